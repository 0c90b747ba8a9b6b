use crate::error::{FwdError, Status};
use regex::Regex;
use std::io::{self, BufRead, Write};
use std::sync::OnceLock;

/// Which way frames flow, seen from the local end: push sends the
/// local channel to the peer, pull fills it from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

impl Direction {
    /// The role the remote end plays for our role.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Push => Direction::Pull,
            Direction::Pull => Direction::Push,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn label(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// Parsed header block. Every recognized key has a slot; all optional
/// except the booleans, which default to off.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Headers {
    pub chan_name: Option<String>,
    pub remote_host: Option<String>,
    pub frame_count: Option<u64>,
    pub frame_size: Option<u64>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub transport: Option<Transport>,
    pub direction: Option<Direction>,
    pub tcp_nodelay: bool,
    pub retry: bool,
    pub get_last: bool,
    pub status: Option<i32>,
    pub message: Option<String>,
}

/// One header per line, `KEY [:=] VALUE` with optional whitespace.
/// The separators can't appear in either part.
fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([^:=]+?)\s*[:=]\s*([^:=]*?)\s*$").unwrap())
}

/// Block terminator: a line whose only non-whitespace content is `.`.
fn dot_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\.\s*$").unwrap())
}

/// Read one header block from the stream into `headers`.
///
/// Comments run from `#` to end of line; blank lines are skipped; keys
/// are case-insensitive. Unknown keys and malformed lines are protocol
/// errors. EOF is accepted in place of the terminator so a peer that
/// dies mid-handshake still yields its partial block.
pub fn parse<R: BufRead + ?Sized>(reader: &mut R, headers: &mut Headers) -> Result<(), FwdError> {
    let mut line = String::new();

    loop {
        line.clear();
        let n = match reader.read_line(&mut line) {
            Ok(n) => n,
            Err(err) => return Err(FwdError::Io("header read failed", err)),
        };
        if n == 0 {
            break;
        }

        let text = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line.as_str(),
        };
        if dot_regex().is_match(text) {
            break;
        }
        if text.trim().is_empty() {
            continue;
        }

        let caps = match line_regex().captures(text) {
            Some(caps) => caps,
            None => {
                return Err(FwdError::Proto(
                    Status::BadHeader,
                    format!("malformed header line '{}'", text.trim()),
                ));
            }
        };
        set_header(&caps[1], &caps[2], headers)?;
    }

    Ok(())
}

fn parse_int<T: std::str::FromStr>(name: &str, val: &str) -> Result<T, FwdError> {
    match val.parse() {
        Ok(num) => Ok(num),
        Err(_) => Err(FwdError::Proto(
            Status::BadHeader,
            format!("invalid {} '{}'", name, val),
        )),
    }
}

/// Boolean vocabulary, case-insensitive.
pub fn parse_bool(val: &str) -> Result<bool, FwdError> {
    const YES: [&str; 7] = ["yes", "true", "1", "t", "y", "+", "aye"];
    const NO: [&str; 7] = ["no", "false", "0", "f", "n", "-", "nay"];

    let val = val.to_lowercase();
    if YES.contains(&val.as_str()) {
        return Ok(true);
    }
    if NO.contains(&val.as_str()) {
        return Ok(false);
    }

    Err(FwdError::Proto(
        Status::BadHeader,
        format!("invalid boolean '{}'", val),
    ))
}

pub fn parse_transport(val: &str) -> Result<Transport, FwdError> {
    match val.to_lowercase().as_str() {
        "tcp" => Ok(Transport::Tcp),
        "udp" => Ok(Transport::Udp),
        _ => Err(FwdError::Proto(
            Status::BadHeader,
            format!("invalid transport '{}'", val),
        )),
    }
}

fn set_header(key: &str, val: &str, headers: &mut Headers) -> Result<(), FwdError> {
    match key.to_lowercase().as_str() {
        "channel-name" => headers.chan_name = Some(val.to_string()),
        "remote-host" => headers.remote_host = Some(val.to_string()),
        "frame-count" => headers.frame_count = Some(parse_int("frame count", val)?),
        "frame-size" => headers.frame_size = Some(parse_int("frame size", val)?),
        "local-port" => headers.local_port = Some(parse_int("local port", val)?),
        "remote-port" => headers.remote_port = Some(parse_int("remote port", val)?),
        "transport" => headers.transport = Some(parse_transport(val)?),
        "direction" => {
            headers.direction = Some(match val.to_lowercase().as_str() {
                "push" => Direction::Push,
                "pull" => Direction::Pull,
                _ => {
                    return Err(FwdError::Proto(
                        Status::BadHeader,
                        format!("invalid direction '{}'", val),
                    ));
                }
            })
        }
        "tcp-nodelay" => headers.tcp_nodelay = parse_bool(val)?,
        "retry" => headers.retry = parse_bool(val)?,
        "get-last" => headers.get_last = parse_bool(val)?,
        "status" => headers.status = Some(parse_int("status", val)?),
        "message" => headers.message = Some(val.to_string()),
        _ => {
            return Err(FwdError::Proto(
                Status::BadHeader,
                format!("unknown header '{}'", key),
            ));
        }
    }

    Ok(())
}

/// Values can't carry the separator characters, so they are replaced
/// before a message goes on the wire.
fn sanitize(msg: &str) -> String {
    msg.replace([':', '=', '#', '\n', '\r'], " ")
}

/// Session request sent by the client.
/// `direction` is the role requested OF THE PEER, i.e. already flipped.
pub fn emit_request<W: Write + ?Sized>(
    writer: &mut W,
    chan_name: &str,
    transport: Transport,
    direction: Direction,
    get_last: bool,
) -> io::Result<()> {
    write!(
        writer,
        "channel-name: {}\ntransport: {}\ndirection: {}\n",
        chan_name,
        transport.label(),
        direction.label()
    )?;
    if get_last {
        write!(writer, "get-last: yes\n")?;
    }
    write!(writer, ".\n")?;
    writer.flush()
}

/// Successful session response: channel geometry and status zero.
pub fn emit_response<W: Write + ?Sized>(
    writer: &mut W,
    frame_count: usize,
    frame_size: usize,
) -> io::Result<()> {
    write!(
        writer,
        "frame-count: {}\nframe-size: {}\nstatus: {} # {}\n.\n",
        frame_count,
        frame_size,
        Status::Ok.code(),
        Status::Ok.label()
    )?;
    writer.flush()
}

/// Error response: non-zero status plus a human-readable message.
pub fn emit_error<W: Write + ?Sized>(
    writer: &mut W,
    status: Status,
    message: &str,
) -> io::Result<()> {
    write!(
        writer,
        "status: {} # {}\nmessage: {}\n.\n",
        status.code(),
        status.label(),
        sanitize(message)
    )?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(block: &str) -> Result<Headers, FwdError> {
        let mut headers = Headers::default();
        parse(&mut block.as_bytes(), &mut headers)?;
        Ok(headers)
    }

    #[test]
    fn parses_request_block() {
        let headers = parse_str("channel-name: c\ntransport: tcp\ndirection: push\n.\n").unwrap();

        assert_eq!(headers.chan_name.as_deref(), Some("c"));
        assert_eq!(headers.transport, Some(Transport::Tcp));
        assert_eq!(headers.direction, Some(Direction::Push));
    }

    #[test]
    fn keys_are_case_insensitive_and_accept_equals() {
        let headers =
            parse_str("Channel-Name = cmd\nTRANSPORT: TCP\nDirection=PULL\n.\n").unwrap();

        assert_eq!(headers.chan_name.as_deref(), Some("cmd"));
        assert_eq!(headers.transport, Some(Transport::Tcp));
        assert_eq!(headers.direction, Some(Direction::Pull));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let headers = parse_str(
            "# request\n\nchannel-name: c # the channel\n   \nstatus: 0 # ok\n.\n",
        )
        .unwrap();

        assert_eq!(headers.chan_name.as_deref(), Some("c"));
        assert_eq!(headers.status, Some(0));
    }

    #[test]
    fn unknown_key_is_a_protocol_error() {
        match parse_str("nosuchkey: x\n.\n") {
            Err(FwdError::Proto(Status::BadHeader, msg)) => {
                assert!(msg.contains("nosuchkey"));
            }
            other => panic!("expected bad header, got {:?}", other),
        }
    }

    #[test]
    fn malformed_line_is_a_protocol_error() {
        assert!(matches!(
            parse_str("no separator here\n.\n"),
            Err(FwdError::Proto(Status::BadHeader, _))
        ));
    }

    #[test]
    fn eof_ends_an_unterminated_block() {
        let headers = parse_str("status: 5\nmessage: broken pipe\n").unwrap();

        assert_eq!(headers.status, Some(5));
        assert_eq!(headers.message.as_deref(), Some("broken pipe"));
    }

    #[test]
    fn boolean_vocabulary() {
        for val in ["yes", "TRUE", "1", "t", "Y", "+", "aye"] {
            assert_eq!(parse_bool(val).unwrap(), true, "{}", val);
        }
        for val in ["no", "False", "0", "f", "N", "-", "NAY"] {
            assert_eq!(parse_bool(val).unwrap(), false, "{}", val);
        }
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert!(parse_str("frame-size: many\n.\n").is_err());
        assert!(parse_str("remote-port: 99999\n.\n").is_err());
    }

    #[test]
    fn invalid_direction_is_rejected() {
        assert!(matches!(
            parse_str("direction: sideways\n.\n"),
            Err(FwdError::Proto(Status::BadHeader, _))
        ));
    }

    #[test]
    fn request_round_trip() {
        let mut wire = Vec::new();
        emit_request(&mut wire, "state", Transport::Tcp, Direction::Pull, true).unwrap();

        let headers = parse_str(std::str::from_utf8(&wire).unwrap()).unwrap();
        assert_eq!(headers.chan_name.as_deref(), Some("state"));
        assert_eq!(headers.transport, Some(Transport::Tcp));
        assert_eq!(headers.direction, Some(Direction::Pull));
        assert!(headers.get_last);
    }

    #[test]
    fn response_round_trip() {
        let mut wire = Vec::new();
        emit_response(&mut wire, 16, 512).unwrap();

        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("status: 0 # ok"));
        assert!(text.ends_with(".\n"));

        let headers = parse_str(text).unwrap();
        assert_eq!(headers.frame_count, Some(16));
        assert_eq!(headers.frame_size, Some(512));
        assert_eq!(headers.status, Some(0));
    }

    #[test]
    fn error_response_round_trip() {
        let mut wire = Vec::new();
        emit_error(&mut wire, Status::NotFound, "channel 'c' not found: gone").unwrap();

        let headers = parse_str(std::str::from_utf8(&wire).unwrap()).unwrap();
        assert_eq!(headers.status, Some(Status::NotFound.code()));
        // The separator was sanitized out of the message.
        let msg = headers.message.unwrap();
        assert!(!msg.is_empty());
        assert!(!msg.contains(':'));
    }

    #[test]
    fn direction_opposite() {
        assert_eq!(Direction::Push.opposite(), Direction::Pull);
        assert_eq!(Direction::Pull.opposite(), Direction::Push);
    }
}
