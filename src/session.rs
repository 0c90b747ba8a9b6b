use crate::chan::{self, Channel};
use crate::error::{FwdError, Status};
use crate::headers::{self, Direction, Headers, Transport};
use crate::log;
use crate::log::Level;
use crate::pump;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::TcpStream;

/// The two buffered halves of a session stream.
/// In server mode these wrap stdin/stdout (already the connected
/// socket); in client mode, two clones of one TCP socket. Keeping the
/// halves independent means a buffered write can never deadlock
/// against a read of its own output.
pub struct SessionIo {
    pub input: Box<dyn BufRead>,
    pub output: Box<dyn Write>,
}

type IoHandler = fn(&Headers, &mut dyn Channel, &mut SessionIo) -> Result<(), FwdError>;

fn push_tcp(headers: &Headers, chan: &mut dyn Channel, io: &mut SessionIo) -> Result<(), FwdError> {
    pump::push(headers, chan, &mut io.output)
}

fn pull_tcp(headers: &Headers, chan: &mut dyn Channel, io: &mut SessionIo) -> Result<(), FwdError> {
    pump::pull(headers, chan, &mut io.input)
}

fn push_udp(_: &Headers, _: &mut dyn Channel, _: &mut SessionIo) -> Result<(), FwdError> {
    Err(FwdError::Proto(
        Status::Unimplemented,
        "udp push transport is not implemented".to_string(),
    ))
}

fn pull_udp(_: &Headers, _: &mut dyn Channel, _: &mut SessionIo) -> Result<(), FwdError> {
    Err(FwdError::Proto(
        Status::Unimplemented,
        "udp pull transport is not implemented".to_string(),
    ))
}

struct HandlerEntry {
    transport: Transport,
    direction: Direction,
    handler: IoHandler,
}

/// The transport x direction matrix. The udp slots are reserved.
const HANDLERS: [HandlerEntry; 4] = [
    HandlerEntry {
        transport: Transport::Tcp,
        direction: Direction::Push,
        handler: push_tcp,
    },
    HandlerEntry {
        transport: Transport::Tcp,
        direction: Direction::Pull,
        handler: pull_tcp,
    },
    HandlerEntry {
        transport: Transport::Udp,
        direction: Direction::Push,
        handler: push_udp,
    },
    HandlerEntry {
        transport: Transport::Udp,
        direction: Direction::Pull,
        handler: pull_udp,
    },
];

fn lookup_handler(transport: Transport, direction: Direction) -> Result<IoHandler, FwdError> {
    for entry in &HANDLERS {
        if entry.transport == transport && entry.direction == direction {
            return Ok(entry.handler);
        }
    }

    Err(FwdError::Proto(
        Status::BadHeader,
        format!(
            "no handler for transport '{}' direction '{}'",
            transport.label(),
            direction.label()
        ),
    ))
}

/// Server role: the peer (or an inetd-style launcher) already
/// connected us; negotiate and pump.
///
/// The `direction` header names the role this end plays. Errors are
/// returned so the caller can report them as a status+message block.
pub fn serve(io: &mut SessionIo) -> Result<(), FwdError> {
    let mut req = Headers::default();
    headers::parse(&mut io.input, &mut req)?;

    let chan_name = match req.chan_name.clone() {
        Some(name) => name,
        None => {
            return Err(FwdError::Proto(
                Status::BadHeader,
                "no channel-name header".to_string(),
            ));
        }
    };
    let transport = match req.transport {
        Some(transport) => transport,
        None => {
            return Err(FwdError::Proto(
                Status::BadHeader,
                "no transport header".to_string(),
            ));
        }
    };
    let direction = match req.direction {
        Some(direction) => direction,
        None => {
            return Err(FwdError::Proto(
                Status::BadHeader,
                "no direction header".to_string(),
            ));
        }
    };
    let handler = lookup_handler(transport, direction)?;

    let mut chan = chan::open(&chan_name)?;

    if let Err(err) = headers::emit_response(&mut io.output, chan.frame_count(), chan.frame_size())
    {
        return Err(FwdError::Io("response write failed", err));
    }
    log!(
        Level::Notice,
        "serving channel {} via {}",
        chan_name,
        transport.label()
    );

    handler(&req, &mut chan, io)
}

/// Report a session error to the peer as a header block.
/// Used in server mode, where stderr may be the socket itself.
pub fn report_header_error(io: &mut SessionIo, err: &FwdError) {
    _ = headers::emit_error(&mut io.output, err.status(), &err.to_string());
}

/// Client-side session configuration, resolved from the command line.
pub struct ClientOpts {
    pub chan_name: String,
    pub remote_chan_name: Option<String>,
    pub remote_host: String,
    pub port: u16,
    pub transport: Transport,
    pub direction: Direction,
    pub tcp_nodelay: bool,
    pub get_last: bool,
}

/// Client role: resolve the host, connect, request the opposite role
/// from the peer, check its status, and pump.
pub fn client(opts: &ClientOpts) -> Result<(), FwdError> {
    let handler = lookup_handler(opts.transport, opts.direction)?;

    // Open the local end first so a bad channel name fails before we
    // touch the network.
    let mut chan = chan::open(&opts.chan_name)?;

    let stream = match TcpStream::connect((opts.remote_host.as_str(), opts.port)) {
        Ok(stream) => stream,
        Err(err) => return Err(FwdError::Io("connect failed", err)),
    };
    if opts.tcp_nodelay {
        if let Err(err) = stream.set_nodelay(true) {
            return Err(FwdError::Io("setsockopt(TCP_NODELAY) failed", err));
        }
    }

    let read_half = match stream.try_clone() {
        Ok(half) => half,
        Err(err) => return Err(FwdError::Io("socket clone failed", err)),
    };
    let mut io = SessionIo {
        input: Box::new(BufReader::new(read_half)),
        output: Box::new(BufWriter::new(stream)),
    };

    // The remote end does the opposite of what we do locally.
    let remote_name = opts.remote_chan_name.as_deref().unwrap_or(&opts.chan_name);
    if let Err(err) = headers::emit_request(
        &mut io.output,
        remote_name,
        opts.transport,
        opts.direction.opposite(),
        opts.get_last,
    ) {
        return Err(FwdError::Io("request write failed", err));
    }

    let mut resp = Headers::default();
    headers::parse(&mut io.input, &mut resp)?;
    match resp.status {
        Some(0) => {}
        Some(code) => {
            let msg = resp
                .message
                .unwrap_or_else(|| "bad response from server".to_string());
            return Err(FwdError::Proto(
                Status::from_code(code),
                format!("server error - {}", msg),
            ));
        }
        None => {
            return Err(FwdError::Proto(
                Status::BadHeader,
                "no status in server response".to_string(),
            ));
        }
    }
    log!(
        Level::Info,
        "connected to {}:{}, remote geometry {}x{}",
        opts.remote_host,
        opts.port,
        resp.frame_count.unwrap_or(0),
        resp.frame_size.unwrap_or(0)
    );

    let session_headers = Headers {
        chan_name: Some(opts.chan_name.clone()),
        transport: Some(opts.transport),
        direction: Some(opts.direction),
        tcp_nodelay: opts.tcp_nodelay,
        get_last: opts.get_last,
        ..Headers::default()
    };

    handler(&session_headers, &mut chan, &mut io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::GetStatus;
    use crate::error::ChanError;
    use crate::frame;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Shared output sink whose flush budget lets push loops end.
    #[derive(Clone)]
    struct SharedBuf {
        wire: Arc<Mutex<Vec<u8>>>,
        flushes_left: Arc<Mutex<usize>>,
    }

    impl SharedBuf {
        fn new(flushes_left: usize) -> Self {
            SharedBuf {
                wire: Arc::new(Mutex::new(Vec::new())),
                flushes_left: Arc::new(Mutex::new(flushes_left)),
            }
        }

        fn contents(&self) -> Vec<u8> {
            self.wire.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.wire.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            let mut left = self.flushes_left.lock().unwrap();
            if *left == 0 {
                return Err(std::io::ErrorKind::BrokenPipe.into());
            }
            *left -= 1;
            Ok(())
        }
    }

    fn serve_str(input: &str, flushes: usize) -> (Result<(), FwdError>, SharedBuf) {
        let out = SharedBuf::new(flushes);
        let mut io = SessionIo {
            input: Box::new(Cursor::new(input.to_string())),
            output: Box::new(out.clone()),
        };
        let result = serve(&mut io);
        if let Err(ref err) = result {
            report_header_error(&mut io, err);
        }
        (result, out)
    }

    #[test]
    fn serve_responds_and_pushes() {
        let mut writer = chan::create("s-serve-push", 8, 64).unwrap();
        writer.put(b"hi").unwrap();

        // One flush for the response block, none left for frames: the
        // pump sees the peer gone after the first frame.
        let (result, out) = serve_str(
            "channel-name: s-serve-push\ntransport: tcp\ndirection: push\n.\n",
            1,
        );
        result.unwrap();

        let wire = out.contents();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("frame-count: 8"));
        assert!(text.contains("frame-size: 64"));
        assert!(text.contains("status: 0 # ok"));

        // The response block ends with the terminator, then frames.
        let dot = wire.windows(3).position(|w| w == b"\n.\n").unwrap() + 3;
        let mut expected = Vec::new();
        frame::write_frame(&mut expected, b"hi").unwrap();
        assert_eq!(&wire[dot..], &expected[..]);
    }

    #[test]
    fn serve_pull_publishes_to_channel() {
        let mut reader = chan::create("s-serve-pull", 8, 64).unwrap();

        let mut input =
            String::from("channel-name: s-serve-pull\ntransport: tcp\ndirection: pull\n.\n")
                .into_bytes();
        frame::write_frame(&mut input, b"abc").unwrap();

        let out = SharedBuf::new(1);
        let mut io = SessionIo {
            input: Box::new(Cursor::new(input)),
            output: Box::new(out.clone()),
        };
        serve(&mut io).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(reader.get_wait(&mut buf, false).unwrap(), GetStatus::Frame(3));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn serve_rejects_unknown_header() {
        let (result, out) = serve_str("nosuchkey: x\n.\n", 1);

        assert!(matches!(result, Err(FwdError::Proto(Status::BadHeader, _))));

        // The peer got a status+message block and a terminator.
        let text = String::from_utf8(out.contents()).unwrap();
        assert!(text.contains("status: 5"));
        assert!(text.contains("message: "));
        assert!(text.ends_with(".\n"));
    }

    #[test]
    fn serve_requires_all_headers() {
        let (result, _) = serve_str("channel-name: c\ntransport: tcp\n.\n", 1);
        assert!(matches!(result, Err(FwdError::Proto(Status::BadHeader, _))));

        let (result, _) = serve_str("channel-name: c\ndirection: push\n.\n", 1);
        assert!(matches!(result, Err(FwdError::Proto(Status::BadHeader, _))));

        let (result, _) = serve_str("transport: tcp\ndirection: push\n.\n", 1);
        assert!(matches!(result, Err(FwdError::Proto(Status::BadHeader, _))));
    }

    #[test]
    fn serve_reports_missing_channel() {
        let (result, out) = serve_str(
            "channel-name: s-no-such\ntransport: tcp\ndirection: push\n.\n",
            1,
        );

        assert!(matches!(result, Err(FwdError::Chan(ChanError::NotFound(_)))));
        let text = String::from_utf8(out.contents()).unwrap();
        assert!(text.contains(&format!("status: {}", Status::NotFound.code())));
    }

    #[test]
    fn serve_rejects_udp_for_now() {
        chan::create("s-udp", 8, 64).unwrap();

        let (result, _) = serve_str(
            "channel-name: s-udp\ntransport: udp\ndirection: push\n.\n",
            1,
        );
        assert!(matches!(
            result,
            Err(FwdError::Proto(Status::Unimplemented, _))
        ));
    }

    #[test]
    fn client_pull_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // Scripted peer: check the request, answer, send two frames,
        // hang up.
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut req = Headers::default();
            headers::parse(&mut reader, &mut req).unwrap();

            // The client asks the peer for the opposite of its own role
            // and names the remote channel.
            assert_eq!(req.direction, Some(Direction::Push));
            assert_eq!(req.chan_name.as_deref(), Some("remote-state"));

            let mut stream = stream;
            headers::emit_response(&mut stream, 16, 512).unwrap();
            frame::write_frame(&mut stream, b"f1").unwrap();
            frame::write_frame(&mut stream, b"f2").unwrap();
            stream.flush().unwrap();
        });

        let mut local = chan::create("s-client-pull", 8, 64).unwrap();
        client(&ClientOpts {
            chan_name: "s-client-pull".to_string(),
            remote_chan_name: Some("remote-state".to_string()),
            remote_host: "127.0.0.1".to_string(),
            port,
            transport: Transport::Tcp,
            direction: Direction::Pull,
            tcp_nodelay: false,
            get_last: false,
        })
        .unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(local.get_wait(&mut buf, false).unwrap(), GetStatus::Frame(2));
        assert_eq!(&buf[..2], b"f1");
        assert_eq!(local.get_wait(&mut buf, false).unwrap(), GetStatus::Frame(2));
        assert_eq!(&buf[..2], b"f2");

        server.join().unwrap();
    }

    #[test]
    fn client_surfaces_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut req = Headers::default();
            headers::parse(&mut reader, &mut req).unwrap();

            let mut stream = stream;
            headers::emit_error(&mut stream, Status::NotFound, "no such channel").unwrap();
        });

        chan::create("s-client-err", 8, 64).unwrap();
        let result = client(&ClientOpts {
            chan_name: "s-client-err".to_string(),
            remote_chan_name: None,
            remote_host: "127.0.0.1".to_string(),
            port,
            transport: Transport::Tcp,
            direction: Direction::Pull,
            tcp_nodelay: false,
            get_last: false,
        });

        match result {
            Err(FwdError::Proto(Status::NotFound, msg)) => {
                assert!(msg.contains("no such channel"));
            }
            other => panic!("expected server error, got {:?}", other),
        }

        server.join().unwrap();
    }
}
