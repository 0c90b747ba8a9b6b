use crate::chan::{Channel, GetStatus};
use crate::error::FwdError;
use crate::frame::{self, FrameBuf, INIT_BUF_SIZE, PREFIX_SIZE};
use crate::headers::Headers;
use crate::log;
use crate::log::Level;
use crate::signal;
use std::io::{BufRead, Write};

/// Push direction: the local channel is the source, the stream the sink.
///
/// Frames are forwarded in channel order until a terminate signal is
/// seen or the peer goes away. With get-last negotiated the channel may
/// skip frames (reported as missed, which is success) but never
/// reorders them. Write or flush failure means the peer is gone; that
/// is a clean shutdown, not an error.
pub fn push<C: Channel + ?Sized, W: Write + ?Sized>(
    headers: &Headers,
    chan: &mut C,
    writer: &mut W,
) -> Result<(), FwdError> {
    let mut buf = FrameBuf::new(INIT_BUF_SIZE);

    while !signal::terminate_requested() {
        // Fetch the next (or latest) frame, growing the buffer until
        // the channel stops reporting overflow.
        let size = loop {
            match chan.get_wait(buf.as_mut_slice(), headers.get_last)? {
                GetStatus::Frame(size) => break size,
                GetStatus::Missed(size) => {
                    log!(Level::Debug, "skipped frames on channel");
                    break size;
                }
                GetStatus::Overflow(needed) => buf.grow(needed),
            }
        };

        if frame::write_frame(writer, &buf.as_slice()[..size]).is_err() {
            break;
        }
        if writer.flush().is_err() {
            break;
        }
    }

    Ok(())
}

/// Pull direction: the stream is the source, the local channel the sink.
///
/// Short reads and bad magic are peer-initiated shutdown. A failing put
/// means the local channel is broken, which is fatal.
pub fn pull<C: Channel + ?Sized, R: BufRead + ?Sized>(
    _headers: &Headers,
    chan: &mut C,
    reader: &mut R,
) -> Result<(), FwdError> {
    let mut buf = FrameBuf::new(INIT_BUF_SIZE);

    while !signal::terminate_requested() {
        let mut prefix = [0u8; PREFIX_SIZE];
        if reader.read_exact(&mut prefix).is_err() {
            break;
        }

        let payload_len = match frame::decode_prefix(&prefix) {
            Some(len) => len,
            None => {
                log!(Level::Notice, "bad frame magic from peer");
                break;
            }
        };
        if payload_len > isize::MAX as u64 {
            log!(Level::Notice, "unreasonable frame length from peer");
            break;
        }
        let payload_len = payload_len as usize;

        buf.grow(payload_len);
        if reader.read_exact(&mut buf.as_mut_slice()[..payload_len]).is_err() {
            break;
        }

        chan.put(&buf.as_slice()[..payload_len])?;
    }

    Ok(())
}
