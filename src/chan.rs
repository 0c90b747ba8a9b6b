use crate::error::ChanError;
use ringbuffer::{AllocRingBuffer, RingBuffer};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// Default channel geometry, used when nothing else is negotiated.
pub const DEFAULT_FRAME_COUNT: usize = 16;
pub const DEFAULT_FRAME_SIZE: usize = 512;

/// Outcome of a get: the frame length actually copied, or the size the
/// destination buffer must grow to. Missed means frames were skipped
/// (reader too slow, or latest-frame mode) but order was preserved;
/// it is success as far as forwarding is concerned.
#[derive(Debug, PartialEq)]
pub enum GetStatus {
    Frame(usize),
    Missed(usize),
    Overflow(usize),
}

/// The channel interface the daemons consume.
///
/// A channel is a ring of at most `frame_count` frames of up to
/// `frame_size` bytes each. Writers never block; a full ring drops the
/// oldest frame. Readers block until a frame newer than their cursor
/// arrives. The backing store is closed when the handle is dropped.
pub trait Channel {
    /// Block until a frame is available and copy it into `dst`.
    /// With `last`, skip ahead to the newest frame.
    /// Overflow consumes nothing; retry with a larger buffer.
    fn get_wait(&mut self, dst: &mut [u8], last: bool) -> Result<GetStatus, ChanError>;

    /// Publish one frame.
    fn put(&mut self, frame: &[u8]) -> Result<(), ChanError>;

    fn frame_count(&self) -> usize;

    fn frame_size(&self) -> usize;
}

struct ChanState {
    frames: AllocRingBuffer<Vec<u8>>,
    /// Sequence number of the next frame to be published.
    head_seq: u64,
}

struct ChanShared {
    frame_count: usize,
    frame_size: usize,
    state: Mutex<ChanState>,
    cond: Condvar,
}

impl ChanShared {
    /// Sequence number of the oldest frame still in the ring.
    fn oldest_seq(state: &ChanState) -> u64 {
        state.head_seq - state.frames.len() as u64
    }
}

/// Process-local reference implementation of `Channel`.
///
/// Each handle carries its own read cursor, so independent readers see
/// independent (sub)sequences. A production deployment substitutes the
/// shared-memory channel library behind the same trait.
pub struct MemChannel {
    shared: Arc<ChanShared>,
    next_seq: u64,
}

impl Channel for MemChannel {
    fn get_wait(&mut self, dst: &mut [u8], last: bool) -> Result<GetStatus, ChanError> {
        let mut state = self.shared.state.lock().unwrap();

        loop {
            if self.next_seq < state.head_seq {
                let oldest_seq = ChanShared::oldest_seq(&state);
                // Oldest unread frame, unless overwritten or skipping
                // to the newest one.
                let seq = if last {
                    state.head_seq - 1
                } else {
                    self.next_seq.max(oldest_seq)
                };
                let frame = state.frames.get((seq - oldest_seq) as usize).unwrap();

                if frame.len() > dst.len() {
                    // Report required size; the cursor doesn't move, so
                    // the same request can be retried.
                    return Ok(GetStatus::Overflow(frame.len()));
                }

                dst[..frame.len()].copy_from_slice(frame);
                let missed = seq - self.next_seq;
                self.next_seq = seq + 1;

                return Ok(if missed > 0 {
                    GetStatus::Missed(frame.len())
                } else {
                    GetStatus::Frame(frame.len())
                });
            }

            state = self.shared.cond.wait(state).unwrap();
        }
    }

    fn put(&mut self, frame: &[u8]) -> Result<(), ChanError> {
        if frame.len() > self.shared.frame_size {
            return Err(ChanError::FrameTooBig {
                size: frame.len(),
                frame_size: self.shared.frame_size,
            });
        }

        let mut state = self.shared.state.lock().unwrap();
        state.frames.enqueue(frame.to_vec()); // full ring drops the oldest
        state.head_seq += 1;
        self.shared.cond.notify_all();

        Ok(())
    }

    fn frame_count(&self) -> usize {
        self.shared.frame_count
    }

    fn frame_size(&self) -> usize {
        self.shared.frame_size
    }
}

/// Named channels of this process.
fn registry() -> &'static Mutex<HashMap<String, Arc<ChanShared>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<ChanShared>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Create a channel with the given geometry.
pub fn create(name: &str, frame_count: usize, frame_size: usize) -> Result<MemChannel, ChanError> {
    let mut map = registry().lock().unwrap();

    if map.contains_key(name) {
        return Err(ChanError::AlreadyExists(name.to_string()));
    }

    let shared = Arc::new(ChanShared {
        frame_count,
        frame_size,
        state: Mutex::new(ChanState {
            frames: AllocRingBuffer::new(frame_count),
            head_seq: 0,
        }),
        cond: Condvar::new(),
    });
    map.insert(name.to_string(), Arc::clone(&shared));

    Ok(MemChannel { shared, next_seq: 0 })
}

/// Open an existing channel by name.
/// The new handle's cursor starts at the oldest frame still available.
pub fn open(name: &str) -> Result<MemChannel, ChanError> {
    let map = registry().lock().unwrap();

    match map.get(name) {
        Some(shared) => {
            let next_seq = {
                let state = shared.state.lock().unwrap();
                ChanShared::oldest_seq(&state)
            };
            Ok(MemChannel {
                shared: Arc::clone(shared),
                next_seq,
            })
        }
        None => Err(ChanError::NotFound(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    // Channel names are process-global; keep them unique per test.

    #[test]
    fn frames_arrive_in_order() {
        let mut writer = create("t-order", 8, 64).unwrap();
        let mut reader = open("t-order").unwrap();

        for payload in [&b"one"[..], b"two", b"three"] {
            writer.put(payload).unwrap();
        }

        let mut buf = [0u8; 64];
        for payload in [&b"one"[..], b"two", b"three"] {
            let status = reader.get_wait(&mut buf, false).unwrap();
            assert_eq!(status, GetStatus::Frame(payload.len()));
            assert_eq!(&buf[..payload.len()], payload);
        }
    }

    #[test]
    fn overflow_reports_required_size() {
        let mut writer = create("t-overflow", 4, 4096).unwrap();
        let mut reader = open("t-overflow").unwrap();

        writer.put(&[0xabu8; 700]).unwrap();

        let mut small = [0u8; 512];
        assert_eq!(
            reader.get_wait(&mut small, false).unwrap(),
            GetStatus::Overflow(700)
        );

        // Nothing was consumed; a big enough buffer gets the frame.
        let mut big = vec![0u8; 700];
        assert_eq!(reader.get_wait(&mut big, false).unwrap(), GetStatus::Frame(700));
        assert_eq!(big, [0xabu8; 700]);
    }

    #[test]
    fn get_last_skips_but_keeps_order() {
        let mut writer = create("t-last", 8, 64).unwrap();
        let mut reader = open("t-last").unwrap();

        for payload in [&b"a"[..], b"b", b"c", b"d"] {
            writer.put(payload).unwrap();
        }

        let mut buf = [0u8; 64];
        assert_eq!(reader.get_wait(&mut buf, true).unwrap(), GetStatus::Missed(1));
        assert_eq!(&buf[..1], b"d");

        // Next put is seen as a fresh frame, not a skip.
        writer.put(b"e").unwrap();
        assert_eq!(reader.get_wait(&mut buf, true).unwrap(), GetStatus::Frame(1));
        assert_eq!(&buf[..1], b"e");
    }

    #[test]
    fn slow_reader_observes_missed_frames() {
        let mut writer = create("t-missed", 2, 64).unwrap();
        let mut reader = open("t-missed").unwrap();

        // Ring of 2: the first two frames are overwritten.
        for payload in [&b"0"[..], b"1", b"2", b"3"] {
            writer.put(payload).unwrap();
        }

        let mut buf = [0u8; 64];
        assert_eq!(reader.get_wait(&mut buf, false).unwrap(), GetStatus::Missed(1));
        assert_eq!(&buf[..1], b"2");
        assert_eq!(reader.get_wait(&mut buf, false).unwrap(), GetStatus::Frame(1));
        assert_eq!(&buf[..1], b"3");
    }

    #[test]
    fn oversized_put_is_rejected() {
        let mut writer = create("t-bigput", 4, 8).unwrap();
        assert!(matches!(
            writer.put(&[0u8; 9]),
            Err(ChanError::FrameTooBig { size: 9, frame_size: 8 })
        ));
    }

    #[test]
    fn get_blocks_until_put() {
        let mut reader = create("t-block", 4, 64).unwrap();

        let publisher = thread::spawn(|| {
            let mut writer = open("t-block").unwrap();
            thread::sleep(Duration::from_millis(20));
            writer.put(b"late").unwrap();
        });

        let mut buf = [0u8; 64];
        let status = reader.get_wait(&mut buf, false).unwrap();
        assert_eq!(status, GetStatus::Frame(4));
        assert_eq!(&buf[..4], b"late");

        publisher.join().unwrap();
    }

    #[test]
    fn open_requires_existing_channel() {
        assert!(matches!(open("t-nosuch"), Err(ChanError::NotFound(_))));
    }
}
