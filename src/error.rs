use rustix::io::Errno;
use std::fmt;
use std::io;

/// Failed system call: which one, and the errno it returned.
#[derive(Debug)]
pub struct SysError(pub &'static str, pub Errno);

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0, self.1)
    }
}

/// Session status codes carried in the `status` header.
/// Zero is reserved for success; everything else terminates the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    FailedSyscall = 1,
    NotFound = 2,
    Overflow = 3,
    MissedFrame = 4,
    BadHeader = 5,
    Unimplemented = 6,
    Closed = 7,
    Bug = 8,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a status code from the wire; codes we don't know collapse
    /// into Bug.
    pub fn from_code(code: i32) -> Status {
        match code {
            0 => Status::Ok,
            1 => Status::FailedSyscall,
            2 => Status::NotFound,
            3 => Status::Overflow,
            4 => Status::MissedFrame,
            5 => Status::BadHeader,
            6 => Status::Unimplemented,
            7 => Status::Closed,
            _ => Status::Bug,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::FailedSyscall => "failed syscall",
            Status::NotFound => "not found",
            Status::Overflow => "overflow",
            Status::MissedFrame => "missed frame",
            Status::BadHeader => "bad header",
            Status::Unimplemented => "unimplemented",
            Status::Closed => "closed",
            Status::Bug => "bug",
        }
    }
}

/// Channel operation failures reported by the channel backend.
/// Overflow and missed-frame conditions are not errors; they are
/// reported in-band by `chan::GetStatus`.
#[derive(Debug)]
pub enum ChanError {
    NotFound(String),
    AlreadyExists(String),
    FrameTooBig { size: usize, frame_size: usize },
}

impl ChanError {
    pub fn status(&self) -> Status {
        match self {
            ChanError::NotFound(_) => Status::NotFound,
            ChanError::AlreadyExists(_) => Status::Bug,
            ChanError::FrameTooBig { .. } => Status::Overflow,
        }
    }
}

impl fmt::Display for ChanError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChanError::NotFound(name) => {
                write!(f, "channel '{}' not found", name)
            }
            ChanError::AlreadyExists(name) => {
                write!(f, "channel '{}' already exists", name)
            }
            ChanError::FrameTooBig { size, frame_size } => {
                write!(
                    f,
                    "frame of {} bytes exceeds channel frame size {}",
                    size, frame_size
                )
            }
        }
    }
}

/// Anything that can end a forwarding session.
#[derive(Debug)]
pub enum FwdError {
    Sys(SysError),
    Io(&'static str, io::Error),
    Chan(ChanError),
    Proto(Status, String),
}

impl FwdError {
    /// Status code reported to the peer in server mode.
    pub fn status(&self) -> Status {
        match self {
            FwdError::Sys(_) => Status::FailedSyscall,
            FwdError::Io(_, _) => Status::FailedSyscall,
            FwdError::Chan(err) => err.status(),
            FwdError::Proto(status, _) => *status,
        }
    }
}

impl fmt::Display for FwdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FwdError::Sys(err) => err.fmt(f),
            FwdError::Io(what, err) => write!(f, "{} - {}", what, err),
            FwdError::Chan(err) => err.fmt(f),
            FwdError::Proto(_, msg) => f.write_str(msg),
        }
    }
}

impl From<SysError> for FwdError {
    fn from(err: SysError) -> Self {
        FwdError::Sys(err)
    }
}

impl From<ChanError> for FwdError {
    fn from(err: ChanError) -> Self {
        FwdError::Chan(err)
    }
}
