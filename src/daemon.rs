use crate::error::SysError;
use crate::log;
use crate::log::Level;
use crate::shim::{self, Fork, SigAction};
use crate::status::*;
use rustix::fs::{self, FlockOperation, Mode, OFlags};
use rustix::io::retry_on_intr;
use rustix::process::{self, Signal};
use rustix::stdio;
use std::ffi::CStr;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::path::Path;

/// Detach from the foreground session and become a daemon.
///
/// Classic double fork: the first fork plus setsid() drops the
/// controlling terminal, the second fork makes sure we can never
/// reacquire one. The grandchild ends up owned by init with its
/// working directory at the filesystem root and stdin closed.
///
/// Only the first fork is fatal on failure; later errors are logged
/// and the daemon keeps going.
pub fn detach(ident: &'static CStr) -> Result<(), SysError> {
    // From here on messages must survive losing the terminal.
    log::open(ident);

    // SAFETY: the parent exits immediately and the child continues
    // normal single-threaded execution.
    match unsafe { shim::fork() } {
        Ok(Fork::Parent(_)) => std::process::exit(EXIT_SUCCESS),
        Ok(Fork::Child) => {}
        Err(err) => return Err(SysError("fork()", err)),
    }

    // Become session leader, losing the controlling terminal.
    if let Err(err) = retry_on_intr(|| process::setsid()) {
        log!(Level::Err, "couldn't create session - {}", SysError("setsid()", err));
    }

    // Refork so the session leader exits and no future tty can attach.
    // SAFETY: as above.
    match unsafe { shim::fork() } {
        Ok(Fork::Parent(_)) => std::process::exit(EXIT_SUCCESS),
        Ok(Fork::Child) => {}
        Err(err) => {
            // Keep running undetached rather than give up.
            log!(Level::Err, "second fork failed - {}", SysError("fork()", err));
        }
    }

    if let Err(err) = shim::sigaction(Signal::HUP, SigAction::Ignore) {
        log!(Level::Err, "couldn't ignore SIGHUP - {}", SysError("sigaction()", err));
    }

    if let Err(err) = process::chdir("/") {
        log!(Level::Err, "couldn't cd to / - {}", SysError("chdir()", err));
    }

    // The daemon reads nothing.
    // SAFETY: stdin is not owned by any live object at this point.
    unsafe { shim::close_raw(0) };

    Ok(())
}

/// A PID file held under an advisory exclusive lock.
/// The lock lives as long as the descriptor, i.e. for the owning
/// process lifetime; a second instance fails to acquire it and must
/// refuse to start.
pub struct PidFile {
    file: File,
}

impl PidFile {
    /// Open-or-create the file with mode 0664 and try-lock it.
    /// Never blocks: a held lock is an immediate error.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self, SysError> {
        let fd: OwnedFd = match retry_on_intr(|| {
            fs::open(
                path.as_ref(),
                OFlags::RDWR | OFlags::CREATE,
                Mode::from_raw_mode(0o664),
            )
        }) {
            Ok(fd) => fd,
            Err(err) => return Err(SysError("open()", err)),
        };

        if let Err(err) = fs::flock(&fd, FlockOperation::NonBlockingLockExclusive) {
            return Err(SysError("flock()", err));
        }

        Ok(PidFile { file: File::from(fd) })
    }

    /// Truncate and write the decimal pid from offset zero, then flush.
    pub fn write_pid(&mut self, pid: i32) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        write!(self.file, "{}", pid)?;
        self.file.flush()
    }
}

/// Open the target file (create, mode 0664) for output redirection.
fn open_redirect_target(path: &Path) -> Result<OwnedFd, SysError> {
    match retry_on_intr(|| {
        fs::open(path, OFlags::RDWR | OFlags::CREATE, Mode::from_raw_mode(0o664))
    }) {
        Ok(fd) => Ok(fd),
        Err(err) => Err(SysError("open()", err)),
    }
}

/// Redirect stdout to the given file.
pub fn redirect_stdout<P: AsRef<Path>>(path: P) -> Result<(), SysError> {
    let fd = open_redirect_target(path.as_ref())?;
    if let Err(err) = retry_on_intr(|| stdio::dup2_stdout(&fd)) {
        return Err(SysError("dup2()", err));
    }

    Ok(())
}

/// Redirect stderr to the given file.
pub fn redirect_stderr<P: AsRef<Path>>(path: P) -> Result<(), SysError> {
    let fd = open_redirect_target(path.as_ref())?;
    if let Err(err) = retry_on_intr(|| stdio::dup2_stderr(&fd)) {
        return Err(SysError("dup2()", err));
    }

    Ok(())
}
