#![allow(clippy::unnecessary_cast)]

use rustix::io::Errno;
use rustix::process::{Pid, Signal};
use std::ffi::CString;
use std::io::Error;
use std::mem::{self, MaybeUninit};
use std::os::fd::RawFd;
use std::ptr::null_mut;
use std::time::Duration;

/// Get errno from last libc call.
fn last_errno() -> Errno {
    Errno::from_io_error(&Error::last_os_error()).unwrap()
}

/// Build a libc signal set from a signal list.
fn sig_set(sig_list: &[Signal]) -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set as *mut libc::sigset_t);
        for sig in sig_list {
            libc::sigaddset(&mut set as *mut libc::sigset_t, sig.as_raw() as libc::c_int);
        }
        set
    }
}

pub enum Fork {
    Parent(Pid),
    Child,
}

/// Convenience shim for libc::fork().
/// In Rust, fork() is not safe in general case, only its specific usages can be proven so.
/// Hence we mark shim as unsafe, and leave the safe usage as responsibility of the caller.
pub unsafe fn fork() -> Result<Fork, Errno> {
    match unsafe { libc::fork() } {
        pid if pid > 0 => Ok(Fork::Parent(Pid::from_raw(pid).unwrap())),
        0 => Ok(Fork::Child),
        _ => Err(last_errno()),
    }
}

/// Shim for libc::_exit().
/// It's like process::exit(), but it doesn't run atexit handlers or any other destructors,
/// just kills the process immediately.
/// While it's not really unsafe, we still mark it so, to make its usage bolder in code
/// when implementing safe use of fork().
pub unsafe fn fast_exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// Shim for libc::close().
/// It violates OwnedFd/BorrowedFd contract by making it possible to close underlying
/// fd while it's still owned, hence marked unsafe.
/// Handles EINTR.
pub unsafe fn close_raw(fd: RawFd) {
    loop {
        if unsafe { libc::close(fd) } == 0 || last_errno() != Errno::INTR {
            break;
        }
    }
}

pub enum SigAction {
    Default,
    Ignore,
    /// Handlers installed this way must only touch async-signal-safe state.
    Handler(extern "C" fn(libc::c_int)),
}

/// Safe shim for sigaction().
pub fn sigaction(sig: Signal, action: SigAction) -> Result<(), Errno> {
    let handler = match action {
        SigAction::Default => libc::SIG_DFL,
        SigAction::Ignore => libc::SIG_IGN,
        SigAction::Handler(func) => func as usize,
    };

    let ret = unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask as *mut libc::sigset_t);

        libc::sigaction(sig.as_raw(), &sa, null_mut())
    };
    if ret < 0 {
        return Err(last_errno());
    }

    Ok(())
}

/// Safe shim for sigprocmask(SIG_BLOCK).
/// Blocks the given signals and returns the previous mask.
pub fn sigmask_block(sig_list: &[Signal]) -> Result<libc::sigset_t, Errno> {
    let block = sig_set(sig_list);

    unsafe {
        let mut old = MaybeUninit::<libc::sigset_t>::uninit();
        if libc::sigprocmask(libc::SIG_BLOCK, &block as *const libc::sigset_t, old.as_mut_ptr())
            < 0
        {
            return Err(last_errno());
        }
        Ok(old.assume_init())
    }
}

/// Safe shim for sigprocmask(SIG_SETMASK).
/// Restores a mask previously returned by sigmask_block().
pub fn sigmask_restore(old: &libc::sigset_t) -> Result<(), Errno> {
    let ret =
        unsafe { libc::sigprocmask(libc::SIG_SETMASK, old as *const libc::sigset_t, null_mut()) };
    if ret < 0 {
        return Err(last_errno());
    }

    Ok(())
}

/// Safe shim for sigsuspend().
/// Atomically installs the given mask and sleeps until any unblocked
/// signal is delivered and its handler has returned.
pub fn sigsuspend(mask: &libc::sigset_t) -> Result<(), Errno> {
    // sigsuspend() always returns -1; EINTR is the expected outcome.
    if unsafe { libc::sigsuspend(mask as *const libc::sigset_t) } != -1 {
        return Err(Errno::INVAL);
    }
    match last_errno() {
        Errno::INTR => Ok(()),
        err => Err(err),
    }
}

/// Safe shim for sigtimedwait().
/// Waits until one of the (blocked) signals is pending, consumes and
/// returns it. Returns None when the timeout expires. Handlers are not
/// invoked for signals consumed this way.
pub fn sigtimedwait(sig_list: &[Signal], timeout: Duration) -> Result<Option<Signal>, Errno> {
    let set = sig_set(sig_list);
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    loop {
        let ret = unsafe {
            let mut info: libc::siginfo_t = mem::zeroed();
            libc::sigtimedwait(
                &set as *const libc::sigset_t,
                &mut info as *mut libc::siginfo_t,
                &ts as *const libc::timespec,
            )
        };
        if ret < 0 {
            match last_errno() {
                Errno::AGAIN => return Ok(None), // timeout expired
                Errno::INTR => continue,
                err => return Err(err),
            }
        }
        match Signal::from_named_raw(ret as i32) {
            Some(sig) => return Ok(Some(sig)),
            None => return Err(Errno::INVAL),
        }
    }
}

/// Safe shim for openlog().
/// The ident string must be 'static because syslog keeps the pointer.
pub fn openlog(ident: &'static std::ffi::CStr) {
    unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) }
}

/// Safe shim for syslog().
/// The message is passed as an argument to a "%s" format, so it may
/// contain anything except interior NULs.
pub fn syslog(priority: libc::c_int, msg: &str) {
    let msg = CString::new(msg).unwrap_or_else(|_| c"malformed log message".to_owned());
    unsafe { libc::syslog(priority, c"%s".as_ptr(), msg.as_ptr()) }
}
