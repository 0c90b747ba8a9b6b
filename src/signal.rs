use crate::error::SysError;
use crate::shim::{self, SigAction};
use rustix::process::Signal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Signals that drive the supervision state machine.
/// The wait primitives below block exactly this set while inspecting
/// the flag counters, so a delivery between check and suspend cannot
/// be lost.
const EVENT_SIGNALS: [Signal; 3] = [Signal::TERM, Signal::INT, Signal::CHILD];

/// Per-signal monotone counters, the only state touched from signal
/// handlers. Terminate and interrupt are sticky; the child counter is
/// decremented on consumption so queued exits are handled one at a time.
static TERM_COUNT: AtomicU32 = AtomicU32::new(0);
static INT_COUNT: AtomicU32 = AtomicU32::new(0);
static CHILD_COUNT: AtomicU32 = AtomicU32::new(0);

/// Installed for each signal in install_sigflags().
/// Lock-free atomic increment is the async-signal-safe subset we allow
/// ourselves here; no I/O, no allocation.
extern "C" fn flag_handler(sig: libc::c_int) {
    if sig == libc::SIGTERM {
        TERM_COUNT.fetch_add(1, Ordering::Relaxed);
    } else if sig == libc::SIGINT {
        INT_COUNT.fetch_add(1, Ordering::Relaxed);
    } else if sig == libc::SIGCHLD {
        CHILD_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

/// Events reported by the wait primitives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalEvent {
    Terminate,
    Interrupt,
    ChildStatus,
}

/// Install the counting handler for each given signal.
pub fn install_sigflags(sig_list: &[Signal]) -> Result<(), SysError> {
    for &sig in sig_list {
        if let Err(err) = shim::sigaction(sig, SigAction::Handler(flag_handler)) {
            return Err(SysError("sigaction()", err));
        }
    }

    Ok(())
}

/// True once a terminate or interrupt signal has ever been received.
/// The pump loops poll this between frames.
pub fn terminate_requested() -> bool {
    TERM_COUNT.load(Ordering::Relaxed) > 0 || INT_COUNT.load(Ordering::Relaxed) > 0
}

/// Take one pending child-status event, decrementing the counter so
/// queued exits are consumed one at a time.
fn consume_child_flag() -> bool {
    CHILD_COUNT
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .is_ok()
}

/// Consume one pending event.
/// Caller must have the event signals blocked.
fn check_flags() -> Option<SignalEvent> {
    if TERM_COUNT.load(Ordering::Relaxed) > 0 {
        return Some(SignalEvent::Terminate);
    }
    if INT_COUNT.load(Ordering::Relaxed) > 0 {
        return Some(SignalEvent::Interrupt);
    }
    if consume_child_flag() {
        return Some(SignalEvent::ChildStatus);
    }

    None
}

/// Wait until at least one event is pending and return it.
///
/// This is the race-free block-check-suspend pattern: block the event
/// signals, inspect the counters, and only if none is set atomically
/// unblock and sleep in sigsuspend() until a handler has run. The
/// original mask is restored before returning.
pub fn wait_event() -> Result<SignalEvent, SysError> {
    let old_mask = match shim::sigmask_block(&EVENT_SIGNALS) {
        Ok(mask) => mask,
        Err(err) => return Err(SysError("sigprocmask()", err)),
    };

    let event = loop {
        if let Some(event) = check_flags() {
            break event;
        }
        // No event yet; sleep until any signal is delivered, then re-check.
        // A handled signal outside the event set can wake us up spuriously.
        if let Err(err) = shim::sigsuspend(&old_mask) {
            return Err(SysError("sigsuspend()", err));
        }
    };

    if let Err(err) = shim::sigmask_restore(&old_mask) {
        return Err(SysError("sigprocmask()", err));
    }

    Ok(event)
}

/// Wait until a child-status-change is pending, or the timeout expires.
/// Returns whether a child event was consumed.
///
/// Unlike wait_event() this ignores the sticky terminate flags, which
/// are necessarily already set on the only path that uses it: waiting
/// for a SIGTERMed child so the caller can escalate to SIGKILL.
/// Terminate deliveries during the wait still bump their counters.
pub fn wait_child_timeout(timeout: Duration) -> Result<bool, SysError> {
    let old_mask = match shim::sigmask_block(&EVENT_SIGNALS) {
        Ok(mask) => mask,
        Err(err) => return Err(SysError("sigprocmask()", err)),
    };

    let deadline = std::time::Instant::now() + timeout;
    let got_child = loop {
        if consume_child_flag() {
            break true;
        }
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        if left.is_zero() {
            break false;
        }
        match shim::sigtimedwait(&EVENT_SIGNALS, left) {
            // sigtimedwait() consumed the signal without running the
            // handler, so account for it here and re-check.
            Ok(Some(sig)) => flag_handler(sig.as_raw() as libc::c_int),
            Ok(None) => break false,
            Err(err) => return Err(SysError("sigtimedwait()", err)),
        }
    };

    if let Err(err) = shim::sigmask_restore(&old_mask) {
        return Err(SysError("sigprocmask()", err));
    }

    Ok(got_child)
}

/// Get human-readable name for signal.
pub fn display_name(sig: Signal) -> String {
    if let Some(sig_name) = Signal::from_named_raw(sig.as_raw()) {
        format!("{:?}", sig_name).replace("Signal::", "SIG")
    } else {
        format!("[{}]", sig.as_raw())
    }
}
