use chanpipe::daemon::{self, PidFile};
use chanpipe::error::SysError;
use chanpipe::log;
use chanpipe::log::Level;
use chanpipe::shim::{self, Fork};
use chanpipe::signal::{self, SignalEvent};
use chanpipe::status::*;
use chanpipe::die;
use clap::Parser;
use clap::error::ErrorKind;
use rustix::io::Errno;
use rustix::process::{Pid, Signal, WaitOptions, kill_process, waitpid};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

/// How long a SIGTERMed child gets before it's SIGKILLed.
const CHILD_TERM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Watchdog to run and restart channel daemons",
    long_about = "Watchdog to run and restart channel daemons.\n\
                  The child is restarted whenever it exits with a non-zero \
                  status or is killed by a signal; a clean exit ends the \
                  supervisor too. SIGTERM and SIGINT are forwarded to the \
                  child before the supervisor exits with the child's status."
)]
struct Args {
    /// File for pid of the supervisor process.
    #[arg(short = 'P', long = "pidfile", value_name = "PATH")]
    pidfile: Option<PathBuf>,

    /// File for pid of the child process.
    #[arg(short = 'p', long = "child-pidfile", value_name = "PATH")]
    child_pidfile: Option<PathBuf>,

    /// Redirect stdout to this file.
    #[arg(short = 'o', long = "stdout", value_name = "PATH")]
    stdout: Option<PathBuf>,

    /// Redirect stderr to this file.
    #[arg(short = 'e', long = "stderr", value_name = "PATH")]
    stderr: Option<PathBuf>,

    /// Detach and run in the background.
    #[arg(short = 'd', long, default_value_t = false)]
    detach: bool,

    /// Make output more verbose.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Child command to run.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "CHILD-COMMAND"
    )]
    command: Vec<String>,
}

/// Print usage error to stderr and exit with EXIT_USAGE code.
macro_rules! usage_error {
    ($fmt:expr $(,$args:expr)*) => ({
        eprint!(concat!("error: ", $fmt, "\n\nFor more information, try '--help'.\n"),
                $($args),*);
        std::process::exit(EXIT_USAGE);
    });
}

/// Parse CLI arguments.
/// Also handles --help, --version, and usage errors.
fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => {
            if args.command.is_empty() {
                usage_error!("no child command given");
            }
            if args.command[0].starts_with('-') {
                usage_error!("unknown option '{}'", args.command[0]);
            }

            args
        }
        Err(err) if err.kind() == ErrorKind::DisplayHelp => {
            print!("{}", err);
            process::exit(EXIT_SUCCESS);
        }
        Err(err) if err.kind() == ErrorKind::DisplayVersion => {
            print!("{} {}\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            process::exit(EXIT_SUCCESS);
        }
        Err(err) => {
            eprint!("{}", err);
            process::exit(EXIT_USAGE);
        }
    }
}

/// Everything the supervision loop works on.
/// Only the signal counters live outside this struct; they are forced
/// process-global by handler async-signal-safety.
struct Supervisor {
    child_argv: Vec<String>,
    child_pid: Option<Pid>,
    /// Held for its advisory lock.
    sup_pid_file: Option<PidFile>,
    child_pid_file: Option<PidFile>,
}

/// How the child ended.
enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

/// Fork and exec the child command, recording its pid.
fn start_child(cx: &mut Supervisor) {
    if cx.child_pid.is_some() {
        die!("internal error - previous child not collected");
    }

    // SAFETY: the child branch only calls exec() and on failure exits
    // immediately without running any parent-side destructors.
    match unsafe { shim::fork() } {
        Ok(Fork::Child) => {
            let mut cmd = exec::Command::new(&cx.child_argv[0]);
            if cx.child_argv.len() > 1 {
                cmd.args(&cx.child_argv[1..]);
            }
            _ = cmd.exec();
            unsafe { shim::fast_exit(EXIT_COMMAND_FAILED) }
        }
        Ok(Fork::Parent(pid)) => {
            log!(Level::Info, "started child {}", pid.as_raw_nonzero());
            cx.child_pid = Some(pid);
            if let Some(file) = cx.child_pid_file.as_mut() {
                if let Err(err) = file.write_pid(pid.as_raw_nonzero().get()) {
                    log!(Level::Err, "can't write child pid file - {}", err);
                }
            }
        }
        Err(err) => {
            die!("can't fork child - {}", SysError("fork()", err));
        }
    }
}

/// Block until the tracked child reports exit or termination by
/// signal, and clear its pid.
/// Reaping an unexpected pid is logged and ignored; running out of
/// children entirely is a programmer error.
fn waitloop(cx: &mut Supervisor) -> ChildExit {
    let child_pid = match cx.child_pid {
        Some(pid) => pid,
        None => die!("internal error - no child to wait for"),
    };

    loop {
        match waitpid(None, WaitOptions::empty()) {
            Ok(Some((pid, status))) => {
                if pid != child_pid {
                    log!(
                        Level::Err,
                        "got unexpected pid from wait, child {}, got {}",
                        child_pid.as_raw_nonzero(),
                        pid.as_raw_nonzero()
                    );
                    continue;
                }
                if let Some(code) = status.exit_status() {
                    log!(Level::Debug, "child exited with {}", code);
                    cx.child_pid = None;
                    return ChildExit::Exited(code);
                }
                if let Some(sig) = status.terminating_signal() {
                    log!(Level::Debug, "child terminated by signal {}", sig);
                    cx.child_pid = None;
                    return ChildExit::Signaled(sig);
                }
                // Stopped or continued; keep waiting.
                log!(Level::Warning, "unexpected wait status, still waiting");
            }
            Ok(None) => continue,
            Err(Errno::INTR) => {
                log!(Level::Debug, "wait interrupted");
            }
            Err(Errno::CHILD) => {
                die!("internal error - no children left to wait for");
            }
            Err(err) => {
                die!("can't wait for child - {}", SysError("waitpid()", err));
            }
        }
    }
}

/// Ask the child to terminate and collect its status, escalating to
/// SIGKILL after CHILD_TERM_TIMEOUT. Returns the supervisor exit code.
fn stop_child(cx: &mut Supervisor) -> i32 {
    let child_pid = match cx.child_pid {
        Some(pid) => pid,
        None => return EXIT_SUCCESS,
    };

    log!(Level::Debug, "sending SIGTERM to child");
    if let Err(err) = kill_process(child_pid, Signal::TERM) {
        die!("can't kill child - {}", SysError("kill()", err));
    }

    match signal::wait_child_timeout(CHILD_TERM_TIMEOUT) {
        Ok(true) => {}
        Ok(false) => {
            log!(Level::Warning, "child ignored SIGTERM, sending SIGKILL");
            _ = kill_process(child_pid, Signal::KILL);
        }
        Err(err) => die!("can't wait for signal - {}", err),
    }

    match waitloop(cx) {
        ChildExit::Exited(code) => code,
        ChildExit::Signaled(sig) => EXIT_COMMAND_SIGNALED + sig,
    }
}

/// The supervision loop: run the child, restart it on abnormal exit,
/// leave on clean exit or terminate request.
fn run(cx: &mut Supervisor) -> ! {
    loop {
        start_child(cx);

        match signal::wait_event() {
            Ok(SignalEvent::Terminate) | Ok(SignalEvent::Interrupt) => {
                log!(Level::Debug, "terminate requested, stopping child");
                let code = stop_child(cx);
                process::exit(code);
            }
            Ok(SignalEvent::ChildStatus) => match waitloop(cx) {
                ChildExit::Exited(0) => {
                    log!(Level::Debug, "child exited cleanly, exiting");
                    process::exit(EXIT_SUCCESS);
                }
                ChildExit::Exited(code) => {
                    log!(Level::Notice, "child exited with {}, restarting", code);
                }
                ChildExit::Signaled(sig) => match Signal::from_named_raw(sig) {
                    Some(sig) => log!(
                        Level::Notice,
                        "child terminated by {}, restarting",
                        signal::display_name(sig)
                    ),
                    None => log!(Level::Notice, "child terminated by signal {}, restarting", sig),
                },
            },
            Err(err) => {
                die!("can't wait for signal - {}", err);
            }
        }
    }
}

fn main() {
    let args = parse_args();
    log::set_verbosity(args.verbose as i32);

    if args.detach {
        if let Err(err) = daemon::detach(c"chansup") {
            die!("can't detach - {}", err);
        }
    }

    // Take both locks before anything else has side effects; failure
    // means another supervisor already owns them.
    let mut sup_pid_file = args.pidfile.as_ref().map(|path| match PidFile::lock(path) {
        Ok(file) => file,
        Err(err) => die!("can't lock pid file \"{}\" - {}", path.display(), err),
    });
    let child_pid_file = args
        .child_pidfile
        .as_ref()
        .map(|path| match PidFile::lock(path) {
            Ok(file) => file,
            Err(err) => die!("can't lock pid file \"{}\" - {}", path.display(), err),
        });

    if let Some(file) = sup_pid_file.as_mut() {
        if let Err(err) = file.write_pid(process::id() as i32) {
            die!("can't write pid file - {}", err);
        }
    }

    if let Some(path) = &args.stdout {
        if let Err(err) = daemon::redirect_stdout(path) {
            die!("can't redirect stdout to \"{}\" - {}", path.display(), err);
        }
    }
    if let Some(path) = &args.stderr {
        if let Err(err) = daemon::redirect_stderr(path) {
            die!("can't redirect stderr to \"{}\" - {}", path.display(), err);
        }
    }

    if let Err(err) = signal::install_sigflags(&[Signal::TERM, Signal::INT, Signal::CHILD]) {
        die!("can't install signal handlers - {}", err);
    }

    let mut cx = Supervisor {
        child_argv: args.command,
        child_pid: None,
        sup_pid_file,
        child_pid_file,
    };
    run(&mut cx);
}
