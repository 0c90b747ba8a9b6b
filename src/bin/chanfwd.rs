use chanpipe::daemon::{self, PidFile};
use chanpipe::error::{FwdError, Status};
use chanpipe::headers::{self, Direction, Transport};
use chanpipe::log;
use chanpipe::log::Level;
use chanpipe::session::{self, ClientOpts, SessionIo};
use chanpipe::shim;
use chanpipe::signal;
use chanpipe::status::*;
use chanpipe::die;
use clap::Parser;
use clap::error::ErrorKind;
use rustix::process::Signal;
use rustix::stdio;
use rustix::termios;
use std::io;
use std::path::PathBuf;
use std::process;

/// Default TCP port of the forwarding service.
const DEFAULT_PORT: u16 = 8076;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Forward channel frames over the network",
    long_about = "Forward channel frames over the network.\n\
                  Without -S or -P the process runs as a server reading \
                  from stdin and writing to stdout, the way an inetd-style \
                  launcher hands over a connected socket. With -S or -P it \
                  connects to a remote server and pushes or pulls the named \
                  channel."
)]
struct Args {
    /// Push frames from the local channel to HOST.
    #[arg(short = 'S', long = "push-to", value_name = "HOST")]
    push_to: Option<String>,

    /// Pull frames from HOST into the local channel.
    #[arg(conflicts_with = "push_to", short = 'P', long = "pull-from", value_name = "HOST")]
    pull_from: Option<String>,

    /// Daemonize (client mode only).
    #[arg(short = 'd', long, default_value_t = false)]
    daemonize: bool,

    /// TCP port of the remote server.
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT, value_name = "PORT")]
    port: u16,

    /// Lock FILE and write our pid there.
    #[arg(short = 'f', long = "pidfile", value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// Transport to use.
    #[arg(short = 't', long, default_value = "tcp", value_name = "tcp|udp")]
    transport: String,

    /// Remote channel name, when it differs from the local one.
    #[arg(short = 'z', long = "remote-channel", value_name = "NAME")]
    remote_channel: Option<String>,

    /// Forward only the latest frame, skipping backlog.
    #[arg(long, default_value_t = false)]
    last: bool,

    /// Set TCP_NODELAY on the client socket.
    #[arg(long, default_value_t = false)]
    nodelay: bool,

    /// Print less.
    #[arg(short = 'q', long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Print more.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Channel to forward (client mode).
    #[arg(value_name = "CHANNEL-NAME")]
    channel: Option<String>,
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
        Ok(args) => args,
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

/// Interactive error reporting for client mode: one line on stderr.
fn report_interactive(err: &FwdError) -> ! {
    if log::verbosity() >= 0 {
        eprintln!("chanfwd: {} - {}", err.status().label(), err);
    }
    process::exit(EXIT_FAILURE);
}

/// Serve one session on the connected socket we were handed as
/// stdin/stdout. Errors go back to the peer as a status+message block.
fn run_server() -> ! {
    if termios::isatty(stdio::stdin()) || termios::isatty(stdio::stdout()) {
        eprintln!("chanfwd: refusing to serve a terminal");
        process::exit(EXIT_FAILURE);
    }

    // stderr may be the service socket itself; from here on messages
    // go to the system logger only.
    log::open(c"chanfwd");
    // SAFETY: stderr is not owned by any live object at this point.
    unsafe { shim::close_raw(2) };

    if let Err(err) = signal::install_sigflags(&[Signal::TERM, Signal::INT]) {
        die!("can't install signal handlers - {}", err);
    }

    let mut session_io = SessionIo {
        input: Box::new(io::stdin().lock()),
        output: Box::new(io::stdout().lock()),
    };

    match session::serve(&mut session_io) {
        Ok(()) => process::exit(EXIT_SUCCESS),
        Err(err) => {
            log!(Level::Err, "{}", err);
            session::report_header_error(&mut session_io, &err);
            let code = err.status().code();
            process::exit(if code != 0 { code } else { EXIT_FAILURE });
        }
    }
}

/// Connect to a remote server and forward the named channel.
fn run_client(args: Args, remote_host: String, direction: Direction, transport: Transport) -> ! {
    let chan_name = match args.channel {
        Some(name) => name,
        None => usage_error!("no channel name given"),
    };

    if args.daemonize {
        if let Err(err) = daemon::detach(c"chanfwd") {
            die!("can't detach - {}", err);
        }
    }

    let mut pid_file = args.pidfile.as_ref().map(|path| match PidFile::lock(path) {
        Ok(file) => file,
        Err(err) => die!("can't lock pid file \"{}\" - {}", path.display(), err),
    });
    if let Some(file) = pid_file.as_mut() {
        if let Err(err) = file.write_pid(process::id() as i32) {
            die!("can't write pid file - {}", err);
        }
    }

    if let Err(err) = signal::install_sigflags(&[Signal::TERM, Signal::INT]) {
        die!("can't install signal handlers - {}", err);
    }

    let opts = ClientOpts {
        chan_name,
        remote_chan_name: args.remote_channel,
        remote_host,
        port: args.port,
        transport,
        direction,
        tcp_nodelay: args.nodelay,
        get_last: args.last,
    };

    match session::client(&opts) {
        Ok(()) => process::exit(EXIT_SUCCESS),
        Err(err) => report_interactive(&err),
    }
}

fn main() {
    let args = parse_args();
    log::set_verbosity(args.verbose as i32 - args.quiet as i32);

    let transport = match headers::parse_transport(&args.transport) {
        Ok(transport) => transport,
        Err(FwdError::Proto(Status::BadHeader, msg)) => usage_error!("{}", msg),
        Err(err) => usage_error!("{}", err),
    };

    match (args.push_to.clone(), args.pull_from.clone()) {
        (Some(host), None) => run_client(args, host, Direction::Push, transport),
        (None, Some(host)) => run_client(args, host, Direction::Pull, transport),
        (None, None) => run_server(),
        (Some(_), Some(_)) => usage_error!("can't push and pull at the same time"),
    }
}
