use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::error;

use nsinit::handshake::SyncPipe;
use nsinit::log::{DiagnosticLog, LOG_PATH};
use nsinit::Container;

/// Initialize a freshly cloned container process and exec the target program.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding `container.json`.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Console (pty slave) path.
    #[arg(long)]
    console: Option<PathBuf>,

    /// Descriptor of the sync pipe shared with the launcher.
    #[arg(long)]
    pipe: RawFd,

    /// Diagnostic log file.
    #[arg(long, default_value = LOG_PATH)]
    log: PathBuf,

    /// Target program and its arguments.
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    args: Vec<String>,
}

fn configure_logging(log: &DiagnosticLog) -> nsinit::Result<()> {
    let default_verbosity = tracing_subscriber::filter::LevelFilter::DEBUG;
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_verbosity.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(Mutex::new(log.try_clone_file()?))
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(())
}

fn main() {
    let args = Args::parse();

    let log = match DiagnosticLog::open(&args.log) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("nsinit: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = configure_logging(&log) {
        eprintln!("nsinit: {e}");
        std::process::exit(1);
    }

    // SAFETY: the launcher hands us ownership of this descriptor.
    let sync_pipe = SyncPipe::from_child_fd(unsafe { OwnedFd::from_raw_fd(args.pipe) });

    let container = match Container::load(&args.root) {
        Ok(container) => container,
        Err(e) => {
            error!(err = %e, "unable to load container");
            std::process::exit(1);
        }
    };

    if let Err(e) = nsinit::init(
        &container,
        container.rootfs_path(),
        args.console.as_deref(),
        sync_pipe,
        &args.args,
        &log,
    ) {
        error!(err = %e, kind = ?e.kind, "init failed");
        std::process::exit(1);
    }
}
