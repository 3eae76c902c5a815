//! The init sequence, from a freshly cloned process to the target program.

use std::convert::Infallible;
use std::path::{Path, PathBuf};

use tracing::{debug, info, span, Level};

use crate::capabilities::CapSet;
use crate::config::{resolve_rootfs, ConfigError, Container};
use crate::console;
use crate::environment::Environment;
use crate::error::{bail, ErrorKind, Result};
use crate::escalate::{self, ExecTarget, PinnedThread};
use crate::handshake::SyncPipe;
use crate::log::DiagnosticLog;
use crate::mount;
use crate::network;
use crate::pdeathsig;
use crate::security::{self, Hardener, SecurityContext};
use crate::user;

/// Everything derived from the configuration before any kernel state changes.
struct Checked<'a> {
    rootfs: PathBuf,
    env: Environment,
    networks: network::Attachments<'a>,
    capabilities: CapSet,
    security: SecurityContext,
}

fn check<'a>(
    container: &'a Container,
    unclean_rootfs: &Path,
) -> std::result::Result<Checked<'a>, ConfigError> {
    let security = SecurityContext::from_container(container);
    if security.restrict {
        security::restrict::lookup(security::RESTRICT_SCOPE)?;
    }
    Ok(Checked {
        rootfs: resolve_rootfs(unclean_rootfs)?,
        env: Environment::from_entries(&container.env)?,
        networks: network::resolve(&container.networks)?,
        capabilities: CapSet::from_names(&container.capabilities)?,
        security,
    })
}

/// Run the container's init sequence and hand off to `args[0]`.
///
/// Every configuration error is reported before kernel state is touched. Any failure up to
/// the clone is returned. After the clone this process only exits, relaying the target's
/// status.
pub fn init(
    container: &Container,
    unclean_rootfs: &Path,
    console: Option<&Path>,
    mut sync_pipe: SyncPipe,
    args: &[String],
    log: &DiagnosticLog,
) -> Result<Infallible> {
    let span = span!(Level::DEBUG, "init");
    let _span_guard = span.enter();

    if args.is_empty() {
        sync_pipe.close();
        bail!(ErrorKind::Config, "no target program given");
    }

    let Checked {
        rootfs,
        env,
        networks,
        capabilities,
        security,
    } = match check(container, unclean_rootfs) {
        Ok(checked) => checked,
        Err(e) => {
            sync_pipe.close();
            return Err(e.into());
        }
    };
    debug!(rootfs = %rootfs.display(), vars = env.len(), "configuration checked");

    let context = sync_pipe.read_from_parent();
    sync_pipe.close();
    let context = context?;
    debug!(keys = ?context, "handshake complete");

    if let Some(console) = console {
        console::open_and_dup(console).map_err(|e| e.context("open console"))?;
    }
    console::setsid().map_err(|e| e.context("setsid"))?;
    if console.is_some() {
        console::setctty().map_err(|e| e.context("set controlling terminal"))?;
    }

    if !networks.is_empty() {
        networks.initialize(&context)?;
    }

    let hardener = Hardener::init(&security)?;

    mount::initialize_mount_namespace(&rootfs, console)
        .map_err(|e| e.or_context("setup mount namespace"))?;

    if !container.hostname.is_empty() {
        mount::set_hostname(&container.hostname).map_err(|e| e.context("set hostname"))?;
    }

    hardener.apply()?;

    // Resolved inside the new root, against the nested namespace's root identity.
    let exec_user = user::get_user_group_supplementary(&container.user, 0, 0)
        .map_err(|e| e.or_context("resolve container user"))?;

    let parent_death_signal = pdeathsig::capture()?;
    let target = ExecTarget::new(
        args,
        &env,
        &exec_user,
        &container.working_dir,
        capabilities,
        parent_death_signal,
    )?;

    let pinned = PinnedThread::pin();
    escalate::switch_host_identity(&pinned, container.host_identity)?;
    pdeathsig::restore(parent_death_signal)?;

    let status = escalate::escalate(&pinned, container.host_identity, &target, log.raw_fd())?;
    info!(?status, code = status.exit_code(), "relaying nested child status");
    std::process::exit(status.exit_code())
}
