//! Keeping the parent-death signal across identity changes.
//!
//! Changing UID or GID clears the parent-death signal. [`capture`] reads it before such a change
//! and [`restore`] puts it back afterwards.

use alloc_counter::no_alloc;
use std::ffi::c_int;

use crate::error::{bail_errno, Result};
use crate::libc_util::{get_parent_death_signal, set_parent_death_signal};

/// A captured parent-death signal. Zero means none was configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentDeathSignal(pub c_int);

#[cfg_attr(debug_assertions, no_alloc)]
pub fn capture() -> Result<ParentDeathSignal> {
    get_parent_death_signal()
        .map(ParentDeathSignal)
        .map_err(|e| e.context("get parent death signal"))
}

/// Reinstall `old` if an identity change cleared it.
///
/// If the parent already died while the signal was unset, the kernel never delivered it, so the
/// signal is sent to ourselves now. In a new PID namespace `getppid()` reads 0, never 1, so this
/// only fires when we were reparented to the host's init.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn restore(old: ParentDeathSignal) -> Result<()> {
    let ParentDeathSignal(old) = old;
    if old == 0 {
        return Ok(());
    }

    let current = get_parent_death_signal().map_err(|e| e.context("get parent death signal"))?;
    if current == old {
        return Ok(());
    }

    set_parent_death_signal(old).map_err(|e| e.context("set parent death signal"))?;

    if unsafe { libc::getppid() } == 1 {
        let 0 = (unsafe { libc::kill(libc::getpid(), old) }) else {
            bail_errno!("failed to deliver parent death signal to self");
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `f` in a forked child and return whether it reported success.
    fn in_child(f: fn() -> bool) -> bool {
        match unsafe { libc::fork() } {
            0 => unsafe { libc::_exit(if f() { 0 } else { 1 }) },
            pid @ 1.. => crate::libc_util::waitpid(pid).unwrap().success(),
            _ => panic!("fork failed"),
        }
    }

    #[test]
    fn restoring_zero_never_touches_current_value() {
        assert!(in_child(|| {
            for current in [0, libc::SIGTERM, libc::SIGUSR2] {
                if set_parent_death_signal(current).is_err() {
                    return false;
                }
                if restore(ParentDeathSignal(0)).is_err() {
                    return false;
                }
                if get_parent_death_signal().ok() != Some(current) {
                    return false;
                }
            }
            true
        }));
    }

    #[test]
    fn cleared_signal_is_reinstalled() {
        assert!(in_child(|| {
            let ok = set_parent_death_signal(libc::SIGUSR1).is_ok();
            let captured = capture();
            let cleared = set_parent_death_signal(0).is_ok();
            let restored = captured.clone().and_then(restore).is_ok();
            ok && cleared
                && restored
                && captured.ok() == Some(ParentDeathSignal(libc::SIGUSR1))
                && get_parent_death_signal().ok() == Some(libc::SIGUSR1)
        }));
    }
}
