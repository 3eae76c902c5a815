use std::ffi::CString;
use std::path::Path;
use std::ptr;

use c_str_macro::c_str;
use tracing::debug;

use crate::config::ConfigError;
use crate::error::{bail_errno, Result};

/// Paths locked down for one restriction scope.
#[derive(Debug)]
pub struct Scope {
    pub name: &'static str,
    /// Remounted read-only.
    pub read_only: &'static [&'static str],
    /// Covered by a bind mount of `/dev/null`.
    pub masked: &'static [&'static str],
}

const SCOPES: &[Scope] = &[Scope {
    name: "sys",
    read_only: &[
        "/proc/sys",
        "/proc/sysrq-trigger",
        "/proc/irq",
        "/proc/bus",
        "/sys",
    ],
    masked: &["/proc/kcore"],
}];

pub fn lookup(scope: &str) -> std::result::Result<&'static Scope, ConfigError> {
    SCOPES
        .iter()
        .find(|s| s.name == scope)
        .ok_or_else(|| ConfigError::UnknownRestrictScope(scope.to_owned()))
}

/// Make the kernel surfaces named by `scope` read-only or inaccessible.
pub fn restrict(scope: &str) -> Result<()> {
    let scope = lookup(scope)?;

    for path in scope.read_only {
        if !Path::new(path).exists() {
            continue;
        }
        let target = CString::new(*path).expect("scope paths are NUL-free");
        let 0 = (unsafe {
            libc::mount(
                target.as_ptr(),
                target.as_ptr(),
                ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                ptr::null(),
            )
        }) else {
            bail_errno!("bind mount for restriction failed");
        };
        let 0 = (unsafe {
            libc::mount(
                target.as_ptr(),
                target.as_ptr(),
                ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_REC,
                ptr::null(),
            )
        }) else {
            bail_errno!("read-only remount for restriction failed");
        };
        debug!(path, "restricted read-only");
    }

    for path in scope.masked {
        if !Path::new(path).exists() {
            continue;
        }
        let target = CString::new(*path).expect("scope paths are NUL-free");
        let 0 = (unsafe {
            libc::mount(
                c_str!("/dev/null").as_ptr(),
                target.as_ptr(),
                ptr::null(),
                libc::MS_BIND,
                ptr::null(),
            )
        }) else {
            bail_errno!("masking for restriction failed");
        };
        debug!(path, "masked");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_scope_covers_proc_and_sys() {
        let scope = lookup("sys").unwrap();
        assert!(scope.read_only.contains(&"/sys"));
        assert!(scope.read_only.contains(&"/proc/sys"));
        assert_eq!(scope.masked, &["/proc/kcore"]);
    }

    #[test]
    fn unknown_scope_is_a_config_error() {
        assert!(matches!(
            lookup("net"),
            Err(ConfigError::UnknownRestrictScope(ref s)) if s == "net"
        ));
        assert!(restrict("net").is_err());
    }
}
