//! Capability sets for the target program.
//!
//! Names are resolved to a bit mask before clone; the drop itself runs in the nested child and
//! does not allocate.

use alloc_counter::no_alloc;
use std::ffi::c_int;

use crate::config::ConfigError;
use crate::error::{bail_errno, Error, Result};

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Capability names in kernel bit order, as in `<linux/capability.h>`.
const NAMES: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "FSETID",
    "KILL",
    "SETGID",
    "SETUID",
    "SETPCAP",
    "LINUX_IMMUTABLE",
    "NET_BIND_SERVICE",
    "NET_BROADCAST",
    "NET_ADMIN",
    "NET_RAW",
    "IPC_LOCK",
    "IPC_OWNER",
    "SYS_MODULE",
    "SYS_RAWIO",
    "SYS_CHROOT",
    "SYS_PTRACE",
    "SYS_PACCT",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_NICE",
    "SYS_RESOURCE",
    "SYS_TIME",
    "SYS_TTY_CONFIG",
    "MKNOD",
    "LEASE",
    "AUDIT_WRITE",
    "AUDIT_CONTROL",
    "SETFCAP",
    "MAC_OVERRIDE",
    "MAC_ADMIN",
    "SYSLOG",
    "WAKE_ALARM",
    "BLOCK_SUSPEND",
    "AUDIT_READ",
    "PERFMON",
    "BPF",
    "CHECKPOINT_RESTORE",
];

/// A set of capabilities as a bit mask over capability numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet(u64);

impl CapSet {
    /// Resolve names such as `NET_ADMIN` or `CAP_NET_ADMIN`, in any case.
    pub fn from_names(
        names: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> std::result::Result<CapSet, ConfigError> {
        let mut bits = 0u64;
        for name in names {
            let name = name.as_ref();
            let upper = name.to_ascii_uppercase();
            let bare = upper.strip_prefix("CAP_").unwrap_or(&upper);
            let Some(index) = NAMES.iter().position(|n| *n == bare) else {
                return Err(ConfigError::UnknownCapability(name.to_owned()));
            };
            bits |= 1u64 << index;
        }
        Ok(CapSet(bits))
    }

    pub fn contains(&self, cap: u32) -> bool {
        cap < 64 && self.0 & (1u64 << cap) != 0
    }

    /// Remove every capability outside this set from the bounding set.
    ///
    /// Needs `CAP_SETPCAP`, so it runs before the user switch.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn drop_bounding(&self) -> Result<()> {
        for cap in 0..64u32 {
            if self.contains(cap) {
                continue;
            }
            let 0 = (unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong) }) else {
                let err = Error::last_os_error();
                // EINVAL: the running kernel does not know this capability.
                if err.errno == libc::EINVAL {
                    continue;
                }
                return Err(err.cause("prctl(PR_CAPBSET_DROP) failed"));
            };
        }
        Ok(())
    }

    /// Make this set the effective, permitted and inheritable sets of the calling thread.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn limit(&self) -> Result<()> {
        let mut header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let low = self.0 as u32;
        let high = (self.0 >> 32) as u32;
        let data = [
            CapUserData {
                effective: low,
                permitted: low,
                inheritable: low,
            },
            CapUserData {
                effective: high,
                permitted: high,
                inheritable: high,
            },
        ];
        let 0 = (unsafe {
            libc::syscall(
                libc::SYS_capset,
                &mut header as *mut CapUserHeader,
                data.as_ptr(),
            )
        }) else {
            bail_errno!("capset failed");
        };
        Ok(())
    }
}

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: c_int,
}

#[repr(C)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}
