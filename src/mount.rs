//! Builds the container's mount namespace and pivots into its root filesystem.

use std::ffi::{c_char, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use c_str_macro::c_str;
use tracing::{debug, span, Level};

use crate::error::{bail, bail_errno, ErrorKind, Result};
use crate::libc_util::{mkdirp, stat};
use crate::mount_table::{self, MountTable};

fn c_path(path: &Path) -> Result<CString> {
    let Ok(c) = CString::new(path.as_os_str().as_bytes()) else {
        bail!(ErrorKind::Config, "path contains an interior NUL");
    };
    Ok(c)
}

/// Mount the container's filesystems under `rootfs` and make it the root of this mount
/// namespace. The calling process must already be in its own mount namespace.
pub fn initialize_mount_namespace(rootfs: &Path, console: Option<&Path>) -> Result<()> {
    let span = span!(Level::DEBUG, "mount", rootfs = %rootfs.display());
    let _span_guard = span.enter();

    let rootfs = c_path(rootfs)?;
    let console = console.map(c_path).transpose()?;

    // Mount events from the host should propagate in, but mount events in the container
    // should not propagate out.
    let 0 = (unsafe {
        libc::mount(
            ptr::null(),
            c_str!("/").as_ptr(),
            ptr::null(),
            libc::MS_SLAVE | libc::MS_REC,
            ptr::null(),
        )
    }) else {
        bail_errno!("remounting root as slave recursive failed");
    };

    // The new root must be a mount point. MS_REC carries bind mounts inside it along.
    let 0 = (unsafe {
        libc::mount(
            rootfs.as_ptr(),
            rootfs.as_ptr(),
            c_str!("bind").as_ptr(),
            libc::MS_BIND | libc::MS_REC,
            ptr::null(),
        )
    }) else {
        bail_errno!("re-bind-mounting rootfs failed");
    };

    let table = MountTable::for_container(rootfs.clone(), console.as_deref());
    mount_all(&table)?;

    setup_ptmx(&rootfs)?;

    pivot_root(&rootfs)?;
    debug!("pivoted into rootfs");
    Ok(())
}

fn mount_all(table: &MountTable) -> Result<()> {
    for mount in table.mounts() {
        // NOTE: There is a TOCTOU race condition between reading the filetype of the source,
        // and creating the right kind of mountpoint.
        if let Some(mut mountpoint_type) = mount.create_mountpoint {
            if mountpoint_type == mount_table::MountpointType::DetermineFromSource {
                let source_stat = stat(mount.source.as_ptr()).map_err(|e| {
                    e.context("failed to stat() mount source while creating mountpoint")
                })?;

                if source_stat.st_mode & libc::S_IFMT == libc::S_IFDIR {
                    mountpoint_type = mount_table::MountpointType::Dir;
                } else {
                    mountpoint_type = mount_table::MountpointType::File;
                }
            }

            match mountpoint_type {
                mount_table::MountpointType::Dir => {
                    let target_ptr: *const c_char = mount.target.as_ptr();
                    mkdirp(target_ptr)
                        .map_err(|e| e.context("failed to mkdir() directory mountpoint"))?;
                }
                mount_table::MountpointType::File => {
                    let fd @ 0.. = (unsafe {
                        libc::open(
                            mount.target.as_ptr(),
                            libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC,
                            0o644,
                        )
                    }) else {
                        bail_errno!("failed to create file mountpoint");
                    };
                    unsafe { libc::close(fd) };
                }
                mount_table::MountpointType::DetermineFromSource => {
                    unreachable!("type should have been resolved earlier in the function")
                }
            }
        }

        debug!(
            source = ?mount.source,
            target = ?mount.target,
            fstype = ?mount.fstype,
            "mounting"
        );
        let 0 = (unsafe {
            libc::mount(
                mount.source.as_ptr(),
                mount.target.as_ptr(),
                mount.fstype.as_ptr(),
                mount.flags,
                match &mount.data {
                    Some(data) => data.as_ptr().cast(),
                    None => ptr::null(),
                },
            )
        }) else {
            bail_errno!("container mount failed");
        };
    }
    Ok(())
}

/// Point `/dev/ptmx` at the container's private devpts instance.
fn setup_ptmx(rootfs: &CString) -> Result<()> {
    let mut path = rootfs.clone().into_bytes();
    path.extend_from_slice(b"/dev/ptmx");
    let Ok(path) = CString::new(path) else {
        bail!(ErrorKind::Config, "rootfs path contains an interior NUL");
    };

    let _ = unsafe { libc::unlink(path.as_ptr()) };
    let 0 = (unsafe { libc::symlink(c_str!("pts/ptmx").as_ptr(), path.as_ptr()) }) else {
        bail_errno!("failed to symlink /dev/ptmx");
    };
    Ok(())
}

/// Pivot root into `new_root` using the `pivot_root(".", ".")` shortcut.
fn pivot_root(new_root: &CString) -> Result<()> {
    let 0 = (unsafe { libc::chdir(new_root.as_ptr()) }) else {
        bail_errno!("chdir to pivot_root location failed");
    };

    let dot = c_str!(".").as_ptr();
    let 0 = (unsafe { libc::syscall(libc::SYS_pivot_root, dot, dot) }) else {
        bail_errno!("pivot_root failed");
    };

    // Unmount the old root, which is now stacked on top of the new one.
    let 0 = (unsafe { libc::umount2(dot, libc::MNT_DETACH) }) else {
        bail_errno!("failed to detach old root mount point");
    };

    let 0 = (unsafe { libc::chdir(c_str!("/").as_ptr()) }) else {
        bail_errno!("chdir to / after pivot_root failed");
    };
    Ok(())
}

/// Set the UTS namespace's hostname.
pub fn set_hostname(hostname: &str) -> Result<()> {
    let 0 = (unsafe { libc::sethostname(hostname.as_ptr().cast(), hostname.len()) }) else {
        bail_errno!("sethostname failed");
    };
    debug!(hostname, "hostname set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_in_rootfs_is_a_config_error() {
        use std::ffi::OsStr;
        let path = Path::new(OsStr::from_bytes(b"/var/lib/\0rootfs"));
        let err = initialize_mount_namespace(path, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }
}
