use c_str_macro::c_str;
use std::ffi::{CStr, CString};

/// Device nodes bind-mounted from the host into the container's `/dev`.
pub const DEVICE_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// A list of mounts to be carried out inside the container's root filesystem.
#[derive(Debug, Clone)]
pub struct MountTable {
    /// The list of mounts.
    pub(crate) mounts: Vec<Mount>,

    /// The target prefix to prepend to each mount's target. By default, the empty string.
    target_prefix: Option<CString>,
}

/// Mount is a struct that represents a mount entry in the mount table.
#[derive(Debug, Clone)]
pub struct Mount {
    pub(crate) source: CString,
    pub(crate) target: CString,
    pub(crate) fstype: CString,
    pub(crate) flags: u64,
    pub(crate) data: Option<CString>,

    /// Before this mount is created, should we create a mountpoint for it?
    pub(crate) create_mountpoint: Option<MountpointType>,
}

/// The type of mountpoint to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountpointType {
    Dir,
    File,

    /// `stat()` the source of the mount, and use that type. Useful for bind mounts.
    DetermineFromSource,
}

impl Mount {
    /// Set whether we should create a mountpoint before mounting this mount.
    pub fn create_mountpoint(&mut self, mountpoint_type: MountpointType) -> &mut Self {
        self.create_mountpoint = Some(mountpoint_type);
        self
    }

    pub fn target(&self) -> &CStr {
        &self.target
    }

    pub fn fstype(&self) -> &CStr {
        &self.fstype
    }
}

impl MountTable {
    /// Creates a mount table with a target prefix.
    ///
    /// A target prefix will be automatically prepended to the `target` of each mount in the
    /// `MountTable`. The container pivots into this prefix once the table is mounted.
    pub fn with_target_prefix(prefix: impl Into<CString>) -> MountTable {
        MountTable {
            mounts: vec![],
            target_prefix: Some(prefix.into()),
        }
    }

    /// The mounts every container gets: `/proc`, a read-only `/sys`, a tmpfs `/dev` with a
    /// private devpts, `/dev/shm`, the host's basic device nodes, and the console if any.
    pub fn for_container(rootfs: impl Into<CString>, console: Option<&CStr>) -> MountTable {
        let mut mt = MountTable::with_target_prefix(rootfs);

        mt.add_proc();
        mt.add_sys();
        mt.add_mount(
            c_str!("tmpfs"),
            c_str!("/dev"),
            c_str!("tmpfs"),
            libc::MS_NOSUID | libc::MS_STRICTATIME,
            Some(c_str!("mode=755")),
        )
        .create_mountpoint(MountpointType::Dir);
        mt.add_mount(
            c_str!("devpts"),
            c_str!("/dev/pts"),
            c_str!("devpts"),
            libc::MS_NOSUID | libc::MS_NOEXEC,
            Some(c_str!("newinstance,ptmxmode=0666,mode=620")),
        )
        .create_mountpoint(MountpointType::Dir);
        mt.add_mount(
            c_str!("shm"),
            c_str!("/dev/shm"),
            c_str!("tmpfs"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            Some(c_str!("mode=1777,size=65536k")),
        )
        .create_mountpoint(MountpointType::Dir);

        for node in DEVICE_NODES {
            let path = CString::new(format!("/dev/{node}")).expect("device names are NUL-free");
            mt.add_bind(path.clone(), path)
                .create_mountpoint(MountpointType::File);
        }

        if let Some(console) = console {
            mt.add_bind(console, c_str!("/dev/console"))
                .create_mountpoint(MountpointType::File);
        }

        mt
    }

    /// Get the current target prefix.
    pub fn target_prefix(&self) -> Option<&CStr> {
        self.target_prefix.as_deref()
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Adds a mount to the mount table.
    pub fn add_mount(
        &mut self,
        source: impl Into<CString>,
        target: impl Into<CString>,
        fstype: impl Into<CString>,
        flags: u64,
        data: Option<impl Into<CString>>,
    ) -> &mut Mount {
        // Concatenate target_prefix with target
        let prefixed_target: CString = match &self.target_prefix {
            Some(prefix) => {
                let mut new_target = prefix.clone().into_bytes();
                new_target.push(b'/');
                new_target.extend(target.into().as_bytes());
                CString::new(new_target)
                    .expect("impossible for target_prefix or target to contain a NUL")
            }
            None => target.into(),
        };

        let mount = Mount {
            source: source.into(),
            target: prefixed_target,
            fstype: fstype.into(),
            flags,
            data: data.map(|d| d.into()),
            create_mountpoint: None,
        };
        self.mounts.push(mount);
        self.mounts.last_mut().expect("a mount was just pushed")
    }

    /// Adds a bind mount to the mount table.
    pub fn add_bind(
        &mut self,
        source: impl Into<CString>,
        target: impl Into<CString>,
    ) -> &mut Mount {
        self.add_mount(
            source,
            target,
            c_str!("<bind>"),
            libc::MS_BIND | libc::MS_REC, // Always use a recursive bind mount.
            None::<CString>,
        )
        .create_mountpoint(MountpointType::DetermineFromSource)
    }

    /// Adds a procfs mount at `/proc`.
    pub fn add_proc(&mut self) {
        self.add_mount(
            c_str!("proc"),
            c_str!("/proc"),
            c_str!("proc"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            None::<CString>,
        )
        .create_mountpoint(MountpointType::Dir);
    }

    /// Mounts a fresh, read-only sysfs at `/sys`.
    pub fn add_sys(&mut self) {
        self.add_mount(
            c_str!("sysfs"),
            c_str!("/sys"),
            c_str!("sysfs"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC | libc::MS_RDONLY,
            None::<CString>,
        )
        .create_mountpoint(MountpointType::Dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_prefixed_with_rootfs() {
        let mt = MountTable::for_container(c_str!("/var/lib/ct/rootfs"), None);
        assert_eq!(mt.target_prefix(), Some(c_str!("/var/lib/ct/rootfs")));
        assert_eq!(mt.mounts()[0].target(), c_str!("/var/lib/ct/rootfs//proc"));
        assert_eq!(mt.mounts()[0].fstype(), c_str!("proc"));
    }

    #[test]
    fn console_is_bound_last() {
        let mt = MountTable::for_container(c_str!("/r"), Some(c_str!("/dev/pts/7")));
        let last = mt.mounts().last().unwrap();
        assert_eq!(last.target(), c_str!("/r//dev/console"));
        assert_eq!(last.source, CString::from(c_str!("/dev/pts/7")));
        assert_eq!(last.create_mountpoint, Some(MountpointType::File));
    }

    #[test]
    fn dev_is_mounted_before_its_contents() {
        let mt = MountTable::for_container(c_str!("/r"), None);
        let position = |target: &CStr| mt.mounts().iter().position(|m| m.target() == target);
        let dev = position(c_str!("/r//dev")).unwrap();
        assert!(position(c_str!("/r//dev/pts")).unwrap() > dev);
        assert!(position(c_str!("/r//dev/null")).unwrap() > dev);
    }
}
