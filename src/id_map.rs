use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::config::HostIdentity;
use crate::error::{Error, ErrorKind, Result};

/// A single-ID mapping: namespace ID 0 onto one host ID.
///
/// Nothing else is ever mapped. This is deliberately not a range allocator.
#[derive(Clone, Debug, Copy, Eq, PartialEq)]
pub struct IdMap {
    outer_id: u32,
}

impl IdMap {
    /// Map the namespace's root ID to `outer_id` on the host.
    pub fn root_to(outer_id: u32) -> IdMap {
        IdMap { outer_id }
    }

    /// Format the [`IdMap`] in the style of a `/proc/PID/uid_map` or `/proc/PID/gid_map` file.
    pub fn into_idmap_file_contents(&self) -> String {
        format!("0 {} 1\n", self.outer_id)
    }
}

/// The UID and GID maps of a process in a fresh user namespace.
#[derive(Clone, Debug, Copy, Eq, PartialEq)]
pub struct IdMappings {
    pub uid_map: IdMap,
    pub gid_map: IdMap,
}

impl IdMappings {
    pub fn for_host_identity(identity: HostIdentity) -> IdMappings {
        IdMappings {
            uid_map: IdMap::root_to(identity.uid),
            gid_map: IdMap::root_to(identity.gid),
        }
    }

    /// Write `<proc_root>/<pid>/uid_map` and then `<proc_root>/<pid>/gid_map`.
    pub fn write(&self, proc_root: &Path, pid: libc::pid_t) -> Result<()> {
        let dir = proc_root.join(pid.to_string());
        for (name, map) in [("uid_map", self.uid_map), ("gid_map", self.gid_map)] {
            let path = dir.join(name);
            OpenOptions::new()
                .write(true)
                .create(true)
                .mode(0o644)
                .open(&path)
                .and_then(|mut file| file.write_all(map.into_idmap_file_contents().as_bytes()))
                .map_err(|e| {
                    Error::from(e)
                        .kind(ErrorKind::ChildLifecycle)
                        .detail(path.display().to_string())
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_single_id() {
        let contents = IdMap::root_to(1017).into_idmap_file_contents();
        assert_eq!(contents, "0 1017 1\n");
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn mappings_follow_host_identity() {
        let mappings = IdMappings::for_host_identity(HostIdentity { uid: 1017, gid: 1018 });
        assert_eq!(mappings.uid_map.into_idmap_file_contents(), "0 1017 1\n");
        assert_eq!(mappings.gid_map.into_idmap_file_contents(), "0 1018 1\n");
    }

    #[test]
    fn write_fails_for_missing_process() {
        let mappings = IdMappings::for_host_identity(HostIdentity::default());
        let err = mappings
            .write(Path::new("/nonexistent/proc"), 4242)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChildLifecycle);
        assert!(err.to_string().contains("/nonexistent/proc/4242/uid_map"));
    }
}
