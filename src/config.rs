//! The container description handed to the init process.
//!
//! The configuration is read once, from `container.json` in the container's state directory,
//! and is never written back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the configuration file inside the `--root` directory.
pub const CONFIG_FILE_NAME: &str = "container.json";

/// Host account that the nested user namespace's root maps to, unless configured otherwise.
pub const DEFAULT_HOST_ID: u32 = 1017;

/// Configuration errors, reported before any kernel state is changed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid environment entry '{0}'")]
    InvalidEnvironment(String),

    #[error("unknown network type '{0}'")]
    UnknownNetworkType(String),

    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("unknown restriction scope '{0}'")]
    UnknownRestrictScope(String),

    #[error("invalid network address '{0}'")]
    InvalidAddress(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Container configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    /// Root filesystem to pivot into. Relative paths are taken from the init's working
    /// directory; empty means the working directory itself.
    pub rootfs: String,

    pub hostname: String,

    pub working_dir: String,

    /// `user`, `uid`, `user:group` or `uid:gid`, resolved against the container's
    /// `/etc/passwd` and `/etc/group`. Empty means "keep the current identity".
    pub user: String,

    /// Ordered `KEY=VALUE` entries making up the target's whole environment.
    #[serde(rename = "environment", alias = "env")]
    pub env: Vec<String>,

    pub networks: Vec<NetworkConfig>,

    /// Named security fields: `apparmor_profile`, `process_label`, `restrictions`.
    pub context: BTreeMap<String, String>,

    /// Capabilities kept by the target program. Everything else is dropped.
    pub capabilities: Vec<String>,

    pub host_identity: HostIdentity,
}

/// One network endpoint to attach inside the container's network namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Attachment strategy, e.g. `loopback` or `veth`.
    #[serde(rename = "type")]
    pub kind: String,

    /// IPv4 address in CIDR notation.
    pub address: String,

    pub gateway: String,

    pub mtu: u32,

    /// Name the interface is given inside the container.
    pub veth_prefix: String,

    /// Host bridge; used by the launcher, carried for completeness.
    pub bridge: String,
}

/// The unprivileged host account the nested namespace's root is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl Default for HostIdentity {
    fn default() -> Self {
        HostIdentity {
            uid: DEFAULT_HOST_ID,
            gid: DEFAULT_HOST_ID,
        }
    }
}

impl Container {
    /// Load `container.json` from the state directory `root`.
    pub fn load(root: impl AsRef<Path>) -> Result<Container, ConfigError> {
        let path = root.as_ref().join(CONFIG_FILE_NAME);
        let data = std::fs::read(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| ConfigError::Parse { path, source })
    }

    /// The root filesystem path as configured, before resolution.
    pub fn rootfs_path(&self) -> &Path {
        match self.rootfs.as_str() {
            "" => Path::new("."),
            rootfs => Path::new(rootfs),
        }
    }

    /// Look up a named security context field. Missing fields read as empty.
    pub fn context_value(&self, key: &str) -> &str {
        self.context.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Resolve the root filesystem path to an absolute path with all symlinks followed.
pub fn resolve_rootfs(unclean: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
    let unclean = unclean.as_ref();
    std::fs::canonicalize(unclean).map_err(|source| ConfigError::Read {
        path: unclean.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() -> eyre::Result<()> {
        let json = r#"{
            "rootfs": "/var/lib/nsinit/koye/rootfs",
            "hostname": "koye",
            "working_dir": "/srv",
            "user": "daemon",
            "environment": ["PATH=/bin", "HOME=/root"],
            "networks": [
                {"type": "loopback", "address": "127.0.0.1/0", "mtu": 1500},
                {"type": "veth", "address": "172.17.0.5/16", "gateway": "172.17.42.1",
                 "mtu": 1500, "veth_prefix": "eth0", "bridge": "docker0"}
            ],
            "context": {"apparmor_profile": "docker-default", "restrictions": "true"},
            "capabilities": ["CHOWN", "NET_BIND_SERVICE"],
            "host_identity": {"uid": 2000, "gid": 2001}
        }"#;
        let container: Container = serde_json::from_str(json)?;
        assert_eq!(container.hostname, "koye");
        assert_eq!(
            container.rootfs_path(),
            Path::new("/var/lib/nsinit/koye/rootfs")
        );
        assert_eq!(container.env, vec!["PATH=/bin", "HOME=/root"]);
        assert_eq!(container.networks.len(), 2);
        assert_eq!(container.networks[1].kind, "veth");
        assert_eq!(container.networks[1].gateway, "172.17.42.1");
        assert_eq!(container.context_value("apparmor_profile"), "docker-default");
        assert_eq!(container.context_value("process_label"), "");
        assert_eq!(container.host_identity, HostIdentity { uid: 2000, gid: 2001 });
        Ok(())
    }

    #[test]
    fn missing_fields_take_defaults() -> eyre::Result<()> {
        let container: Container = serde_json::from_str("{}")?;
        assert!(container.env.is_empty());
        assert!(container.networks.is_empty());
        assert_eq!(container.host_identity, HostIdentity::default());
        assert_eq!(container.host_identity.uid, DEFAULT_HOST_ID);
        assert_eq!(container.rootfs_path(), Path::new("."));
        Ok(())
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Container::load("/nonexistent/nsinit-state").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn rootfs_is_independent_of_the_state_directory() -> eyre::Result<()> {
        let state_dir = std::env::temp_dir().join(format!(
            "nsinit-state-{:016x}",
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&state_dir)?;
        let state_dir = state_dir.canonicalize()?;
        std::fs::write(
            state_dir.join(CONFIG_FILE_NAME),
            r#"{"rootfs": "/proc/self/cwd/."}"#,
        )?;
        let container = Container::load(&state_dir)?;
        std::fs::remove_dir_all(&state_dir)?;

        let rootfs = resolve_rootfs(container.rootfs_path())?;
        assert_ne!(rootfs, state_dir);
        assert_eq!(rootfs, std::env::current_dir()?.canonicalize()?);
        Ok(())
    }

    #[test]
    fn resolve_rootfs_follows_symlinks() -> eyre::Result<()> {
        let resolved = resolve_rootfs("/proc/self/cwd/.")?;
        assert!(resolved.is_absolute());
        assert_eq!(resolved, std::env::current_dir()?.canonicalize()?);
        Ok(())
    }
}
