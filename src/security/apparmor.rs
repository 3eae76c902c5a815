use std::fs;

use tracing::debug;

use crate::error::{Error, Result};

const ENABLED_PATH: &str = "/sys/module/apparmor/parameters/enabled";
const EXEC_ATTR_PATH: &str = "/proc/self/attr/exec";

pub fn is_enabled() -> bool {
    fs::read(ENABLED_PATH)
        .map(|buf| buf.first() == Some(&b'Y'))
        .unwrap_or(false)
}

/// Arrange for the next exec to transition into profile `name`.
///
/// An empty name selects the default (unconfined-by-us) profile, so nothing is written.
pub fn apply_profile(name: &str) -> Result<()> {
    if name.is_empty() || !is_enabled() {
        debug!(profile = name, "no apparmor transition");
        return Ok(());
    }
    fs::write(EXEC_ATTR_PATH, format!("exec {name}")).map_err(|e| {
        Error::from(e)
            .cause("failed to write apparmor exec attribute")
            .detail(name)
    })?;
    debug!(profile = name, "apparmor profile applied");
    Ok(())
}
