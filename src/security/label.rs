use std::path::Path;
use std::sync::OnceLock;

use crate::error::{Error, Result};

const SELINUX_ENFORCE_PATH: &str = "/sys/fs/selinux/enforce";
const EXEC_ATTR_PATH: &str = "/proc/self/attr/exec";

static SELINUX_ENABLED: OnceLock<bool> = OnceLock::new();

/// Detect SELinux once per process. Later calls return the first answer.
pub fn init() -> bool {
    *SELINUX_ENABLED.get_or_init(|| Path::new(SELINUX_ENFORCE_PATH).exists())
}

/// Set the label the next exec runs under. Empty labels and disabled systems are no-ops.
pub fn set_process_label(label: &str) -> Result<()> {
    if label.is_empty() || !init() {
        return Ok(());
    }
    std::fs::write(EXEC_ATTR_PATH, label).map_err(|e| {
        Error::from(e)
            .cause("failed to write selinux exec attribute")
            .detail(label)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_stable() {
        assert_eq!(init(), init());
    }

    #[test]
    fn empty_label_is_a_no_op() {
        assert!(set_process_label("").is_ok());
    }
}
