use tracing::debug;

use super::netdev::NetDev;
use crate::config::NetworkConfig;
use crate::error::Result;
use crate::handshake::Context;

/// Bring up `lo` inside the new network namespace.
pub fn initialize(_config: &NetworkConfig, _context: &Context) -> Result<()> {
    NetDev::open()?
        .set_up("lo")
        .map_err(|e| e.context("bring up loopback"))?;
    debug!("lo is up");
    Ok(())
}
