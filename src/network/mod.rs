//! Network attachment inside the container's network namespace.
//!
//! Each declared endpoint names a strategy by type string. Resolution is a plain lookup into a
//! closed set of strategies; it is done for every endpoint before any of them is initialized,
//! so an unknown type aborts before anything is configured.

mod loopback;
mod netdev;
mod veth;

use tracing::{debug, span, Level};

use crate::config::{ConfigError, NetworkConfig};
use crate::error::Result;
use crate::handshake::Context;

/// An attachment strategy, resolved from an endpoint's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Loopback,
    Veth,
}

impl Strategy {
    /// Every registered strategy with the type string that selects it.
    pub const REGISTRY: &'static [(&'static str, Strategy)] =
        &[("loopback", Strategy::Loopback), ("veth", Strategy::Veth)];

    /// Resolve a strategy by its type string.
    pub fn lookup(kind: &str) -> std::result::Result<Strategy, ConfigError> {
        Self::REGISTRY
            .iter()
            .find(|(name, _)| *name == kind)
            .map(|(_, strategy)| *strategy)
            .ok_or_else(|| ConfigError::UnknownNetworkType(kind.to_owned()))
    }

    /// Configure the endpoint so it is usable from inside the namespace.
    pub fn initialize(&self, config: &NetworkConfig, context: &Context) -> Result<()> {
        match self {
            Strategy::Loopback => loopback::initialize(config, context),
            Strategy::Veth => veth::initialize(config, context),
        }
    }
}

/// Endpoints paired with their resolved strategies.
#[derive(Debug, Clone)]
pub struct Attachments<'a> {
    resolved: Vec<(Strategy, &'a NetworkConfig)>,
}

/// Resolve a strategy for every endpoint. Fails on the first unknown type.
pub fn resolve(networks: &[NetworkConfig]) -> std::result::Result<Attachments<'_>, ConfigError> {
    let resolved = networks
        .iter()
        .map(|config| Ok((Strategy::lookup(&config.kind)?, config)))
        .collect::<std::result::Result<Vec<_>, ConfigError>>()?;
    Ok(Attachments { resolved })
}

impl Attachments<'_> {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }

    pub fn strategies(&self) -> impl Iterator<Item = Strategy> + '_ {
        self.resolved.iter().map(|(strategy, _)| *strategy)
    }

    /// Invoke each strategy once, in declared order, with its endpoint and the payload.
    pub fn initialize(&self, context: &Context) -> Result<()> {
        for (strategy, config) in &self.resolved {
            let span = span!(Level::DEBUG, "network", kind = %config.kind);
            let _span_guard = span.enter();
            strategy
                .initialize(config, context)
                .map_err(|e| e.or_context("setup networking"))?;
            debug!("endpoint attached");
        }
        Ok(())
    }
}
