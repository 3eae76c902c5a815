use std::net::Ipv4Addr;

use tracing::debug;

use super::netdev::{parse_cidr, NetDev};
use crate::config::{ConfigError, NetworkConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::handshake::Context;

/// Payload key naming the container-side end of the veth pair, set by the launcher.
pub const VETH_CHILD_KEY: &str = "vethChild";

const DEFAULT_NAME: &str = "eth0";

/// What to do to the container-side veth, worked out before touching any interface.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VethPlan {
    current_name: String,
    name: String,
    addr: Option<(Ipv4Addr, u8)>,
    mtu: Option<u32>,
    gateway: Option<Ipv4Addr>,
}

fn plan(config: &NetworkConfig, context: &Context) -> std::result::Result<VethPlan, Error> {
    let Some(current_name) = context.get(VETH_CHILD_KEY) else {
        return Err(Error::new()
            .kind(ErrorKind::Sync)
            .cause("handshake payload has no veth child name")
            .detail(VETH_CHILD_KEY));
    };

    let name = match config.veth_prefix.as_str() {
        "" => DEFAULT_NAME,
        prefix => prefix,
    };

    let addr = match config.address.as_str() {
        "" => None,
        cidr => Some(parse_cidr(cidr)?),
    };

    let gateway = match config.gateway.as_str() {
        "" => None,
        gw => Some(
            gw.parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidAddress(gw.to_owned()))?,
        ),
    };

    Ok(VethPlan {
        current_name: current_name.to_owned(),
        name: name.to_owned(),
        addr,
        mtu: (config.mtu != 0).then_some(config.mtu),
        gateway,
    })
}

/// Rename the container-side veth, address it, set its MTU, bring it up and route through
/// the gateway.
pub fn initialize(config: &NetworkConfig, context: &Context) -> Result<()> {
    let plan = plan(config, context)?;
    debug!(?plan, "configuring veth");

    let netdev = NetDev::open()?;
    netdev
        .rename(&plan.current_name, &plan.name)
        .map_err(|e| e.context("rename veth"))?;
    if let Some((addr, prefix_len)) = plan.addr {
        netdev
            .set_ipv4(&plan.name, addr, prefix_len)
            .map_err(|e| e.context("set veth address"))?;
    }
    if let Some(mtu) = plan.mtu {
        netdev
            .set_mtu(&plan.name, mtu)
            .map_err(|e| e.context("set veth mtu"))?;
    }
    netdev
        .set_up(&plan.name)
        .map_err(|e| e.context("bring up veth"))?;
    if let Some(gateway) = plan.gateway {
        netdev
            .add_default_route(gateway)
            .map_err(|e| e.context("add default route"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn veth_config() -> NetworkConfig {
        NetworkConfig {
            kind: "veth".into(),
            address: "172.17.0.5/16".into(),
            gateway: "172.17.42.1".into(),
            mtu: 1500,
            veth_prefix: "eth0".into(),
            bridge: "docker0".into(),
        }
    }

    #[test]
    fn plan_uses_endpoint_and_payload() {
        let mut context = Context::new();
        context.insert(VETH_CHILD_KEY, "vethc0ffee");

        let plan = plan(&veth_config(), &context).unwrap();
        assert_eq!(
            plan,
            VethPlan {
                current_name: "vethc0ffee".into(),
                name: "eth0".into(),
                addr: Some((Ipv4Addr::new(172, 17, 0, 5), 16)),
                mtu: Some(1500),
                gateway: Some(Ipv4Addr::new(172, 17, 42, 1)),
            }
        );
    }

    #[test]
    fn plan_requires_child_name_in_payload() {
        let err = plan(&veth_config(), &Context::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Sync);
    }

    #[test]
    fn plan_rejects_bad_gateway() {
        let mut context = Context::new();
        context.insert(VETH_CHILD_KEY, "veth0");
        let config = NetworkConfig {
            gateway: "gateway.local".into(),
            ..veth_config()
        };
        let err = plan(&config, &context).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn optional_fields_stay_unset() {
        let mut context = Context::new();
        context.insert(VETH_CHILD_KEY, "veth0");
        let config = NetworkConfig {
            kind: "veth".into(),
            ..NetworkConfig::default()
        };
        let plan = plan(&config, &context).unwrap();
        assert_eq!(plan.name, DEFAULT_NAME);
        assert_eq!(plan.addr, None);
        assert_eq!(plan.mtu, None);
        assert_eq!(plan.gateway, None);
    }
}
