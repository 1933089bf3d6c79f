//! Moves a physical uplink's addresses, routes and MAC onto an external
//! bridge and back. Everything is recomputed from live state on each call.

use super::ovs::{PortSpec, Switch, VENDOR};
use super::{AddrEntry, LinkDetails, LinkKind, NetOps, RouteEntry, RouteScope};
use anyhow::{anyhow, Context, Result};
use podwire_common::addressing::is_link_local;
use tracing::{debug, info, warn};

/// Bonding mode whose slaves keep their own MACs
pub const BALANCE_ALB: &str = "balance-alb";
/// Value of the `vendor` tag on uplink ports
pub const VENDOR_NAME: &str = "podwire";

const ATTACH_SCOPES: [RouteScope; 3] = [RouteScope::Link, RouteScope::Site, RouteScope::Universe];
const DETACH_SCOPES: [RouteScope; 4] = [
    RouteScope::Host,
    RouteScope::Link,
    RouteScope::Site,
    RouteScope::Universe,
];

/// Migrates uplinks between a physical NIC and a switch bridge
pub struct UplinkMigrator<'a> {
    net: &'a dyn NetOps,
    switch: &'a dyn Switch,
}

fn relabel(addr: &AddrEntry, from: &str, to: &str) -> AddrEntry {
    let mut moved = addr.clone();
    if let Some(label) = &addr.label {
        moved.label = Some(format!("{}{}", to, label.strip_prefix(from).unwrap_or(label)));
    }
    moved
}

/// Routes of `scope` in replay order, minus gateway-less link-local ones
/// which the kernel regenerates per link
fn replayable(routes: &[RouteEntry], scope: RouteScope) -> impl Iterator<Item = &RouteEntry> {
    routes.iter().filter(move |r| {
        r.scope == scope && !(r.gateway.is_none() && is_link_local(&r.destination.ip()))
    })
}

impl<'a> UplinkMigrator<'a> {
    pub fn new(net: &'a dyn NetOps, switch: &'a dyn Switch) -> Self {
        Self { net, switch }
    }

    /// True for a balance-alb bond or a VLAN on top of one
    pub async fn is_alb_bond(&self, link: &LinkDetails) -> Result<bool> {
        let link = match (link.kind, link.parent) {
            (LinkKind::Vlan, Some(parent)) => self
                .net
                .link_by_index(parent)
                .await?
                .ok_or_else(|| anyhow!("Parent {} of {} not found", parent, link.name))?,
            _ => link.clone(),
        };
        if link.kind != LinkKind::Bond {
            return Ok(false);
        }
        Ok(self.net.bond_mode(&link.name).await?.as_deref() == Some(BALANCE_ALB))
    }

    async fn bridge(&self, name: &str) -> Result<LinkDetails> {
        self.net
            .link_by_name(name)
            .await?
            .ok_or_else(|| anyhow!("Bridge {} not found", name))
    }

    /// Move `nic`'s addressing onto `bridge` and plug `nic` into it.
    /// Returns the uplink MTU, `None` when the uplink does not exist.
    #[tracing::instrument(name = "uplink.attach", skip(self))]
    pub async fn attach(&self, nic_name: &str, bridge_name: &str) -> Result<Option<u32>> {
        let Some(nic) = self.net.link_by_name(nic_name).await? else {
            warn!("Uplink {} not found, nothing to attach", nic_name);
            return Ok(None);
        };
        let bridge = self.bridge(bridge_name).await?;

        self.net
            .enable_ipv6(Some(bridge_name))
            .await
            .with_context(|| format!("Failed to enable IPv6 on {bridge_name}"))?;

        let addrs = self.net.addresses(nic.index).await?;
        let routes = self.net.routes(nic.index).await?;

        for addr in addrs.iter().filter(|a| !is_link_local(&a.network.ip())) {
            self.net
                .replace_address(bridge.index, &relabel(addr, nic_name, bridge_name))
                .await
                .with_context(|| {
                    format!("Failed to move address {} to {}", addr.network, bridge_name)
                })?;
            self.net
                .delete_address(nic.index, addr)
                .await
                .with_context(|| {
                    format!("Failed to delete address {} from {}", addr.network, nic_name)
                })?;
            debug!("Moved {} from {} to {}", addr.network, nic_name, bridge_name);
        }

        if self.is_alb_bond(&nic).await? {
            info!("{} is a {} bond, bridge keeps its own MAC", nic_name, BALANCE_ALB);
        } else if let Some(mac) = nic.mac {
            self.switch.set_bridge_hwaddr(bridge_name, mac).await?;
        }

        self.net
            .set_mtu(bridge.index, nic.mtu)
            .await
            .with_context(|| format!("Failed to set MTU of {bridge_name}"))?;
        self.net.set_link_up(bridge.index, true).await?;

        for scope in ATTACH_SCOPES {
            for route in replayable(&routes, scope) {
                self.net
                    .replace_route(bridge.index, route)
                    .await
                    .with_context(|| format!("Failed to move route {}", route.destination))?;
            }
        }

        let port = PortSpec::new(bridge_name, nic_name).with_external_id(VENDOR, VENDOR_NAME);
        self.switch.add_port(&port).await?;
        self.net.set_link_up(nic.index, true).await?;

        info!("Uplink {} attached to {}", nic_name, bridge_name);
        Ok(Some(nic.mtu))
    }

    /// Unplug `nic` from `bridge` and give its addressing back
    #[tracing::instrument(name = "uplink.detach", skip(self))]
    pub async fn detach(&self, nic_name: &str, bridge_name: &str) -> Result<()> {
        let Some(nic) = self.net.link_by_name(nic_name).await? else {
            warn!("Uplink {} not found, nothing to detach", nic_name);
            return Ok(());
        };
        let bridge = self.bridge(bridge_name).await?;

        let addrs = self.net.addresses(bridge.index).await?;
        let routes = self.net.routes(bridge.index).await?;

        self.switch
            .del_port(Some(bridge_name), nic_name)
            .await
            .with_context(|| format!("Failed to remove {nic_name} from {bridge_name}"))?;

        for addr in addrs.iter().filter(|a| !is_link_local(&a.network.ip())) {
            self.net
                .replace_address(nic.index, &relabel(addr, bridge_name, nic_name))
                .await
                .with_context(|| format!("Failed to move address {} to {}", addr.network, nic_name))?;
            self.net
                .delete_address(bridge.index, addr)
                .await
                .with_context(|| {
                    format!("Failed to delete address {} from {}", addr.network, bridge_name)
                })?;
        }

        self.net.set_link_up(bridge.index, false).await?;

        for scope in DETACH_SCOPES {
            for route in replayable(&routes, scope) {
                self.net
                    .replace_route(nic.index, route)
                    .await
                    .with_context(|| format!("Failed to move route {}", route.destination))?;
            }
        }

        info!("Uplink {} detached from {}", nic_name, bridge_name);
        Ok(())
    }
}
