//! Container-side configuration: namespace move, rename, addresses, MAC,
//! MTU and routes. Every step checks live state first so a second run after
//! a crash picks up where the first stopped.

use super::device::Endpoint;
use super::{AddrEntry, NetOps, RouteEntry};
use anyhow::{anyhow, Context, Result};
use ipnetwork::IpNetwork;
use podwire_common::addressing::is_link_local;
use podwire_common::{AttachmentRequest, MacAddr, Protocol, Route};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info, warn};

/// Everything to install inside the namespace for one device
#[derive(Debug, Clone, PartialEq)]
pub struct InstallPlan {
    /// Device name before any rename
    pub nic: String,
    /// Requested interface name
    pub ifname: String,
    pub rename: bool,
    /// Realize `ifname` as a dummy next to `nic`
    pub companion: bool,
    pub mac: MacAddr,
    pub mtu: i32,
    pub addresses: Vec<IpNetwork>,
    pub gateways: Vec<(IpNetwork, IpAddr)>,
    pub default_route: bool,
    pub routes: Vec<Route>,
}

impl InstallPlan {
    /// Plan for the container device of `endpoint`, `None` when the device
    /// model leaves nothing to configure in the namespace
    pub fn for_request(req: &AttachmentRequest, endpoint: &Endpoint) -> Result<Option<Self>> {
        let Some(nic) = &endpoint.container_nic else {
            return Ok(None);
        };
        Ok(Some(Self {
            nic: nic.clone(),
            ifname: req.ifname.clone(),
            rename: endpoint.rename,
            companion: endpoint.companion,
            mac: req.mac,
            mtu: req.mtu,
            addresses: req.addresses()?,
            gateways: req.gateway_pairs()?,
            default_route: req.default_route,
            routes: req.routes.clone(),
        }))
    }

    /// Name the device carries once installed
    pub fn final_name(&self) -> &str {
        if self.rename {
            &self.ifname
        } else {
            &self.nic
        }
    }

    fn protocol(&self) -> Option<Protocol> {
        let ips: Vec<IpAddr> = self.addresses.iter().map(IpNetwork::ip).collect();
        Protocol::of(&ips)
    }
}

/// Tag the device with its original name and move it into `netns`.
/// Returns `false` when the device is no longer in this namespace, which on
/// a repeated run means it was moved already.
pub async fn move_into(host: &dyn NetOps, nic: &str, netns: &Path) -> Result<bool> {
    let Some(link) = host.link_by_name(nic).await? else {
        debug!("{} not in host namespace, assuming it was moved", nic);
        return Ok(false);
    };
    host.set_alias(link.index, nic)
        .await
        .with_context(|| format!("Failed to set alias of {nic}"))?;
    host.move_to_netns(link.index, netns)
        .await
        .with_context(|| format!("Failed to move {} into {}", nic, netns.display()))?;
    info!("Moved {} into {}", nic, netns.display());
    Ok(true)
}

/// Configure the moved device from inside its namespace. Returns the name
/// the device ends up with.
#[tracing::instrument(name = "installer.configure", skip(net, plan), fields(nic = %plan.nic, ifname = %plan.ifname))]
pub async fn configure(net: &dyn NetOps, plan: &InstallPlan) -> Result<String> {
    let mut link = match net.link_by_name(&plan.nic).await? {
        Some(link) => link,
        None => net
            .link_by_name(plan.final_name())
            .await?
            .ok_or_else(|| anyhow!("Device {} not found in namespace", plan.nic))?,
    };

    if plan.rename && link.name != plan.ifname {
        if link.admin_up {
            net.set_link_up(link.index, false).await?;
            link.admin_up = false;
        }
        net.rename_link(link.index, &plan.ifname)
            .await
            .with_context(|| format!("Failed to rename {} to {}", link.name, plan.ifname))?;
        link.name = plan.ifname.clone();
    }

    if plan.protocol().is_some_and(Protocol::has_ipv6) {
        net.enable_ipv6(None).await?;
        net.enable_ipv6(Some(&link.name)).await?;
    }

    reconcile_addresses(net, link.index, &plan.addresses).await?;

    if link.mac != Some(plan.mac) {
        net.set_mac(link.index, plan.mac)
            .await
            .with_context(|| format!("Failed to set MAC of {}", link.name))?;
    }
    if plan.mtu > 0 && link.mtu != plan.mtu as u32 {
        net.set_mtu(link.index, plan.mtu as u32)
            .await
            .with_context(|| format!("Failed to set MTU of {}", link.name))?;
    }
    if !link.admin_up {
        net.set_link_up(link.index, true).await?;
    }

    if plan.companion {
        install_companion(net, &plan.ifname, &plan.addresses).await?;
    }

    if plan.default_route {
        for (_, gateway) in &plan.gateways {
            net.replace_route(link.index, &RouteEntry::default_via(*gateway)?)
                .await
                .with_context(|| format!("Failed to set default route via {gateway}"))?;
            info!("Default route via {} on {}", gateway, link.name);
        }
    }

    for route in &plan.routes {
        let (destination, gateway) = match route.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Skipping route {:?}: {}", route, e);
                continue;
            }
        };
        if let Err(e) = net
            .replace_route(link.index, &RouteEntry::new(destination, gateway))
            .await
        {
            warn!("Failed to add route {}: {:#}", destination, e);
        }
    }

    Ok(link.name)
}

/// Make the non-link-local addresses of `index` equal to `wanted`, touching
/// only the difference.
pub async fn reconcile_addresses(net: &dyn NetOps, index: u32, wanted: &[IpNetwork]) -> Result<()> {
    let current: Vec<IpNetwork> = net
        .addresses(index)
        .await?
        .into_iter()
        .map(|a| a.network)
        .filter(|n| !is_link_local(&n.ip()))
        .collect();

    for stale in current.iter().filter(|c| !wanted.contains(c)) {
        net.delete_address(index, &AddrEntry::new(*stale))
            .await
            .with_context(|| format!("Failed to delete address {stale}"))?;
        debug!("Deleted address {}", stale);
    }
    for missing in wanted.iter().filter(|w| !current.contains(w)) {
        net.add_address(index, &AddrEntry::new(*missing))
            .await
            .with_context(|| format!("Failed to add address {missing}"))?;
        debug!("Added address {}", missing);
    }
    Ok(())
}

async fn install_companion(net: &dyn NetOps, ifname: &str, addresses: &[IpNetwork]) -> Result<()> {
    net.create_dummy(ifname)
        .await
        .with_context(|| format!("Failed to create {ifname}"))?;
    let dummy = net
        .link_by_name(ifname)
        .await?
        .ok_or_else(|| anyhow!("Device {} vanished after creation", ifname))?;
    reconcile_addresses(net, dummy.index, addresses).await?;
    if !dummy.admin_up {
        net.set_link_up(dummy.index, true).await?;
    }
    Ok(())
}
