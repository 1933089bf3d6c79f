//! The node's own port on the integration bridge, used for host to pod
//! traffic, and the periodic check that it still forwards.

use super::device::INTERNAL;
use super::installer::{self, InstallPlan};
use super::ovs::{PortSpec, Switch, IFACE_ID, IP};
use super::prober::{GatewayProbe, ProbePolicy, Prober};
use super::NetOps;
use anyhow::{anyhow, bail, Context, Result};
use ipnetwork::IpNetwork;
use podwire_common::addressing::pair_gateways;
use podwire_common::{GatewayCheckMode, MacAddr, Route};
use std::net::IpAddr;
use tracing::info;

/// Identity of the node port
#[derive(Debug, Clone, PartialEq)]
pub struct NodeNic {
    pub name: String,
    pub iface_id: String,
    pub addresses: Vec<IpNetwork>,
    pub gateways: Vec<IpAddr>,
    pub mac: MacAddr,
    pub mtu: i32,
    /// Cluster ranges reached through the node port
    pub routes: Vec<Route>,
}

impl NodeNic {
    fn pairs(&self) -> Result<Vec<(IpNetwork, IpAddr)>> {
        Ok(pair_gateways(&self.addresses, &self.gateways)?)
    }
}

/// Create and configure the node port, then wait until its gateway answers
#[tracing::instrument(name = "node.setup", skip_all, fields(nic = %nic.name))]
pub async fn setup(
    net: &dyn NetOps,
    switch: &dyn Switch,
    probe: &dyn GatewayProbe,
    bridge: &str,
    nic: &NodeNic,
    txqlen: u32,
    policy: ProbePolicy,
) -> Result<()> {
    let ips: Vec<String> = nic.addresses.iter().map(|a| a.ip().to_string()).collect();
    let port = PortSpec::new(bridge, &nic.name)
        .with_kind(INTERNAL)
        .with_external_id(IFACE_ID, &nic.iface_id)
        .with_external_id(IP, &ips.join(","));
    switch
        .add_port(&port)
        .await
        .with_context(|| format!("Failed to configure node nic {}", nic.name))?;

    let plan = InstallPlan {
        nic: nic.name.clone(),
        ifname: nic.name.clone(),
        rename: false,
        companion: false,
        mac: nic.mac,
        mtu: nic.mtu,
        addresses: nic.addresses.clone(),
        gateways: nic.pairs()?,
        default_route: false,
        routes: nic.routes.clone(),
    };
    installer::configure(net, &plan).await?;

    let link = net
        .link_by_name(&nic.name)
        .await?
        .ok_or_else(|| anyhow!("Node nic {} not found", nic.name))?;
    net.set_txqlen(link.index, txqlen)
        .await
        .with_context(|| format!("Failed to set txqueuelen of {}", nic.name))?;

    info!("Waiting for node gateway on {}", nic.name);
    Prober::new(probe, policy, policy)
        .check(GatewayCheckMode::Ping, &nic.name, &plan.gateways)
        .await?;
    info!("Node nic {} ready", nic.name);
    Ok(())
}

/// Node port health. Any error means forwarding state is stale.
pub async fn self_check(
    net: &dyn NetOps,
    probe: &dyn GatewayProbe,
    nic: &NodeNic,
    policy: ProbePolicy,
) -> Result<()> {
    let link = net
        .link_by_name(&nic.name)
        .await?
        .ok_or_else(|| anyhow!("Node nic {} not found", nic.name))?;
    if link.oper_down {
        bail!("Node nic {} is down", nic.name);
    }

    let pairs = nic.pairs()?;
    Prober::new(probe, policy, policy)
        .check(GatewayCheckMode::Ping, &nic.name, &pairs)
        .await
        .with_context(|| format!("Node nic {} lost its gateway", nic.name))
}
