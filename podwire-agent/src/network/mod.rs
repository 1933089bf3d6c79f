pub mod binder;
pub mod command;
pub mod device;
pub mod installer;
pub mod netlink;
pub mod netns;
pub mod node;
pub mod ovs;
pub mod prober;
pub mod reaper;
pub mod shaper;
pub mod sriov;
pub mod uplink;

#[cfg(test)]
pub mod fakes;

use anyhow::Result;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use podwire_common::MacAddr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// Kernel main routing table
pub const MAIN_TABLE: u32 = 254;

/// Link type as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Veth,
    Vlan,
    Bond,
    Dummy,
    Bridge,
    OpenvSwitch,
    Other,
}

/// Snapshot of one network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDetails {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    pub mac: Option<MacAddr>,
    pub mtu: u32,
    /// Administratively up (IFF_UP)
    pub admin_up: bool,
    /// Operational state reported as down
    pub oper_down: bool,
    pub alias: Option<String>,
    /// Lower device of a VLAN interface
    pub parent: Option<u32>,
}

/// Address configured on a link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrEntry {
    pub network: IpNetwork,
    pub label: Option<String>,
}

impl AddrEntry {
    pub fn new(network: IpNetwork) -> Self {
        Self {
            network,
            label: None,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: String) -> Self {
        self.label = Some(label);
        self
    }
}

/// Route scope, declared in the order routes are replayed onto a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RouteScope {
    Host,
    Link,
    Site,
    Universe,
}

/// Route bound to an output interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub scope: RouteScope,
    pub table: u32,
    pub source: Option<IpAddr>,
    pub priority: Option<u32>,
}

impl RouteEntry {
    /// Main-table route, link scope unless it goes through a gateway
    pub fn new(destination: IpNetwork, gateway: Option<IpAddr>) -> Self {
        Self {
            destination,
            gateway,
            scope: if gateway.is_some() {
                RouteScope::Universe
            } else {
                RouteScope::Link
            },
            table: MAIN_TABLE,
            source: None,
            priority: None,
        }
    }

    /// `0.0.0.0/0` or `::/0` through `gateway`
    pub fn default_via(gateway: IpAddr) -> Result<Self> {
        let any = match gateway {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Ok(Self::new(IpNetwork::new(any, 0)?, Some(gateway)))
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix() == 0
    }
}

/// Link, address and route operations in one network namespace.
///
/// Every mutation is an "ensure" operation: adding something that already
/// exists or deleting something that is already gone succeeds.
#[async_trait]
pub trait NetOps: Send + Sync {
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkDetails>>;
    async fn link_by_index(&self, index: u32) -> Result<Option<LinkDetails>>;

    /// Create a veth pair, both ends in this namespace
    async fn create_veth(&self, name: &str, peer: &str) -> Result<()>;
    async fn create_dummy(&self, name: &str) -> Result<()>;
    async fn delete_link(&self, index: u32) -> Result<()>;

    async fn rename_link(&self, index: u32, name: &str) -> Result<()>;
    async fn set_alias(&self, index: u32, alias: &str) -> Result<()>;
    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()>;
    async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<()>;
    async fn set_link_up(&self, index: u32, up: bool) -> Result<()>;
    async fn set_txqlen(&self, index: u32, qlen: u32) -> Result<()>;
    async fn move_to_netns(&self, index: u32, netns: &Path) -> Result<()>;

    async fn addresses(&self, index: u32) -> Result<Vec<AddrEntry>>;
    async fn add_address(&self, index: u32, addr: &AddrEntry) -> Result<()>;
    async fn replace_address(&self, index: u32, addr: &AddrEntry) -> Result<()>;
    async fn delete_address(&self, index: u32, addr: &AddrEntry) -> Result<()>;

    /// Main-table routes whose output interface is `index`, both families
    async fn routes(&self, index: u32) -> Result<Vec<RouteEntry>>;
    async fn replace_route(&self, index: u32, route: &RouteEntry) -> Result<()>;

    /// Clear `disable_ipv6` for `ifname`, or for `all` when `None`
    async fn enable_ipv6(&self, ifname: Option<&str>) -> Result<()>;
    /// Bonding mode name (e.g. `balance-alb`), `None` when not a bond
    async fn bond_mode(&self, name: &str) -> Result<Option<String>>;
    async fn disable_tx_offload(&self, name: &str) -> Result<()>;
    /// Program the MAC of virtual function `vf` through its physical function
    async fn set_vf_mac(&self, pf: &str, vf: u32, mac: MacAddr) -> Result<()>;
}
