use super::command;
use super::{AddrEntry, LinkDetails, LinkKind, NetOps, RouteEntry, RouteScope, MAIN_TABLE};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use ipnetwork::IpNetwork;
use podwire_common::MacAddr;
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
use rtnetlink::packet_route::link::{
    InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage, State,
};
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteScope as NlRouteScope, RouteType,
};
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{Handle, LinkDummy, LinkUnspec, LinkVeth, RouteMessageBuilder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// errno carried by a netlink error reply
pub fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => Some(-msg.raw_code()),
        _ => None,
    }
}

fn is_errno(err: &rtnetlink::Error, code: i32) -> bool {
    errno(err) == Some(code)
}

/// `NetOps` over a netlink socket bound to the namespace it was opened in.
///
/// The socket keeps talking to that namespace no matter which thread later
/// drives it. Sysctl writes are the exception: `/proc/sys/net` resolves
/// against the calling thread, so they happen synchronously on it.
pub struct RtNetlink {
    handle: Handle,
    sysfs_root: PathBuf,
}

impl RtNetlink {
    /// Open a connection in the current namespace. Must run inside a tokio
    /// runtime, the connection task is spawned onto it.
    pub fn connect(sysfs_root: PathBuf) -> Result<Self> {
        let (conn, handle, _) =
            rtnetlink::new_connection().context("Failed to open netlink socket")?;
        tokio::spawn(conn);
        Ok(Self { handle, sysfs_root })
    }

    async fn set_link(&self, message: LinkMessage, what: &str) -> Result<()> {
        let index = message.header.index;
        self.handle
            .link()
            .set(message)
            .execute()
            .await
            .with_context(|| format!("Failed to set {what} on link {index}"))
    }

    async fn address_messages(&self, index: u32) -> Result<Vec<AddressMessage>> {
        self.handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .with_context(|| format!("Failed to list addresses of link {index}"))
    }
}

fn link_details(msg: &LinkMessage) -> LinkDetails {
    let mut details = LinkDetails {
        index: msg.header.index,
        name: String::new(),
        kind: LinkKind::Other,
        mac: None,
        mtu: 0,
        admin_up: msg.header.flags.contains(LinkFlags::Up),
        oper_down: false,
        alias: None,
        parent: None,
    };

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => details.name.clone_from(name),
            LinkAttribute::Address(bytes) => details.mac = MacAddr::try_from(bytes.as_slice()).ok(),
            LinkAttribute::Mtu(mtu) => details.mtu = *mtu,
            LinkAttribute::OperState(state) => details.oper_down = *state == State::Down,
            LinkAttribute::IfAlias(alias) => details.alias = Some(alias.clone()),
            LinkAttribute::Link(parent) => details.parent = Some(*parent),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(kind) = info {
                        details.kind = match kind {
                            InfoKind::Veth => LinkKind::Veth,
                            InfoKind::Vlan => LinkKind::Vlan,
                            InfoKind::Bond => LinkKind::Bond,
                            InfoKind::Dummy => LinkKind::Dummy,
                            InfoKind::Bridge => LinkKind::Bridge,
                            InfoKind::Other(name) if name == "openvswitch" => {
                                LinkKind::OpenvSwitch
                            }
                            _ => LinkKind::Other,
                        };
                    }
                }
            }
            _ => {}
        }
    }

    details
}

fn addr_entry(msg: &AddressMessage) -> Option<AddrEntry> {
    let mut address = None;
    let mut label = None;
    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Address(ip) => address = Some(*ip),
            AddressAttribute::Label(l) => label = Some(l.clone()),
            _ => {}
        }
    }
    let network = IpNetwork::new(address?, msg.header.prefix_len).ok()?;
    Some(AddrEntry { network, label })
}

fn route_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

/// Convert a kernel route into a `RouteEntry` if it is a main-table unicast
/// route leaving through `index`.
fn route_entry(msg: &RouteMessage, index: u32) -> Option<RouteEntry> {
    if msg.header.kind != RouteType::Unicast {
        return None;
    }

    let scope = match msg.header.scope {
        NlRouteScope::Host => RouteScope::Host,
        NlRouteScope::Link => RouteScope::Link,
        NlRouteScope::Site => RouteScope::Site,
        NlRouteScope::Universe => RouteScope::Universe,
        _ => return None,
    };

    let mut table = u32::from(msg.header.table);
    let mut oif = None;
    let mut destination = None;
    let mut gateway = None;
    let mut source = None;
    let mut priority = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Table(t) => table = *t,
            RouteAttribute::Oif(i) => oif = Some(*i),
            RouteAttribute::Destination(a) => destination = route_ip(a),
            RouteAttribute::Gateway(a) => gateway = route_ip(a),
            RouteAttribute::PrefSource(a) => source = route_ip(a),
            RouteAttribute::Priority(p) => priority = Some(*p),
            _ => {}
        }
    }

    if table != MAIN_TABLE || oif != Some(index) {
        return None;
    }

    let destination = destination.unwrap_or(match msg.header.address_family {
        AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    });
    let destination = IpNetwork::new(destination, msg.header.destination_prefix_length).ok()?;

    Some(RouteEntry {
        destination,
        gateway,
        scope,
        table,
        source,
        priority,
    })
}

fn nl_scope(scope: RouteScope) -> NlRouteScope {
    match scope {
        RouteScope::Host => NlRouteScope::Host,
        RouteScope::Link => NlRouteScope::Link,
        RouteScope::Site => NlRouteScope::Site,
        RouteScope::Universe => NlRouteScope::Universe,
    }
}

fn route_message(index: u32, route: &RouteEntry) -> Result<RouteMessage> {
    let family_mismatch = |addr: IpAddr| {
        anyhow!(
            "address {} does not match the family of route {}",
            addr,
            route.destination
        )
    };

    let msg = match route.destination {
        IpNetwork::V4(dst) => {
            let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
                .destination_prefix(dst.ip(), dst.prefix())
                .output_interface(index)
                .scope(nl_scope(route.scope))
                .table_id(route.table);
            if let Some(gw) = route.gateway {
                let IpAddr::V4(gw) = gw else {
                    return Err(family_mismatch(gw));
                };
                builder = builder.gateway(gw);
            }
            if let Some(IpAddr::V4(src)) = route.source {
                builder = builder.pref_source(src);
            }
            if let Some(priority) = route.priority {
                builder = builder.priority(priority);
            }
            builder.build()
        }
        IpNetwork::V6(dst) => {
            let mut builder = RouteMessageBuilder::<Ipv6Addr>::default()
                .destination_prefix(dst.ip(), dst.prefix())
                .output_interface(index)
                .scope(nl_scope(route.scope))
                .table_id(route.table);
            if let Some(gw) = route.gateway {
                let IpAddr::V6(gw) = gw else {
                    return Err(family_mismatch(gw));
                };
                builder = builder.gateway(gw);
            }
            if let Some(IpAddr::V6(src)) = route.source {
                builder = builder.pref_source(src);
            }
            if let Some(priority) = route.priority {
                builder = builder.priority(priority);
            }
            builder.build()
        }
    };

    Ok(msg)
}

#[async_trait]
impl NetOps for RtNetlink {
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkDetails>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(msg) => Ok(msg.as_ref().map(link_details)),
            Err(e) if is_errno(&e, libc::ENODEV) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to look up link {name}")),
        }
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<LinkDetails>> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(msg) => Ok(msg.as_ref().map(link_details)),
            Err(e) if is_errno(&e, libc::ENODEV) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to look up link {index}")),
        }
    }

    async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        match self
            .handle
            .link()
            .add(LinkVeth::new(name, peer).build())
            .execute()
            .await
        {
            Ok(()) => {
                info!("Created veth pair {} <-> {}", name, peer);
                Ok(())
            }
            Err(e) if is_errno(&e, libc::EEXIST) => {
                debug!("Veth {} already exists", name);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to create veth pair {name}")),
        }
    }

    async fn create_dummy(&self, name: &str) -> Result<()> {
        match self
            .handle
            .link()
            .add(LinkDummy::new(name).build())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_errno(&e, libc::EEXIST) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to create dummy link {name}")),
        }
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_errno(&e, libc::ENODEV) => {
                debug!("Link {} already gone", index);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete link {index}")),
        }
    }

    async fn rename_link(&self, index: u32, name: &str) -> Result<()> {
        self.set_link(
            LinkUnspec::new_with_index(index)
                .name(name.to_string())
                .build(),
            "name",
        )
        .await
    }

    async fn set_alias(&self, index: u32, alias: &str) -> Result<()> {
        let mut message = LinkUnspec::new_with_index(index).build();
        message
            .attributes
            .push(LinkAttribute::IfAlias(alias.to_string()));
        self.set_link(message, "alias").await
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.set_link(LinkUnspec::new_with_index(index).mtu(mtu).build(), "mtu")
            .await
    }

    async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<()> {
        self.set_link(
            LinkUnspec::new_with_index(index)
                .address(mac.octets().to_vec())
                .build(),
            "mac address",
        )
        .await
    }

    async fn set_link_up(&self, index: u32, up: bool) -> Result<()> {
        let builder = LinkUnspec::new_with_index(index);
        let message = if up { builder.up() } else { builder.down() }.build();
        self.set_link(message, "link state").await
    }

    async fn set_txqlen(&self, index: u32, qlen: u32) -> Result<()> {
        let mut message = LinkUnspec::new_with_index(index).build();
        message.attributes.push(LinkAttribute::TxQueueLen(qlen));
        self.set_link(message, "txqueuelen").await
    }

    async fn move_to_netns(&self, index: u32, netns: &Path) -> Result<()> {
        let ns = std::fs::File::open(netns)
            .with_context(|| format!("Failed to open network namespace {}", netns.display()))?;
        self.set_link(
            LinkUnspec::new_with_index(index)
                .setns_by_fd(ns.as_raw_fd())
                .build(),
            "network namespace",
        )
        .await
    }

    async fn addresses(&self, index: u32) -> Result<Vec<AddrEntry>> {
        Ok(self
            .address_messages(index)
            .await?
            .iter()
            .filter_map(addr_entry)
            .collect())
    }

    async fn add_address(&self, index: u32, addr: &AddrEntry) -> Result<()> {
        let mut request =
            self.handle
                .address()
                .add(index, addr.network.ip(), addr.network.prefix());
        if let Some(label) = &addr.label {
            request
                .message_mut()
                .attributes
                .push(AddressAttribute::Label(label.clone()));
        }
        match request.execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_errno(&e, libc::EEXIST) => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to add address {} to link {}", addr.network, index)
            }),
        }
    }

    async fn replace_address(&self, index: u32, addr: &AddrEntry) -> Result<()> {
        let mut request = self
            .handle
            .address()
            .add(index, addr.network.ip(), addr.network.prefix())
            .replace();
        if let Some(label) = &addr.label {
            request
                .message_mut()
                .attributes
                .push(AddressAttribute::Label(label.clone()));
        }
        request.execute().await.with_context(|| {
            format!("Failed to replace address {} on link {}", addr.network, index)
        })
    }

    async fn delete_address(&self, index: u32, addr: &AddrEntry) -> Result<()> {
        let existing = self
            .address_messages(index)
            .await?
            .into_iter()
            .find(|msg| addr_entry(msg).is_some_and(|e| e.network == addr.network));

        let Some(message) = existing else {
            debug!("Address {} not present on link {}", addr.network, index);
            return Ok(());
        };

        match self.handle.address().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_errno(&e, libc::EADDRNOTAVAIL) => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to delete address {} from link {}", addr.network, index)
            }),
        }
    }

    async fn routes(&self, index: u32) -> Result<Vec<RouteEntry>> {
        let queries = [
            RouteMessageBuilder::<Ipv4Addr>::default().build(),
            RouteMessageBuilder::<Ipv6Addr>::default().build(),
        ];

        let mut routes = Vec::new();
        for query in queries {
            let messages: Vec<RouteMessage> = self
                .handle
                .route()
                .get(query)
                .execute()
                .try_collect()
                .await
                .with_context(|| format!("Failed to list routes of link {index}"))?;
            routes.extend(messages.iter().filter_map(|m| route_entry(m, index)));
        }
        Ok(routes)
    }

    async fn replace_route(&self, index: u32, route: &RouteEntry) -> Result<()> {
        let message = route_message(index, route)?;
        self.handle
            .route()
            .add(message)
            .replace()
            .execute()
            .await
            .with_context(|| {
                format!(
                    "Failed to replace route {} via {:?} on link {}",
                    route.destination, route.gateway, index
                )
            })
    }

    async fn enable_ipv6(&self, ifname: Option<&str>) -> Result<()> {
        let path = format!(
            "/proc/sys/net/ipv6/conf/{}/disable_ipv6",
            ifname.unwrap_or("all")
        );
        let current = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {path}"))?;
        if current.trim() == "0" {
            return Ok(());
        }
        std::fs::write(&path, "0").with_context(|| format!("Failed to write {path}"))?;
        info!("Enabled IPv6 via {}", path);
        Ok(())
    }

    async fn bond_mode(&self, name: &str) -> Result<Option<String>> {
        let path = self
            .sysfs_root
            .join("class/net")
            .join(name)
            .join("bonding/mode");
        match tokio::fs::read_to_string(&path).await {
            // "balance-alb 6"
            Ok(content) => Ok(content.split_whitespace().next().map(str::to_string)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn disable_tx_offload(&self, name: &str) -> Result<()> {
        command::run("ethtool", &["-K", name, "tx", "off"])
            .await
            .with_context(|| format!("Failed to disable tx checksum offload on {name}"))?;
        Ok(())
    }

    async fn set_vf_mac(&self, pf: &str, vf: u32, mac: MacAddr) -> Result<()> {
        if pf.is_empty() {
            bail!("Missing physical function for vf {}", vf);
        }
        let vf = vf.to_string();
        let mac = mac.to_string();
        command::run("ip", &["link", "set", pf, "vf", &vf, "mac", &mac])
            .await
            .with_context(|| format!("Failed to set mac {mac} on {pf} vf {vf}"))?;
        Ok(())
    }
}
