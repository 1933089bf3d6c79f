//! In-memory stand-ins for the OS and switch seams. Every mutation is
//! appended to a shared operation log so tests can count side effects.

use super::netns::{NamespaceExec, NsJob};
use super::ovs::{PortSpec, QosSpec, Switch, SwitchInterface};
use super::prober::GatewayProbe;
use super::{AddrEntry, LinkDetails, LinkKind, NetOps, RouteEntry};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use podwire_common::MacAddr;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Namespace key of the host (root) namespace
pub const HOST_NS: &str = "host";

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub details: LinkDetails,
    pub addrs: Vec<AddrEntry>,
    pub routes: Vec<RouteEntry>,
    pub peer: Option<u32>,
    pub txqlen: Option<u32>,
    pub tx_offload: bool,
}

#[derive(Default)]
pub struct World {
    /// namespace -> ifindex -> link
    pub namespaces: HashMap<PathBuf, BTreeMap<u32, FakeLink>>,
    pub next_index: u32,
    pub ops: Vec<String>,
    pub bond_modes: HashMap<String, String>,
    pub ipv6_enabled: HashSet<String>,
    pub vf_macs: HashMap<(String, u32), MacAddr>,
    pub fail_veth: bool,
}

impl World {
    fn ns_mut(&mut self, ns: &Path) -> Result<&mut BTreeMap<u32, FakeLink>> {
        self.namespaces
            .get_mut(ns)
            .ok_or_else(|| anyhow!("namespace {} does not exist", ns.display()))
    }

    fn link_mut(&mut self, ns: &Path, index: u32) -> Result<&mut FakeLink> {
        self.ns_mut(ns)?
            .get_mut(&index)
            .ok_or_else(|| anyhow!("link {} not found", index))
    }

    fn name_of(&self, ns: &Path, index: u32) -> String {
        self.namespaces
            .get(ns)
            .and_then(|links| links.get(&index))
            .map(|l| l.details.name.clone())
            .unwrap_or_else(|| index.to_string())
    }

    fn insert(&mut self, ns: &Path, name: &str, kind: LinkKind) -> Result<u32> {
        self.next_index += 1;
        let index = self.next_index;
        let link = FakeLink {
            details: LinkDetails {
                index,
                name: name.to_string(),
                kind,
                mac: Some(MacAddr::new([0x02, 0, 0, 0, 0, index as u8])),
                mtu: 1500,
                admin_up: false,
                oper_down: false,
                alias: None,
                parent: None,
            },
            addrs: Vec::new(),
            routes: Vec::new(),
            peer: None,
            txqlen: None,
            tx_offload: true,
        };
        self.ns_mut(ns)?.insert(index, link);
        Ok(index)
    }

    fn remove_anywhere(&mut self, index: u32) -> Option<FakeLink> {
        self.namespaces
            .values_mut()
            .find_map(|links| links.remove(&index))
    }
}

/// Shared fake kernel, one per test
#[derive(Clone, Default)]
pub struct FakeKernel {
    pub world: Arc<Mutex<World>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        let kernel = Self::default();
        kernel.add_namespace(Path::new(HOST_NS));
        kernel
    }

    pub fn add_namespace(&self, ns: &Path) {
        self.world
            .lock()
            .unwrap()
            .namespaces
            .entry(ns.to_path_buf())
            .or_default();
    }

    pub fn remove_namespace(&self, ns: &Path) {
        self.world.lock().unwrap().namespaces.remove(ns);
    }

    /// `NetOps` view of the host namespace
    pub fn host(&self) -> Arc<FakeNet> {
        self.view(Path::new(HOST_NS))
    }

    pub fn view(&self, ns: &Path) -> Arc<FakeNet> {
        Arc::new(FakeNet {
            world: self.world.clone(),
            ns: ns.to_path_buf(),
        })
    }

    pub fn add_link(&self, ns: &Path, name: &str, kind: LinkKind) -> u32 {
        self.world.lock().unwrap().insert(ns, name, kind).unwrap()
    }

    pub fn link(&self, ns: &Path, name: &str) -> Option<FakeLink> {
        let world = self.world.lock().unwrap();
        world
            .namespaces
            .get(ns)?
            .values()
            .find(|l| l.details.name == name)
            .cloned()
    }

    pub fn update(&self, ns: &Path, name: &str, f: impl FnOnce(&mut FakeLink)) {
        let mut world = self.world.lock().unwrap();
        let link = world
            .namespaces
            .get_mut(ns)
            .and_then(|links| links.values_mut().find(|l| l.details.name == name))
            .unwrap();
        f(link);
    }

    pub fn ops(&self) -> Vec<String> {
        self.world.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.world.lock().unwrap().ops.clear();
    }

    pub fn count_ops(&self, prefix: &str) -> usize {
        self.ops().iter().filter(|op| op.starts_with(prefix)).count()
    }

    pub fn exec(&self) -> Arc<FakeNamespaceExec> {
        Arc::new(FakeNamespaceExec {
            kernel: self.clone(),
        })
    }
}

/// `NetOps` scoped to one namespace of a `FakeKernel`
pub struct FakeNet {
    world: Arc<Mutex<World>>,
    ns: PathBuf,
}

impl FakeNet {
    fn with<T>(&self, f: impl FnOnce(&mut World, &Path) -> Result<T>) -> Result<T> {
        let mut world = self.world.lock().unwrap();
        f(&mut world, &self.ns)
    }

    fn log(world: &mut World, op: String) {
        world.ops.push(op);
    }
}

#[async_trait]
impl NetOps for FakeNet {
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkDetails>> {
        self.with(|w, ns| {
            Ok(w.ns_mut(ns)?
                .values()
                .find(|l| l.details.name == name)
                .map(|l| l.details.clone()))
        })
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<LinkDetails>> {
        self.with(|w, ns| Ok(w.ns_mut(ns)?.get(&index).map(|l| l.details.clone())))
    }

    async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.with(|w, ns| {
            let exists = w.ns_mut(ns)?.values().any(|l| l.details.name == name);
            if exists {
                return Ok(());
            }
            if w.fail_veth {
                // half-created pair
                w.insert(ns, name, LinkKind::Veth)?;
                bail!("veth creation failed");
            }
            let a = w.insert(ns, name, LinkKind::Veth)?;
            let b = w.insert(ns, peer, LinkKind::Veth)?;
            w.link_mut(ns, a)?.peer = Some(b);
            w.link_mut(ns, b)?.peer = Some(a);
            Self::log(w, format!("create_veth {name} {peer}"));
            Ok(())
        })
    }

    async fn create_dummy(&self, name: &str) -> Result<()> {
        self.with(|w, ns| {
            if w.ns_mut(ns)?.values().any(|l| l.details.name == name) {
                return Ok(());
            }
            w.insert(ns, name, LinkKind::Dummy)?;
            Self::log(w, format!("create_dummy {name}"));
            Ok(())
        })
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            let Some(link) = w.ns_mut(ns)?.remove(&index) else {
                return Ok(());
            };
            if let Some(peer) = link.peer {
                w.remove_anywhere(peer);
            }
            Self::log(w, format!("delete_link {name}"));
            Ok(())
        })
    }

    async fn rename_link(&self, index: u32, name: &str) -> Result<()> {
        self.with(|w, ns| {
            let old = w.name_of(ns, index);
            w.link_mut(ns, index)?.details.name = name.to_string();
            Self::log(w, format!("rename_link {old} {name}"));
            Ok(())
        })
    }

    async fn set_alias(&self, index: u32, alias: &str) -> Result<()> {
        self.with(|w, ns| {
            w.link_mut(ns, index)?.details.alias = Some(alias.to_string());
            Ok(())
        })
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            w.link_mut(ns, index)?.details.mtu = mtu;
            Self::log(w, format!("set_mtu {name} {mtu}"));
            Ok(())
        })
    }

    async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            w.link_mut(ns, index)?.details.mac = Some(mac);
            Self::log(w, format!("set_mac {name} {mac}"));
            Ok(())
        })
    }

    async fn set_link_up(&self, index: u32, up: bool) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            w.link_mut(ns, index)?.details.admin_up = up;
            Self::log(w, format!("set_link_up {name} {up}"));
            Ok(())
        })
    }

    async fn set_txqlen(&self, index: u32, qlen: u32) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            w.link_mut(ns, index)?.txqlen = Some(qlen);
            Self::log(w, format!("set_txqlen {name} {qlen}"));
            Ok(())
        })
    }

    async fn move_to_netns(&self, index: u32, netns: &Path) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            if !w.namespaces.contains_key(netns) {
                bail!("namespace {} does not exist", netns.display());
            }
            let link = w
                .ns_mut(ns)?
                .remove(&index)
                .ok_or_else(|| anyhow!("link {} not found", index))?;
            w.ns_mut(netns)?.insert(index, link);
            Self::log(w, format!("move_to_netns {name}"));
            Ok(())
        })
    }

    async fn addresses(&self, index: u32) -> Result<Vec<AddrEntry>> {
        self.with(|w, ns| Ok(w.link_mut(ns, index)?.addrs.clone()))
    }

    async fn add_address(&self, index: u32, addr: &AddrEntry) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            let link = w.link_mut(ns, index)?;
            if !link.addrs.iter().any(|a| a.network == addr.network) {
                link.addrs.push(addr.clone());
            }
            Self::log(w, format!("add_address {name} {}", addr.network));
            Ok(())
        })
    }

    async fn replace_address(&self, index: u32, addr: &AddrEntry) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            let link = w.link_mut(ns, index)?;
            link.addrs.retain(|a| a.network != addr.network);
            link.addrs.push(addr.clone());
            Self::log(w, format!("replace_address {name} {}", addr.network));
            Ok(())
        })
    }

    async fn delete_address(&self, index: u32, addr: &AddrEntry) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            w.link_mut(ns, index)?
                .addrs
                .retain(|a| a.network != addr.network);
            Self::log(w, format!("delete_address {name} {}", addr.network));
            Ok(())
        })
    }

    async fn routes(&self, index: u32) -> Result<Vec<RouteEntry>> {
        self.with(|w, ns| Ok(w.link_mut(ns, index)?.routes.clone()))
    }

    async fn replace_route(&self, index: u32, route: &RouteEntry) -> Result<()> {
        self.with(|w, ns| {
            let name = w.name_of(ns, index);
            // a main-table route is keyed by destination, whatever the device
            for link in w.ns_mut(ns)?.values_mut() {
                link.routes
                    .retain(|r| r.destination != route.destination || r.table != route.table);
            }
            w.link_mut(ns, index)?.routes.push(route.clone());
            let via = route
                .gateway
                .map(|gw| format!(" via {gw}"))
                .unwrap_or_default();
            Self::log(w, format!("replace_route {name} {}{via}", route.destination));
            Ok(())
        })
    }

    async fn enable_ipv6(&self, ifname: Option<&str>) -> Result<()> {
        self.with(|w, ns| {
            let key = format!("{}:{}", ns.display(), ifname.unwrap_or("all"));
            w.ipv6_enabled.insert(key);
            Ok(())
        })
    }

    async fn bond_mode(&self, name: &str) -> Result<Option<String>> {
        self.with(|w, _| Ok(w.bond_modes.get(name).cloned()))
    }

    async fn disable_tx_offload(&self, name: &str) -> Result<()> {
        self.with(|w, ns| {
            let link = w
                .ns_mut(ns)?
                .values_mut()
                .find(|l| l.details.name == name)
                .ok_or_else(|| anyhow!("link {} not found", name))?;
            link.tx_offload = false;
            Self::log(w, format!("disable_tx_offload {name}"));
            Ok(())
        })
    }

    async fn set_vf_mac(&self, pf: &str, vf: u32, mac: MacAddr) -> Result<()> {
        self.with(|w, _| {
            w.vf_macs.insert((pf.to_string(), vf), mac);
            Self::log(w, format!("set_vf_mac {pf} {vf} {mac}"));
            Ok(())
        })
    }
}

/// Runs namespace jobs directly against the fake namespace view
pub struct FakeNamespaceExec {
    kernel: FakeKernel,
}

#[async_trait]
impl NamespaceExec for FakeNamespaceExec {
    async fn run(&self, netns: &Path, job: NsJob) -> Result<()> {
        if !self.kernel.world.lock().unwrap().namespaces.contains_key(netns) {
            bail!("Failed to open network namespace {}", netns.display());
        }
        job(self.kernel.view(netns)).await
    }
}

#[derive(Default)]
pub struct SwitchState {
    pub ports: BTreeMap<String, PortSpec>,
    pub policing: HashMap<String, (u64, u64)>,
    /// (attached port, iface id, qos)
    pub qos: Vec<(Option<String>, String, QosSpec)>,
    pub bridge_hwaddr: HashMap<String, MacAddr>,
    pub datapath: String,
    pub ops: Vec<String>,
    /// Ports whose next `del_port` fails
    pub failing_deletes: HashSet<String>,
}

#[derive(Default)]
pub struct FakeSwitch {
    pub state: Mutex<SwitchState>,
}

impl FakeSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_datapath(datapath: &str) -> Arc<Self> {
        let switch = Self::default();
        switch.state.lock().unwrap().datapath = datapath.to_string();
        Arc::new(switch)
    }

    pub fn insert_port(&self, spec: PortSpec) {
        self.state
            .lock()
            .unwrap()
            .ports
            .insert(spec.name.clone(), spec);
    }

    pub fn port(&self, name: &str) -> Option<PortSpec> {
        self.state.lock().unwrap().ports.get(name).cloned()
    }

    pub fn port_names(&self) -> Vec<String> {
        self.state.lock().unwrap().ports.keys().cloned().collect()
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn count_ops(&self, prefix: &str) -> usize {
        self.ops().iter().filter(|op| op.starts_with(prefix)).count()
    }

    pub fn fail_next_delete(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deletes
            .insert(name.to_string());
    }
}

#[async_trait]
impl Switch for FakeSwitch {
    async fn add_port(&self, spec: &PortSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("add_port {}", spec.name));
        state.ports.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn del_port(&self, _bridge: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.remove(name) {
            bail!("ovs-vsctl: transaction error deleting {name}");
        }
        if state.ports.remove(name).is_some() {
            state.ops.push(format!("del_port {name}"));
        }
        state.policing.remove(name);
        Ok(())
    }

    async fn interface_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().ports.contains_key(name))
    }

    async fn interfaces_with_iface_id(&self, iface_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ports
            .values()
            .filter(|p| p.iface_id() == Some(iface_id))
            .map(|p| p.name.clone())
            .collect())
    }

    async fn internal_interfaces(&self) -> Result<Vec<SwitchInterface>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ports
            .values()
            .filter(|p| p.kind.as_deref() == Some("internal"))
            .map(|p| SwitchInterface {
                name: p.name.clone(),
                external_ids: p.external_ids.clone(),
            })
            .collect())
    }

    async fn set_ingress_policing(&self, iface: &str, rate_kbps: u64, burst_kb: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(format!("set_ingress_policing {iface} {rate_kbps} {burst_kb}"));
        if rate_kbps == 0 {
            state.policing.remove(iface);
        } else {
            state
                .policing
                .insert(iface.to_string(), (rate_kbps, burst_kb));
        }
        Ok(())
    }

    async fn set_qos(&self, port: &str, iface_id: &str, qos: &QosSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("set_qos {port}"));
        state
            .qos
            .push((Some(port.to_string()), iface_id.to_string(), qos.clone()));
        Ok(())
    }

    async fn clear_qos(&self, port: Option<&str>, iface_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("clear_qos {iface_id}"));
        if let Some(port) = port {
            for entry in state.qos.iter_mut() {
                if entry.0.as_deref() == Some(port) {
                    entry.0 = None;
                }
            }
        }
        state.qos.retain(|(_, id, _)| id != iface_id);
        Ok(())
    }

    async fn set_bridge_hwaddr(&self, bridge: &str, mac: MacAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("set_bridge_hwaddr {bridge} {mac}"));
        state.bridge_hwaddr.insert(bridge.to_string(), mac);
        Ok(())
    }

    async fn datapath_type(&self, _bridge: &str) -> Result<String> {
        Ok(self.state.lock().unwrap().datapath.clone())
    }
}

/// Gateway responder that answers from a given attempt on, or never
pub struct FakeProbe {
    /// 1-based attempt of the first reply, `None` never replies
    pub reply_from: Option<u32>,
    pub arpings: Mutex<u32>,
    pub pings: Mutex<u32>,
}

impl FakeProbe {
    pub fn replying() -> Arc<Self> {
        Self::replying_from(Some(1))
    }

    pub fn silent() -> Arc<Self> {
        Self::replying_from(None)
    }

    pub fn replying_from(attempt: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            reply_from: attempt,
            arpings: Mutex::new(0),
            pings: Mutex::new(0),
        })
    }

    pub fn arpings(&self) -> u32 {
        *self.arpings.lock().unwrap()
    }

    pub fn pings(&self) -> u32 {
        *self.pings.lock().unwrap()
    }

    fn answers(&self, attempt: u32) -> bool {
        self.reply_from.is_some_and(|first| attempt >= first)
    }
}

#[async_trait]
impl GatewayProbe for FakeProbe {
    async fn arping(&self, _nic: &str, _source: Ipv4Addr, _gateway: Ipv4Addr) -> Result<Option<MacAddr>> {
        let mut count = self.arpings.lock().unwrap();
        *count += 1;
        Ok(self
            .answers(*count)
            .then(|| MacAddr::new([0x0a, 0, 0, 0, 0, 1])))
    }

    async fn ping(&self, _source: IpAddr, _gateway: IpAddr) -> Result<bool> {
        let mut count = self.pings.lock().unwrap();
        *count += 1;
        Ok(self.answers(*count))
    }
}
