//! Attach engine: the operations exposed to the cluster controller, composed
//! from the network components over the OS and switch seams.

use crate::config::AgentConfig;
use crate::network::binder::{self, PortTags};
use crate::network::device::{backend_for, DeviceContext, DPDK_VHOST_CLIENT};
use crate::network::installer::{self, InstallPlan};
use crate::network::netlink::RtNetlink;
use crate::network::netns::{NamespaceExec, NsJob, ThreadNamespaceExec};
use crate::network::node::{self, NodeNic};
use crate::network::ovs::{OvsVsctl, Switch};
use crate::network::prober::{CommandProbe, GatewayProbe, Prober};
use crate::network::reaper::PortReaper;
use crate::network::shaper;
use crate::network::sriov::SriovResolver;
use crate::network::uplink::UplinkMigrator;
use crate::network::NetOps;
use anyhow::{anyhow, bail, Context, Result};
use podwire_common::{naming, AttachmentRequest, DetachRequest, NicNames, Shaping};
use std::sync::Arc;
use tracing::{debug, info};

/// Datapath type of a userspace switch
const NETDEV_DATAPATH: &str = "netdev";

pub struct AttachEngine {
    net: Arc<dyn NetOps>,
    switch: Arc<dyn Switch>,
    exec: Arc<dyn NamespaceExec>,
    probe: Arc<dyn GatewayProbe>,
    sriov: SriovResolver,
    config: AgentConfig,
}

impl AttachEngine {
    pub fn new(
        net: Arc<dyn NetOps>,
        switch: Arc<dyn Switch>,
        exec: Arc<dyn NamespaceExec>,
        probe: Arc<dyn GatewayProbe>,
        config: AgentConfig,
    ) -> Self {
        Self {
            sriov: SriovResolver::new(config.sysfs_root.clone()),
            net,
            switch,
            exec,
            probe,
            config,
        }
    }

    /// Engine over the kernel, `ovs-vsctl` and the probe tools.
    /// Must be called inside a tokio runtime.
    pub fn system(config: AgentConfig) -> Result<Self> {
        let net = RtNetlink::connect(config.sysfs_root.clone())?;
        Ok(Self::new(
            Arc::new(net),
            Arc::new(OvsVsctl::new(config.ovs_timeout_secs)),
            Arc::new(ThreadNamespaceExec::new(config.sysfs_root.clone())),
            Arc::new(CommandProbe),
            config,
        ))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn device_context(&self) -> DeviceContext<'_> {
        DeviceContext {
            net: self.net.as_ref(),
            sriov: &self.sriov,
            vhost_dir: &self.config.vhost_dir,
        }
    }

    /// Provision, bind, shape and install one pod interface. Safe to repeat
    /// with the same request; every step converges on live state.
    #[tracing::instrument(
        name = "engine.attach",
        skip(self, req),
        fields(pod = %req.pod_name, namespace = %req.pod_namespace, ifname = %req.ifname, device = req.device.kind())
    )]
    pub async fn attach(&self, req: &AttachmentRequest) -> Result<NicNames> {
        req.validate().context("Invalid attachment request")?;
        let names = req.nic_names()?;
        let iface_id = req.logical_port_id();
        let addresses = req.addresses()?;

        let ctx = self.device_context();
        let backend = backend_for(&req.device, &ctx);
        let endpoint = backend
            .provision(&names, req.mac, req.mtu)
            .await
            .with_context(|| format!("Failed to provision {} device for {}", req.device.kind(), iface_id))?;

        let tags = PortTags::new(iface_id.clone(), &req.pod_name, &req.pod_namespace)
            .with_addresses(&addresses)
            .with_netns(req.netns.display().to_string());
        binder::bind(self.switch.as_ref(), &self.config.bridge, &endpoint, &tags).await?;

        if endpoint.port_kind.is_none() {
            self.configure_host_end(&endpoint.port).await?;
        }
        // vhost-user ports take bandwidth limits only
        let shaping = if endpoint.port_kind.as_deref() == Some(DPDK_VHOST_CLIENT) {
            req.shaping.without_emulation()
        } else {
            req.shaping.clone()
        };
        shaper::apply(self.switch.as_ref(), &endpoint.port, &iface_id, &shaping).await?;

        match InstallPlan::for_request(req, &endpoint)? {
            Some(plan) => self.install(req, plan).await?,
            None => debug!("{} has no device in the pod namespace", iface_id),
        }

        info!("Attached {} as {}", iface_id, endpoint.port);
        Ok(names)
    }

    /// Bring the host endpoint up and set its queue length
    async fn configure_host_end(&self, name: &str) -> Result<()> {
        let link = self
            .net
            .link_by_name(name)
            .await?
            .ok_or_else(|| anyhow!("Host endpoint {} not found", name))?;
        if !link.admin_up {
            self.net
                .set_link_up(link.index, true)
                .await
                .with_context(|| format!("Failed to bring up {name}"))?;
        }
        self.net
            .set_txqlen(link.index, self.config.host_txqlen)
            .await
            .with_context(|| format!("Failed to set txqueuelen of {name}"))
    }

    async fn install(&self, req: &AttachmentRequest, plan: InstallPlan) -> Result<()> {
        let datapath = self.switch.datapath_type(&self.config.bridge).await?;
        if datapath == NETDEV_DATAPATH && self.net.link_by_name(&plan.nic).await?.is_some() {
            self.net
                .disable_tx_offload(&plan.nic)
                .await
                .with_context(|| format!("Failed to turn off tx offload on {}", plan.nic))?;
        }

        installer::move_into(self.net.as_ref(), &plan.nic, &req.netns).await?;

        let probe = self.probe.clone();
        let (arping, ping) = (self.config.arping, self.config.ping);
        let mode = self.config.effective_check(req.gateway_check);
        let ifname = plan.ifname.clone();
        let job: NsJob = Box::new(move |net| {
            Box::pin(async move {
                let nic = installer::configure(net.as_ref(), &plan).await?;
                Prober::new(probe.as_ref(), arping, ping)
                    .check(mode, &nic, &plan.gateways)
                    .await?;
                Ok(())
            })
        });
        self.exec
            .run(&req.netns, job)
            .await
            .with_context(|| format!("Failed to configure {} in {}", ifname, req.netns.display()))
    }

    /// Tear down one pod interface. Anything already gone counts as done.
    #[tracing::instrument(
        name = "engine.detach",
        skip(self, req),
        fields(pod = %req.pod_name, namespace = %req.pod_namespace, ifname = %req.ifname)
    )]
    pub async fn detach(&self, req: &DetachRequest) -> Result<()> {
        let names = naming::nic_names(&req.container_id, &req.ifname)?;
        let iface_id = naming::logical_port_id(&req.pod_name, &req.pod_namespace, &req.provider);

        let ctx = self.device_context();
        let backend = backend_for(&req.device, &ctx);
        let port = backend.port_name(&names).to_string();

        binder::unbind(self.switch.as_ref(), &port).await?;
        shaper::clear(self.switch.as_ref(), &port, &iface_id).await?;
        backend
            .release(&names)
            .await
            .with_context(|| format!("Failed to release device of {iface_id}"))?;

        info!("Detached {}", iface_id);
        Ok(())
    }

    /// Re-apply shaping to every port bound as `iface_id`
    #[tracing::instrument(name = "engine.update_shaping", skip(self, shaping))]
    pub async fn update_shaping(&self, iface_id: &str, shaping: &Shaping) -> Result<()> {
        let ports = self.switch.interfaces_with_iface_id(iface_id).await?;
        if ports.is_empty() {
            bail!("No port bound as {}", iface_id);
        }
        for port in &ports {
            shaper::apply(self.switch.as_ref(), port, iface_id, shaping).await?;
        }
        Ok(())
    }

    /// Returns the uplink MTU, `None` when the uplink does not exist
    pub async fn uplink_attach(&self, nic: &str, bridge: &str) -> Result<Option<u32>> {
        UplinkMigrator::new(self.net.as_ref(), self.switch.as_ref())
            .attach(nic, bridge)
            .await
    }

    pub async fn uplink_detach(&self, nic: &str, bridge: &str) -> Result<()> {
        UplinkMigrator::new(self.net.as_ref(), self.switch.as_ref())
            .detach(nic, bridge)
            .await
    }

    pub async fn reap(&self, reaper: &mut PortReaper) -> Result<Vec<String>> {
        reaper.sweep(self.switch.as_ref()).await
    }

    pub async fn node_setup(&self, nic: &NodeNic) -> Result<()> {
        node::setup(
            self.net.as_ref(),
            self.switch.as_ref(),
            self.probe.as_ref(),
            &self.config.bridge,
            nic,
            self.config.host_txqlen,
            self.config.ping,
        )
        .await
    }

    pub async fn node_check(&self, nic: &NodeNic) -> Result<()> {
        node::self_check(self.net.as_ref(), self.probe.as_ref(), nic, self.config.ping).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::device::INTERNAL;
    use crate::network::fakes::{FakeKernel, FakeProbe, FakeSwitch, HOST_NS};
    use crate::network::ovs::{QosSpec, IFACE_ID, POD_NETNS};
    use crate::network::prober::{ProbeError, ProbePolicy};
    use crate::network::sriov::fixture::{self, VF};
    use crate::network::LinkKind;
    use podwire_common::{DeviceModel, GatewayCheckMode, MacAddr};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    const NETNS: &str = "/var/run/netns/cni-1234";

    struct Harness {
        kernel: FakeKernel,
        switch: Arc<FakeSwitch>,
        probe: Arc<FakeProbe>,
        engine: AttachEngine,
    }

    fn config() -> AgentConfig {
        AgentConfig {
            arping: ProbePolicy::new(3, Duration::from_millis(1)),
            ping: ProbePolicy::new(3, Duration::from_millis(1)),
            ..AgentConfig::default()
        }
    }

    fn harness_with(switch: Arc<FakeSwitch>, probe: Arc<FakeProbe>, config: AgentConfig) -> Harness {
        let kernel = FakeKernel::new();
        kernel.add_namespace(Path::new(NETNS));
        let engine = AttachEngine::new(
            kernel.host(),
            switch.clone(),
            kernel.exec(),
            probe.clone(),
            config,
        );
        Harness {
            kernel,
            switch,
            probe,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeSwitch::new(), FakeProbe::replying(), config())
    }

    fn request() -> AttachmentRequest {
        AttachmentRequest {
            pod_name: "web-0".to_string(),
            pod_namespace: "default".to_string(),
            provider: "ovn".to_string(),
            container_id: "3f2a9c1d7e8b4a5f".to_string(),
            netns: PathBuf::from(NETNS),
            ifname: "eth0".to_string(),
            device: DeviceModel::Veth,
            mac: "0a:58:0a:10:00:05".parse().unwrap(),
            ip: "10.16.0.5/16".to_string(),
            gateway: "10.16.0.1".to_string(),
            default_route: true,
            routes: Vec::new(),
            mtu: 1400,
            shaping: Shaping::default(),
            gateway_check: GatewayCheckMode::Ping,
            dns: Default::default(),
        }
    }

    fn netns() -> &'static Path {
        Path::new(NETNS)
    }

    #[tokio::test]
    async fn test_attach_veth() {
        let h = harness();
        let names = h.engine.attach(&request()).await.unwrap();
        assert_eq!(names.host, "3f2a9c1d7e8b_h");

        let port = h.switch.port(&names.host).unwrap();
        assert_eq!(port.iface_id(), Some("web-0.default"));
        assert_eq!(port.external_ids.get(POD_NETNS).unwrap(), NETNS);

        let host = h.kernel.link(Path::new(HOST_NS), &names.host).unwrap();
        assert!(host.details.admin_up);
        assert_eq!(host.txqlen, Some(1000));

        let eth0 = h.kernel.link(netns(), "eth0").unwrap();
        assert_eq!(eth0.details.mac, Some(request().mac));
        assert_eq!(eth0.details.mtu, 1400);
        assert_eq!(eth0.details.alias.as_deref(), Some(names.container.as_str()));
        assert_eq!(eth0.addrs.len(), 1);
        assert_eq!(eth0.routes.iter().filter(|r| r.is_default()).count(), 1);
        assert_eq!(h.probe.pings(), 1);
        assert!(h.kernel.link(Path::new(HOST_NS), &names.container).is_none());
    }

    #[tokio::test]
    async fn test_attach_twice_converges() {
        let h = harness();
        h.engine.attach(&request()).await.unwrap();
        h.engine.attach(&request()).await.unwrap();

        assert_eq!(h.switch.port_names().len(), 1);
        assert_eq!(h.kernel.count_ops("create_veth"), 1);
        assert_eq!(h.kernel.count_ops("move_to_netns"), 1);
        assert_eq!(h.kernel.count_ops("add_address"), 1);

        let eth0 = h.kernel.link(netns(), "eth0").unwrap();
        assert_eq!(eth0.addrs.len(), 1);
        assert_eq!(eth0.routes.iter().filter(|r| r.is_default()).count(), 1);
    }

    #[tokio::test]
    async fn test_attach_dual_stack_default_routes() {
        let h = harness();
        let mut req = request();
        req.ip = "10.0.0.5/24,fd00::5/64".to_string();
        req.gateway = "10.0.0.1,fd00::1".to_string();
        h.engine.attach(&req).await.unwrap();

        let eth0 = h.kernel.link(netns(), "eth0").unwrap();
        let mut defaults: Vec<String> = eth0
            .routes
            .iter()
            .filter(|r| r.is_default())
            .map(|r| format!("{} via {}", r.destination, r.gateway.unwrap()))
            .collect();
        defaults.sort();
        assert_eq!(defaults, vec!["0.0.0.0/0 via 10.0.0.1", "::/0 via fd00::1"]);
        assert_eq!(h.probe.pings(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_fails_attach() {
        let h = harness_with(FakeSwitch::new(), FakeProbe::silent(), config());
        let err = h.engine.attach(&request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProbeError>(),
            Some(ProbeError::Unreachable { attempts: 3, .. })
        ));
        assert_eq!(h.probe.pings(), 3);

        let eth0 = h.kernel.link(netns(), "eth0").unwrap();
        assert_eq!(eth0.addrs.len(), 1);
        assert_eq!(eth0.routes.len(), 1);

        // a retry by the controller adds nothing new
        h.kernel.clear_ops();
        assert!(h.engine.attach(&request()).await.is_err());
        assert_eq!(h.kernel.count_ops("add_address"), 0);
        assert_eq!(h.kernel.link(netns(), "eth0").unwrap().routes.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_converges_once_gateway_answers() {
        let h = harness_with(FakeSwitch::new(), FakeProbe::silent(), config());
        let mut req = request();
        req.shaping.ingress_mbps = Some(50);
        assert!(h.engine.attach(&req).await.is_err());
        // the port stays bound for the retry
        assert_eq!(h.switch.port_names().len(), 1);

        let engine = AttachEngine::new(
            h.kernel.host(),
            h.switch.clone(),
            h.kernel.exec(),
            FakeProbe::replying(),
            config(),
        );
        let names = engine.attach(&req).await.unwrap();

        assert_eq!(h.switch.port_names(), vec![names.host.clone()]);
        assert_eq!(h.switch.state.lock().unwrap().qos.len(), 1);
        assert_eq!(h.kernel.count_ops("create_veth"), 1);
        let eth0 = h.kernel.link(netns(), "eth0").unwrap();
        assert_eq!(eth0.addrs.len(), 1);
        assert_eq!(eth0.routes.iter().filter(|r| r.is_default()).count(), 1);
    }

    #[tokio::test]
    async fn test_node_wide_disabled_check_skips_probe() {
        let config = AgentConfig {
            gateway_check: GatewayCheckMode::Disabled,
            ..config()
        };
        let h = harness_with(FakeSwitch::new(), FakeProbe::silent(), config);
        h.engine.attach(&request()).await.unwrap();
        assert_eq!(h.probe.pings(), 0);
    }

    #[tokio::test]
    async fn test_attach_rejects_invalid_request() {
        let h = harness();
        let mut req = request();
        req.ip = "10.16.0.5".to_string();
        req.gateway = "fd00::1".to_string();
        assert!(h.engine.attach(&req).await.is_err());
        assert!(h.kernel.ops().is_empty());
        assert!(h.switch.ops().is_empty());
    }

    #[tokio::test]
    async fn test_attach_internal_port_with_companion() {
        let h = harness();
        let mut req = request();
        req.device = DeviceModel::Internal;
        let names = req.nic_names().unwrap();
        // the switch creates internal devices in the host namespace
        h.kernel
            .add_link(Path::new(HOST_NS), &names.container, LinkKind::OpenvSwitch);

        h.engine.attach(&req).await.unwrap();

        let port = h.switch.port(&names.container).unwrap();
        assert_eq!(port.kind.as_deref(), Some(INTERNAL));
        assert!(h.switch.port(&names.host).is_none());

        let internal = h.kernel.link(netns(), &names.container).unwrap();
        assert_eq!(internal.addrs.len(), 1);
        let companion = h.kernel.link(netns(), "eth0").unwrap();
        assert_eq!(companion.details.kind, LinkKind::Dummy);
        assert_eq!(companion.addrs, internal.addrs);
        assert_eq!(h.kernel.count_ops("set_txqlen"), 0);
    }

    #[tokio::test]
    async fn test_detach_internal_port() {
        let h = harness();
        let mut req = request();
        req.device = DeviceModel::Internal;
        req.shaping.egress_mbps = Some(10);
        let names = req.nic_names().unwrap();
        h.kernel
            .add_link(Path::new(HOST_NS), &names.container, LinkKind::OpenvSwitch);
        h.engine.attach(&req).await.unwrap();
        assert!(h.switch.state.lock().unwrap().policing.contains_key(&names.container));
        h.kernel.clear_ops();

        h.engine.detach(&req.detach_request()).await.unwrap();
        assert!(h.switch.port(&names.container).is_none());
        assert!(h.switch.state.lock().unwrap().policing.is_empty());
        // the switch owns the device, nothing is deleted through the kernel
        assert_eq!(h.kernel.count_ops("delete_link"), 0);

        h.engine.detach(&req.detach_request()).await.unwrap();
        assert_eq!(h.switch.count_ops("del_port"), 1);
    }

    #[tokio::test]
    async fn test_attach_and_detach_sriov_vf() {
        let sysfs = fixture::sysfs();
        let config = AgentConfig {
            sysfs_root: sysfs.path().to_path_buf(),
            ..config()
        };
        let h = harness_with(FakeSwitch::new(), FakeProbe::replying(), config);
        h.kernel.add_link(Path::new(HOST_NS), "ens1f0v1", LinkKind::Other);
        h.kernel.add_link(Path::new(HOST_NS), "eth6", LinkKind::Other);
        let mut req = request();
        req.device = DeviceModel::SriovVf {
            device_id: VF.to_string(),
            vf_driver: None,
        };

        let names = h.engine.attach(&req).await.unwrap();
        assert!(h.switch.port(&names.host).is_some());
        assert!(h.kernel.link(Path::new(HOST_NS), &names.host).is_some());
        assert!(h.kernel.link(netns(), "eth0").is_some());
        assert_eq!(h.kernel.count_ops(&format!("set_vf_mac ens1f0 1 {}", req.mac)), 1);

        h.engine.detach(&req.detach_request()).await.unwrap();
        assert!(h.switch.port_names().is_empty());
        assert_eq!(h.kernel.count_ops(&format!("set_vf_mac ens1f0 1 {}", MacAddr::ZERO)), 1);
    }

    #[tokio::test]
    async fn test_attach_dpdk_skips_namespace() {
        let vhost = tempfile::TempDir::new().unwrap();
        let config = AgentConfig {
            vhost_dir: vhost.path().to_path_buf(),
            ..config()
        };
        let h = harness_with(FakeSwitch::new(), FakeProbe::replying(), config);
        let mut req = request();
        req.device = DeviceModel::Dpdk {
            pod_uid: "uid-1".to_string(),
            volume: "vhost".to_string(),
            socket: "sock0".to_string(),
        };

        let names = h.engine.attach(&req).await.unwrap();
        let port = h.switch.port(&names.host).unwrap();
        assert_eq!(
            port.options.get("vhost-server-path").map(String::as_str),
            Some(vhost.path().join("uid-1/vhost/sock0").to_str().unwrap())
        );
        assert!(vhost.path().join("uid-1/vhost").is_dir());
        assert_eq!(h.kernel.count_ops("move_to_netns"), 0);
        assert_eq!(h.probe.pings(), 0);
    }

    fn dpdk_request() -> AttachmentRequest {
        let mut req = request();
        req.device = DeviceModel::Dpdk {
            pod_uid: "uid-1".to_string(),
            volume: "vhost".to_string(),
            socket: "sock0".to_string(),
        };
        req
    }

    #[tokio::test]
    async fn test_dpdk_port_gets_bandwidth_without_emulation() {
        let vhost = tempfile::TempDir::new().unwrap();
        let config = AgentConfig {
            vhost_dir: vhost.path().to_path_buf(),
            ..config()
        };
        let h = harness_with(FakeSwitch::new(), FakeProbe::replying(), config);
        let mut req = dpdk_request();
        req.shaping = Shaping {
            ingress_mbps: Some(100),
            egress_mbps: Some(20),
            latency_ms: Some(30),
            loss_percent: Some(2.0),
            ..Shaping::default()
        };

        let names = h.engine.attach(&req).await.unwrap();
        let state = h.switch.state.lock().unwrap();
        assert_eq!(state.policing.get(&names.host), Some(&(20_000, 16_000)));
        assert_eq!(state.qos.len(), 1);
        assert_eq!(
            state.qos[0].2,
            QosSpec::Htb {
                max_rate_bps: Some(100_000_000),
                priority: None
            }
        );
    }

    #[tokio::test]
    async fn test_veth_port_keeps_emulation() {
        let h = harness();
        let mut req = request();
        req.shaping = Shaping {
            ingress_mbps: Some(100),
            latency_ms: Some(30),
            ..Shaping::default()
        };
        h.engine.attach(&req).await.unwrap();

        let state = h.switch.state.lock().unwrap();
        assert!(matches!(state.qos[0].2, QosSpec::Netem { .. }));
    }

    #[tokio::test]
    async fn test_detach_dpdk_port() {
        let vhost = tempfile::TempDir::new().unwrap();
        let config = AgentConfig {
            vhost_dir: vhost.path().to_path_buf(),
            ..config()
        };
        let h = harness_with(FakeSwitch::new(), FakeProbe::replying(), config);
        let mut req = dpdk_request();
        req.shaping.ingress_mbps = Some(10);
        let names = h.engine.attach(&req).await.unwrap();
        assert!(h.switch.port(&names.host).is_some());

        h.engine.detach(&req.detach_request()).await.unwrap();
        assert!(h.switch.port_names().is_empty());
        assert!(h.switch.state.lock().unwrap().qos.is_empty());
        assert_eq!(h.kernel.count_ops("delete_link"), 0);

        h.engine.detach(&req.detach_request()).await.unwrap();
        assert_eq!(h.switch.count_ops("del_port"), 1);
    }

    #[tokio::test]
    async fn test_netdev_datapath_turns_off_tx_offload_once() {
        let h = harness_with(FakeSwitch::with_datapath("netdev"), FakeProbe::replying(), config());
        let names = h.engine.attach(&request()).await.unwrap();
        h.engine.attach(&request()).await.unwrap();

        assert_eq!(
            h.kernel.count_ops(&format!("disable_tx_offload {}", names.container)),
            1
        );
        assert!(!h.kernel.link(netns(), "eth0").unwrap().tx_offload);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let h = harness();
        let req = request();
        let names = h.engine.attach(&req).await.unwrap();

        h.engine.detach(&req.detach_request()).await.unwrap();
        assert!(h.switch.port_names().is_empty());
        assert!(h.kernel.link(Path::new(HOST_NS), &names.host).is_none());
        assert!(h.kernel.link(netns(), "eth0").is_none());

        h.engine.detach(&req.detach_request()).await.unwrap();
        assert_eq!(h.kernel.count_ops("delete_link"), 1);
        assert_eq!(h.switch.count_ops("del_port"), 1);
    }

    #[tokio::test]
    async fn test_detach_after_namespace_removed() {
        let h = harness();
        let req = request();
        let names = h.engine.attach(&req).await.unwrap();
        h.kernel.remove_namespace(netns());

        h.engine.detach(&req.detach_request()).await.unwrap();
        assert!(h.kernel.link(Path::new(HOST_NS), &names.host).is_none());
        assert!(h.switch.port_names().is_empty());
    }

    #[tokio::test]
    async fn test_update_shaping() {
        let h = harness();
        h.engine.attach(&request()).await.unwrap();
        let shaping = Shaping {
            ingress_mbps: Some(100),
            ..Shaping::default()
        };

        h.engine.update_shaping("web-0.default", &shaping).await.unwrap();
        assert_eq!(h.switch.count_ops("set_qos"), 1);
        assert!(h
            .engine
            .update_shaping("missing.default", &shaping)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_port_of_same_pod_is_replaced() {
        let h = harness();
        let mut req = request();
        h.engine.attach(&req).await.unwrap();

        // sandbox recreated with a new container id and namespace
        req.container_id = "99aa88bb77cc66dd".to_string();
        req.netns = PathBuf::from("/var/run/netns/cni-5678");
        h.kernel.add_namespace(&req.netns);
        let names = h.engine.attach(&req).await.unwrap();
        assert_eq!(h.switch.port_names(), vec![names.host.clone()]);
        assert_eq!(
            h.switch.port(&names.host).unwrap().external_ids.get(IFACE_ID).unwrap(),
            "web-0.default"
        );
    }
}
