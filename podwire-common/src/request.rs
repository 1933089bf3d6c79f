use crate::addressing::{self, MacAddr, Protocol};
use crate::error::ConfigError;
use crate::naming::{self, NicNames, DEFAULT_PROVIDER, PRIMARY_INTERFACE};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Desired network identity of one pod interface, as handed over by the
/// cluster controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRequest {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub container_id: String,
    pub netns: PathBuf,
    #[serde(default = "default_ifname")]
    pub ifname: String,
    #[serde(default)]
    pub device: DeviceModel,
    pub mac: MacAddr,
    /// Comma-joined `address/prefix` list, IPv4 first for dual stack
    pub ip: String,
    /// Comma-joined gateways in the same family order as `ip`
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub default_route: bool,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Zero or negative keeps whatever MTU the device already has
    #[serde(default)]
    pub mtu: i32,
    #[serde(default)]
    pub shaping: Shaping,
    #[serde(default)]
    pub gateway_check: GatewayCheckMode,
    #[serde(default)]
    pub dns: DnsHints,
}

/// Backing device of a pod interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceModel {
    /// Software veth pair
    #[default]
    Veth,
    /// SR-IOV virtual function attached through its switchdev representor
    SriovVf {
        /// PCI address of the virtual function
        device_id: String,
        /// Kernel driver the VF is bound to, `vfio-pci` means no netdevice
        #[serde(default)]
        vf_driver: Option<String>,
    },
    /// vhost-user socket served to a userspace dataplane
    Dpdk {
        pod_uid: String,
        volume: String,
        socket: String,
    },
    /// Switch internal port living in the pod namespace
    Internal,
}

impl DeviceModel {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceModel::Veth => "veth",
            DeviceModel::SriovVf { .. } => "sriov_vf",
            DeviceModel::Dpdk { .. } => "dpdk",
            DeviceModel::Internal => "internal",
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DeviceModel::SriovVf { device_id, .. } if device_id.is_empty() => {
                Err(ConfigError::Missing("sriov device id"))
            }
            DeviceModel::Dpdk { pod_uid, .. } if pod_uid.is_empty() => {
                Err(ConfigError::Missing("dpdk pod uid"))
            }
            DeviceModel::Dpdk { volume, .. } if volume.is_empty() => {
                Err(ConfigError::Missing("dpdk volume"))
            }
            DeviceModel::Dpdk { socket, .. } if socket.is_empty() => {
                Err(ConfigError::Missing("dpdk socket"))
            }
            _ => Ok(()),
        }
    }
}

/// How the gateway is probed before an attachment is reported ready
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayCheckMode {
    Disabled,
    /// ICMP echo for every family
    #[default]
    Ping,
    /// ARP for IPv4 underlay gateways, echo for IPv6
    Arping,
}

/// Additional static route installed inside the pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl Route {
    /// Parse destination and gateway. A malformed route is skipped by the
    /// installer rather than failing the attachment.
    pub fn parse(&self) -> Result<(IpNetwork, Option<IpAddr>), ConfigError> {
        let destination: IpNetwork = self
            .destination
            .trim()
            .parse()
            .map_err(|_| ConfigError::RouteDestination(self.destination.clone()))?;

        let gateway = match self.gateway.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(gw) => {
                let gw: IpAddr = gw.parse().map_err(|_| ConfigError::Gateway(gw.to_string()))?;
                if gw.is_ipv4() != destination.is_ipv4() {
                    return Err(ConfigError::GatewayFamily {
                        address: destination.to_string(),
                        gateway: gw.to_string(),
                    });
                }
                Some(gw)
            }
        };

        Ok((destination, gateway))
    }
}

/// Bandwidth and emulation parameters for a pod port. Every field is
/// optional, an empty `Shaping` clears everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shaping {
    /// Ceiling of traffic toward the pod, Mbit/s. Enforced by the port's
    /// HTB queue.
    #[serde(default)]
    pub ingress_mbps: Option<u64>,
    /// Rate of traffic leaving the pod, Mbit/s. Policed where the switch
    /// receives it.
    #[serde(default)]
    pub egress_mbps: Option<u64>,
    /// Queue priority, lower is served first
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub latency_ms: Option<u32>,
    #[serde(default)]
    pub loss_percent: Option<f64>,
    #[serde(default)]
    pub limit_packets: Option<u32>,
}

impl Shaping {
    pub fn has_rate_limit(&self) -> bool {
        self.ingress_mbps.is_some_and(|v| v > 0) || self.priority.is_some()
    }

    pub fn has_emulation(&self) -> bool {
        self.latency_ms.is_some_and(|v| v > 0)
            || self.loss_percent.is_some_and(|v| v > 0.0)
            || self.limit_packets.is_some_and(|v| v > 0)
    }

    /// The bandwidth and priority settings alone
    #[must_use]
    pub fn without_emulation(&self) -> Self {
        Self {
            latency_ms: None,
            loss_percent: None,
            limit_packets: None,
            ..self.clone()
        }
    }
}

/// Resolver hints carried for the caller. The agent accepts them as part of
/// the request but never applies them. Writing the pod's resolver
/// configuration is left to the runtime that issued the attach.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsHints {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub search: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_ifname() -> String {
    PRIMARY_INTERFACE.to_string()
}

impl AttachmentRequest {
    pub fn logical_port_id(&self) -> String {
        naming::logical_port_id(&self.pod_name, &self.pod_namespace, &self.provider)
    }

    pub fn nic_names(&self) -> Result<NicNames, ConfigError> {
        naming::nic_names(&self.container_id, &self.ifname)
    }

    pub fn addresses(&self) -> Result<Vec<IpNetwork>, ConfigError> {
        addressing::parse_networks(&self.ip)
    }

    pub fn gateways(&self) -> Result<Vec<IpAddr>, ConfigError> {
        addressing::parse_addrs(&self.gateway)
    }

    pub fn protocol(&self) -> Result<Protocol, ConfigError> {
        let ips: Vec<IpAddr> = self.addresses()?.iter().map(IpNetwork::ip).collect();
        Protocol::of(&ips).ok_or(ConfigError::Missing("ip address"))
    }

    /// Address/gateway pairs in request order. Empty when no gateway was
    /// given and no default route is requested.
    pub fn gateway_pairs(&self) -> Result<Vec<(IpNetwork, IpAddr)>, ConfigError> {
        let gateways = self.gateways()?;
        if gateways.is_empty() && !self.default_route {
            return Ok(Vec::new());
        }
        addressing::pair_gateways(&self.addresses()?, &gateways)
    }

    /// Check everything the engine needs before touching the host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pod_name.is_empty() {
            return Err(ConfigError::Missing("pod name"));
        }
        if self.pod_namespace.is_empty() {
            return Err(ConfigError::Missing("pod namespace"));
        }
        if self.netns.as_os_str().is_empty() {
            return Err(ConfigError::Missing("network namespace path"));
        }
        self.nic_names()?;
        self.device.validate()?;

        if self.addresses()?.is_empty() {
            return Err(ConfigError::Missing("ip address"));
        }
        self.gateway_pairs()?;
        Ok(())
    }

    /// Teardown request for the same interface.
    pub fn detach_request(&self) -> DetachRequest {
        DetachRequest {
            pod_name: self.pod_name.clone(),
            pod_namespace: self.pod_namespace.clone(),
            provider: self.provider.clone(),
            container_id: self.container_id.clone(),
            netns: Some(self.netns.clone()),
            ifname: self.ifname.clone(),
            device: self.device.clone(),
        }
    }
}

/// Identity of an interface to tear down. Names are recomputed from the
/// container id, so nothing else about the attachment has to be kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachRequest {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub container_id: String,
    #[serde(default)]
    pub netns: Option<PathBuf>,
    #[serde(default = "default_ifname")]
    pub ifname: String,
    #[serde(default)]
    pub device: DeviceModel,
}

impl DetachRequest {
    pub fn logical_port_id(&self) -> String {
        naming::logical_port_id(&self.pod_name, &self.pod_namespace, &self.provider)
    }

    pub fn nic_names(&self) -> Result<NicNames, ConfigError> {
        naming::nic_names(&self.container_id, &self.ifname)
    }
}
