//! Host-side endpoint provisioning, one backend per device model.

use super::sriov::{is_pci_address, SriovResolver};
use super::{LinkKind, NetOps};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use podwire_common::{DeviceModel, MacAddr, NicNames};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Switch interface type of a vhost-user client port
pub const DPDK_VHOST_CLIENT: &str = "dpdkvhostuserclient";
/// Switch interface type of an internal port
pub const INTERNAL: &str = "internal";

/// What a backend produced and how the rest of the attachment must treat it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Port name on the integration bridge
    pub port: String,
    /// Interface type, `None` for a system device
    pub port_kind: Option<String>,
    pub port_options: BTreeMap<String, String>,
    /// Device to configure inside the namespace, `None` when there is none
    pub container_nic: Option<String>,
    /// Whether the container device is renamed to the requested ifname
    pub rename: bool,
    /// The requested ifname is a dummy companion next to the container device
    pub companion: bool,
}

impl Endpoint {
    fn system(port: &str, container_nic: Option<String>) -> Self {
        Self {
            port: port.to_string(),
            port_kind: None,
            port_options: BTreeMap::new(),
            container_nic,
            rename: true,
            companion: false,
        }
    }
}

/// Device provisioning for one device model
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Create or reuse the host endpoint
    async fn provision(&self, names: &NicNames, mac: MacAddr, mtu: i32) -> Result<Endpoint>;
    /// Undo `provision`; an endpoint that is already gone is fine
    async fn release(&self, names: &NicNames) -> Result<()>;
    /// Bridge port carrying this model's traffic
    fn port_name<'n>(&self, names: &'n NicNames) -> &'n str {
        &names.host
    }
}

/// Shared handles the backends work with
pub struct DeviceContext<'a> {
    pub net: &'a dyn NetOps,
    pub sriov: &'a SriovResolver,
    pub vhost_dir: &'a Path,
}

/// Select the backend for a device model
pub fn backend_for<'a>(model: &'a DeviceModel, ctx: &DeviceContext<'a>) -> Box<dyn DeviceBackend + 'a> {
    match model {
        DeviceModel::Veth => Box::new(VethDevice { net: ctx.net }),
        DeviceModel::SriovVf {
            device_id,
            vf_driver,
        } => Box::new(SriovDevice {
            net: ctx.net,
            resolver: ctx.sriov,
            device_id,
            vf_driver: vf_driver.as_deref(),
        }),
        DeviceModel::Dpdk {
            pod_uid,
            volume,
            socket,
        } => Box::new(DpdkDevice {
            socket_path: ctx.vhost_dir.join(pod_uid).join(volume).join(socket),
        }),
        DeviceModel::Internal => Box::new(InternalDevice),
    }
}

/// Software veth pair, both ends created in the host namespace
pub struct VethDevice<'a> {
    net: &'a dyn NetOps,
}

#[async_trait]
impl DeviceBackend for VethDevice<'_> {
    async fn provision(&self, names: &NicNames, _mac: MacAddr, _mtu: i32) -> Result<Endpoint> {
        match self.net.link_by_name(&names.host).await? {
            Some(link) if link.kind == LinkKind::Veth => {
                debug!("Reusing veth pair {}/{}", names.host, names.container);
            }
            Some(link) => bail!(
                "Device {} exists but is a {:?}, not a veth",
                link.name,
                link.kind
            ),
            None => {
                if let Err(e) = self.net.create_veth(&names.host, &names.container).await {
                    self.remove_halves(names).await;
                    return Err(e.context(format!(
                        "Failed to create veth pair {}/{}",
                        names.host, names.container
                    )));
                }
                info!("Created veth pair {}/{}", names.host, names.container);
            }
        }
        Ok(Endpoint::system(&names.host, Some(names.container.clone())))
    }

    async fn release(&self, names: &NicNames) -> Result<()> {
        let Some(link) = self.net.link_by_name(&names.host).await? else {
            debug!("Host device {} already gone", names.host);
            return Ok(());
        };
        if link.kind != LinkKind::Veth {
            warn!("Not deleting {}, it is a {:?}", link.name, link.kind);
            return Ok(());
        }
        self.net
            .delete_link(link.index)
            .await
            .with_context(|| format!("Failed to delete host device {}", names.host))?;
        info!("Deleted veth pair {}", names.host);
        Ok(())
    }
}

impl VethDevice<'_> {
    async fn remove_halves(&self, names: &NicNames) {
        for name in [&names.host, &names.container] {
            if let Ok(Some(link)) = self.net.link_by_name(name).await {
                if let Err(e) = self.net.delete_link(link.index).await {
                    warn!("Failed to remove half-created {}: {:#}", name, e);
                }
            }
        }
    }
}

/// SR-IOV virtual function, bridged through its switchdev representor
pub struct SriovDevice<'a> {
    net: &'a dyn NetOps,
    resolver: &'a SriovResolver,
    device_id: &'a str,
    vf_driver: Option<&'a str>,
}

#[async_trait]
impl DeviceBackend for SriovDevice<'_> {
    async fn provision(&self, names: &NicNames, mac: MacAddr, mtu: i32) -> Result<Endpoint> {
        let vf = self
            .resolver
            .resolve(self.device_id, self.vf_driver)
            .with_context(|| format!("Failed to resolve VF {}", self.device_id))?;

        let representor = self
            .net
            .link_by_name(&vf.representor)
            .await?
            .ok_or_else(|| anyhow!("Representor {} not found", vf.representor))?;

        if representor.name != names.host {
            self.net.set_link_up(representor.index, false).await?;
            self.net
                .rename_link(representor.index, &names.host)
                .await
                .with_context(|| {
                    format!("Failed to rename representor {} to {}", vf.representor, names.host)
                })?;
            self.net.set_link_up(representor.index, true).await?;
            info!("Representor {} renamed to {}", vf.representor, names.host);
        }

        if mtu > 0 {
            self.net
                .set_mtu(representor.index, mtu as u32)
                .await
                .with_context(|| format!("Failed to set MTU of {}", names.host))?;
        }
        self.net
            .set_vf_mac(&vf.pf, vf.index, mac)
            .await
            .with_context(|| format!("Failed to set MAC of {} vf {}", vf.pf, vf.index))?;

        Ok(Endpoint::system(&names.host, vf.netdev))
    }

    async fn release(&self, _names: &NicNames) -> Result<()> {
        if !is_pci_address(self.device_id) {
            return Ok(());
        }
        let (pf, index) = self.resolver.physical_function(self.device_id)?;
        self.net
            .set_vf_mac(&pf, index, MacAddr::ZERO)
            .await
            .with_context(|| format!("Failed to reset MAC of {} vf {}", pf, index))?;
        debug!("Reset MAC of {} vf {}", pf, index);
        Ok(())
    }
}

/// vhost-user socket for a userspace dataplane, no kernel device
pub struct DpdkDevice {
    socket_path: PathBuf,
}

#[async_trait]
impl DeviceBackend for DpdkDevice {
    async fn provision(&self, names: &NicNames, _mac: MacAddr, _mtu: i32) -> Result<Endpoint> {
        if let Some(dir) = self.socket_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let mut endpoint = Endpoint::system(&names.host, None);
        endpoint.port_kind = Some(DPDK_VHOST_CLIENT.to_string());
        endpoint.port_options.insert(
            "vhost-server-path".to_string(),
            self.socket_path.display().to_string(),
        );
        Ok(endpoint)
    }

    async fn release(&self, _names: &NicNames) -> Result<()> {
        Ok(())
    }
}

/// Internal port created by the switch; the port itself is the container
/// device and keeps its derived name
pub struct InternalDevice;

#[async_trait]
impl DeviceBackend for InternalDevice {
    async fn provision(&self, names: &NicNames, _mac: MacAddr, _mtu: i32) -> Result<Endpoint> {
        Ok(Endpoint {
            port: names.container.clone(),
            port_kind: Some(INTERNAL.to_string()),
            port_options: BTreeMap::new(),
            container_nic: Some(names.container.clone()),
            rename: false,
            companion: true,
        })
    }

    async fn release(&self, _names: &NicNames) -> Result<()> {
        // deleting the port with its interface removes the device
        Ok(())
    }

    fn port_name<'n>(&self, names: &'n NicNames) -> &'n str {
        &names.container
    }
}
