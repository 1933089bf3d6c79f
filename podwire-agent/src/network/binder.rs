//! Integration bridge port binding keyed by logical port id.

use super::device::Endpoint;
use super::ovs::{PortSpec, Switch, IFACE_ID, IP, POD_NAME, POD_NAMESPACE, POD_NETNS};
use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use tracing::{info, warn};

/// Descriptive tags written onto a bound port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTags {
    pub iface_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    /// Addresses without prefix length
    pub ips: Vec<String>,
    pub netns: String,
}

impl PortTags {
    pub fn new(iface_id: String, pod_name: &str, pod_namespace: &str) -> Self {
        Self {
            iface_id,
            pod_name: pod_name.to_string(),
            pod_namespace: pod_namespace.to_string(),
            ips: Vec::new(),
            netns: String::new(),
        }
    }

    #[must_use]
    pub fn with_addresses(mut self, addresses: &[IpNetwork]) -> Self {
        self.ips = addresses.iter().map(|a| a.ip().to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_netns(mut self, netns: String) -> Self {
        self.netns = netns;
        self
    }

    fn apply(&self, spec: PortSpec) -> PortSpec {
        let mut spec = spec
            .with_external_id(IFACE_ID, &self.iface_id)
            .with_external_id(POD_NAME, &self.pod_name)
            .with_external_id(POD_NAMESPACE, &self.pod_namespace);
        if !self.ips.is_empty() {
            spec = spec.with_external_id(IP, &self.ips.join(","));
        }
        if !self.netns.is_empty() {
            spec = spec.with_external_id(POD_NETNS, &self.netns);
        }
        spec
    }
}

/// Bind `endpoint` to `bridge`. Any other port still carrying the same
/// logical port id is removed first, so repeated binds converge on one port.
#[tracing::instrument(name = "binder.bind", skip(switch, endpoint, tags), fields(port = %endpoint.port, iface_id = %tags.iface_id))]
pub async fn bind(switch: &dyn Switch, bridge: &str, endpoint: &Endpoint, tags: &PortTags) -> Result<()> {
    let existing = switch
        .interfaces_with_iface_id(&tags.iface_id)
        .await
        .with_context(|| format!("Failed to look up ports of {}", tags.iface_id))?;
    for stale in existing.iter().filter(|name| **name != endpoint.port) {
        warn!("Removing duplicate port {} of {}", stale, tags.iface_id);
        switch.del_port(None, stale).await?;
    }

    let mut spec = PortSpec::new(bridge, &endpoint.port);
    if let Some(kind) = &endpoint.port_kind {
        spec = spec.with_kind(kind);
    }
    for (key, value) in &endpoint.port_options {
        spec = spec.with_option(key, value);
    }
    switch.add_port(&tags.apply(spec)).await?;
    info!("Bound {} as {}", endpoint.port, tags.iface_id);
    Ok(())
}

/// Remove a port together with its interface; absent is fine
pub async fn unbind(switch: &dyn Switch, port: &str) -> Result<()> {
    switch
        .del_port(None, port)
        .await
        .with_context(|| format!("Failed to unbind {port}"))
}
