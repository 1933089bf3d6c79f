use crate::network::prober::ProbePolicy;
use anyhow::{anyhow, bail, Context, Result};
use podwire_common::GatewayCheckMode;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Integration bridge all pod ports attach to
    pub bridge: String,
    /// Internal port used by the node itself
    pub node_nic: String,
    /// `disabled` turns gateway probing off for every attachment
    pub gateway_check: GatewayCheckMode,
    pub arping: ProbePolicy,
    pub ping: ProbePolicy,
    pub reap_interval: Duration,
    pub node_check_interval: Duration,
    pub uplink_resync_interval: Duration,
    pub sysfs_root: PathBuf,
    /// Base directory of vhost-user sockets
    pub vhost_dir: PathBuf,
    pub host_txqlen: u32,
    pub ovs_timeout_secs: u32,
    pub otlp: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bridge: "br-int".to_string(),
            node_nic: "ovn0".to_string(),
            gateway_check: GatewayCheckMode::Ping,
            arping: ProbePolicy::new(200, Duration::from_secs(1)),
            ping: ProbePolicy::new(10, Duration::from_secs(1)),
            reap_interval: Duration::from_secs(300),
            node_check_interval: Duration::from_secs(5),
            uplink_resync_interval: Duration::from_secs(60),
            sysfs_root: PathBuf::from("/sys"),
            vhost_dir: PathBuf::from("/var/run/podwire/vhost"),
            host_txqlen: 1000,
            ovs_timeout_secs: 30,
            otlp: false,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid value for {}: {:?}", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => bail!("Invalid value for {}: {:?}", key, value),
    }
}

pub fn parse_check_mode(value: &str) -> Result<GatewayCheckMode> {
    match value.trim() {
        "disabled" | "none" => Ok(GatewayCheckMode::Disabled),
        "ping" => Ok(GatewayCheckMode::Ping),
        "arping" => Ok(GatewayCheckMode::Arping),
        other => bail!("Unknown gateway check mode {:?}", other),
    }
}

impl AgentConfig {
    /// Defaults overridden by `PODWIRE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let secs = |key: &str, value: &str| parse_var::<u64>(key, value).map(Duration::from_secs);

        if let Some(v) = lookup("PODWIRE_BRIDGE") {
            config.bridge = v;
        }
        if let Some(v) = lookup("PODWIRE_NODE_NIC") {
            config.node_nic = v;
        }
        if let Some(v) = lookup("PODWIRE_GATEWAY_CHECK") {
            config.gateway_check = parse_check_mode(&v)?;
        }
        if let Some(v) = lookup("PODWIRE_ARPING_RETRIES") {
            config.arping.max_attempts = parse_var("PODWIRE_ARPING_RETRIES", &v)?;
        }
        if let Some(v) = lookup("PODWIRE_PING_RETRIES") {
            config.ping.max_attempts = parse_var("PODWIRE_PING_RETRIES", &v)?;
        }
        if let Some(v) = lookup("PODWIRE_PROBE_INTERVAL_MS") {
            let interval =
                Duration::from_millis(parse_var("PODWIRE_PROBE_INTERVAL_MS", &v)?);
            config.arping.interval = interval;
            config.ping.interval = interval;
        }
        if let Some(v) = lookup("PODWIRE_REAP_INTERVAL_SECS") {
            config.reap_interval = secs("PODWIRE_REAP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("PODWIRE_NODE_CHECK_INTERVAL_SECS") {
            config.node_check_interval = secs("PODWIRE_NODE_CHECK_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("PODWIRE_UPLINK_RESYNC_SECS") {
            config.uplink_resync_interval = secs("PODWIRE_UPLINK_RESYNC_SECS", &v)?;
        }
        if let Some(v) = lookup("PODWIRE_SYSFS_ROOT") {
            config.sysfs_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("PODWIRE_VHOST_DIR") {
            config.vhost_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PODWIRE_HOST_TXQLEN") {
            config.host_txqlen = parse_var("PODWIRE_HOST_TXQLEN", &v)?;
        }
        if let Some(v) = lookup("PODWIRE_OVS_TIMEOUT_SECS") {
            config.ovs_timeout_secs = parse_var("PODWIRE_OVS_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PODWIRE_OTLP") {
            config.otlp = parse_bool("PODWIRE_OTLP", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bridge.is_empty() {
            bail!("Bridge name must not be empty");
        }
        podwire_common::naming::validate_ifname(&self.node_nic)
            .context("Invalid node nic name")?;
        if self.reap_interval.is_zero()
            || self.node_check_interval.is_zero()
            || self.uplink_resync_interval.is_zero()
        {
            bail!("Loop intervals must be positive");
        }
        Ok(())
    }

    /// Probe mode for a request, a node-wide `disabled` wins
    pub fn effective_check(&self, requested: GatewayCheckMode) -> GatewayCheckMode {
        if self.gateway_check == GatewayCheckMode::Disabled {
            GatewayCheckMode::Disabled
        } else {
            requested
        }
    }
}

/// Desired uplink of one provider network: `provider=nic:bridge`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UplinkMapping {
    pub provider: String,
    pub nic: String,
    pub bridge: String,
}

impl FromStr for UplinkMapping {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (provider, rest) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected provider=nic:bridge, got {:?}", s))?;
        let (nic, bridge) = rest
            .split_once(':')
            .ok_or_else(|| anyhow!("Expected provider=nic:bridge, got {:?}", s))?;
        if provider.is_empty() || nic.is_empty() || bridge.is_empty() {
            bail!("Empty field in uplink mapping {:?}", s);
        }
        Ok(Self {
            provider: provider.to_string(),
            nic: nic.to_string(),
            bridge: bridge.to_string(),
        })
    }
}
