use super::command;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use podwire_common::MacAddr;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// External id tying a switch interface to its logical port
pub const IFACE_ID: &str = "iface-id";
pub const POD_NAME: &str = "pod_name";
pub const POD_NAMESPACE: &str = "pod_namespace";
pub const POD_NETNS: &str = "pod_netns";
pub const IP: &str = "ip";
pub const VENDOR: &str = "vendor";

/// Desired state of one bridge port and its interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSpec {
    pub bridge: String,
    pub name: String,
    /// Interface type, `None` for a plain system device
    pub kind: Option<String>,
    pub options: BTreeMap<String, String>,
    pub external_ids: BTreeMap<String, String>,
}

impl PortSpec {
    pub fn new(bridge: &str, name: &str) -> Self {
        Self {
            bridge: bridge.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_external_id(mut self, key: &str, value: &str) -> Self {
        self.external_ids.insert(key.to_string(), value.to_string());
        self
    }

    pub fn iface_id(&self) -> Option<&str> {
        self.external_ids.get(IFACE_ID).map(String::as_str)
    }
}

/// Interface row as listed from the switch database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchInterface {
    pub name: String,
    pub external_ids: BTreeMap<String, String>,
}

/// Queueing discipline attached to a port
#[derive(Debug, Clone, PartialEq)]
pub enum QosSpec {
    /// Hierarchical token bucket with a single queue
    Htb {
        max_rate_bps: Option<u64>,
        priority: Option<u32>,
    },
    /// Delay/loss emulation
    Netem {
        latency_us: Option<u64>,
        loss_percent: Option<f64>,
        limit: Option<u32>,
    },
}

/// Management interface of the virtual switch
#[async_trait]
pub trait Switch: Send + Sync {
    /// Create the port if missing and set its type, options and external ids
    async fn add_port(&self, spec: &PortSpec) -> Result<()>;
    /// Delete a port by port or interface name, absent is fine
    async fn del_port(&self, bridge: Option<&str>, name: &str) -> Result<()>;
    async fn interface_exists(&self, name: &str) -> Result<bool>;
    async fn interfaces_with_iface_id(&self, iface_id: &str) -> Result<Vec<String>>;
    async fn internal_interfaces(&self) -> Result<Vec<SwitchInterface>>;
    async fn set_ingress_policing(&self, iface: &str, rate_kbps: u64, burst_kb: u64) -> Result<()>;
    /// Create a QoS row (and queue) tagged with `iface_id` and attach it to `port`
    async fn set_qos(&self, port: &str, iface_id: &str, qos: &QosSpec) -> Result<()>;
    /// Detach QoS from `port` when given, then destroy every QoS and queue
    /// row tagged with `iface_id`
    async fn clear_qos(&self, port: Option<&str>, iface_id: &str) -> Result<()>;
    async fn set_bridge_hwaddr(&self, bridge: &str, mac: MacAddr) -> Result<()>;
    /// `netdev` for a userspace datapath, `system` or empty otherwise
    async fn datapath_type(&self, bridge: &str) -> Result<String>;
}

/// `Switch` backed by the `ovs-vsctl` tool
pub struct OvsVsctl {
    timeout_secs: u32,
}

impl OvsVsctl {
    pub fn new(timeout_secs: u32) -> Self {
        Self { timeout_secs }
    }

    async fn vsctl(&self, args: &[String]) -> Result<String> {
        let mut full = vec![format!("--timeout={}", self.timeout_secs)];
        full.extend_from_slice(args);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        command::run("ovs-vsctl", &refs).await
    }

    async fn find_column(&self, table: &str, column: &str, condition: &str) -> Result<Vec<String>> {
        let out = self
            .vsctl(&[
                "--data=bare".to_string(),
                "--no-heading".to_string(),
                format!("--columns={column}"),
                "find".to_string(),
                table.to_string(),
                condition.to_string(),
            ])
            .await?;
        Ok(bare_lines(&out))
    }
}

impl Default for OvsVsctl {
    fn default() -> Self {
        Self::new(30)
    }
}

fn bare_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn add_port_args(spec: &PortSpec) -> Vec<String> {
    let mut args = vec![
        "--may-exist".to_string(),
        "add-port".to_string(),
        spec.bridge.clone(),
        spec.name.clone(),
    ];

    let mut settings = Vec::new();
    if let Some(kind) = &spec.kind {
        settings.push(format!("type={kind}"));
    }
    for (key, value) in &spec.options {
        settings.push(format!("options:{key}={value}"));
    }
    for (key, value) in &spec.external_ids {
        settings.push(format!("external_ids:{key}=\"{value}\""));
    }

    if !settings.is_empty() {
        args.extend([
            "--".to_string(),
            "set".to_string(),
            "interface".to_string(),
            spec.name.clone(),
        ]);
        args.extend(settings);
    }
    args
}

fn qos_args(port: &str, iface_id: &str, qos: &QosSpec) -> Vec<String> {
    let tag = format!("external_ids:{IFACE_ID}=\"{iface_id}\"");
    let mut args = vec![
        "--".to_string(),
        "set".to_string(),
        "port".to_string(),
        port.to_string(),
        "qos=@qos".to_string(),
        "--".to_string(),
        "--id=@qos".to_string(),
        "create".to_string(),
        "qos".to_string(),
    ];

    match qos {
        QosSpec::Htb {
            max_rate_bps,
            priority,
        } => {
            args.extend([
                "type=linux-htb".to_string(),
                "queues:0=@queue".to_string(),
                tag.clone(),
                "--".to_string(),
                "--id=@queue".to_string(),
                "create".to_string(),
                "queue".to_string(),
                tag,
            ]);
            if let Some(rate) = max_rate_bps {
                args.push(format!("other_config:max-rate={rate}"));
            }
            if let Some(priority) = priority {
                args.push(format!("other_config:priority={priority}"));
            }
        }
        QosSpec::Netem {
            latency_us,
            loss_percent,
            limit,
        } => {
            args.extend(["type=linux-netem".to_string(), tag]);
            if let Some(latency) = latency_us {
                args.push(format!("other_config:latency={latency}"));
            }
            if let Some(loss) = loss_percent {
                args.push(format!("other_config:loss={loss}"));
            }
            if let Some(limit) = limit {
                args.push(format!("other_config:limit={limit}"));
            }
        }
    }
    args
}

fn json_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Parse `ovs-vsctl --format=json --data=json --columns=name,external_ids`
/// output into interface rows.
pub fn parse_interface_table(out: &str) -> Result<Vec<SwitchInterface>> {
    let table: Value = serde_json::from_str(out).context("Failed to parse ovs-vsctl output")?;
    let rows = table
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("ovs-vsctl output has no data array"))?;

    let mut interfaces = Vec::with_capacity(rows.len());
    for row in rows {
        let Some([name, ids]) = row.as_array().map(Vec::as_slice) else {
            continue;
        };
        let Some(name) = json_string(name) else {
            continue;
        };

        // ["map", [["key", "value"], ...]]
        let mut external_ids = BTreeMap::new();
        if let Some(pairs) = ids.get(1).and_then(Value::as_array) {
            for pair in pairs {
                if let (Some(k), Some(v)) = (
                    pair.get(0).and_then(json_string),
                    pair.get(1).and_then(json_string),
                ) {
                    external_ids.insert(k, v);
                }
            }
        }
        interfaces.push(SwitchInterface { name, external_ids });
    }
    Ok(interfaces)
}

#[async_trait]
impl Switch for OvsVsctl {
    #[tracing::instrument(name = "ovs.add_port", skip(self, spec), fields(bridge = %spec.bridge, port = %spec.name))]
    async fn add_port(&self, spec: &PortSpec) -> Result<()> {
        self.vsctl(&add_port_args(spec))
            .await
            .with_context(|| format!("Failed to add port {} to {}", spec.name, spec.bridge))?;
        info!("Port {} bound to bridge {}", spec.name, spec.bridge);
        Ok(())
    }

    async fn del_port(&self, bridge: Option<&str>, name: &str) -> Result<()> {
        let mut args = vec![
            "--if-exists".to_string(),
            "--with-iface".to_string(),
            "del-port".to_string(),
        ];
        if let Some(bridge) = bridge {
            args.push(bridge.to_string());
        }
        args.push(name.to_string());

        self.vsctl(&args)
            .await
            .with_context(|| format!("Failed to delete port {name}"))?;
        debug!("Port {} deleted", name);
        Ok(())
    }

    async fn interface_exists(&self, name: &str) -> Result<bool> {
        let names = self
            .find_column("interface", "name", &format!("name={name}"))
            .await?;
        Ok(!names.is_empty())
    }

    async fn interfaces_with_iface_id(&self, iface_id: &str) -> Result<Vec<String>> {
        self.find_column(
            "interface",
            "name",
            &format!("external_ids:{IFACE_ID}=\"{iface_id}\""),
        )
        .await
    }

    async fn internal_interfaces(&self) -> Result<Vec<SwitchInterface>> {
        let out = self
            .vsctl(&[
                "--format=json".to_string(),
                "--data=json".to_string(),
                "--columns=name,external_ids".to_string(),
                "find".to_string(),
                "interface".to_string(),
                "type=internal".to_string(),
            ])
            .await?;
        parse_interface_table(&out)
    }

    async fn set_ingress_policing(&self, iface: &str, rate_kbps: u64, burst_kb: u64) -> Result<()> {
        self.vsctl(&[
            "set".to_string(),
            "interface".to_string(),
            iface.to_string(),
            format!("ingress_policing_rate={rate_kbps}"),
            format!("ingress_policing_burst={burst_kb}"),
        ])
        .await
        .with_context(|| format!("Failed to set ingress policing on {iface}"))?;
        Ok(())
    }

    async fn set_qos(&self, port: &str, iface_id: &str, qos: &QosSpec) -> Result<()> {
        self.vsctl(&qos_args(port, iface_id, qos))
            .await
            .with_context(|| format!("Failed to set qos on {port}"))?;
        Ok(())
    }

    async fn clear_qos(&self, port: Option<&str>, iface_id: &str) -> Result<()> {
        if let Some(port) = port {
            self.vsctl(&[
                "clear".to_string(),
                "port".to_string(),
                port.to_string(),
                "qos".to_string(),
            ])
            .await
            .with_context(|| format!("Failed to clear qos of {port}"))?;
        }

        let tag = format!("external_ids:{IFACE_ID}=\"{iface_id}\"");
        for table in ["qos", "queue"] {
            for uuid in self.find_column(table, "_uuid", &tag).await? {
                self.vsctl(&["destroy".to_string(), table.to_string(), uuid.clone()])
                    .await
                    .with_context(|| format!("Failed to destroy {table} {uuid}"))?;
            }
        }
        Ok(())
    }

    async fn set_bridge_hwaddr(&self, bridge: &str, mac: MacAddr) -> Result<()> {
        self.vsctl(&[
            "set".to_string(),
            "bridge".to_string(),
            bridge.to_string(),
            format!("other_config:hwaddr=\"{mac}\""),
        ])
        .await
        .with_context(|| format!("Failed to set hwaddr of bridge {bridge}"))?;
        Ok(())
    }

    async fn datapath_type(&self, bridge: &str) -> Result<String> {
        let out = self
            .vsctl(&[
                "get".to_string(),
                "bridge".to_string(),
                bridge.to_string(),
                "datapath_type".to_string(),
            ])
            .await
            .with_context(|| format!("Failed to read datapath type of {bridge}"))?;
        Ok(out.trim().trim_matches('"').to_string())
    }
}
