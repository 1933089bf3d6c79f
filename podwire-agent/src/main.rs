mod config;
mod daemon;
mod engine;
mod network;
mod telemetry;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{AgentConfig, UplinkMapping};
use daemon::Daemon;
use engine::AttachEngine;
use network::node::NodeNic;
use network::reaper::PortReaper;
use podwire_common::addressing::{parse_addrs, parse_networks};
use podwire_common::{AttachmentRequest, DetachRequest, GatewayCheckMode, MacAddr, Route};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "podwire-agent")]
#[command(version)]
#[command(about = "Node-local pod network attach agent", long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Flags taking precedence over `PODWIRE_*` variables
#[derive(Args)]
struct ConfigArgs {
    /// Integration bridge
    #[arg(long, global = true)]
    bridge: Option<String>,

    /// Gateway check override: disabled, ping or arping
    #[arg(long, global = true, value_parser = config::parse_check_mode)]
    gateway_check: Option<GatewayCheckMode>,

    #[arg(long, global = true)]
    sysfs_root: Option<PathBuf>,

    #[arg(long, global = true)]
    vhost_dir: Option<PathBuf>,

    /// Export spans over OTLP
    #[arg(long, global = true)]
    otlp: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run(RunArgs),

    /// Attach one pod interface
    Attach {
        /// Attachment request as JSON
        #[arg(long)]
        request: PathBuf,
    },

    /// Detach one pod interface
    Detach {
        /// Detach request as JSON
        #[arg(long)]
        request: PathBuf,
    },

    /// Move an uplink onto or off a bridge
    Uplink {
        #[command(subcommand)]
        command: UplinkCommand,
    },

    /// List residual port candidates without deleting them. Deletion needs
    /// a port to be residual on two sweeps of the running agent.
    Reap,
}

#[derive(Subcommand)]
enum UplinkCommand {
    Attach {
        #[arg(long)]
        nic: String,
        #[arg(long)]
        bridge: String,
    },
    Detach {
        #[arg(long)]
        nic: String,
        #[arg(long)]
        bridge: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Desired uplink, `provider=nic:bridge`, repeatable
    #[arg(long = "uplink")]
    uplinks: Vec<UplinkMapping>,

    /// Node port name
    #[arg(long)]
    node_nic: Option<String>,

    /// Node port addresses, comma separated `address/prefix`
    #[arg(long, requires_all = ["node_gateway", "node_mac", "node_iface_id"])]
    node_ip: Option<String>,

    /// Node gateways in the same family order as `--node-ip`
    #[arg(long)]
    node_gateway: Option<String>,

    #[arg(long)]
    node_mac: Option<MacAddr>,

    /// Logical port id of the node port
    #[arg(long)]
    node_iface_id: Option<String>,

    #[arg(long, default_value = "0")]
    node_mtu: i32,

    /// Cluster range reached through the node port, repeatable
    #[arg(long = "node-route")]
    node_routes: Vec<String>,
}

impl ConfigArgs {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(bridge) = &self.bridge {
            config.bridge.clone_from(bridge);
        }
        if let Some(mode) = self.gateway_check {
            config.gateway_check = mode;
        }
        if let Some(root) = &self.sysfs_root {
            config.sysfs_root.clone_from(root);
        }
        if let Some(dir) = &self.vhost_dir {
            config.vhost_dir.clone_from(dir);
        }
        if self.otlp {
            config.otlp = true;
        }
    }
}

impl RunArgs {
    /// Node port identity, `None` when no node address was given
    fn node_nic(&self, config: &AgentConfig) -> Result<Option<NodeNic>> {
        let (Some(ip), Some(gateway), Some(mac), Some(iface_id)) = (
            &self.node_ip,
            &self.node_gateway,
            self.node_mac,
            &self.node_iface_id,
        ) else {
            return Ok(None);
        };
        let addresses = parse_networks(ip)?;
        let gateways = parse_addrs(gateway)?;

        let mut routes = Vec::new();
        for destination in &self.node_routes {
            let network: ipnetwork::IpNetwork = destination
                .parse()
                .with_context(|| format!("Invalid node route {destination:?}"))?;
            let Some(via) = gateways.iter().find(|g| g.is_ipv4() == network.is_ipv4()) else {
                bail!("No node gateway for route {}", destination);
            };
            routes.push(Route {
                destination: destination.clone(),
                gateway: Some(via.to_string()),
            });
        }

        Ok(Some(NodeNic {
            name: self.node_nic.clone().unwrap_or_else(|| config.node_nic.clone()),
            iface_id: iface_id.clone(),
            addresses,
            gateways,
            mac,
            mtu: self.node_mtu,
            routes,
        }))
    }
}

fn read_request<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AgentConfig::from_env().context("Invalid PODWIRE_* configuration")?;
    cli.overrides.apply(&mut config);
    config.validate()?;

    let tracer_provider =
        telemetry::init_telemetry(config.otlp).context("Failed to initialize telemetry")?;

    let result = execute(cli.command, config).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }

    // Flush remaining spans before exit
    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            error!("Failed to shut down tracer provider: {}", e);
        }
    }
    result
}

async fn execute(command: Commands, config: AgentConfig) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("podwire-agent must run as root to manage links and namespaces");
    }

    match command {
        Commands::Run(args) => {
            let node_nic = args.node_nic(&config)?;
            let engine = Arc::new(AttachEngine::system(config)?);

            if let Some(nic) = &node_nic {
                engine
                    .node_setup(nic)
                    .await
                    .context("Failed to set up node nic")?;
            }

            // The handle is the entry point for a controller front end (a CNI
            // or RPC server) embedding the agent; `run` alone only keeps the
            // timers going.
            let (daemon, _handle) = Daemon::new(engine, node_nic, args.uplinks);
            daemon.run(shutdown_signal()).await?;
            info!("Agent stopped");
        }
        Commands::Attach { request } => {
            let request: AttachmentRequest = read_request(&request)?;
            let engine = AttachEngine::system(config)?;
            let names = engine.attach(&request).await?;
            println!(
                "{}",
                serde_json::json!({ "host": names.host, "container": names.container })
            );
        }
        Commands::Detach { request } => {
            let request: DetachRequest = read_request(&request)?;
            AttachEngine::system(config)?.detach(&request).await?;
        }
        Commands::Uplink { command } => {
            let engine = AttachEngine::system(config)?;
            match command {
                UplinkCommand::Attach { nic, bridge } => {
                    let mtu = engine.uplink_attach(&nic, &bridge).await?;
                    println!("{}", serde_json::json!({ "mtu": mtu }));
                }
                UplinkCommand::Detach { nic, bridge } => {
                    engine.uplink_detach(&nic, &bridge).await?;
                }
            }
        }
        Commands::Reap => {
            let engine = AttachEngine::system(config)?;
            let mut reaper = PortReaper::new();
            engine.reap(&mut reaper).await?;
            let mut pending: Vec<&String> = reaper.pending().iter().collect();
            pending.sort();
            println!("{}", serde_json::json!({ "residual": pending }));
        }
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received SIGINT, shutting down"),
                Err(e) => error!("Failed to listen for SIGINT: {}", e),
            }
        }
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
}
