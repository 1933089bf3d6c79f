//! Long-running agent: serves requests from an in-process channel and runs
//! the maintenance loops (residual port sweep, node self-check, uplink
//! resync) on independent timers.

use crate::config::UplinkMapping;
use crate::engine::AttachEngine;
use crate::network::node::NodeNic;
use crate::network::reaper::PortReaper;
use anyhow::{anyhow, Result};
use podwire_common::{AttachmentRequest, DetachRequest, NicNames, Shaping};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub enum Request {
    Attach {
        request: AttachmentRequest,
        resp: oneshot::Sender<Result<NicNames>>,
    },
    Detach {
        request: DetachRequest,
        resp: oneshot::Sender<Result<()>>,
    },
    UpdateShaping {
        iface_id: String,
        shaping: Shaping,
        resp: oneshot::Sender<Result<()>>,
    },
    UplinkAttach {
        nic: String,
        bridge: String,
        resp: oneshot::Sender<Result<Option<u32>>>,
    },
    UplinkDetach {
        nic: String,
        bridge: String,
        resp: oneshot::Sender<Result<()>>,
    },
    /// Replace the desired uplink mappings
    SetUplinks {
        mappings: Vec<UplinkMapping>,
        resp: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the daemon's request channel
#[derive(Clone)]
pub struct DaemonHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl DaemonHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .map_err(|_| anyhow!("Agent is shutting down"))?;
        rx.await.map_err(|_| anyhow!("Agent dropped the request"))
    }

    pub async fn attach(&self, request: AttachmentRequest) -> Result<NicNames> {
        self.call(|resp| Request::Attach { request, resp }).await?
    }

    pub async fn detach(&self, request: DetachRequest) -> Result<()> {
        self.call(|resp| Request::Detach { request, resp }).await?
    }

    pub async fn update_shaping(&self, iface_id: String, shaping: Shaping) -> Result<()> {
        self.call(|resp| Request::UpdateShaping {
            iface_id,
            shaping,
            resp,
        })
        .await?
    }

    pub async fn uplink_attach(&self, nic: String, bridge: String) -> Result<Option<u32>> {
        self.call(|resp| Request::UplinkAttach { nic, bridge, resp })
            .await?
    }

    pub async fn uplink_detach(&self, nic: String, bridge: String) -> Result<()> {
        self.call(|resp| Request::UplinkDetach { nic, bridge, resp })
            .await?
    }

    pub async fn set_uplinks(&self, mappings: Vec<UplinkMapping>) -> Result<()> {
        self.call(|resp| Request::SetUplinks { mappings, resp })
            .await
    }
}

pub struct Daemon {
    engine: Arc<AttachEngine>,
    node_nic: Option<NodeNic>,
    uplinks: Arc<Mutex<Vec<UplinkMapping>>>,
    rx: mpsc::UnboundedReceiver<Request>,
}

impl Daemon {
    /// `node_nic` enables the self-check loop; the nic is expected to be set
    /// up already.
    pub fn new(
        engine: Arc<AttachEngine>,
        node_nic: Option<NodeNic>,
        uplinks: Vec<UplinkMapping>,
    ) -> (Self, DaemonHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let daemon = Self {
            engine,
            node_nic,
            uplinks: Arc::new(Mutex::new(uplinks)),
            rx,
        };
        (daemon, DaemonHandle { tx })
    }

    /// Serve until `shutdown` resolves. Returns an error when the node
    /// self-check fails, the process is expected to exit on it.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let config = self.engine.config().clone();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(1);
        let mut loops = JoinSet::new();

        loops.spawn(reap_loop(self.engine.clone(), config.reap_interval));
        loops.spawn(uplink_loop(
            self.engine.clone(),
            self.uplinks.clone(),
            config.uplink_resync_interval,
        ));
        if let Some(nic) = self.node_nic.take() {
            loops.spawn(node_check_loop(
                self.engine.clone(),
                nic,
                config.node_check_interval,
                fatal_tx,
            ));
        }
        info!("Agent running on bridge {}", config.bridge);

        tokio::pin!(shutdown);
        let mut accepting = true;
        let result = loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutting down");
                    break Ok(());
                }
                Some(err) = fatal_rx.recv() => {
                    break Err(err.context("Node self-check failed"));
                }
                msg = self.rx.recv(), if accepting => match msg {
                    Some(request) => self.dispatch(request),
                    None => {
                        debug!("All request handles dropped");
                        accepting = false;
                    }
                },
            }
        };

        loops.shutdown().await;
        result
    }

    fn dispatch(&self, request: Request) {
        let engine = self.engine.clone();
        match request {
            Request::Attach { request, resp } => {
                tokio::spawn(async move {
                    let _ = resp.send(engine.attach(&request).await);
                });
            }
            Request::Detach { request, resp } => {
                tokio::spawn(async move {
                    let _ = resp.send(engine.detach(&request).await);
                });
            }
            Request::UpdateShaping {
                iface_id,
                shaping,
                resp,
            } => {
                tokio::spawn(async move {
                    let _ = resp.send(engine.update_shaping(&iface_id, &shaping).await);
                });
            }
            Request::UplinkAttach { nic, bridge, resp } => {
                tokio::spawn(async move {
                    let _ = resp.send(engine.uplink_attach(&nic, &bridge).await);
                });
            }
            Request::UplinkDetach { nic, bridge, resp } => {
                tokio::spawn(async move {
                    let _ = resp.send(engine.uplink_detach(&nic, &bridge).await);
                });
            }
            Request::SetUplinks { mappings, resp } => {
                let uplinks = self.uplinks.clone();
                tokio::spawn(async move {
                    set_uplinks(&engine, &uplinks, mappings).await;
                    let _ = resp.send(());
                });
            }
        }
    }
}

/// Store the new desired mappings, detach the ones that were dropped and
/// attach the rest
async fn set_uplinks(
    engine: &AttachEngine,
    uplinks: &Mutex<Vec<UplinkMapping>>,
    mappings: Vec<UplinkMapping>,
) {
    let removed: Vec<UplinkMapping> = {
        let mut desired = uplinks.lock().await;
        let old = std::mem::replace(&mut *desired, mappings.clone());
        old.into_iter().filter(|m| !mappings.contains(m)).collect()
    };
    for mapping in &removed {
        match engine.uplink_detach(&mapping.nic, &mapping.bridge).await {
            Ok(()) => info!("Uplink {} of {} detached", mapping.nic, mapping.provider),
            Err(e) => warn!("Failed to detach uplink {}: {:#}", mapping.nic, e),
        }
    }
    resync_uplinks(engine, &mappings).await;
}

async fn resync_uplinks(engine: &AttachEngine, mappings: &[UplinkMapping]) {
    for mapping in mappings {
        match engine.uplink_attach(&mapping.nic, &mapping.bridge).await {
            Ok(Some(mtu)) => debug!("Uplink {} on {} mtu {}", mapping.nic, mapping.bridge, mtu),
            Ok(None) => {}
            Err(e) => warn!(
                "Failed to attach uplink {} to {}: {:#}",
                mapping.nic, mapping.bridge, e
            ),
        }
    }
}

async fn reap_loop(engine: Arc<AttachEngine>, period: Duration) {
    let mut reaper = PortReaper::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match engine.reap(&mut reaper).await {
            Ok(deleted) if !deleted.is_empty() => {
                info!("Reaped {} residual ports", deleted.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Residual port sweep failed: {:#}", e),
        }
    }
}

async fn uplink_loop(
    engine: Arc<AttachEngine>,
    uplinks: Arc<Mutex<Vec<UplinkMapping>>>,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let mappings = uplinks.lock().await.clone();
        resync_uplinks(&engine, &mappings).await;
    }
}

async fn node_check_loop(
    engine: Arc<AttachEngine>,
    nic: NodeNic,
    period: Duration,
    fatal: mpsc::Sender<anyhow::Error>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = engine.node_check(&nic).await {
            error!("Node self-check of {} failed: {:#}", nic.name, e);
            let _ = fatal.send(e).await;
            return;
        }
    }
}
