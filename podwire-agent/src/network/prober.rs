use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use podwire_common::{GatewayCheckMode, MacAddr};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Gateway did not answer within the probe budget
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("gateway {gateway} did not answer {attempts} {method} probes from {source_addr}")]
    Unreachable {
        gateway: IpAddr,
        source_addr: IpAddr,
        method: ProbeMethod,
        attempts: u32,
    },
    #[error("invalid probe transition from {from} to {to}")]
    InvalidTransition { from: ProbeState, to: ProbeState },
}

/// Single-shot reachability checks. Production runs `arping`/`ping`
/// processes, which inherit the caller's network namespace.
#[async_trait]
pub trait GatewayProbe: Send + Sync {
    /// One address-resolution request, the gateway's MAC on reply
    async fn arping(&self, nic: &str, source: Ipv4Addr, gateway: Ipv4Addr) -> Result<Option<MacAddr>>;
    /// One echo request, `true` on reply
    async fn ping(&self, source: IpAddr, gateway: IpAddr) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Arping,
    Ping,
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeMethod::Arping => write!(f, "arping"),
            ProbeMethod::Ping => write!(f, "ping"),
        }
    }
}

/// States of one bounded probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Sending attempt n (1-based)
    Attempt(u32),
    /// Attempt n went unanswered, sleeping before the next one
    Waiting(u32),
    Succeeded,
    Exhausted,
}

impl std::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeState::Attempt(n) => write!(f, "Attempt {n}"),
            ProbeState::Waiting(n) => write!(f, "Waiting after {n}"),
            ProbeState::Succeeded => write!(f, "Succeeded"),
            ProbeState::Exhausted => write!(f, "Exhausted"),
        }
    }
}

/// Tracks one probe run and rejects transitions that would skip the bound
#[derive(Debug)]
pub struct ProbeCycle {
    state: ProbeState,
    max_attempts: u32,
}

impl ProbeCycle {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ProbeState::Attempt(1),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn current_state(&self) -> ProbeState {
        self.state
    }

    pub fn transition_to(&mut self, next: ProbeState) -> Result<(), ProbeError> {
        let is_valid = match (self.state, next) {
            (ProbeState::Attempt(_), ProbeState::Succeeded) => true,
            (ProbeState::Attempt(n), ProbeState::Waiting(m)) => n == m && n < self.max_attempts,
            (ProbeState::Attempt(n), ProbeState::Exhausted) => n >= self.max_attempts,
            (ProbeState::Waiting(n), ProbeState::Attempt(m)) => m == n + 1,
            _ => false,
        };

        if !is_valid {
            return Err(ProbeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Next state after the current attempt got (or did not get) a reply
    pub fn after_attempt(&mut self, answered: bool) -> Result<ProbeState, ProbeError> {
        let ProbeState::Attempt(n) = self.state else {
            return Err(ProbeError::InvalidTransition {
                from: self.state,
                to: ProbeState::Succeeded,
            });
        };
        let next = if answered {
            ProbeState::Succeeded
        } else if n >= self.max_attempts {
            ProbeState::Exhausted
        } else {
            ProbeState::Waiting(n)
        };
        self.transition_to(next)?;
        Ok(next)
    }
}

/// Retry bound and spacing of one probe method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl ProbePolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

/// Runs bounded gateway probes with a `GatewayProbe`
pub struct Prober<'a> {
    probe: &'a dyn GatewayProbe,
    arping: ProbePolicy,
    ping: ProbePolicy,
}

impl<'a> Prober<'a> {
    pub fn new(probe: &'a dyn GatewayProbe, arping: ProbePolicy, ping: ProbePolicy) -> Self {
        Self {
            probe,
            arping,
            ping,
        }
    }

    /// Probe every (address, gateway) pair; the first unreachable gateway
    /// fails the whole check.
    pub async fn check(
        &self,
        mode: GatewayCheckMode,
        nic: &str,
        pairs: &[(IpNetwork, IpAddr)],
    ) -> Result<(), ProbeError> {
        if mode == GatewayCheckMode::Disabled {
            return Ok(());
        }
        for (address, gateway) in pairs {
            let method = match (mode, address.ip(), gateway) {
                (GatewayCheckMode::Arping, IpAddr::V4(_), IpAddr::V4(_)) => ProbeMethod::Arping,
                _ => ProbeMethod::Ping,
            };
            self.probe_gateway(method, nic, address.ip(), *gateway)
                .await?;
        }
        Ok(())
    }

    #[tracing::instrument(name = "probe.gateway", skip(self, method), fields(method = %method))]
    pub async fn probe_gateway(
        &self,
        method: ProbeMethod,
        nic: &str,
        source: IpAddr,
        gateway: IpAddr,
    ) -> Result<(), ProbeError> {
        let policy = match method {
            ProbeMethod::Arping => self.arping,
            ProbeMethod::Ping => self.ping,
        };
        let mut cycle = ProbeCycle::new(policy.max_attempts);

        loop {
            match cycle.current_state() {
                ProbeState::Attempt(n) => {
                    let answered = self.attempt(method, nic, source, gateway).await;
                    if !answered {
                        debug!("Gateway {} unanswered, attempt {}", gateway, n);
                    }
                    cycle.after_attempt(answered)?;
                }
                ProbeState::Waiting(n) => {
                    tokio::time::sleep(policy.interval).await;
                    cycle.transition_to(ProbeState::Attempt(n + 1))?;
                }
                ProbeState::Succeeded => {
                    debug!("Gateway {} reachable from {}", gateway, source);
                    return Ok(());
                }
                ProbeState::Exhausted => {
                    warn!("Gateway {} unreachable from {}", gateway, source);
                    return Err(ProbeError::Unreachable {
                        gateway,
                        source_addr: source,
                        method,
                        attempts: policy.max_attempts.max(1),
                    });
                }
            }
        }
    }

    async fn attempt(&self, method: ProbeMethod, nic: &str, source: IpAddr, gateway: IpAddr) -> bool {
        let result = match (method, source, gateway) {
            (ProbeMethod::Arping, IpAddr::V4(src), IpAddr::V4(gw)) => self
                .probe
                .arping(nic, src, gw)
                .await
                .map(|mac| {
                    if let Some(mac) = mac {
                        debug!("Gateway {} resolved to {}", gw, mac);
                    }
                    mac.is_some()
                }),
            _ => self.probe.ping(source, gateway).await,
        };
        result.unwrap_or_else(|e| {
            warn!("Probe of {} failed to run: {:#}", gateway, e);
            false
        })
    }
}

/// `GatewayProbe` that shells out to `arping` and `ping`
pub struct CommandProbe;

fn parse_arping_reply(out: &str) -> Option<MacAddr> {
    // Unicast reply from 10.0.0.1 [0A:58:0A:00:00:01]  0.712ms
    out.lines()
        .filter(|l| l.contains("reply from"))
        .find_map(|l| {
            let start = l.find('[')? + 1;
            let end = l[start..].find(']')? + start;
            l[start..end].parse().ok()
        })
}

#[async_trait]
impl GatewayProbe for CommandProbe {
    async fn arping(&self, nic: &str, source: Ipv4Addr, gateway: Ipv4Addr) -> Result<Option<MacAddr>> {
        let output = Command::new("arping")
            .args(["-c", "1", "-w", "1", "-I", nic, "-s"])
            .arg(source.to_string())
            .arg(gateway.to_string())
            .output()
            .await
            .context("Failed to execute arping")?;

        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_arping_reply(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn ping(&self, source: IpAddr, gateway: IpAddr) -> Result<bool> {
        let family = if gateway.is_ipv6() { "-6" } else { "-4" };
        let output = Command::new("ping")
            .args([family, "-c", "1", "-W", "1", "-I"])
            .arg(source.to_string())
            .arg(gateway.to_string())
            .output()
            .await
            .context("Failed to execute ping")?;
        Ok(output.status.success())
    }
}
