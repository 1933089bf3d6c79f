//! Port bandwidth limiting and delay/loss emulation.

use super::ovs::{QosSpec, Switch};
use anyhow::{Context, Result};
use podwire_common::Shaping;
use tracing::{debug, info};

/// Policing burst as a share of the rate, in percent
const BURST_PERCENT: u64 = 80;

/// Replace any shaping on `port` with `shaping`.
///
/// Rates are from the pod's point of view. Pod egress arrives at the switch
/// as interface ingress and is policed there; pod ingress leaves through the
/// port's transmit queue and is capped by HTB. Emulation parameters take
/// precedence over the HTB ceiling since a port holds a single QoS row.
#[tracing::instrument(name = "shaper.apply", skip(switch, shaping), fields(port = %port, iface_id = %iface_id))]
pub async fn apply(switch: &dyn Switch, port: &str, iface_id: &str, shaping: &Shaping) -> Result<()> {
    clear(switch, port, iface_id).await?;

    if let Some(mbps) = shaping.egress_mbps.filter(|v| *v > 0) {
        let rate_kbps = mbps * 1000;
        switch
            .set_ingress_policing(port, rate_kbps, rate_kbps * BURST_PERCENT / 100)
            .await
            .with_context(|| format!("Failed to police {port}"))?;
        info!("Pod egress on {} policed at {} Mbit/s", port, mbps);
    }

    let qos = if shaping.has_emulation() {
        Some(QosSpec::Netem {
            latency_us: shaping.latency_ms.filter(|v| *v > 0).map(|ms| u64::from(ms) * 1000),
            loss_percent: shaping.loss_percent.filter(|v| *v > 0.0),
            limit: shaping.limit_packets.filter(|v| *v > 0),
        })
    } else if shaping.has_rate_limit() {
        Some(QosSpec::Htb {
            max_rate_bps: shaping.ingress_mbps.filter(|v| *v > 0).map(|m| m * 1_000_000),
            priority: shaping.priority,
        })
    } else {
        None
    };

    if let Some(qos) = qos {
        switch
            .set_qos(port, iface_id, &qos)
            .await
            .with_context(|| format!("Failed to set qos of {port}"))?;
        info!("QoS {:?} applied to {}", qos, port);
    }
    Ok(())
}

/// Remove policing and QoS. A port that no longer exists counts as clear,
/// tagged QoS rows are destroyed either way.
pub async fn clear(switch: &dyn Switch, port: &str, iface_id: &str) -> Result<()> {
    let exists = switch.interface_exists(port).await?;
    if exists {
        switch.set_ingress_policing(port, 0, 0).await?;
    } else {
        debug!("Port {} gone, clearing tagged QoS only", port);
    }
    switch
        .clear_qos(exists.then_some(port), iface_id)
        .await
        .with_context(|| format!("Failed to clear qos of {iface_id}"))
}
