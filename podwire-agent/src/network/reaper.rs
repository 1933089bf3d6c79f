//! Debounced removal of internal ports whose pod is gone.

use super::ovs::{Switch, SwitchInterface, IFACE_ID, POD_NETNS};
use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// An internal port is residual when it was created for a pod namespace
/// that no longer exists, or when it lost its logical port id.
pub fn is_residual(iface: &SwitchInterface, netns_exists: impl Fn(&Path) -> bool) -> bool {
    let Some(netns) = iface.external_ids.get(POD_NETNS) else {
        return false;
    };
    !iface.external_ids.contains_key(IFACE_ID) || !netns_exists(Path::new(netns))
}

/// Deletes a port only after it was residual on two consecutive sweeps
#[derive(Debug, Default)]
pub struct PortReaper {
    last_residual: HashSet<String>,
}

impl PortReaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names seen residual on the previous sweep
    pub fn pending(&self) -> &HashSet<String> {
        &self.last_residual
    }

    /// One sweep. Returns the ports deleted.
    #[tracing::instrument(name = "reaper.sweep", skip_all)]
    pub async fn sweep(&mut self, switch: &dyn Switch) -> Result<Vec<String>> {
        self.sweep_with(switch, |path| path.exists()).await
    }

    pub async fn sweep_with(
        &mut self,
        switch: &dyn Switch,
        netns_exists: impl Fn(&Path) -> bool,
    ) -> Result<Vec<String>> {
        let residual: HashSet<String> = switch
            .internal_interfaces()
            .await?
            .into_iter()
            .filter(|iface| is_residual(iface, &netns_exists))
            .map(|iface| iface.name)
            .collect();

        let mut deleted = Vec::new();
        for name in residual.intersection(&self.last_residual) {
            match switch.del_port(None, name).await {
                Ok(()) => {
                    info!("Reaped residual port {}", name);
                    deleted.push(name.clone());
                }
                Err(e) => warn!("Failed to reap residual port {}: {:#}", name, e),
            }
        }

        let deleted_set: HashSet<&String> = deleted.iter().collect();
        self.last_residual = residual
            .into_iter()
            .filter(|name| !deleted_set.contains(name))
            .collect();
        debug!("{} ports pending confirmation", self.last_residual.len());

        deleted.sort();
        Ok(deleted)
    }
}
