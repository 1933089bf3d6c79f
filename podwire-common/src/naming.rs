//! Deterministic device names for a container's network endpoints.
//!
//! Teardown recomputes the same names from the container id and interface
//! name, so nothing about the chosen names has to be stored.

use crate::error::ConfigError;

/// Interface that receives the short `<id>_h` / `<id>_c` names
pub const PRIMARY_INTERFACE: &str = "eth0";

/// Provider whose logical ports omit the provider suffix
pub const DEFAULT_PROVIDER: &str = "ovn";

/// Longest usable Linux interface name (IFNAMSIZ minus the terminator)
pub const MAX_IFNAME_LEN: usize = 15;

/// Characters of the container id used for the primary interface
const ID_PREFIX_LEN: usize = 12;

/// Host-side and container-side names of one endpoint pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NicNames {
    pub host: String,
    pub container: String,
}

/// Derive the endpoint names for `ifname` of the given container.
///
/// The primary interface uses the first 12 characters of the id. Any other
/// interface gives up one id character per character of its own name, so
/// the result always fits in [`MAX_IFNAME_LEN`].
pub fn nic_names(container_id: &str, ifname: &str) -> Result<NicNames, ConfigError> {
    if container_id.is_empty() {
        return Err(ConfigError::Missing("container id"));
    }
    validate_ifname(ifname)?;

    if ifname == PRIMARY_INTERFACE {
        let id = truncate(container_id, ID_PREFIX_LEN);
        return Ok(NicNames {
            host: format!("{id}_h"),
            container: format!("{id}_c"),
        });
    }

    let ifname_len = ifname.chars().count();
    if ifname_len >= ID_PREFIX_LEN {
        return Err(ConfigError::InterfaceName {
            name: ifname.to_string(),
            reason: format!("secondary interface names must be shorter than {ID_PREFIX_LEN} characters"),
        });
    }

    let id = truncate(container_id, ID_PREFIX_LEN - ifname_len);
    Ok(NicNames {
        host: format!("{id}_{ifname}_h"),
        container: format!("{id}_{ifname}_c"),
    })
}

/// Logical-port id for a pod on a provider network.
pub fn logical_port_id(pod_name: &str, pod_namespace: &str, provider: &str) -> String {
    if provider.is_empty() || provider == DEFAULT_PROVIDER {
        format!("{pod_name}.{pod_namespace}")
    } else {
        format!("{pod_name}.{pod_namespace}.{provider}")
    }
}

/// Reject names the kernel would refuse.
pub fn validate_ifname(name: &str) -> Result<(), ConfigError> {
    let reason = if name.is_empty() {
        Some("empty".to_string())
    } else if name.len() > MAX_IFNAME_LEN {
        Some(format!("longer than {MAX_IFNAME_LEN} bytes"))
    } else if name == "." || name == ".." {
        Some("reserved name".to_string())
    } else if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        Some("contains '/', ':' or whitespace".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ConfigError::InterfaceName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn truncate(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((end, _)) => &value[..end],
        None => value,
    }
}
