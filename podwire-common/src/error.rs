use thiserror::Error;

/// Malformed or inconsistent input handed to the engine by the controller.
///
/// These are never retried internally: the request has to change before the
/// same call can succeed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid address {value:?}: {reason}")]
    Address { value: String, reason: String },

    #[error("invalid gateway {0:?}")]
    Gateway(String),

    #[error("invalid mac address {0:?}")]
    Mac(String),

    #[error("{addresses} address families but {gateways} gateways")]
    GatewayCount { addresses: usize, gateways: usize },

    #[error("gateway {gateway} does not match the family of address {address}")]
    GatewayFamily { address: String, gateway: String },

    #[error("invalid interface name {name:?}: {reason}")]
    InterfaceName { name: String, reason: String },

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid route destination {0:?}")]
    RouteDestination(String),
}
