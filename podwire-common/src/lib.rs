pub mod addressing;
pub mod error;
pub mod naming;
pub mod request;

// Re-export commonly used types
pub use addressing::{MacAddr, Protocol};
pub use error::ConfigError;
pub use naming::{logical_port_id, nic_names, NicNames};
pub use request::{
    AttachmentRequest, DetachRequest, DeviceModel, DnsHints, GatewayCheckMode, Route, Shaping,
};
