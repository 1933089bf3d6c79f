use crate::error::ConfigError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A 48-bit Ethernet hardware address
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// All-zero address, used to release a virtual function's MAC
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl FromStr for MacAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Mac(s.to_string());
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<&[u8]> for MacAddr {
    type Error = ConfigError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let octets: [u8; 6] = bytes
            .try_into()
            .map_err(|_| ConfigError::Mac(format!("{bytes:02x?}")))?;
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Address families present in a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    IPv4,
    IPv6,
    Dual,
}

impl Protocol {
    /// Classify a set of addresses. Returns `None` for an empty set.
    pub fn of<'a>(addrs: impl IntoIterator<Item = &'a IpAddr>) -> Option<Self> {
        let (mut v4, mut v6) = (false, false);
        for addr in addrs {
            match addr {
                IpAddr::V4(_) => v4 = true,
                IpAddr::V6(_) => v6 = true,
            }
        }
        match (v4, v6) {
            (true, true) => Some(Self::Dual),
            (true, false) => Some(Self::IPv4),
            (false, true) => Some(Self::IPv6),
            (false, false) => None,
        }
    }

    pub fn has_ipv6(self) -> bool {
        matches!(self, Self::IPv6 | Self::Dual)
    }
}

/// Split a comma-joined list, dropping empty items and surrounding whitespace.
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a comma-joined list of `address/prefix` values.
///
/// Host bits are kept, `10.0.0.5/24` stays `10.0.0.5/24`.
pub fn parse_networks(value: &str) -> Result<Vec<IpNetwork>, ConfigError> {
    split_list(value)
        .map(|item| {
            IpNetwork::from_str(item).map_err(|e| ConfigError::Address {
                value: item.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Parse a comma-joined list of bare addresses.
pub fn parse_addrs(value: &str) -> Result<Vec<IpAddr>, ConfigError> {
    split_list(value)
        .map(|item| {
            item.parse::<IpAddr>()
                .map_err(|_| ConfigError::Gateway(item.to_string()))
        })
        .collect()
}

/// True for 169.254.0.0/16 and fe80::/10
pub fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Pair every address with the gateway of the same position, checking that
/// the counts and families agree.
pub fn pair_gateways(
    addrs: &[IpNetwork],
    gateways: &[IpAddr],
) -> Result<Vec<(IpNetwork, IpAddr)>, ConfigError> {
    if addrs.len() != gateways.len() {
        return Err(ConfigError::GatewayCount {
            addresses: addrs.len(),
            gateways: gateways.len(),
        });
    }

    addrs
        .iter()
        .zip(gateways)
        .map(|(addr, gw)| {
            if addr.is_ipv4() == gw.is_ipv4() {
                Ok((*addr, *gw))
            } else {
                Err(ConfigError::GatewayFamily {
                    address: addr.to_string(),
                    gateway: gw.to_string(),
                })
            }
        })
        .collect()
}
