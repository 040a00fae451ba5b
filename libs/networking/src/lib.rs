//! Networking value types shared by the routing agent.
//!
//! This library provides:
//! - `IpInterface` (host address plus prefix, e.g. `10.1.2.3/24`)
//! - `IpNetwork` (masked network prefix, e.g. `10.1.2.0/24`)
//! - MTU validation
//! - Kernel routing constants (tables, scopes, protocols) and their names

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MTU value.
    #[error("invalid MTU: {value} (must be between {min} and {max})")]
    InvalidMtu { value: u32, min: u32, max: u32 },

    /// Unknown symbolic name (scope, table, protocol).
    #[error("unknown {kind} name: {name}")]
    UnknownName { kind: &'static str, name: String },
}

// ============================================================================
// Address family
// ============================================================================

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Inet,
            IpAddr::V6(_) => Family::Inet6,
        }
    }

    /// Maximum prefix length for the family.
    pub fn max_prefix_len(self) -> u8 {
        match self {
            Family::Inet => 32,
            Family::Inet6 => 128,
        }
    }

    /// The unspecified address of the family.
    pub fn unspecified(self) -> IpAddr {
        match self {
            Family::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

// ============================================================================
// Interface addresses and networks
// ============================================================================

/// An address assigned to an interface, with its prefix length.
///
/// The host bits are preserved: `10.1.2.3/24` stays `10.1.2.3/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpInterface {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpInterface {
    /// Create a new interface address.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        check_prefix_len(&addr, prefix_len)?;
        Ok(Self { addr, prefix_len })
    }

    /// The host address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The address family.
    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// The network this address belongs to.
    pub fn network(&self) -> IpNetwork {
        IpNetwork {
            addr: mask(self.addr, self.prefix_len),
            prefix_len: self.prefix_len,
        }
    }
}

impl fmt::Display for IpInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpInterface {
    type Err = NetworkError;

    /// Parse `addr/len`. A bare address gets a host-length prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix_len) = parse_cidr(s)?;
        Self::new(addr, prefix_len)
    }
}

impl TryFrom<String> for IpInterface {
    type Error = NetworkError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpInterface> for String {
    fn from(value: IpInterface) -> Self {
        value.to_string()
    }
}

/// A network prefix with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    /// Create a new network, masking away host bits.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        check_prefix_len(&addr, prefix_len)?;
        Ok(Self {
            addr: mask(addr, prefix_len),
            prefix_len,
        })
    }

    /// The default route network (`0.0.0.0/0` or `::/0`).
    pub fn default_for(family: Family) -> Self {
        Self {
            addr: family.unspecified(),
            prefix_len: 0,
        }
    }

    /// The network address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The address family.
    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    /// Whether this is a default route destination.
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Check whether an address lies within this network.
    pub fn contains(&self, addr: IpAddr) -> bool {
        Family::of(&addr) == self.family() && mask(addr, self.prefix_len) == self.addr
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpNetwork {
    type Err = NetworkError;

    /// Parse `addr/len`. Host bits are cleared.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix_len) = parse_cidr(s)?;
        Self::new(addr, prefix_len)
    }
}

impl TryFrom<String> for IpNetwork {
    type Error = NetworkError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpNetwork> for String {
    fn from(value: IpNetwork) -> Self {
        value.to_string()
    }
}

fn parse_cidr(s: &str) -> Result<(IpAddr, u8), NetworkError> {
    let (addr_str, prefix_str) = match s.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (s, None),
    };

    let addr =
        IpAddr::from_str(addr_str).map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

    let prefix_len = match prefix_str {
        Some(p) => p
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(s.to_string()))?,
        None => Family::of(&addr).max_prefix_len(),
    };

    Ok((addr, prefix_len))
}

fn check_prefix_len(addr: &IpAddr, prefix_len: u8) -> Result<(), NetworkError> {
    let max = Family::of(addr).max_prefix_len();
    if prefix_len > max {
        return Err(NetworkError::InvalidPrefix(format!(
            "prefix length {} exceeds {}",
            prefix_len, max
        )));
    }
    Ok(())
}

/// Mask an address to a prefix length.
pub fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(mask_ipv4(v4, prefix_len)),
        IpAddr::V6(v6) => IpAddr::V6(mask_ipv6(v6, prefix_len)),
    }
}

fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from((bits & mask).to_be_bytes())
}

fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// MTU Configuration
// ============================================================================

/// Minimum MTU accepted for an IPv4 link.
pub const MTU_MIN_IPV4: u32 = 68;

/// Minimum MTU for IPv6.
pub const MTU_MIN_IPV6: u32 = 1280;

/// Largest MTU the kernel accepts for most link types.
pub const MTU_MAX: u32 = 65535;

/// Default MTU for Ethernet.
pub const MTU_DEFAULT_ETHERNET: u32 = 1500;

/// Validate a link MTU value.
pub fn validate_mtu(mtu: u32) -> Result<u32, NetworkError> {
    if !(MTU_MIN_IPV4..=MTU_MAX).contains(&mtu) {
        return Err(NetworkError::InvalidMtu {
            value: mtu,
            min: MTU_MIN_IPV4,
            max: MTU_MAX,
        });
    }
    Ok(mtu)
}

// ============================================================================
// Routing tables, scopes and protocols
// ============================================================================

/// The `default` routing table.
pub const RT_TABLE_DEFAULT: u32 = 253;

/// The `main` routing table.
pub const RT_TABLE_MAIN: u32 = 254;

/// The `local` routing table.
pub const RT_TABLE_LOCAL: u32 = 255;

/// Tables that always exist in the kernel, with their names.
pub const DEFAULT_TABLES: [(u32, &str); 3] = [
    (RT_TABLE_DEFAULT, "default"),
    (RT_TABLE_MAIN, "main"),
    (RT_TABLE_LOCAL, "local"),
];

/// Route protocol tag marking objects owned by the agent.
pub const RTPROT_ROUTEKEEPER: u8 = 52;

/// Route protocol used by the kernel for automatically added routes.
pub const RTPROT_KERNEL: u8 = 2;

/// Resolve a table id from its symbolic or numeric name.
pub fn table_from_name(name: &str) -> Result<u32, NetworkError> {
    if let Some((id, _)) = DEFAULT_TABLES.iter().find(|(_, n)| *n == name) {
        return Ok(*id);
    }
    name.parse().map_err(|_| NetworkError::UnknownName {
        kind: "table",
        name: name.to_string(),
    })
}

/// Resolve a route protocol from its symbolic or numeric name.
pub fn protocol_from_name(name: &str) -> Result<u8, NetworkError> {
    let id = match name {
        "redirect" => 1,
        "kernel" => RTPROT_KERNEL,
        "boot" => 3,
        "static" => 4,
        "ra" => 9,
        "dhcp" => 16,
        other => {
            return other.parse().map_err(|_| NetworkError::UnknownName {
                kind: "protocol",
                name: name.to_string(),
            })
        }
    };
    Ok(id)
}

/// Route and address scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
}

impl Scope {
    /// Numeric kernel value.
    pub fn as_u8(self) -> u8 {
        match self {
            Scope::Universe => 0,
            Scope::Site => 200,
            Scope::Link => 253,
            Scope::Host => 254,
            Scope::Nowhere => 255,
        }
    }

    /// Name as used by iproute2.
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Universe => "global",
            Scope::Site => "site",
            Scope::Link => "link",
            Scope::Host => "host",
            Scope::Nowhere => "nowhere",
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Universe
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" | "universe" | "0" => Ok(Scope::Universe),
            "site" | "200" => Ok(Scope::Site),
            "link" | "253" => Ok(Scope::Link),
            "host" | "254" => Ok(Scope::Host),
            "nowhere" | "255" => Ok(Scope::Nowhere),
            _ => Err(NetworkError::UnknownName {
                kind: "scope",
                name: s.to_string(),
            }),
        }
    }
}

/// Normalise a hardware address for comparison (`AA:BB` becomes `aa:bb`).
pub fn normalize_lladdr(addr: &str) -> String {
    addr.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_interface_keeps_host_bits() {
        let iface: IpInterface = "10.1.2.3/24".parse().unwrap();
        assert_eq!(iface.addr(), "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(iface.prefix_len(), 24);
        assert_eq!(iface.network().to_string(), "10.1.2.0/24");
    }

    #[test]
    fn test_network_masks_host_bits() {
        let net: IpNetwork = "2001:db8::1/32".parse().unwrap();
        assert_eq!(net.to_string(), "2001:db8::/32");

        assert!(net.contains("2001:db8:ffff::1".parse().unwrap()));
        assert!(!net.contains("2001:db9::1".parse().unwrap()));
        assert!(!net.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_bare_address_gets_host_prefix() {
        let iface: IpInterface = "192.0.2.1".parse().unwrap();
        assert_eq!(iface.prefix_len(), 32);
        let iface: IpInterface = "fe80::1".parse().unwrap();
        assert_eq!(iface.prefix_len(), 128);
    }

    #[rstest]
    #[case("10.0.0.0/33")]
    #[case("::/129")]
    #[case("10.0.0/8")]
    #[case("10.0.0.0/x")]
    fn test_invalid_cidr(#[case] input: &str) {
        assert!(input.parse::<IpNetwork>().is_err());
    }

    #[test]
    fn test_default_network() {
        let net = IpNetwork::default_for(Family::Inet);
        assert!(net.is_default());
        assert_eq!(net.to_string(), "0.0.0.0/0");
        assert!(net.contains("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_serde_as_string() {
        let iface: IpInterface = "10.1.2.3/24".parse().unwrap();
        let json = serde_json::to_string(&iface).unwrap();
        assert_eq!(json, "\"10.1.2.3/24\"");
        let back: IpInterface = serde_json::from_str(&json).unwrap();
        assert_eq!(back, iface);

        assert!(serde_json::from_str::<IpNetwork>("\"nonsense\"").is_err());
    }

    #[test]
    fn test_mtu_validation() {
        assert!(validate_mtu(68).is_ok());
        assert!(validate_mtu(1500).is_ok());
        assert!(validate_mtu(9000).is_ok());

        assert!(validate_mtu(67).is_err());
        assert!(validate_mtu(65536).is_err());
    }

    #[rstest]
    #[case("main", 254)]
    #[case("local", 255)]
    #[case("default", 253)]
    #[case("100", 100)]
    fn test_table_names(#[case] name: &str, #[case] id: u32) {
        assert_eq!(table_from_name(name).unwrap(), id);
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(protocol_from_name("kernel").unwrap(), 2);
        assert_eq!(protocol_from_name("52").unwrap(), RTPROT_ROUTEKEEPER);
        assert!(protocol_from_name("bogus").is_err());
    }

    #[test]
    fn test_scope_names() {
        assert_eq!("link".parse::<Scope>().unwrap(), Scope::Link);
        assert_eq!("global".parse::<Scope>().unwrap(), Scope::Universe);
        assert_eq!(Scope::Host.as_u8(), 254);
    }

    proptest! {
        #[test]
        fn network_contains_its_interfaces(a: u32, len in 0u8..=32) {
            let addr = IpAddr::V4(Ipv4Addr::from(a));
            let iface = IpInterface::new(addr, len).unwrap();
            prop_assert!(iface.network().contains(addr));
        }
    }
}
