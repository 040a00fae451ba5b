//! Payload definitions for all agent events.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use routekeeper_networking::{IpInterface, IpNetwork, Scope, RT_TABLE_MAIN};
use serde::{Deserialize, Serialize};

// =============================================================================
// Kernel Links
// =============================================================================

/// Link attributes as reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAttributes {
    /// Administrative state (IFF_UP).
    #[serde(default)]
    pub up: bool,

    /// ARP disabled (IFF_NOARP).
    #[serde(default)]
    pub noarp: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txqueuelen: Option<u32>,

    /// Hardware address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Hardware broadcast address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,

    /// Index of the master device (bridge, bond).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<u32>,

    /// Index of the parent device (VLAN trunk, tunnel underlay).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<u32>,

    /// Operational state (`UP`, `DOWN`, `LOWERLAYERDOWN`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operstate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<bool>,

    /// IPv6 address generation mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addrgenmode: Option<String>,

    /// IPv6 interface identifier token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Hardware type (`ether`, `loopback`, `sit`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
}

/// An interface appeared or changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAdd {
    pub ifindex: u32,
    pub ifname: String,

    /// Link kind for virtual devices (`bridge`, `vlan`, `vxlan`, `sit`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub attributes: LinkAttributes,
}

/// An interface was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRemove {
    pub ifindex: u32,
    pub ifname: String,
}

// =============================================================================
// Kernel Addresses
// =============================================================================

/// An address was added to an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAdd {
    pub ifindex: u32,
    pub ifname: String,
    pub address: IpInterface,

    /// Peer address of a point-to-point link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<IpAddr>,

    #[serde(default)]
    pub scope: Scope,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Protocol tag of the address, when the kernel reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u8>,
}

/// An address was removed from an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRemove {
    pub ifindex: u32,
    pub ifname: String,
    pub address: IpInterface,
}

// =============================================================================
// Kernel Routes
// =============================================================================

/// One nexthop of a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nexthop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifindex: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ifname: Option<String>,
}

/// A route was added or replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdd {
    pub table: u32,
    pub destination: IpNetwork,
    pub protocol: u8,

    #[serde(default)]
    pub scope: Scope,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefsrc: Option<IpAddr>,

    #[serde(default)]
    pub nexthops: Vec<Nexthop>,
}

/// A route was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRemove {
    pub table: u32,
    pub destination: IpNetwork,
}

// =============================================================================
// Kernel Neighbours
// =============================================================================

/// A neighbour table entry was added, changed or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighbourEntry {
    pub ifindex: u32,
    pub ifname: String,
    pub address: IpAddr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lladdr: Option<String>,

    #[serde(default)]
    pub state: Vec<String>,
}

// =============================================================================
// DHCPv4 Leases
// =============================================================================

/// A classless static route handed out with a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRoute {
    pub destination: IpNetwork,
    pub gateway: IpAddr,
}

/// A DHCPv4 lease bound to an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub interface: String,
    pub address: IpInterface,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    /// Table that receives the lease's routes.
    #[serde(default = "default_lease_table")]
    pub table: u32,

    #[serde(default)]
    pub routes: Vec<LeaseRoute>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

fn default_lease_table() -> u32 {
    RT_TABLE_MAIN
}

/// The DHCP client is about to configure an interface, or lost its lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLeaseReset {
    pub interface: String,
}

// =============================================================================
// Configuration
// =============================================================================

/// A configuration commit succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigCommitted {
    pub version: u64,
    pub committed_at: DateTime<Utc>,
}
