//! The event union and its kind tags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::types::*;

// =============================================================================
// Event Kind Constants
// =============================================================================

/// All event kind names as constants.
pub mod event_kinds {
    // Kernel links
    pub const INTERFACE_ADD: &str = "interface.add";
    pub const INTERFACE_REMOVE: &str = "interface.remove";

    // Kernel addresses
    pub const ADDRESS_ADD: &str = "address.add";
    pub const ADDRESS_REMOVE: &str = "address.remove";

    // Kernel routes
    pub const ROUTE_ADD: &str = "route.add";
    pub const ROUTE_REMOVE: &str = "route.remove";

    // Kernel neighbours
    pub const NEIGHBOUR_ADD: &str = "neighbour.add";
    pub const NEIGHBOUR_REMOVE: &str = "neighbour.remove";

    // DHCPv4 client
    pub const DHCP4_LEASE_PREINIT: &str = "dhcp4.lease_preinit";
    pub const DHCP4_LEASE_ACQUIRED: &str = "dhcp4.lease_acquired";
    pub const DHCP4_LEASE_LOST: &str = "dhcp4.lease_lost";

    // Configuration
    pub const CONFIG_COMMITTED: &str = "config.committed";
}

/// Event kind tag, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InterfaceAdd,
    InterfaceRemove,
    AddressAdd,
    AddressRemove,
    RouteAdd,
    RouteRemove,
    NeighbourAdd,
    NeighbourRemove,
    DhcpLeasePreinit,
    DhcpLeaseAcquired,
    DhcpLeaseLost,
    ConfigCommitted,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 12] = [
        EventKind::InterfaceAdd,
        EventKind::InterfaceRemove,
        EventKind::AddressAdd,
        EventKind::AddressRemove,
        EventKind::RouteAdd,
        EventKind::RouteRemove,
        EventKind::NeighbourAdd,
        EventKind::NeighbourRemove,
        EventKind::DhcpLeasePreinit,
        EventKind::DhcpLeaseAcquired,
        EventKind::DhcpLeaseLost,
        EventKind::ConfigCommitted,
    ];

    /// The dotted kind name.
    pub fn as_str(&self) -> &'static str {
        use event_kinds::*;
        match self {
            EventKind::InterfaceAdd => INTERFACE_ADD,
            EventKind::InterfaceRemove => INTERFACE_REMOVE,
            EventKind::AddressAdd => ADDRESS_ADD,
            EventKind::AddressRemove => ADDRESS_REMOVE,
            EventKind::RouteAdd => ROUTE_ADD,
            EventKind::RouteRemove => ROUTE_REMOVE,
            EventKind::NeighbourAdd => NEIGHBOUR_ADD,
            EventKind::NeighbourRemove => NEIGHBOUR_REMOVE,
            EventKind::DhcpLeasePreinit => DHCP4_LEASE_PREINIT,
            EventKind::DhcpLeaseAcquired => DHCP4_LEASE_ACQUIRED,
            EventKind::DhcpLeaseLost => DHCP4_LEASE_LOST,
            EventKind::ConfigCommitted => CONFIG_COMMITTED,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventKind(s.to_string()))
    }
}

// =============================================================================
// Event
// =============================================================================

/// Something that happened, either in the kernel or inside the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Event {
    InterfaceAdd(InterfaceAdd),
    InterfaceRemove(InterfaceRemove),
    AddressAdd(AddressAdd),
    AddressRemove(AddressRemove),
    RouteAdd(RouteAdd),
    RouteRemove(RouteRemove),
    NeighbourAdd(NeighbourEntry),
    NeighbourRemove(NeighbourEntry),
    DhcpLeasePreinit(DhcpLeaseReset),
    DhcpLeaseAcquired(DhcpLease),
    DhcpLeaseLost(DhcpLeaseReset),
    ConfigCommitted(ConfigCommitted),
}

impl Event {
    /// The kind tag of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::InterfaceAdd(_) => EventKind::InterfaceAdd,
            Event::InterfaceRemove(_) => EventKind::InterfaceRemove,
            Event::AddressAdd(_) => EventKind::AddressAdd,
            Event::AddressRemove(_) => EventKind::AddressRemove,
            Event::RouteAdd(_) => EventKind::RouteAdd,
            Event::RouteRemove(_) => EventKind::RouteRemove,
            Event::NeighbourAdd(_) => EventKind::NeighbourAdd,
            Event::NeighbourRemove(_) => EventKind::NeighbourRemove,
            Event::DhcpLeasePreinit(_) => EventKind::DhcpLeasePreinit,
            Event::DhcpLeaseAcquired(_) => EventKind::DhcpLeaseAcquired,
            Event::DhcpLeaseLost(_) => EventKind::DhcpLeaseLost,
            Event::ConfigCommitted(_) => EventKind::ConfigCommitted,
        }
    }

    /// The interface this event concerns, if any.
    pub fn interface_name(&self) -> Option<&str> {
        match self {
            Event::InterfaceAdd(e) => Some(&e.ifname),
            Event::InterfaceRemove(e) => Some(&e.ifname),
            Event::AddressAdd(e) => Some(&e.ifname),
            Event::AddressRemove(e) => Some(&e.ifname),
            Event::NeighbourAdd(e) | Event::NeighbourRemove(e) => Some(&e.ifname),
            Event::DhcpLeasePreinit(e) | Event::DhcpLeaseLost(e) => Some(&e.interface),
            Event::DhcpLeaseAcquired(e) => Some(&e.interface),
            Event::RouteAdd(_) | Event::RouteRemove(_) | Event::ConfigCommitted(_) => None,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, EventError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(value: serde_json::Value) -> Result<Self, EventError> {
        serde_json::from_value(value).map_err(|e| EventError::InvalidPayload(e.to_string()))
    }
}
