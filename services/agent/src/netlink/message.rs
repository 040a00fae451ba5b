//! Structured rtnetlink messages as delivered by an OS netlink binding.

use std::net::IpAddr;

use routekeeper_events::LinkAttributes;
use routekeeper_networking::Scope;

/// Address family of an address, route or neighbour message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    Other(u8),
}

/// Route type (`rtm_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    Unicast,
    Local,
    Broadcast,
    Multicast,
    Blackhole,
    Unreachable,
    Prohibit,
    Other,
}

/// RTM_NEWLINK / RTM_DELLINK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub ifindex: u32,
    pub ifname: String,
    pub kind: Option<String>,
    pub attributes: LinkAttributes,
}

/// RTM_NEWADDR / RTM_DELADDR.
///
/// For point-to-point links `local` is the local address and `address` the
/// peer; otherwise both carry the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMessage {
    pub family: AddressFamily,
    pub ifindex: u32,
    pub prefixlen: u8,
    pub local: Option<IpAddr>,
    pub address: Option<IpAddr>,
    pub scope: Scope,
    pub label: Option<String>,
    pub protocol: Option<u8>,
}

/// One nexthop of a route message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NexthopMessage {
    pub gateway: Option<IpAddr>,
    pub oif: Option<u32>,
}

/// RTM_NEWROUTE / RTM_DELROUTE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMessage {
    pub family: AddressFamily,
    pub route_type: RouteType,
    pub table: u32,

    /// Destination address; `None` for a default route.
    pub destination: Option<IpAddr>,
    pub dst_len: u8,
    pub protocol: u8,
    pub scope: Scope,
    pub prefsrc: Option<IpAddr>,
    pub nexthops: Vec<NexthopMessage>,
}

/// RTM_NEWNEIGH / RTM_DELNEIGH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighbourMessage {
    pub family: AddressFamily,
    pub ifindex: u32,
    pub destination: Option<IpAddr>,
    pub lladdr: Option<String>,
    pub state: Vec<String>,
}

/// One rtnetlink message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelMessage {
    NewLink(LinkMessage),
    DelLink(LinkMessage),
    NewAddress(AddressMessage),
    DelAddress(AddressMessage),
    NewRoute(RouteMessage),
    DelRoute(RouteMessage),
    NewNeighbour(NeighbourMessage),
    DelNeighbour(NeighbourMessage),
}

impl KernelMessage {
    /// Message type name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            KernelMessage::NewLink(_) => "newlink",
            KernelMessage::DelLink(_) => "dellink",
            KernelMessage::NewAddress(_) => "newaddr",
            KernelMessage::DelAddress(_) => "deladdr",
            KernelMessage::NewRoute(_) => "newroute",
            KernelMessage::DelRoute(_) => "delroute",
            KernelMessage::NewNeighbour(_) => "newneigh",
            KernelMessage::DelNeighbour(_) => "delneigh",
        }
    }
}

/// Object classes enumerated at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumpKind {
    Links,
    Addresses,
    Neighbours,
    Routes,
}

impl DumpKind {
    /// Enumeration order: links first so that later objects can resolve
    /// interface names.
    pub const ENUMERATION_ORDER: [DumpKind; 4] = [
        DumpKind::Links,
        DumpKind::Addresses,
        DumpKind::Neighbours,
        DumpKind::Routes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DumpKind::Links => "links",
            DumpKind::Addresses => "addresses",
            DumpKind::Neighbours => "neighbours",
            DumpKind::Routes => "routes",
        }
    }
}
