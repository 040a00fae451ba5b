//! Kernel command interface.
//!
//! Entity managers converge state by issuing commands through the `Kernel`
//! trait. Implementations serialize commands through a single lock held
//! only while one command runs; the event-reading thread never takes it.
//!
//! Addresses and routes carry an explicit protocol tag so that the agent
//! can tell its own objects apart and flush only those on interface reset.

mod recording;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use routekeeper_events::LinkAttributes;
use routekeeper_networking::{normalize_lladdr, IpInterface, IpNetwork, Scope};

use crate::netlink::{NetlinkBinding, SharedIndex};
use crate::runtime::Provider;

pub use recording::{KernelCall, RecordingKernel};

// =============================================================================
// Errors
// =============================================================================

/// Errors from kernel commands.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The object already exists (EEXIST).
    #[error("object already exists")]
    Exists,

    /// The interface does not exist (ENODEV).
    #[error("no such device")]
    NoDevice,

    /// A nexthop gateway is not reachable (ENETUNREACH).
    #[error("gateway unreachable")]
    Unreachable,

    /// The kernel rejected the command.
    #[error("{operation} failed: {message}")]
    Command {
        operation: &'static str,
        message: String,
    },

    /// The command could not be executed.
    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Command specs
// =============================================================================

/// Type-specific part of a virtual link to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkKindSpec {
    Bridge {
        stp: bool,
    },
    Vlan {
        trunk: u32,
        id: u16,
    },
    Vxlan {
        vni: u32,
        underlay: Option<u32>,
        local: Option<IpAddr>,
        remote: Option<IpAddr>,
        group: Option<IpAddr>,
        port: Option<u16>,
        ttl: Option<u8>,
    },
    Sit {
        local: Option<IpAddr>,
        remote: Option<IpAddr>,
        ttl: Option<u8>,
    },
}

impl LinkKindSpec {
    /// Kernel link kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkKindSpec::Bridge { .. } => "bridge",
            LinkKindSpec::Vlan { .. } => "vlan",
            LinkKindSpec::Vxlan { .. } => "vxlan",
            LinkKindSpec::Sit { .. } => "sit",
        }
    }
}

/// A virtual link to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub name: String,
    pub kind: LinkKindSpec,
}

/// Link parameters to set. `None` fields are left alone.
///
/// `master` uses index 0 for "no master", as the kernel does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParams {
    pub up: Option<bool>,
    pub noarp: Option<bool>,
    pub mtu: Option<u32>,
    pub txqueuelen: Option<u32>,
    pub address: Option<String>,
    pub broadcast: Option<String>,
    pub master: Option<u32>,
    pub addrgenmode: Option<String>,
    pub token: Option<String>,
}

impl LinkParams {
    /// Every parameter the kernel reported.
    pub fn observed(attributes: &LinkAttributes) -> Self {
        Self {
            up: Some(attributes.up),
            noarp: Some(attributes.noarp),
            mtu: attributes.mtu,
            txqueuelen: attributes.txqueuelen,
            address: attributes.address.as_deref().map(normalize_lladdr),
            broadcast: attributes.broadcast.as_deref().map(normalize_lladdr),
            master: Some(attributes.master.unwrap_or(0)),
            addrgenmode: attributes.addrgenmode.clone(),
            token: attributes.token.clone(),
        }
    }

    /// Keep only the fields that `shape` sets.
    pub fn restricted_to(&self, shape: &LinkParams) -> LinkParams {
        fn keep<T: Clone>(value: &Option<T>, shape: &Option<impl Sized>) -> Option<T> {
            shape.as_ref().and(value.clone())
        }

        LinkParams {
            up: keep(&self.up, &shape.up),
            noarp: keep(&self.noarp, &shape.noarp),
            mtu: keep(&self.mtu, &shape.mtu),
            txqueuelen: keep(&self.txqueuelen, &shape.txqueuelen),
            address: keep(&self.address, &shape.address),
            broadcast: keep(&self.broadcast, &shape.broadcast),
            master: keep(&self.master, &shape.master),
            addrgenmode: keep(&self.addrgenmode, &shape.addrgenmode),
            token: keep(&self.token, &shape.token),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == LinkParams::default()
    }
}

/// An address to add or remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpec {
    pub ifindex: u32,
    pub address: IpInterface,
    pub peer: Option<IpAddr>,

    /// Do not install the prefix route for the address.
    pub noprefixroute: bool,

    pub protocol: u8,
}

/// One nexthop of a route to install.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NexthopSpec {
    pub gateway: Option<IpAddr>,
    pub ifindex: Option<u32>,
}

/// A route to replace or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub table: u32,
    pub destination: IpNetwork,
    pub protocol: u8,
    pub scope: Option<Scope>,
    pub prefsrc: Option<IpAddr>,

    /// One nexthop for a plain route, several for a multipath route.
    pub nexthops: Vec<NexthopSpec>,
}

impl RouteSpec {
    /// Nexthops in canonical order, so that comparisons ignore ordering.
    pub fn normalized(mut self) -> Self {
        self.nexthops.sort();
        self
    }

    pub fn is_multipath(&self) -> bool {
        self.nexthops.len() > 1
    }
}

// =============================================================================
// Kernel trait
// =============================================================================

/// Commands the agent issues to converge kernel state.
#[async_trait]
pub trait Kernel: Send + Sync {
    async fn link_add(&self, link: &LinkSpec) -> Result<(), KernelError>;

    async fn link_set(&self, ifindex: u32, params: &LinkParams) -> Result<(), KernelError>;

    async fn link_delete(&self, ifindex: u32) -> Result<(), KernelError>;

    async fn address_add(&self, address: &AddressSpec) -> Result<(), KernelError>;

    async fn address_remove(&self, address: &AddressSpec) -> Result<(), KernelError>;

    /// Remove every address on `ifindex` tagged with `protocol`.
    async fn address_flush(&self, ifindex: u32, protocol: u8) -> Result<(), KernelError>;

    /// Add or replace a route.
    async fn route_replace(&self, route: &RouteSpec) -> Result<(), KernelError>;

    async fn route_delete(&self, route: &RouteSpec) -> Result<(), KernelError>;
}

// =============================================================================
// Provider
// =============================================================================

/// Holds the kernel command handle, the netlink binding and the shared
/// interface index for the other providers.
pub struct KernelProvider {
    kernel: Arc<dyn Kernel>,
    binding: Arc<dyn NetlinkBinding>,
    index: SharedIndex,
    route_protocol: u8,
}

impl KernelProvider {
    pub fn new(
        kernel: Arc<dyn Kernel>,
        binding: Arc<dyn NetlinkBinding>,
        index: SharedIndex,
        route_protocol: u8,
    ) -> Self {
        Self {
            kernel,
            binding,
            index,
            route_protocol,
        }
    }

    pub fn kernel(&self) -> Arc<dyn Kernel> {
        Arc::clone(&self.kernel)
    }

    pub fn binding(&self) -> Arc<dyn NetlinkBinding> {
        Arc::clone(&self.binding)
    }

    pub fn index(&self) -> SharedIndex {
        Arc::clone(&self.index)
    }

    /// Protocol tag for owned addresses and routes.
    pub fn route_protocol(&self) -> u8 {
        self.route_protocol
    }
}

impl Provider for KernelProvider {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_keeps_configured_fields() {
        let attributes = LinkAttributes {
            up: false,
            mtu: Some(9000),
            address: Some("AA:BB:CC:00:11:22".to_string()),
            txqueuelen: Some(1000),
            ..Default::default()
        };
        let target = LinkParams {
            up: Some(true),
            mtu: Some(1500),
            address: Some("aa:bb:cc:00:11:22".to_string()),
            ..Default::default()
        };

        let projection = LinkParams::observed(&attributes).restricted_to(&target);
        assert_eq!(projection.up, Some(false));
        assert_eq!(projection.mtu, Some(9000));
        assert_eq!(projection.address, target.address);
        assert_eq!(projection.txqueuelen, None);
        assert_ne!(projection, target);
    }

    #[test]
    fn test_observed_master_defaults_to_zero() {
        let params = LinkParams::observed(&LinkAttributes::default());
        assert_eq!(params.master, Some(0));
    }

    #[test]
    fn test_route_normalization_ignores_nexthop_order() {
        let a = NexthopSpec {
            gateway: Some("192.0.2.1".parse().unwrap()),
            ifindex: Some(2),
        };
        let b = NexthopSpec {
            gateway: Some("192.0.2.2".parse().unwrap()),
            ifindex: Some(3),
        };
        let route = |nexthops| RouteSpec {
            table: 254,
            destination: "0.0.0.0/0".parse().unwrap(),
            protocol: 52,
            scope: None,
            prefsrc: None,
            nexthops,
        };

        let forward = route(vec![a.clone(), b.clone()]).normalized();
        let backward = route(vec![b, a]).normalized();
        assert_eq!(forward, backward);
        assert!(forward.is_multipath());
    }
}
