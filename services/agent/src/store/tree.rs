//! Configuration document.

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use routekeeper_networking::{validate_mtu, IpInterface, IpNetwork, Scope};

/// Schema version written into fresh documents.
pub const SCHEMA_VERSION: &str = "1.0";

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Configuration that fails validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("duplicate {kind}: {key}")]
    Duplicate { kind: &'static str, key: String },
}

// =============================================================================
// Document
// =============================================================================

/// Versioned configuration document.
///
/// Only the interface, address and route sections are reconciled here;
/// the firewall, DHCP and DNS sections are carried verbatim for the
/// services that render them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigTree {
    #[serde(default)]
    pub system: SystemConfig,

    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,

    #[serde(default)]
    pub addresses: Vec<AddressConfig>,

    #[serde(default)]
    pub route: RouteConfig,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub netfilter: Value,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub dhcp: Value,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub dns: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub version: u64,

    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

fn default_schema() -> String {
    SCHEMA_VERSION.to_string()
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            version: 0,
            schema: default_schema(),
            committed_at: None,
        }
    }
}

impl ConfigTree {
    /// An empty version-0 document.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.system.version
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn route_table(&self, id: u32) -> Option<&RouteTableConfig> {
        self.route.tables.iter().find(|t| t.id == id)
    }

    pub fn route_table_mut(&mut self, id: u32) -> Option<&mut RouteTableConfig> {
        self.route.tables.iter_mut().find(|t| t.id == id)
    }

    /// Check every section for malformed entries and duplicate keys.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for interface in &self.interfaces {
            interface.validate()?;
            if !names.insert(interface.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "interface",
                    key: interface.name.clone(),
                });
            }
        }

        let mut addresses = HashSet::new();
        for address in &self.addresses {
            address.validate()?;
            if !addresses.insert(address.key()) {
                return Err(ConfigError::Duplicate {
                    kind: "address",
                    key: format!("{} {}", address.interface, address.ip),
                });
            }
        }

        let mut tables = HashSet::new();
        for table in &self.route.tables {
            table.validate()?;
            if !tables.insert(table.id) {
                return Err(ConfigError::Duplicate {
                    kind: "route table",
                    key: table.id.to_string(),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Interfaces
// =============================================================================

/// Interface type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Ethernet,
    Loopback,
    Bridge,
    Vlan,
    Vxlan,
    Sit,
}

impl InterfaceKind {
    /// Virtual interfaces are created and deleted by the agent; physical
    /// ones are only configured and reset.
    pub fn is_virtual(self) -> bool {
        !matches!(self, InterfaceKind::Ethernet | InterfaceKind::Loopback)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceKind::Ethernet => "ethernet",
            InterfaceKind::Loopback => "loopback",
            InterfaceKind::Bridge => "bridge",
            InterfaceKind::Vlan => "vlan",
            InterfaceKind::Vxlan => "vxlan",
            InterfaceKind::Sit => "sit",
        }
    }
}

/// Link parameters. Unset fields are left as the kernel has them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txqueuelen: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noarp: Option<bool>,

    /// Bridge this interface is enslaved to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addrgenmode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanConfig {
    pub trunk: String,
    pub id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanConfig {
    pub vni: u32,

    /// Underlay interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub stp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: InterfaceKind,

    /// Keep the entry but leave the interface unmanaged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vxlan: Option<VxlanConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sit: Option<SitConfig>,
}

impl InterfaceConfig {
    /// A plain entry of `kind` with no parameters.
    pub fn new(name: &str, kind: InterfaceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            disable: false,
            link: LinkConfig::default(),
            bridge: None,
            vlan: None,
            vxlan: None,
            sit: None,
        }
    }

    /// Names of the interfaces this one cannot exist or be configured
    /// without: master, VLAN trunk, VXLAN underlay.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps = Vec::new();
        if let Some(master) = &self.link.master {
            deps.push(master.as_str());
        }
        if let (InterfaceKind::Vlan, Some(vlan)) = (self.kind, &self.vlan) {
            deps.push(vlan.trunk.as_str());
        }
        if let (InterfaceKind::Vxlan, Some(vxlan)) = (self.kind, &self.vxlan) {
            if let Some(underlay) = &vxlan.interface {
                deps.push(underlay.as_str());
            }
        }
        deps
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingField("name"));
        }
        if self.name.len() > MAX_INTERFACE_NAME_LEN || self.name.contains(['/', ' ']) {
            return Err(ConfigError::Invalid {
                field: "name",
                message: format!("{:?} is not a valid interface name", self.name),
            });
        }
        if let Some(mtu) = self.link.mtu {
            validate_mtu(mtu).map_err(|e| ConfigError::Invalid {
                field: "link.mtu",
                message: e.to_string(),
            })?;
        }
        if self.link.master.as_deref() == Some(self.name.as_str()) {
            return Err(ConfigError::Invalid {
                field: "link.master",
                message: "interface cannot be its own master".to_string(),
            });
        }

        match self.kind {
            InterfaceKind::Vlan => {
                let vlan = self.vlan.as_ref().ok_or(ConfigError::MissingField("vlan"))?;
                if vlan.trunk.is_empty() {
                    return Err(ConfigError::MissingField("vlan.trunk"));
                }
                if vlan.id == 0 || vlan.id > 4094 {
                    return Err(ConfigError::Invalid {
                        field: "vlan.id",
                        message: format!("{} is outside 1-4094", vlan.id),
                    });
                }
            }
            InterfaceKind::Vxlan => {
                let vxlan = self.vxlan.as_ref().ok_or(ConfigError::MissingField("vxlan"))?;
                if vxlan.vni >= 1 << 24 {
                    return Err(ConfigError::Invalid {
                        field: "vxlan.vni",
                        message: format!("{} does not fit in 24 bits", vxlan.vni),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

// =============================================================================
// Addresses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressConfig {
    pub interface: String,
    pub ip: IpInterface,

    /// Remote end of a point-to-point link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<IpAddr>,
}

impl AddressConfig {
    pub fn key(&self) -> (String, IpInterface) {
        (self.interface.clone(), self.ip)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty() {
            return Err(ConfigError::MissingField("interface"));
        }
        if let Some(peer) = self.peer {
            if peer.is_ipv4() != self.ip.addr().is_ipv4() {
                return Err(ConfigError::Invalid {
                    field: "peer",
                    message: format!("{peer} is not in the family of {}", self.ip),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Routes
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub tables: Vec<RouteTableConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTableConfig {
    pub id: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub routes: Vec<RouteEntryConfig>,
}

impl RouteTableConfig {
    pub fn new(id: u32, name: Option<&str>) -> Self {
        Self {
            id,
            name: name.map(str::to_string),
            routes: Vec::new(),
        }
    }

    pub fn route(&self, destination: &IpNetwork) -> Option<&RouteEntryConfig> {
        self.routes.iter().find(|r| &r.destination == destination)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id == 0 {
            return Err(ConfigError::Invalid {
                field: "id",
                message: "table 0 is reserved".to_string(),
            });
        }
        let mut seen = BTreeSet::new();
        for route in &self.routes {
            route.validate()?;
            if !seen.insert(route.destination) {
                return Err(ConfigError::Duplicate {
                    kind: "route",
                    key: format!("table {} {}", self.id, route.destination),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntryConfig {
    pub destination: IpNetwork,

    #[serde(default)]
    pub nexthops: Vec<NexthopConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefsrc: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
}

impl RouteEntryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nexthops.is_empty() {
            return Err(ConfigError::MissingField("nexthops"));
        }
        for nexthop in &self.nexthops {
            if nexthop.gateway.is_none() && nexthop.interface.is_none() {
                return Err(ConfigError::Invalid {
                    field: "nexthops",
                    message: "a nexthop needs a gateway or an interface".to_string(),
                });
            }
            if let Some(gateway) = nexthop.gateway {
                if gateway.is_ipv4() != self.destination.addr().is_ipv4() {
                    return Err(ConfigError::Invalid {
                        field: "nexthops.gateway",
                        message: format!("{gateway} is not in the family of {}", self.destination),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NexthopConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_parses_with_opaque_sections() {
        let json = r#"{
            "system": {"version": 3},
            "interfaces": [
                {"name": "eth0", "type": "ethernet", "link": {"mtu": 9000}},
                {"name": "eth0.10", "type": "vlan", "vlan": {"trunk": "eth0", "id": 10}}
            ],
            "addresses": [{"interface": "eth0", "ip": "10.1.2.3/24"}],
            "route": {"tables": [{"id": 254, "name": "main", "routes": [
                {"destination": "0.0.0.0/0", "nexthops": [{"gateway": "192.0.2.1"}]}
            ]}]},
            "netfilter": {"zones": []}
        }"#;
        let tree: ConfigTree = serde_json::from_str(json).unwrap();

        assert_eq!(tree.version(), 3);
        assert_eq!(tree.system.schema, SCHEMA_VERSION);
        assert_eq!(tree.interface("eth0.10").unwrap().dependencies(), vec!["eth0"]);
        assert!(tree.route_table(254).is_some());
        assert!(tree.dhcp.is_null());
        tree.validate().unwrap();

        let back: ConfigTree = serde_json::from_value(serde_json::to_value(&tree).unwrap()).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_vlan_requires_block() {
        let vlan = InterfaceConfig::new("eth0.10", InterfaceKind::Vlan);
        assert_eq!(vlan.validate(), Err(ConfigError::MissingField("vlan")));
    }

    #[test]
    fn test_duplicate_interfaces_rejected() {
        let mut tree = ConfigTree::new();
        tree.interfaces.push(InterfaceConfig::new("eth0", InterfaceKind::Ethernet));
        tree.interfaces.push(InterfaceConfig::new("eth0", InterfaceKind::Ethernet));
        assert!(matches!(tree.validate(), Err(ConfigError::Duplicate { .. })));
    }

    #[test]
    fn test_route_needs_nexthop() {
        let route = RouteEntryConfig {
            destination: "10.0.0.0/8".parse().unwrap(),
            nexthops: Vec::new(),
            prefsrc: None,
            scope: None,
        };
        assert_eq!(route.validate(), Err(ConfigError::MissingField("nexthops")));
    }
}
