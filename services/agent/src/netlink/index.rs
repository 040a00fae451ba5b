//! Interface name and index map.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Interface index shared between the event source and kernel commands.
pub type SharedIndex = Arc<RwLock<InterfaceIndex>>;

/// Bidirectional interface name/index map.
///
/// Indices are reused by the kernel after a delete, so an entry is always
/// replaced as a whole when a link message arrives.
#[derive(Debug, Default, Clone)]
pub struct InterfaceIndex {
    names: HashMap<u32, String>,
    indices: HashMap<String, u32>,
}

impl InterfaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new shared, empty index.
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record that `name` has index `ifindex`, dropping stale mappings of
    /// either.
    pub fn insert(&mut self, ifindex: u32, name: &str) {
        if let Some(old_name) = self.names.insert(ifindex, name.to_string()) {
            if old_name != name {
                self.indices.remove(&old_name);
            }
        }
        if let Some(old_index) = self.indices.insert(name.to_string(), ifindex) {
            if old_index != ifindex {
                self.names.remove(&old_index);
            }
        }
    }

    /// Forget `ifindex`. Returns the name it had.
    pub fn remove(&mut self, ifindex: u32) -> Option<String> {
        let name = self.names.remove(&ifindex)?;
        if self.indices.get(&name) == Some(&ifindex) {
            self.indices.remove(&name);
        }
        Some(name)
    }

    pub fn name(&self, ifindex: u32) -> Option<&str> {
        self.names.get(&ifindex).map(String::as_str)
    }

    pub fn index(&self, name: &str) -> Option<u32> {
        self.indices.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reused_index_replaces_name() {
        let mut index = InterfaceIndex::new();
        index.insert(5, "vlan10");
        index.remove(5);
        index.insert(5, "vlan20");

        assert_eq!(index.name(5), Some("vlan20"));
        assert_eq!(index.index("vlan10"), None);
        assert_eq!(index.index("vlan20"), Some(5));
    }

    #[test]
    fn test_rename_and_move() {
        let mut index = InterfaceIndex::new();
        index.insert(2, "eth0");
        index.insert(2, "wan0");
        assert_eq!(index.index("eth0"), None);
        assert_eq!(index.name(2), Some("wan0"));

        index.insert(3, "wan0");
        assert_eq!(index.name(2), None);
        assert_eq!(index.len(), 1);
    }
}
