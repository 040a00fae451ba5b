//! Reconciliation primitives.
//!
//! This library provides helpers for entity managers that converge the
//! kernel's network objects to the declared configuration. Key concepts:
//!
//! - **Intent**: what the agent wants for one object. Either nothing, a
//!   declared configuration, or a dynamic value such as a DHCP lease.
//! - **Observation**: what the kernel last reported for that object.
//! - **Convergence**: issuing the minimal kernel operation that makes the
//!   observation match the intent.
//!
//! # Invariants
//!
//! - Declared intent always overrides dynamic intent
//! - A target is never issued twice while nothing observable has changed
//! - Entities waiting on a missing interface are re-applied when it appears

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Two configuration entries share the same key.
    #[error("duplicate {kind} entry: {key}")]
    DuplicateKey { kind: &'static str, key: String },

    /// Entities depend on each other in a cycle.
    #[error("dependency cycle between: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// Configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Intent
// =============================================================================

/// Desired state for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent<D, Y> {
    /// Nothing is wanted; the entity only mirrors the kernel.
    None,

    /// Declared by configuration.
    Declared(D),

    /// Supplied at runtime, used only while nothing is declared.
    Dynamic(Y),
}

/// Where an entity's intent came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Observed,
    Declared,
    Dynamic,
}

impl<D, Y> Default for Intent<D, Y> {
    fn default() -> Self {
        Intent::None
    }
}

impl<D, Y> Intent<D, Y> {
    /// Combine the declared and dynamic candidates. Declared wins.
    pub fn resolve(declared: Option<D>, dynamic: Option<Y>) -> Self {
        match (declared, dynamic) {
            (Some(d), _) => Intent::Declared(d),
            (None, Some(y)) => Intent::Dynamic(y),
            (None, None) => Intent::None,
        }
    }

    /// Returns true if nothing is wanted.
    pub fn is_none(&self) -> bool {
        matches!(self, Intent::None)
    }

    /// The declared configuration, if any.
    pub fn declared(&self) -> Option<&D> {
        match self {
            Intent::Declared(d) => Some(d),
            _ => None,
        }
    }

    /// The dynamic value, if it is in effect.
    pub fn dynamic(&self) -> Option<&Y> {
        match self {
            Intent::Dynamic(y) => Some(y),
            _ => None,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            Intent::None => Origin::Observed,
            Intent::Declared(_) => Origin::Declared,
            Intent::Dynamic(_) => Origin::Dynamic,
        }
    }
}

// =============================================================================
// Convergence memo
// =============================================================================

/// Remembers the last target successfully issued for an entity.
///
/// A target is issued only if it differs from the observation and from the
/// last issued target. The memo must be invalidated whenever the relevant
/// observation changes, so that drift introduced by someone else is
/// corrected again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convergence<T> {
    applied: Option<T>,
}

impl<T> Default for Convergence<T> {
    fn default() -> Self {
        Self { applied: None }
    }
}

impl<T: PartialEq> Convergence<T> {
    /// Create an empty memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `target` must be issued given the current observation.
    pub fn needs_apply(&self, target: &T, observed: Option<&T>) -> bool {
        observed != Some(target) && self.applied.as_ref() != Some(target)
    }

    /// Record that `target` was issued successfully.
    pub fn record(&mut self, target: T) {
        self.applied = Some(target);
    }

    /// Forget the last issued target.
    pub fn invalidate(&mut self) {
        self.applied = None;
    }

    /// The last issued target.
    pub fn applied(&self) -> Option<&T> {
        self.applied.as_ref()
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of an address or route entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectStatus {
    /// The interface the object lives on does not exist.
    InterfaceMissing,

    /// The interface exists but the address is not in the kernel.
    AddressMissing,

    /// The route is not in the kernel.
    RouteMissing,

    /// The kernel reports the object.
    Present,
}

impl ObjectStatus {
    /// Status of an address entity.
    pub fn for_address(interface_known: bool, observed: bool) -> Self {
        match (interface_known, observed) {
            (false, _) => ObjectStatus::InterfaceMissing,
            (true, false) => ObjectStatus::AddressMissing,
            (true, true) => ObjectStatus::Present,
        }
    }

    /// Status of a route entity.
    pub fn for_route(interfaces_known: bool, observed: bool) -> Self {
        match (interfaces_known, observed) {
            (_, true) => ObjectStatus::Present,
            (false, false) => ObjectStatus::InterfaceMissing,
            (true, false) => ObjectStatus::RouteMissing,
        }
    }

    /// Returns true if the object is in the kernel.
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present)
    }
}

// =============================================================================
// Dependency index
// =============================================================================

/// Map from a depended-upon interface name to the entities waiting on it.
#[derive(Debug, Clone)]
pub struct DependencyIndex<K> {
    waiting: BTreeMap<String, BTreeSet<K>>,
}

impl<K> Default for DependencyIndex<K> {
    fn default() -> Self {
        Self {
            waiting: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> DependencyIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `key` until `dependency` appears.
    ///
    /// Returns true if the key was not already waiting on it.
    pub fn wait(&mut self, dependency: &str, key: K) -> bool {
        self.waiting
            .entry(dependency.to_string())
            .or_default()
            .insert(key)
    }

    /// Take every key waiting on `dependency`.
    pub fn release(&mut self, dependency: &str) -> Vec<K> {
        self.waiting
            .remove(dependency)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop `key` from every wait list.
    pub fn forget(&mut self, key: &K) {
        self.waiting.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    /// Names `key` is currently waiting on.
    pub fn waiting_on(&self, key: &K) -> Vec<&str> {
        self.waiting
            .iter()
            .filter(|(_, keys)| keys.contains(key))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Returns true if `key` waits on anything.
    pub fn is_waiting(&self, key: &K) -> bool {
        self.waiting.values().any(|keys| keys.contains(key))
    }

    /// Number of distinct dependencies with waiters.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// Reject dependency graphs with cycles.
///
/// `edges` maps each name to the names it depends on. Names absent from the
/// map are leaves.
pub fn check_acyclic(edges: &BTreeMap<String, Vec<String>>) -> Result<(), ReconcileError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        edges: &'a BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), ReconcileError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.sort();
                return Err(ReconcileError::DependencyCycle(cycle));
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some(deps) = edges.get(name) {
            for dep in deps {
                visit(dep, edges, marks, path)?;
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = BTreeMap::new();
    let mut path = Vec::new();
    for name in edges.keys() {
        visit(name, edges, &mut marks, &mut path)?;
    }
    Ok(())
}
