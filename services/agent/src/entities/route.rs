//! Route entities, keyed by (table, destination).
//!
//! Routes come from the `route.tables` configuration section or from DHCPv4
//! leases. A route is installed with `route replace` once every interface
//! its nexthops name exists. If the kernel reports the gateway unreachable
//! the route is parked until a route covering the gateway shows up in the
//! same table.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use routekeeper_events::{DhcpLease, Event, EventKind, InterfaceAdd, InterfaceRemove, Nexthop, RouteAdd, RouteRemove};
use routekeeper_networking::{IpNetwork, Scope, DEFAULT_TABLES};
use routekeeper_reconcile::{Convergence, DependencyIndex, Intent, ObjectStatus, Origin};

use super::{first_error, settle, subscribe, EntityEvents, Outcome};
use crate::kernel::{Kernel, KernelError, KernelProvider, NexthopSpec, RouteSpec};
use crate::runtime::{Injector, Provider};
use crate::store::{
    ConfigChangeHandler, ConfigError, ConfigProvider, ConfigStore, ConfigTree, NexthopConfig,
    RouteEntryConfig, RouteTableConfig,
};

type RouteKey = (u32, IpNetwork);

/// Init handler writing the kernel's default tables into a fresh
/// configuration.
pub fn default_route_tables(tree: &mut ConfigTree) {
    for (id, name) in DEFAULT_TABLES {
        if tree.route_table(id).is_none() {
            tree.route.tables.push(RouteTableConfig::new(id, Some(name)));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NexthopReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Externally visible state of one route entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStatusReport {
    pub table: u32,
    pub destination: IpNetwork,
    pub origin: Origin,
    pub status: ObjectStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefsrc: Option<IpAddr>,

    pub nexthops: Vec<NexthopReport>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTableSummary {
    pub id: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Route entities in the table, declared or observed.
    pub routes: usize,

    /// The table is part of the running configuration.
    pub declared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedRoute {
    protocol: u8,
    scope: Scope,
    prefsrc: Option<IpAddr>,
    nexthops: Vec<Nexthop>,
}

impl ObservedRoute {
    /// The observed route, limited to what `target` sets.
    fn project(&self, target: &RouteSpec) -> RouteSpec {
        let nexthops = self
            .nexthops
            .iter()
            .map(|nexthop| NexthopSpec {
                gateway: nexthop.gateway,
                ifindex: nexthop.ifindex.filter(|_| {
                    target
                        .nexthops
                        .iter()
                        .any(|t| t.gateway == nexthop.gateway && t.ifindex.is_some())
                }),
            })
            .collect();

        RouteSpec {
            table: target.table,
            destination: target.destination,
            protocol: self.protocol,
            scope: target.scope.map(|_| self.scope),
            prefsrc: target.prefsrc.and(self.prefsrc),
            nexthops,
        }
        .normalized()
    }

    fn uses(&self, ifindex: u32) -> bool {
        self.nexthops.iter().any(|n| n.ifindex == Some(ifindex))
    }
}

#[derive(Debug, Default)]
struct RouteEntity {
    declared: Option<RouteEntryConfig>,

    /// From a DHCP lease.
    dynamic: Option<RouteEntryConfig>,

    observed: Option<ObservedRoute>,
    memo: Convergence<RouteSpec>,

    /// Gateways the kernel called unreachable on the last attempt.
    unreachable: Vec<IpAddr>,

    /// Target refused with nothing specific to wait for; retried when it
    /// changes or an interface appears.
    stalled: Option<RouteSpec>,

    removing: bool,
}

impl RouteEntity {
    fn intent(&self) -> Intent<&RouteEntryConfig, &RouteEntryConfig> {
        Intent::resolve(self.declared.as_ref(), self.dynamic.as_ref())
    }

    fn wanted(&self) -> Option<&RouteEntryConfig> {
        match self.intent() {
            Intent::Declared(config) | Intent::Dynamic(config) => Some(config),
            Intent::None => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.declared.is_none() && self.dynamic.is_none() && self.observed.is_none()
    }
}

#[derive(Debug, Default)]
struct RouteState {
    entities: BTreeMap<RouteKey, RouteEntity>,
    interfaces: BTreeMap<String, u32>,
    deps: DependencyIndex<RouteKey>,

    /// Routes each interface's lease contributed.
    leases: BTreeMap<String, BTreeSet<RouteKey>>,

    /// Tables of the running configuration.
    tables: BTreeMap<u32, Option<String>>,
}

struct RouteInner {
    kernel: Arc<dyn Kernel>,
    protocol: u8,
    state: Mutex<RouteState>,
}

fn describe(key: &RouteKey) -> String {
    format!("{} table {}", key.1, key.0)
}

/// The routes a lease asks for: its connected network, a default route via
/// the gateway and the classless static routes.
fn lease_routes(lease: &DhcpLease) -> BTreeMap<RouteKey, RouteEntryConfig> {
    let prefsrc = Some(lease.address.addr());
    let via = |gateway: Option<IpAddr>| NexthopConfig {
        gateway,
        interface: Some(lease.interface.clone()),
    };

    let mut routes = BTreeMap::new();
    let connected = lease.address.network();
    routes.insert(
        (lease.table, connected),
        RouteEntryConfig {
            destination: connected,
            nexthops: vec![via(None)],
            prefsrc,
            scope: Some(Scope::Link),
        },
    );

    let gateways = lease
        .gateway
        .map(|gateway| (IpNetwork::default_for(lease.address.family()), gateway))
        .into_iter()
        .chain(lease.routes.iter().map(|r| (r.destination, r.gateway)));
    for (destination, gateway) in gateways {
        routes.insert(
            (lease.table, destination),
            RouteEntryConfig {
                destination,
                nexthops: vec![via(Some(gateway))],
                prefsrc,
                scope: None,
            },
        );
    }
    routes
}

impl RouteInner {
    async fn apply(&self, state: &mut RouteState, key: &RouteKey) -> anyhow::Result<()> {
        state.deps.forget(key);
        let Some(config) = state
            .entities
            .get(key)
            .and_then(RouteEntity::wanted)
            .cloned()
        else {
            return self.withdraw(state, key).await;
        };

        let mut nexthops = Vec::new();
        let mut missing = Vec::new();
        for nexthop in &config.nexthops {
            let ifindex = match &nexthop.interface {
                Some(name) => match state.interfaces.get(name) {
                    Some(&ifindex) => Some(ifindex),
                    None => {
                        missing.push(name.clone());
                        continue;
                    }
                },
                None => None,
            };
            nexthops.push(NexthopSpec {
                gateway: nexthop.gateway,
                ifindex,
            });
        }
        if !missing.is_empty() {
            debug!(route = %describe(key), waiting_on = ?missing, "Route waits for interfaces");
            for name in missing {
                state.deps.wait(&name, *key);
            }
            return Ok(());
        }

        let target = RouteSpec {
            table: key.0,
            destination: key.1,
            protocol: self.protocol,
            scope: config.scope,
            prefsrc: config.prefsrc,
            nexthops,
        }
        .normalized();

        let Some(entity) = state.entities.get_mut(key) else {
            return Ok(());
        };
        // A route being deleted is as good as gone.
        let projection = match &entity.observed {
            Some(observed) if !entity.removing => Some(observed.project(&target)),
            _ => None,
        };
        if !entity.memo.needs_apply(&target, projection.as_ref())
            || !entity.unreachable.is_empty()
            || entity.stalled.as_ref() == Some(&target)
        {
            return Ok(());
        }
        entity.stalled = None;

        info!(route = %describe(key), nexthops = target.nexthops.len(), "Installing route");
        match self.kernel.route_replace(&target).await {
            Err(KernelError::Unreachable) => {
                entity.unreachable = target.nexthops.iter().filter_map(|n| n.gateway).collect();
                if entity.unreachable.is_empty() {
                    warn!(route = %describe(key), "Route unreachable without a gateway");
                    entity.stalled = Some(target);
                } else {
                    debug!(route = %describe(key), "Gateway unreachable, waiting for a covering route");
                }
            }
            result => match settle(result, &describe(key), "route_replace")? {
                Outcome::Applied => {
                    entity.memo.record(target);
                    entity.removing = false;
                }
                Outcome::Vanished => {
                    entity.memo.invalidate();
                    let names: Vec<&String> =
                        config.nexthops.iter().filter_map(|n| n.interface.as_ref()).collect();
                    if names.is_empty() {
                        // The kernel picked the device from the gateway.
                        entity.stalled = Some(target);
                    }
                    for name in names {
                        state.interfaces.remove(name);
                        state.deps.wait(name, *key);
                    }
                }
            },
        }
        Ok(())
    }

    /// Delete a route nobody wants any more, if the agent installed it and
    /// the kernel still has it.
    async fn withdraw(&self, state: &mut RouteState, key: &RouteKey) -> anyhow::Result<()> {
        let Some(entity) = state.entities.get_mut(key) else {
            return Ok(());
        };
        entity.unreachable.clear();
        entity.stalled = None;
        let owned = entity.memo.applied().is_some()
            || entity.observed.as_ref().is_some_and(|o| o.protocol == self.protocol);
        entity.memo.invalidate();

        if let Some(observed) = &entity.observed {
            if owned && !entity.removing {
                let spec = RouteSpec {
                    table: key.0,
                    destination: key.1,
                    protocol: observed.protocol,
                    scope: None,
                    prefsrc: None,
                    nexthops: Vec::new(),
                };
                info!(route = %describe(key), "Deleting route");
                let result = self.kernel.route_delete(&spec).await;
                settle(result, &describe(key), "route_delete")?;
                entity.removing = true;
            }
        }

        if entity.is_empty() {
            state.entities.remove(key);
        }
        Ok(())
    }

    async fn apply_all(&self, state: &mut RouteState, keys: Vec<RouteKey>) -> anyhow::Result<()> {
        let mut result = Ok(());
        for key in keys {
            let next = self.apply(state, &key).await;
            first_error(&mut result, next);
        }
        result
    }

    async fn on_link_add(&self, add: InterfaceAdd) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.interfaces.insert(add.ifname.clone(), add.ifindex);
        let mut waiting = state.deps.release(&add.ifname);
        for (key, entity) in state.entities.iter_mut() {
            if entity.stalled.take().is_some() && !waiting.contains(key) {
                waiting.push(*key);
            }
        }
        self.apply_all(&mut state, waiting).await
    }

    async fn on_link_remove(&self, remove: InterfaceRemove) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.interfaces.get(&remove.ifname) != Some(&remove.ifindex) {
            return Ok(());
        }
        state.interfaces.remove(&remove.ifname);

        // Routes through the device go with it, with or without an event.
        let mut affected = Vec::new();
        for (key, entity) in state.entities.iter_mut() {
            let gone = entity.observed.as_ref().is_some_and(|o| o.uses(remove.ifindex));
            let names = entity.wanted().is_some_and(|c| {
                c.nexthops
                    .iter()
                    .any(|n| n.interface.as_deref() == Some(remove.ifname.as_str()))
            });
            if gone {
                entity.observed = None;
                entity.removing = false;
            }
            if gone || names {
                entity.memo.invalidate();
                affected.push(*key);
            }
        }
        self.apply_all(&mut state, affected).await
    }

    async fn on_route_add(&self, add: RouteAdd) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let key = (add.table, add.destination);
        let observed = ObservedRoute {
            protocol: add.protocol,
            scope: add.scope,
            prefsrc: add.prefsrc,
            nexthops: add.nexthops,
        };
        let entity = state.entities.entry(key).or_default();
        if entity.observed.as_ref() != Some(&observed) {
            entity.memo.invalidate();
        }
        entity.observed = Some(observed);
        entity.removing = false;

        let mut keys = vec![key];
        for (other, entity) in state.entities.iter_mut() {
            if other.0 != add.table || *other == key {
                continue;
            }
            if entity.unreachable.iter().any(|gw| add.destination.contains(*gw)) {
                debug!(route = %describe(other), covering = %add.destination, "Retrying route");
                entity.unreachable.clear();
                keys.push(*other);
            }
        }
        self.apply_all(&mut state, keys).await
    }

    async fn on_route_remove(&self, remove: RouteRemove) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let key = (remove.table, remove.destination);
        let Some(entity) = state.entities.get_mut(&key) else {
            return Ok(());
        };
        entity.observed = None;
        entity.removing = false;
        entity.memo.invalidate();

        self.apply(&mut state, &key).await
    }

    async fn set_lease(
        &self,
        state: &mut RouteState,
        interface: &str,
        routes: BTreeMap<RouteKey, RouteEntryConfig>,
    ) -> anyhow::Result<()> {
        let previous = state.leases.remove(interface).unwrap_or_default();
        let mut changed = Vec::new();

        for key in previous.iter().filter(|k| !routes.contains_key(*k)) {
            if let Some(entity) = state.entities.get_mut(key) {
                entity.dynamic = None;
                changed.push(*key);
            }
        }
        let keys: BTreeSet<RouteKey> = routes.keys().copied().collect();
        for (key, config) in routes {
            let entity = state.entities.entry(key).or_default();
            if entity.dynamic.as_ref() != Some(&config) {
                entity.dynamic = Some(config);
                entity.unreachable.clear();
                changed.push(key);
            }
        }
        if !keys.is_empty() {
            state.leases.insert(interface.to_string(), keys);
        }

        self.apply_all(state, changed).await
    }

    async fn on_lease(&self, lease: DhcpLease) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        info!(interface = %lease.interface, address = %lease.address, "Applying lease routes");
        self.set_lease(&mut state, &lease.interface, lease_routes(&lease)).await
    }

    async fn on_lease_reset(&self, interface: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        self.set_lease(&mut state, interface, BTreeMap::new()).await
    }

    async fn apply_config(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        let mut tables = BTreeMap::new();
        let mut declared = BTreeMap::new();
        for table in &tree.route.tables {
            table.validate()?;
            if tables.insert(table.id, table.name.clone()).is_some() {
                return Err(ConfigError::Duplicate {
                    kind: "route table",
                    key: table.id.to_string(),
                }
                .into());
            }
            for route in &table.routes {
                declared.insert((table.id, route.destination), route);
            }
        }

        let mut state = self.state.lock().await;
        state.tables = tables;

        let mut changed = BTreeSet::new();
        for (key, entity) in state.entities.iter_mut() {
            if entity.declared.is_some() && !declared.contains_key(key) {
                entity.declared = None;
                entity.unreachable.clear();
                changed.insert(*key);
            }
        }
        for (key, config) in declared {
            let entity = state.entities.entry(key).or_default();
            if entity.declared.as_ref() != Some(config) {
                entity.declared = Some(config.clone());
                entity.unreachable.clear();
                changed.insert(key);
            }
        }

        self.apply_all(&mut state, changed.into_iter().collect()).await
    }

    async fn list(&self) -> Vec<RouteStatusReport> {
        let state = self.state.lock().await;
        let name_of = |ifindex: u32| {
            state
                .interfaces
                .iter()
                .find(|(_, i)| **i == ifindex)
                .map(|(name, _)| name.clone())
        };

        state
            .entities
            .iter()
            .map(|(key, entity)| {
                let observed = entity.observed.as_ref();
                let wanted = entity.wanted();
                let interfaces_known = wanted.map_or(true, |c| {
                    c.nexthops
                        .iter()
                        .filter_map(|n| n.interface.as_ref())
                        .all(|name| state.interfaces.contains_key(name))
                });
                let nexthops = match (wanted, observed) {
                    (Some(config), _) => config
                        .nexthops
                        .iter()
                        .map(|n| NexthopReport {
                            gateway: n.gateway,
                            interface: n.interface.clone(),
                        })
                        .collect(),
                    (None, Some(observed)) => observed
                        .nexthops
                        .iter()
                        .map(|n| NexthopReport {
                            gateway: n.gateway,
                            interface: n.ifname.clone().or_else(|| n.ifindex.and_then(name_of)),
                        })
                        .collect(),
                    (None, None) => Vec::new(),
                };

                RouteStatusReport {
                    table: key.0,
                    destination: key.1,
                    origin: entity.intent().origin(),
                    status: ObjectStatus::for_route(interfaces_known, observed.is_some()),
                    protocol: observed.map(|o| o.protocol),
                    scope: wanted.and_then(|c| c.scope).or(observed.map(|o| o.scope)),
                    prefsrc: wanted.and_then(|c| c.prefsrc).or(observed.and_then(|o| o.prefsrc)),
                    nexthops,
                    waiting_on: state
                        .deps
                        .waiting_on(key)
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                }
            })
            .collect()
    }

    async fn tables(&self) -> Vec<RouteTableSummary> {
        let state = self.state.lock().await;
        let mut summary: BTreeMap<u32, RouteTableSummary> = state
            .tables
            .iter()
            .map(|(&id, name)| {
                let summary = RouteTableSummary {
                    id,
                    name: name.clone(),
                    routes: 0,
                    declared: true,
                };
                (id, summary)
            })
            .collect();

        for (table, _) in state.entities.keys() {
            summary
                .entry(*table)
                .or_insert_with(|| RouteTableSummary {
                    id: *table,
                    name: DEFAULT_TABLES
                        .iter()
                        .find(|(id, _)| id == table)
                        .map(|(_, name)| name.to_string()),
                    routes: 0,
                    declared: false,
                })
                .routes += 1;
        }
        summary.into_values().collect()
    }
}

#[async_trait]
impl EntityEvents for RouteInner {
    async fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::InterfaceAdd(add) => self.on_link_add(add).await,
            Event::InterfaceRemove(remove) => self.on_link_remove(remove).await,
            Event::RouteAdd(add) => self.on_route_add(add).await,
            Event::RouteRemove(remove) => self.on_route_remove(remove).await,
            Event::DhcpLeaseAcquired(lease) => self.on_lease(lease).await,
            Event::DhcpLeaseLost(reset) | Event::DhcpLeasePreinit(reset) => {
                self.on_lease_reset(&reset.interface).await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ConfigChangeHandler for RouteInner {
    fn name(&self) -> &str {
        "routes"
    }

    async fn on_config_changed(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        self.apply_config(tree).await
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Converges routing tables to the `route` configuration section and to
/// DHCPv4 leases.
pub struct RouteManager {
    inner: Arc<RouteInner>,
    store: Option<Arc<ConfigStore>>,
}

impl RouteManager {
    pub fn new(kernel: Arc<dyn Kernel>, protocol: u8) -> Self {
        Self {
            inner: Arc::new(RouteInner {
                kernel,
                protocol,
                state: Mutex::new(RouteState::default()),
            }),
            store: None,
        }
    }

    pub fn from_injector(injector: &Injector<'_>) -> anyhow::Result<Self> {
        let kernel: Arc<KernelProvider> = injector.get("kernel")?;
        let config: Arc<ConfigProvider> = injector.get("config")?;

        let mut manager = Self::new(kernel.kernel(), kernel.route_protocol());
        subscribe(
            &injector.hub(),
            "route-manager",
            &[
                EventKind::InterfaceAdd,
                EventKind::InterfaceRemove,
                EventKind::RouteAdd,
                EventKind::RouteRemove,
                EventKind::DhcpLeasePreinit,
                EventKind::DhcpLeaseAcquired,
                EventKind::DhcpLeaseLost,
            ],
            &manager.inner,
        );
        let store = config.store();
        store.add_init_handler(default_route_tables);
        store.add_change_handler(manager.inner.clone());
        manager.store = Some(store);
        Ok(manager)
    }

    pub async fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        self.inner.handle_event(event).await
    }

    pub async fn apply_config(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        self.inner.apply_config(tree).await
    }

    pub async fn list(&self) -> Vec<RouteStatusReport> {
        self.inner.list().await
    }

    pub async fn tables(&self) -> Vec<RouteTableSummary> {
        self.inner.tables().await
    }
}

#[async_trait]
impl Provider for RouteManager {
    async fn start(&self) -> anyhow::Result<()> {
        if let Some(store) = &self.store {
            let tree = store.get_running().await;
            if let Err(e) = self.inner.apply_config(&tree).await {
                error!(error = format!("{e:#}"), "Failed to apply route configuration");
            }
        }
        Ok(())
    }
}
