//! Address entities, keyed by (interface name, address).

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use routekeeper_events::{
    AddressAdd, AddressRemove, DhcpLease, Event, EventKind, InterfaceAdd, InterfaceRemove,
};
use routekeeper_networking::{IpInterface, Scope};
use routekeeper_reconcile::{Convergence, DependencyIndex, Intent, ObjectStatus, Origin};

use super::{first_error, settle, subscribe, EntityEvents, Outcome};
use crate::kernel::{AddressSpec, Kernel, KernelProvider};
use crate::runtime::{Injector, Provider};
use crate::store::{AddressConfig, ConfigChangeHandler, ConfigError, ConfigProvider, ConfigStore, ConfigTree};

type AddressKey = (String, IpInterface);

/// Externally visible state of one address entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressStatusReport {
    pub interface: String,
    pub address: IpInterface,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ifindex: Option<u32>,

    pub origin: Origin,
    pub status: ObjectStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedAddress {
    peer: Option<IpAddr>,
    scope: Scope,
    protocol: Option<u8>,
}

#[derive(Debug, Default)]
struct AddressEntity {
    declared: Option<AddressConfig>,

    /// Handed out by a DHCP lease.
    dynamic: bool,

    observed: Option<ObservedAddress>,
    memo: Convergence<AddressSpec>,

    /// A remove was issued and its event has not arrived yet.
    removing: bool,
}

impl AddressEntity {
    fn intent(&self) -> Intent<&AddressConfig, ()> {
        Intent::resolve(self.declared.as_ref(), self.dynamic.then_some(()))
    }

    fn is_empty(&self) -> bool {
        self.declared.is_none() && !self.dynamic && self.observed.is_none()
    }
}

#[derive(Debug, Default)]
struct AddressState {
    entities: BTreeMap<AddressKey, AddressEntity>,
    interfaces: BTreeMap<String, u32>,
    deps: DependencyIndex<AddressKey>,
}

impl AddressState {
    fn keys_on(&self, interface: &str) -> Vec<AddressKey> {
        self.entities
            .keys()
            .filter(|(name, _)| name == interface)
            .cloned()
            .collect()
    }
}

struct AddressInner {
    kernel: Arc<dyn Kernel>,
    protocol: u8,
    state: Mutex<AddressState>,
}

fn describe(key: &AddressKey) -> String {
    format!("{} on {}", key.1, key.0)
}

impl AddressInner {
    async fn apply(&self, state: &mut AddressState, key: &AddressKey) -> anyhow::Result<()> {
        state.deps.forget(key);
        let ifindex = state.interfaces.get(&key.0).copied();
        let Some(entity) = state.entities.get_mut(key) else {
            return Ok(());
        };

        let wanted = match entity.intent() {
            Intent::Declared(config) => Some((config.peer, false)),
            Intent::Dynamic(()) => Some((None, true)),
            Intent::None => None,
        };

        let Some((peer, noprefixroute)) = wanted else {
            self.withdraw(entity, key, ifindex).await?;
            if entity.is_empty() {
                state.entities.remove(key);
            }
            return Ok(());
        };

        let Some(ifindex) = ifindex else {
            debug!(address = %key.1, interface = %key.0, "Address waits for its interface");
            state.deps.wait(&key.0, key.clone());
            return Ok(());
        };

        let target = AddressSpec {
            ifindex,
            address: key.1,
            peer,
            noprefixroute,
            protocol: self.protocol,
        };
        // An address being removed is as good as gone.
        let projection = match &entity.observed {
            Some(observed) if !entity.removing => Some(AddressSpec {
                peer: observed.peer,
                ..target.clone()
            }),
            _ => None,
        };
        if !entity.memo.needs_apply(&target, projection.as_ref()) {
            return Ok(());
        }

        // A different peer is a different kernel object.
        if let Some(stale) = projection {
            let result = self.kernel.address_remove(&stale).await;
            settle(result, &describe(key), "address_remove")?;
        }

        info!(address = %key.1, interface = %key.0, ifindex, "Adding address");
        let result = self.kernel.address_add(&target).await;
        match settle(result, &describe(key), "address_add")? {
            Outcome::Applied => {
                entity.memo.record(target);
                entity.removing = false;
            }
            Outcome::Vanished => {
                entity.memo.invalidate();
                state.interfaces.remove(&key.0);
                state.deps.wait(&key.0, key.clone());
            }
        }
        Ok(())
    }

    /// Remove an address nobody wants any more, if the agent put it there.
    async fn withdraw(
        &self,
        entity: &mut AddressEntity,
        key: &AddressKey,
        ifindex: Option<u32>,
    ) -> anyhow::Result<()> {
        let owned = entity.memo.applied().is_some()
            || entity.observed.as_ref().and_then(|o| o.protocol) == Some(self.protocol);
        entity.memo.invalidate();

        let (Some(observed), Some(ifindex)) = (&entity.observed, ifindex) else {
            return Ok(());
        };
        if !owned || entity.removing {
            return Ok(());
        }

        let spec = AddressSpec {
            ifindex,
            address: key.1,
            peer: observed.peer,
            noprefixroute: false,
            protocol: self.protocol,
        };
        info!(address = %key.1, interface = %key.0, ifindex, "Removing address");
        let result = self.kernel.address_remove(&spec).await;
        settle(result, &describe(key), "address_remove")?;
        entity.removing = true;
        Ok(())
    }

    async fn apply_all(&self, state: &mut AddressState, keys: Vec<AddressKey>) -> anyhow::Result<()> {
        let mut result = Ok(());
        for key in keys {
            let next = self.apply(state, &key).await;
            first_error(&mut result, next);
        }
        result
    }

    async fn on_link_add(&self, add: InterfaceAdd) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let previous = state.interfaces.insert(add.ifname.clone(), add.ifindex);
        let mut waiting = state.deps.release(&add.ifname);
        if previous.is_some_and(|i| i != add.ifindex) {
            for key in state.keys_on(&add.ifname) {
                if let Some(entity) = state.entities.get_mut(&key) {
                    entity.memo.invalidate();
                }
                if !waiting.contains(&key) {
                    waiting.push(key);
                }
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

        // The kernel drops every address along with the device.
        let keys = state.keys_on(&remove.ifname);
        for key in &keys {
            if let Some(entity) = state.entities.get_mut(key) {
                entity.observed = None;
                entity.removing = false;
                entity.memo.invalidate();
            }
        }
        self.apply_all(&mut state, keys).await
    }

    async fn on_address_add(&self, add: AddressAdd) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.interfaces.entry(add.ifname.clone()).or_insert(add.ifindex);

        let key = (add.ifname, add.address);
        let observed = ObservedAddress {
            peer: add.peer,
            scope: add.scope,
            protocol: add.protocol,
        };
        let entity = state.entities.entry(key.clone()).or_default();
        if entity.observed.as_ref() != Some(&observed) {
            entity.memo.invalidate();
        }
        entity.observed = Some(observed);
        entity.removing = false;

        self.apply(&mut state, &key).await
    }

    async fn on_address_remove(&self, remove: AddressRemove) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let key = (remove.ifname, remove.address);
        let Some(entity) = state.entities.get_mut(&key) else {
            return Ok(());
        };
        entity.observed = None;
        entity.removing = false;
        entity.memo.invalidate();

        self.apply(&mut state, &key).await
    }

    async fn on_lease(&self, lease: DhcpLease) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let mut changed = Vec::new();
        for key in state.keys_on(&lease.interface) {
            if key.1 == lease.address {
                continue;
            }
            if let Some(entity) = state.entities.get_mut(&key) {
                if entity.dynamic {
                    entity.dynamic = false;
                    changed.push(key);
                }
            }
        }

        let key = (lease.interface, lease.address);
        let entity = state.entities.entry(key.clone()).or_default();
        if !entity.dynamic {
            entity.dynamic = true;
            changed.push(key);
        }
        self.apply_all(&mut state, changed).await
    }

    async fn on_lease_reset(&self, interface: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let mut changed = Vec::new();
        for key in state.keys_on(interface) {
            if let Some(entity) = state.entities.get_mut(&key) {
                if entity.dynamic {
                    entity.dynamic = false;
                    changed.push(key);
                }
            }
        }
        self.apply_all(&mut state, changed).await
    }

    async fn apply_config(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        let mut declared = BTreeMap::new();
        for address in &tree.addresses {
            address.validate()?;
            if declared.insert(address.key(), address).is_some() {
                return Err(ConfigError::Duplicate {
                    kind: "address",
                    key: describe(&address.key()),
                }
                .into());
            }
        }

        let mut state = self.state.lock().await;
        let mut changed = BTreeSet::new();
        for (key, entity) in state.entities.iter_mut() {
            if entity.declared.is_some() && !declared.contains_key(key) {
                entity.declared = None;
                changed.insert(key.clone());
            }
        }
        for (key, config) in declared {
            let entity = state.entities.entry(key.clone()).or_default();
            if entity.declared.as_ref() != Some(config) {
                entity.declared = Some(config.clone());
                changed.insert(key);
            }
        }

        self.apply_all(&mut state, changed.into_iter().collect()).await
    }

    async fn list(&self) -> Vec<AddressStatusReport> {
        let state = self.state.lock().await;
        state
            .entities
            .iter()
            .map(|((interface, address), entity)| {
                let ifindex = state.interfaces.get(interface).copied();
                let observed = entity.observed.as_ref();
                AddressStatusReport {
                    interface: interface.clone(),
                    address: *address,
                    peer: entity
                        .declared
                        .as_ref()
                        .and_then(|c| c.peer)
                        .or_else(|| observed.and_then(|o| o.peer)),
                    ifindex,
                    origin: entity.intent().origin(),
                    status: ObjectStatus::for_address(ifindex.is_some(), observed.is_some()),
                    scope: observed.map(|o| o.scope),
                    protocol: observed.and_then(|o| o.protocol),
                }
            })
            .collect()
    }
}

#[async_trait]
impl EntityEvents for AddressInner {
    async fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::InterfaceAdd(add) => self.on_link_add(add).await,
            Event::InterfaceRemove(remove) => self.on_link_remove(remove).await,
            Event::AddressAdd(add) => self.on_address_add(add).await,
            Event::AddressRemove(remove) => self.on_address_remove(remove).await,
            Event::DhcpLeaseAcquired(lease) => self.on_lease(lease).await,
            Event::DhcpLeaseLost(reset) | Event::DhcpLeasePreinit(reset) => {
                self.on_lease_reset(&reset.interface).await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ConfigChangeHandler for AddressInner {
    fn name(&self) -> &str {
        "addresses"
    }

    async fn on_config_changed(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        self.apply_config(tree).await
    }
}

/// Converges interface addresses to the `addresses` configuration section
/// and to DHCPv4 leases.
pub struct AddressManager {
    inner: Arc<AddressInner>,
    store: Option<Arc<ConfigStore>>,
}

impl AddressManager {
    pub fn new(kernel: Arc<dyn Kernel>, protocol: u8) -> Self {
        Self {
            inner: Arc::new(AddressInner {
                kernel,
                protocol,
                state: Mutex::new(AddressState::default()),
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
            "address-manager",
            &[
                EventKind::InterfaceAdd,
                EventKind::InterfaceRemove,
                EventKind::AddressAdd,
                EventKind::AddressRemove,
                EventKind::DhcpLeasePreinit,
                EventKind::DhcpLeaseAcquired,
                EventKind::DhcpLeaseLost,
            ],
            &manager.inner,
        );
        let store = config.store();
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

    pub async fn list(&self) -> Vec<AddressStatusReport> {
        self.inner.list().await
    }
}

#[async_trait]
impl Provider for AddressManager {
    async fn start(&self) -> anyhow::Result<()> {
        if let Some(store) = &self.store {
            let tree = store.get_running().await;
            if let Err(e) = self.inner.apply_config(&tree).await {
                error!(error = format!("{e:#}"), "Failed to apply address configuration");
            }
        }
        Ok(())
    }
}
