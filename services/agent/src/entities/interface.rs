//! Interface entities.
//!
//! Physical interfaces (ethernet, loopback) are configured in place and
//! reset when their configuration goes away: addresses carrying the owned
//! protocol tag are flushed and the link parameters the agent changed are
//! restored to what was first observed. Virtual interfaces are created and
//! deleted by the agent; a changed kind or parent means delete, then
//! create again once the removal is reported.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use routekeeper_events::{Event, EventKind, InterfaceAdd, InterfaceRemove, LinkAttributes};
use routekeeper_networking::normalize_lladdr;
use routekeeper_reconcile::{check_acyclic, Convergence, DependencyIndex, ObjectStatus, Origin};

use super::{first_error, settle, subscribe, EntityEvents, Outcome};
use crate::kernel::{Kernel, KernelProvider, LinkKindSpec, LinkParams, LinkSpec};
use crate::runtime::{Injector, Provider};
use crate::store::{ConfigChangeHandler, ConfigProvider, ConfigStore, ConfigTree, InterfaceConfig, InterfaceKind};

/// Externally visible state of one interface entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStatusReport {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ifindex: Option<u32>,

    pub origin: Origin,
    pub status: ObjectStatus,

    #[serde(default)]
    pub disabled: bool,

    /// Interfaces this one waits for before it can be configured.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting_on: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<LinkAttributes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedLink {
    ifindex: u32,
    kind: Option<String>,
    attributes: LinkAttributes,
}

#[derive(Debug, Default)]
struct InterfaceEntity {
    declared: Option<InterfaceConfig>,
    observed: Option<ObservedLink>,

    /// Link parameters as first observed.
    initial: Option<LinkParams>,

    /// Kind the agent last managed the interface as.
    managed: Option<InterfaceKind>,

    /// Last link parameter target; its fields are the ones reset restores.
    target: Option<LinkParams>,

    link: Convergence<LinkParams>,
    create: Convergence<LinkSpec>,

    /// Deleted so that it can be created with a new kind or parent.
    recreating: bool,

    /// Created by the agent, then withdrawn before the kernel reported it.
    pending_delete: bool,
}

impl InterfaceEntity {
    fn desired(&self) -> Option<&InterfaceConfig> {
        self.declared.as_ref().filter(|c| !c.disable)
    }

    fn ifindex(&self) -> Option<u32> {
        self.observed.as_ref().map(|o| o.ifindex)
    }

    fn is_empty(&self) -> bool {
        self.declared.is_none() && self.observed.is_none() && !self.pending_delete
    }
}

#[derive(Debug, Default)]
struct InterfaceState {
    entities: BTreeMap<String, InterfaceEntity>,
    deps: DependencyIndex<String>,
}

impl InterfaceState {
    fn ifindex(&self, name: &str) -> Option<u32> {
        self.entities.get(name).and_then(InterfaceEntity::ifindex)
    }
}

struct InterfaceInner {
    kernel: Arc<dyn Kernel>,
    protocol: u8,
    state: Mutex<InterfaceState>,
}

// =============================================================================
// Targets
// =============================================================================

fn link_params(
    config: &InterfaceConfig,
    resolved: &HashMap<String, u32>,
    previous: Option<&LinkParams>,
) -> LinkParams {
    let master = match &config.link.master {
        Some(master) => resolved.get(master).copied(),
        // Release a master set earlier.
        None => previous
            .and_then(|p| p.master)
            .filter(|&m| m != 0)
            .map(|_| 0),
    };

    LinkParams {
        up: Some(true),
        noarp: config.link.noarp,
        mtu: config.link.mtu,
        txqueuelen: config.link.txqueuelen,
        address: config.link.address.as_deref().map(normalize_lladdr),
        broadcast: config.link.broadcast.as_deref().map(normalize_lladdr),
        master,
        addrgenmode: config.link.addrgenmode.clone(),
        token: config.link.token.clone(),
    }
}

fn link_spec(config: &InterfaceConfig, resolved: &HashMap<String, u32>) -> anyhow::Result<LinkSpec> {
    let index = |name: &str| {
        resolved
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("{}: {name} is not resolved", config.name))
    };

    let kind = match config.kind {
        InterfaceKind::Bridge => LinkKindSpec::Bridge {
            stp: config.bridge.as_ref().is_some_and(|b| b.stp),
        },
        InterfaceKind::Vlan => {
            let vlan = config
                .vlan
                .as_ref()
                .ok_or_else(|| anyhow!("{}: vlan block missing", config.name))?;
            LinkKindSpec::Vlan {
                trunk: index(&vlan.trunk)?,
                id: vlan.id,
            }
        }
        InterfaceKind::Vxlan => {
            let vxlan = config
                .vxlan
                .as_ref()
                .ok_or_else(|| anyhow!("{}: vxlan block missing", config.name))?;
            LinkKindSpec::Vxlan {
                vni: vxlan.vni,
                underlay: vxlan.interface.as_deref().map(index).transpose()?,
                local: vxlan.local,
                remote: vxlan.remote,
                group: vxlan.group,
                port: vxlan.port,
                ttl: vxlan.ttl,
            }
        }
        InterfaceKind::Sit => {
            let sit = config.sit.clone().unwrap_or_default();
            LinkKindSpec::Sit {
                local: sit.local,
                remote: sit.remote,
                ttl: sit.ttl,
            }
        }
        InterfaceKind::Ethernet | InterfaceKind::Loopback => {
            anyhow::bail!("{}: {} interfaces cannot be created", config.name, config.kind.as_str())
        }
    };

    Ok(LinkSpec {
        name: config.name.clone(),
        kind,
    })
}

/// Whether the existing link must be deleted to become `spec`.
fn needs_recreate(observed: &ObservedLink, spec: &LinkSpec) -> bool {
    let Some(kind) = observed.kind.as_deref() else {
        // Not a virtual link at all; never delete it.
        return false;
    };
    if kind != spec.kind.kind() {
        return true;
    }
    let parent = observed.attributes.link;
    match &spec.kind {
        LinkKindSpec::Vlan { trunk, .. } => parent.is_some_and(|p| p != *trunk),
        LinkKindSpec::Vxlan {
            underlay: Some(underlay),
            ..
        } => parent.is_some_and(|p| p != *underlay),
        _ => false,
    }
}

/// The trunk or underlay went away under a create; forget its index and
/// wait for it to come back.
fn park_on_parents(state: &mut InterfaceState, name: &str, config: &InterfaceConfig) {
    let master = config.link.master.as_deref();
    for parent in config.dependencies().into_iter().filter(|d| Some(*d) != master) {
        warn!(ifname = name, dependency = parent, "Parent vanished, waiting for it to return");
        if let Some(entity) = state.entities.get_mut(parent) {
            entity.observed = None;
            entity.link.invalidate();
        }
        state.deps.wait(parent, name.to_string());
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

impl InterfaceInner {
    async fn apply(&self, state: &mut InterfaceState, name: &str) -> anyhow::Result<()> {
        state.deps.forget(&name.to_string());
        let Some(entity) = state.entities.get(name) else {
            return Ok(());
        };

        match entity.desired().cloned() {
            Some(config) => self.converge(state, name, config).await,
            None => self.reset(state, name).await,
        }
    }

    async fn converge(
        &self,
        state: &mut InterfaceState,
        name: &str,
        config: InterfaceConfig,
    ) -> anyhow::Result<()> {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();
        for dependency in config.dependencies() {
            match state.ifindex(dependency) {
                Some(ifindex) => {
                    resolved.insert(dependency.to_string(), ifindex);
                }
                None => missing.push(dependency.to_string()),
            }
        }
        if !missing.is_empty() {
            debug!(ifname = name, waiting_on = ?missing, "Interface waits for dependencies");
            for dependency in missing {
                state.deps.wait(&dependency, name.to_string());
            }
            return Ok(());
        }

        let Some(entity) = state.entities.get_mut(name) else {
            return Ok(());
        };
        entity.managed = Some(config.kind);
        entity.pending_delete = false;

        if config.kind.is_virtual() {
            let spec = link_spec(&config, &resolved)?;
            match &entity.observed {
                None => {
                    if entity.create.needs_apply(&spec, None) {
                        info!(ifname = name, kind = spec.kind.kind(), "Creating interface");
                        let result = self.kernel.link_add(&spec).await;
                        match settle(result, &name, "link_add")? {
                            Outcome::Applied => entity.create.record(spec),
                            Outcome::Vanished => park_on_parents(state, name, &config),
                        }
                    }
                    return Ok(());
                }
                Some(observed) if needs_recreate(observed, &spec) => {
                    if !entity.recreating {
                        info!(ifname = name, kind = spec.kind.kind(), "Recreating interface");
                        let result = self.kernel.link_delete(observed.ifindex).await;
                        match settle(result, &name, "link_delete")? {
                            Outcome::Applied => entity.recreating = true,
                            Outcome::Vanished => entity.observed = None,
                        }
                    }
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let Some(observed) = &entity.observed else {
            debug!(ifname = name, "Interface not present yet");
            return Ok(());
        };
        let ifindex = observed.ifindex;
        let target = link_params(&config, &resolved, entity.target.as_ref());
        let projection = LinkParams::observed(&observed.attributes).restricted_to(&target);
        entity.target = Some(target.clone());

        if entity.link.needs_apply(&target, Some(&projection)) {
            debug!(ifname = name, ifindex, "Setting link parameters");
            let result = self.kernel.link_set(ifindex, &target).await;
            match settle(result, &name, "link_set")? {
                Outcome::Applied => entity.link.record(target),
                Outcome::Vanished => {
                    entity.observed = None;
                    entity.link.invalidate();
                }
            }
        }
        Ok(())
    }

    async fn reset(&self, state: &mut InterfaceState, name: &str) -> anyhow::Result<()> {
        let Some(entity) = state.entities.get_mut(name) else {
            return Ok(());
        };

        let managed = entity.managed.take();
        let target = entity.target.take();
        // Created but not reported yet: delete once the kernel shows it.
        if entity.observed.is_none() && entity.create.applied().is_some() {
            entity.pending_delete = true;
        }
        entity.link.invalidate();
        entity.create.invalidate();

        let delete = entity.pending_delete || managed.is_some_and(InterfaceKind::is_virtual);
        let observed = entity.observed.as_ref().filter(|_| delete || managed.is_some());
        if let Some(observed) = observed {
            let ifindex = observed.ifindex;
            if delete {
                info!(ifname = name, "Deleting interface");
                let result = self.kernel.link_delete(ifindex).await;
                settle(result, &name, "link_delete")?;
                entity.pending_delete = false;
            } else {
                info!(ifname = name, "Resetting interface");
                let result = self.kernel.address_flush(ifindex, self.protocol).await;
                if settle(result, &name, "address_flush")? == Outcome::Applied {
                    let restore = match (&entity.initial, &target) {
                        (Some(initial), Some(target)) => initial.restricted_to(target),
                        _ => LinkParams::default(),
                    };
                    let projection =
                        LinkParams::observed(&observed.attributes).restricted_to(&restore);
                    if !restore.is_empty() && restore != projection {
                        let result = self.kernel.link_set(ifindex, &restore).await;
                        settle(result, &name, "link_set")?;
                    }
                }
            }
        }

        if entity.is_empty() {
            state.entities.remove(name);
        }
        Ok(())
    }

    /// Apply `name`, then everything that was waiting for it.
    async fn apply_with_dependents(&self, state: &mut InterfaceState, name: &str) -> anyhow::Result<()> {
        let mut result = self.apply(state, name).await;
        if state.ifindex(name).is_some() {
            for waiting in state.deps.release(name) {
                let next = self.apply(state, &waiting).await;
                first_error(&mut result, next);
            }
        }
        result
    }

    async fn on_link_add(&self, add: InterfaceAdd) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let entity = state.entities.entry(add.ifname.clone()).or_default();

        let observed = ObservedLink {
            ifindex: add.ifindex,
            kind: add.kind,
            attributes: add.attributes,
        };
        if entity.observed.as_ref() != Some(&observed) {
            entity.link.invalidate();
        }
        if entity.ifindex() != Some(observed.ifindex) {
            entity.recreating = false;
        }
        if entity.initial.is_none() {
            entity.initial = Some(LinkParams::observed(&observed.attributes));
        }
        entity.observed = Some(observed);

        self.apply_with_dependents(&mut state, &add.ifname).await
    }

    async fn on_link_remove(&self, remove: InterfaceRemove) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some(entity) = state.entities.get_mut(&remove.ifname) else {
            return Ok(());
        };
        if entity.ifindex().is_some_and(|i| i != remove.ifindex) {
            debug!(ifname = %remove.ifname, ifindex = remove.ifindex, "Ignoring stale removal");
            return Ok(());
        }

        entity.observed = None;
        entity.recreating = false;
        entity.link.invalidate();
        entity.create.invalidate();

        self.apply(&mut state, &remove.ifname).await
    }

    async fn apply_config(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        let mut edges = BTreeMap::new();
        for interface in &tree.interfaces {
            interface.validate()?;
            let deps = interface.dependencies().into_iter().map(str::to_string).collect();
            if edges.insert(interface.name.clone(), deps).is_some() {
                anyhow::bail!("duplicate interface {}", interface.name);
            }
        }
        check_acyclic(&edges)?;

        let mut state = self.state.lock().await;
        let mut changed = Vec::new();

        for (name, entity) in state.entities.iter_mut() {
            if entity.declared.is_some() && tree.interface(name).is_none() {
                entity.declared = None;
                changed.push(name.clone());
            }
        }
        for config in &tree.interfaces {
            let entity = state.entities.entry(config.name.clone()).or_default();
            if entity.declared.as_ref() != Some(config) {
                entity.declared = Some(config.clone());
                changed.push(config.name.clone());
            }
        }

        let mut result = Ok(());
        for name in changed {
            let next = self.apply_with_dependents(&mut state, &name).await;
            first_error(&mut result, next);
        }
        result
    }

    async fn list(&self) -> Vec<InterfaceStatusReport> {
        let state = self.state.lock().await;
        state
            .entities
            .iter()
            .map(|(name, entity)| {
                let observed = entity.observed.as_ref();
                InterfaceStatusReport {
                    name: name.clone(),
                    kind: entity
                        .declared
                        .as_ref()
                        .map(|c| c.kind.as_str().to_string())
                        .or_else(|| observed.and_then(|o| o.kind.clone())),
                    ifindex: entity.ifindex(),
                    origin: if entity.declared.is_some() {
                        Origin::Declared
                    } else {
                        Origin::Observed
                    },
                    status: if observed.is_some() {
                        ObjectStatus::Present
                    } else {
                        ObjectStatus::InterfaceMissing
                    },
                    disabled: entity.declared.as_ref().is_some_and(|c| c.disable),
                    waiting_on: state
                        .deps
                        .waiting_on(name)
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    attributes: observed.map(|o| o.attributes.clone()),
                }
            })
            .collect()
    }
}

#[async_trait]
impl EntityEvents for InterfaceInner {
    async fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::InterfaceAdd(add) => self.on_link_add(add).await,
            Event::InterfaceRemove(remove) => self.on_link_remove(remove).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ConfigChangeHandler for InterfaceInner {
    fn name(&self) -> &str {
        "interfaces"
    }

    async fn on_config_changed(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        self.apply_config(tree).await
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Converges interfaces to the `interfaces` configuration section.
pub struct InterfaceManager {
    inner: Arc<InterfaceInner>,
    store: Option<Arc<ConfigStore>>,
}

impl InterfaceManager {
    /// A manager not attached to a runtime or store.
    pub fn new(kernel: Arc<dyn Kernel>, protocol: u8) -> Self {
        Self {
            inner: Arc::new(InterfaceInner {
                kernel,
                protocol,
                state: Mutex::new(InterfaceState::default()),
            }),
            store: None,
        }
    }

    /// Constructor used by the runtime; depends on `KernelProvider` as
    /// `kernel` and `ConfigProvider` as `config`.
    pub fn from_injector(injector: &Injector<'_>) -> anyhow::Result<Self> {
        let kernel: Arc<KernelProvider> = injector.get("kernel")?;
        let config: Arc<ConfigProvider> = injector.get("config")?;

        let mut manager = Self::new(kernel.kernel(), kernel.route_protocol());
        subscribe(
            &injector.hub(),
            "interface-manager",
            &[EventKind::InterfaceAdd, EventKind::InterfaceRemove],
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

    /// Converge to the interface section of `tree`.
    pub async fn apply_config(&self, tree: &ConfigTree) -> anyhow::Result<()> {
        self.inner.apply_config(tree).await
    }

    pub async fn list(&self) -> Vec<InterfaceStatusReport> {
        self.inner.list().await
    }

    /// Current index of the interface called `name`.
    pub async fn ifindex(&self, name: &str) -> Option<u32> {
        self.inner.state.lock().await.ifindex(name)
    }
}

#[async_trait]
impl Provider for InterfaceManager {
    async fn start(&self) -> anyhow::Result<()> {
        if let Some(store) = &self.store {
            let tree = store.get_running().await;
            if let Err(e) = self.inner.apply_config(&tree).await {
                error!(error = format!("{e:#}"), "Failed to apply interface configuration");
            }
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let state = self.inner.state.lock().await;
        if !state.deps.is_empty() {
            warn!(waiting = state.deps.len(), "Stopping with interfaces still waiting");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelCall, KernelError, RecordingKernel};
    use crate::store::VlanConfig;

    fn add(ifindex: u32, name: &str, kind: Option<&str>) -> Event {
        Event::InterfaceAdd(InterfaceAdd {
            ifindex,
            ifname: name.to_string(),
            kind: kind.map(str::to_string),
            attributes: LinkAttributes {
                mtu: Some(1500),
                ..Default::default()
            },
        })
    }

    fn remove(ifindex: u32, name: &str) -> Event {
        Event::InterfaceRemove(InterfaceRemove {
            ifindex,
            ifname: name.to_string(),
        })
    }

    fn vlan(name: &str, trunk: &str, id: u16) -> InterfaceConfig {
        let mut config = InterfaceConfig::new(name, InterfaceKind::Vlan);
        config.vlan = Some(VlanConfig {
            trunk: trunk.to_string(),
            id,
        });
        config
    }

    fn setup() -> (Arc<RecordingKernel>, InterfaceManager) {
        let kernel = Arc::new(RecordingKernel::new());
        let manager = InterfaceManager::new(kernel.clone(), 52);
        (kernel, manager)
    }

    #[tokio::test]
    async fn test_vlan_waits_for_trunk() {
        let (kernel, manager) = setup();
        let mut tree = ConfigTree::new();
        tree.interfaces.push(vlan("eth0.10", "eth0", 10));

        manager.apply_config(&tree).await.unwrap();
        assert!(kernel.calls().is_empty());
        assert_eq!(manager.list().await[0].waiting_on, vec!["eth0"]);

        manager.handle_event(add(2, "eth0", None)).await.unwrap();
        assert_eq!(
            kernel.take_calls(),
            vec![KernelCall::LinkAdd(LinkSpec {
                name: "eth0.10".to_string(),
                kind: LinkKindSpec::Vlan { trunk: 2, id: 10 },
            })]
        );

        // The trunk's own link events must not create it again.
        manager.handle_event(add(2, "eth0", None)).await.unwrap();
        assert!(kernel.calls().is_empty());

        manager.handle_event(add(5, "eth0.10", Some("vlan"))).await.unwrap();
        let calls = kernel.take_calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], KernelCall::LinkSet { ifindex: 5, params } if params.up == Some(true)));
    }

    #[tokio::test]
    async fn test_physical_reset_restores_initial_params() {
        let (kernel, manager) = setup();
        manager.handle_event(add(2, "eth0", None)).await.unwrap();

        let mut tree = ConfigTree::new();
        let mut eth0 = InterfaceConfig::new("eth0", InterfaceKind::Ethernet);
        eth0.link.mtu = Some(9000);
        tree.interfaces.push(eth0);
        manager.apply_config(&tree).await.unwrap();
        assert_eq!(kernel.take_calls().len(), 1);

        // The kernel reports the change; already converged.
        let mut changed = add(2, "eth0", None);
        if let Event::InterfaceAdd(add) = &mut changed {
            add.attributes.mtu = Some(9000);
            add.attributes.up = true;
        }
        manager.handle_event(changed).await.unwrap();
        assert!(kernel.calls().is_empty());

        manager.apply_config(&ConfigTree::new()).await.unwrap();
        let calls = kernel.take_calls();
        assert_eq!(calls[0], KernelCall::AddressFlush { ifindex: 2, protocol: 52 });
        let KernelCall::LinkSet { params, .. } = &calls[1] else {
            panic!("expected link set");
        };
        assert_eq!(params.mtu, Some(1500));
        assert_eq!(params.up, Some(false));
    }

    #[tokio::test]
    async fn test_vanished_interface_defers() {
        let (kernel, manager) = setup();
        manager.handle_event(add(2, "eth0", None)).await.unwrap();
        kernel.fail_next("link_set", KernelError::NoDevice);

        let mut tree = ConfigTree::new();
        tree.interfaces.push(InterfaceConfig::new("eth0", InterfaceKind::Ethernet));
        manager.apply_config(&tree).await.unwrap();

        let report = &manager.list().await[0];
        assert_eq!(report.status, ObjectStatus::InterfaceMissing);
        assert_eq!(report.ifindex, None);
    }

    #[tokio::test]
    async fn test_dependency_cycle_is_rejected() {
        let (kernel, manager) = setup();
        let mut a = InterfaceConfig::new("br0", InterfaceKind::Bridge);
        a.link.master = Some("br1".to_string());
        let mut b = InterfaceConfig::new("br1", InterfaceKind::Bridge);
        b.link.master = Some("br0".to_string());

        let mut tree = ConfigTree::new();
        tree.interfaces = vec![a, b];
        assert!(manager.apply_config(&tree).await.is_err());
        assert!(kernel.calls().is_empty());
    }

    #[tokio::test]
    async fn test_trunk_change_recreates() {
        let (kernel, manager) = setup();
        manager.handle_event(add(2, "eth0", None)).await.unwrap();
        manager.handle_event(add(3, "eth1", None)).await.unwrap();

        let mut tree = ConfigTree::new();
        tree.interfaces.push(vlan("vlan10", "eth0", 10));
        manager.apply_config(&tree).await.unwrap();
        let mut event = add(5, "vlan10", Some("vlan"));
        if let Event::InterfaceAdd(add) = &mut event {
            add.attributes.link = Some(2);
        }
        manager.handle_event(event).await.unwrap();
        kernel.take_calls();

        tree.interfaces = vec![vlan("vlan10", "eth1", 10)];
        manager.apply_config(&tree).await.unwrap();
        assert_eq!(kernel.take_calls(), vec![KernelCall::LinkDelete { ifindex: 5 }]);

        manager.handle_event(remove(5, "vlan10")).await.unwrap();
        assert_eq!(
            kernel.take_calls(),
            vec![KernelCall::LinkAdd(LinkSpec {
                name: "vlan10".to_string(),
                kind: LinkKindSpec::Vlan { trunk: 3, id: 10 },
            })]
        );
    }

    #[tokio::test]
    async fn test_vlan_waits_again_when_trunk_vanishes_during_create() {
        let (kernel, manager) = setup();
        manager.handle_event(add(2, "eth0", None)).await.unwrap();
        kernel.fail_next("link_add", KernelError::NoDevice);

        let mut tree = ConfigTree::new();
        tree.interfaces.push(vlan("eth0.10", "eth0", 10));
        manager.apply_config(&tree).await.unwrap();
        assert_eq!(kernel.take_calls().len(), 1);
        let report = manager
            .list()
            .await
            .into_iter()
            .find(|r| r.name == "eth0.10")
            .unwrap();
        assert_eq!(report.waiting_on, vec!["eth0"]);

        manager.handle_event(remove(2, "eth0")).await.unwrap();
        assert!(kernel.calls().is_empty());

        manager.handle_event(add(7, "eth0", None)).await.unwrap();
        assert_eq!(
            kernel.take_calls(),
            vec![KernelCall::LinkAdd(LinkSpec {
                name: "eth0.10".to_string(),
                kind: LinkKindSpec::Vlan { trunk: 7, id: 10 },
            })]
        );
    }

    #[tokio::test]
    async fn test_withdrawn_bridge_is_deleted_once_reported() {
        let (kernel, manager) = setup();
        let mut tree = ConfigTree::new();
        tree.interfaces.push(InterfaceConfig::new("br0", InterfaceKind::Bridge));
        manager.apply_config(&tree).await.unwrap();
        assert_eq!(kernel.calls_of("link_add").len(), 1);
        kernel.take_calls();

        // Withdrawn before the kernel reported the new link.
        manager.apply_config(&ConfigTree::new()).await.unwrap();
        assert!(kernel.calls().is_empty());

        manager.handle_event(add(9, "br0", Some("bridge"))).await.unwrap();
        assert_eq!(kernel.take_calls(), vec![KernelCall::LinkDelete { ifindex: 9 }]);

        manager.handle_event(remove(9, "br0")).await.unwrap();
        assert!(kernel.calls().is_empty());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_existing_link_counts_as_created() {
        let (kernel, manager) = setup();
        kernel.fail_next("link_add", KernelError::Exists);

        let mut tree = ConfigTree::new();
        tree.interfaces.push(InterfaceConfig::new("br0", InterfaceKind::Bridge));
        manager.apply_config(&tree).await.unwrap();
        assert_eq!(kernel.take_calls().len(), 1);

        // Recorded as created: a changed config does not create it again.
        let mut changed = ConfigTree::new();
        let mut br0 = InterfaceConfig::new("br0", InterfaceKind::Bridge);
        br0.link.mtu = Some(9000);
        changed.interfaces.push(br0);
        manager.apply_config(&changed).await.unwrap();
        assert!(kernel.calls().is_empty());
    }
}
