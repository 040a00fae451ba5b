//! Provider runtime.
//!
//! Loads registered providers in dependency order, runs their lifecycle
//! hooks and owns the dispatch loop that drains the event bus:
//!
//! ```text
//! register* -> load -> start -> run (until shutdown) -> stop
//! UNLOADED     LOADED   RUNNING                         STOPPED
//! ```
//!
//! Every drained event is dispatched on its own task; tasks are tracked so
//! that `stop` can cancel them before any stop hook runs.

mod hub;
mod provider;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::{self, BusError, EventBus};

pub use hub::{EventHub, SubscriptionId};
pub use provider::{Dependency, Injector, Provider, ProviderId, Registration};

use provider::Loaded;

// =============================================================================
// Errors
// =============================================================================

/// Runtime lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Unloaded,
    Loaded,
    Running,
    Stopped,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeState::Unloaded => "unloaded",
            RuntimeState::Loaded => "loaded",
            RuntimeState::Running => "running",
            RuntimeState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Errors from the provider runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Providers that depend on each other and can never be constructed.
    #[error("dependency loop between providers: {}", .0.join(", "))]
    DependencyLoop(Vec<String>),

    /// A provider depends on one that was never registered.
    #[error("provider {provider} depends on unregistered provider {dependency}")]
    DependencyMissing { provider: String, dependency: String },

    /// The same provider was registered twice.
    #[error("provider {0} is already registered")]
    DuplicateProvider(String),

    /// Operation not valid in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: RuntimeState,
    },

    /// `run` was called a second time.
    #[error("dispatch loop is already running")]
    AlreadyRunning,

    /// A constructor failed.
    #[error("failed to construct provider {provider}: {message}")]
    Construct { provider: String, message: String },

    /// A lifecycle hook failed.
    #[error("provider {provider} failed to {phase}: {message}")]
    Hook {
        provider: String,
        phase: &'static str,
        message: String,
    },
}

// =============================================================================
// Runtime
// =============================================================================

/// Provider runtime and dispatch loop.
pub struct Runtime {
    state: RuntimeState,
    pending: Vec<Registration>,
    resolved: HashMap<ProviderId, Loaded>,
    order: Vec<ProviderId>,
    hub: EventHub,
    bus: EventBus,
    tasks: JoinSet<()>,
    dispatched: bool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Create an empty runtime with its own event bus.
    pub fn new() -> Self {
        let (publisher, bus) = bus::channel();
        Self {
            state: RuntimeState::Unloaded,
            pending: Vec::new(),
            resolved: HashMap::new(),
            order: Vec::new(),
            hub: EventHub::new(publisher),
            bus,
            tasks: JoinSet::new(),
            dispatched: false,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// The event hub shared with providers.
    pub fn hub(&self) -> EventHub {
        self.hub.clone()
    }

    /// Add a provider to the pending set. Nothing is constructed yet.
    pub fn register(&mut self, registration: Registration) -> Result<(), RuntimeError> {
        self.expect_state(RuntimeState::Unloaded, "register")?;

        if self.pending.iter().any(|r| r.id == registration.id) {
            return Err(RuntimeError::DuplicateProvider(registration.id.to_string()));
        }

        debug!(provider = %registration.id, "Registered provider");
        self.pending.push(registration);
        Ok(())
    }

    /// Construct every registered provider, dependencies first.
    pub fn load(&mut self) -> Result<(), RuntimeError> {
        self.expect_state(RuntimeState::Unloaded, "load")?;

        let registered: HashSet<ProviderId> = self.pending.iter().map(|r| r.id).collect();
        for registration in &self.pending {
            for dependency in &registration.dependencies {
                if !registered.contains(&dependency.id) {
                    return Err(RuntimeError::DependencyMissing {
                        provider: registration.id.to_string(),
                        dependency: dependency.id.to_string(),
                    });
                }
            }
        }

        while !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|r| {
                r.dependencies
                    .iter()
                    .all(|d| self.resolved.contains_key(&d.id))
            });

            if ready.is_empty() {
                let mut names: Vec<String> = waiting.iter().map(|r| r.id.to_string()).collect();
                names.sort();
                self.pending = waiting;
                return Err(RuntimeError::DependencyLoop(names));
            }
            self.pending = waiting;

            for registration in ready {
                let Registration {
                    id,
                    dependencies,
                    kwargs,
                    constructor,
                } = registration;

                let injector = Injector {
                    id,
                    dependencies: &dependencies,
                    resolved: &self.resolved,
                    kwargs: &kwargs,
                    hub: &self.hub,
                };
                let loaded = constructor(&injector).map_err(|e| RuntimeError::Construct {
                    provider: id.to_string(),
                    message: format!("{e:#}"),
                })?;

                debug!(provider = %id, "Constructed provider");
                self.resolved.insert(id, loaded);
                self.order.push(id);
            }
        }

        info!(providers = self.order.len(), "Providers loaded");
        self.state = RuntimeState::Loaded;
        Ok(())
    }

    /// Run every start hook in load order.
    ///
    /// If a hook fails, providers already started are stopped again in
    /// reverse order before the error is returned.
    pub async fn start(&mut self) -> Result<(), RuntimeError> {
        self.expect_state(RuntimeState::Loaded, "start")?;

        for (position, id) in self.order.iter().enumerate() {
            let Some(provider) = self.provider_object(id) else {
                continue;
            };
            debug!(provider = %id, "Starting provider");

            if let Err(e) = provider.start().await {
                error!(provider = %id, error = format!("{e:#}"), "Provider failed to start");
                for started in self.order[..position].iter().rev() {
                    if let Some(provider) = self.provider_object(started) {
                        if let Err(e) = provider.stop().await {
                            warn!(provider = %started, error = format!("{e:#}"), "Provider failed to stop");
                        }
                    }
                }
                self.state = RuntimeState::Stopped;
                return Err(RuntimeError::Hook {
                    provider: id.to_string(),
                    phase: "start",
                    message: format!("{e:#}"),
                });
            }
        }

        info!("Providers started");
        self.state = RuntimeState::Running;
        Ok(())
    }

    /// Drain the event bus until `shutdown` turns true.
    ///
    /// Each drain cycle takes every queued event and spawns one task per
    /// event. Tasks run concurrently; their relative order is not defined.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), RuntimeError> {
        if self.dispatched {
            return Err(RuntimeError::AlreadyRunning);
        }
        self.expect_state(RuntimeState::Running, "run")?;
        self.dispatched = true;

        info!("Starting event dispatch loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                ready = self.bus.ready() => {
                    if let Err(BusError::Closed) = ready {
                        warn!("Event bus closed");
                        break;
                    }
                    for event in self.bus.drain() {
                        debug!(kind = %event.kind(), "Dispatching event");
                        self.tasks.spawn(self.hub.clone().dispatch(event));
                    }
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Dispatch task panicked");
                        }
                    }
                }
            }
        }

        info!("Event dispatch loop stopped");
        Ok(())
    }

    /// Cancel outstanding dispatch tasks, then run every stop hook in
    /// reverse load order.
    pub async fn stop(&mut self) -> Result<(), RuntimeError> {
        self.expect_state(RuntimeState::Running, "stop")?;

        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Dispatch task panicked");
                }
            }
        }
        self.bus.close();

        let mut first_error = None;
        for id in self.order.iter().rev() {
            let Some(provider) = self.provider_object(id) else {
                continue;
            };
            debug!(provider = %id, "Stopping provider");

            if let Err(e) = provider.stop().await {
                error!(provider = %id, error = format!("{e:#}"), "Provider failed to stop");
                first_error.get_or_insert(RuntimeError::Hook {
                    provider: id.to_string(),
                    phase: "stop",
                    message: format!("{e:#}"),
                });
            }
        }

        self.state = RuntimeState::Stopped;
        info!("Providers stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The loaded provider of type `T`.
    pub fn provider<T: Provider>(&self) -> Option<Arc<T>> {
        self.resolved
            .get(&ProviderId::of::<T>())
            .and_then(|loaded| loaded.instance.clone().downcast::<T>().ok())
    }

    /// Provider names in load order.
    pub fn load_order(&self) -> Vec<&'static str> {
        self.order.iter().map(|id| id.name()).collect()
    }

    /// Number of dispatch tasks not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    fn provider_object(&self, id: &ProviderId) -> Option<Arc<dyn Provider>> {
        self.resolved.get(id).map(|loaded| loaded.provider.clone())
    }

    fn expect_state(
        &self,
        expected: RuntimeState,
        operation: &'static str,
    ) -> Result<(), RuntimeError> {
        if self.state != expected {
            return Err(RuntimeError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }
}
