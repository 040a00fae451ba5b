//! Provider trait, identities and registrations.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::hub::EventHub;

// =============================================================================
// Core Traits
// =============================================================================

/// An independently developed component with lifecycle hooks.
///
/// Providers subscribe to events from their constructor through the
/// `Injector`'s hub; `start` and `stop` run in dependency order and reverse
/// dependency order respectively.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Called once every provider is constructed.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on shutdown, after event dispatch has stopped.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Identity of a provider: its concrete type.
#[derive(Debug, Clone, Copy)]
pub struct ProviderId {
    type_id: TypeId,
    type_name: &'static str,
}

impl ProviderId {
    /// Identity of provider type `T`.
    pub fn of<T: Provider>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Short name for logs (the last path segment of the type name).
    pub fn name(&self) -> &'static str {
        self.type_name
            .rsplit("::")
            .next()
            .unwrap_or(self.type_name)
    }
}

impl PartialEq for ProviderId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ProviderId {}

impl Hash for ProviderId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A constructor parameter bound to another provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub param: &'static str,
    pub id: ProviderId,
}

impl Dependency {
    /// Depend on provider `T`, injected as `param`.
    pub fn on<T: Provider>(param: &'static str) -> Self {
        Self {
            param,
            id: ProviderId::of::<T>(),
        }
    }
}

// =============================================================================
// Registration
// =============================================================================

/// A constructed provider, kept both as a trait object and as `Any` so that
/// dependents can receive it with its concrete type.
pub(crate) struct Loaded {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) instance: Arc<dyn Any + Send + Sync>,
}

type Constructor = Box<dyn FnOnce(&Injector<'_>) -> anyhow::Result<Loaded> + Send>;

/// How to build one provider: its dependencies, static keyword arguments
/// and constructor. Nothing is constructed until the runtime loads.
pub struct Registration {
    pub(crate) id: ProviderId,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) kwargs: Map<String, Value>,
    pub(crate) constructor: Constructor,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("kwargs", &self.kwargs)
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Register provider `T` built by `constructor`.
    pub fn new<T, F>(constructor: F) -> Self
    where
        T: Provider,
        F: FnOnce(&Injector<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            id: ProviderId::of::<T>(),
            dependencies: Vec::new(),
            kwargs: Map::new(),
            constructor: Box::new(move |injector| {
                let instance = Arc::new(constructor(injector)?);
                Ok(Loaded {
                    provider: instance.clone(),
                    instance,
                })
            }),
        }
    }

    /// Declare that the constructor needs provider `D` as `param`.
    pub fn depends_on<D: Provider>(mut self, param: &'static str) -> Self {
        self.dependencies.push(Dependency::on::<D>(param));
        self
    }

    /// Attach a static keyword argument.
    pub fn with_kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }
}

// =============================================================================
// Injection
// =============================================================================

/// What a constructor can see: its resolved dependencies, its keyword
/// arguments and the event hub.
pub struct Injector<'a> {
    pub(crate) id: ProviderId,
    pub(crate) dependencies: &'a [Dependency],
    pub(crate) resolved: &'a HashMap<ProviderId, Loaded>,
    pub(crate) kwargs: &'a Map<String, Value>,
    pub(crate) hub: &'a EventHub,
}

impl Injector<'_> {
    /// The dependency declared as `param`, with its concrete type.
    pub fn get<T: Provider>(&self, param: &str) -> anyhow::Result<Arc<T>> {
        let dependency = self
            .dependencies
            .iter()
            .find(|d| d.param == param)
            .ok_or_else(|| anyhow!("{} declares no dependency named {param}", self.id))?;

        if dependency.id != ProviderId::of::<T>() {
            anyhow::bail!(
                "{}: dependency {param} is {}, not {}",
                self.id,
                dependency.id,
                ProviderId::of::<T>()
            );
        }

        let loaded = self
            .resolved
            .get(&dependency.id)
            .ok_or_else(|| anyhow!("{}: dependency {param} is not loaded", self.id))?;

        loaded
            .instance
            .clone()
            .downcast::<T>()
            .map_err(|_| anyhow!("{}: dependency {param} has the wrong type", self.id))
    }

    /// All keyword arguments.
    pub fn kwargs(&self) -> &Map<String, Value> {
        self.kwargs
    }

    /// One keyword argument, deserialized.
    pub fn kwarg<V: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<V>> {
        self.kwargs
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .with_context(|| format!("{}: invalid keyword argument {key}", self.id))
            })
            .transpose()
    }

    /// The event hub, for subscribing and publishing.
    pub fn hub(&self) -> EventHub {
        self.hub.clone()
    }
}
