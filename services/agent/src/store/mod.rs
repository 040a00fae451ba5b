//! Configuration store.
//!
//! Holds the running (committed) and staged (proposed) configuration
//! trees. A commit swaps staged into running and hands the new tree to
//! every change handler; if any handler fails, running is restored and
//! every handler is called again with the restored tree.
//!
//! Handlers must be idempotent functions of the tree they receive: a
//! rolled-back commit calls each of them twice in a row.

mod persistence;
mod tree;

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use routekeeper_events::{ConfigCommitted, Event};

use crate::bus::EventPublisher;
use crate::runtime::{Injector, Provider};

pub use persistence::{ConfigPersistence, FileConfigPersistence, MemoryPersistence};
pub use tree::{
    AddressConfig, BridgeConfig, ConfigError, ConfigTree, InterfaceConfig, InterfaceKind,
    LinkConfig, NexthopConfig, RouteConfig, RouteEntryConfig, RouteTableConfig, SitConfig,
    SystemConfig, VlanConfig, VxlanConfig, MAX_INTERFACE_NAME_LEN, SCHEMA_VERSION,
};

/// Errors from the configuration store and its persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt configuration document {path}: {message}")]
    Corrupt { path: String, message: String },
}

/// Result of `ConfigStore::commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitOutcome {
    Success { version: u64 },
    Unchanged,
    Error { message: String },
}

/// Reacts to a newly committed configuration.
///
/// Returning an error fails the commit. A handler must not leave partial
/// changes behind when it fails.
#[async_trait]
pub trait ConfigChangeHandler: Send + Sync {
    /// Name used in logs and commit error messages.
    fn name(&self) -> &str;

    async fn on_config_changed(&self, tree: &ConfigTree) -> anyhow::Result<()>;
}

type InitHandler = Box<dyn Fn(&mut ConfigTree) + Send + Sync>;

struct Trees {
    running: ConfigTree,
    staged: ConfigTree,
}

/// Running and staged configuration with commit and rollback.
pub struct ConfigStore {
    trees: Mutex<Trees>,
    handlers: RwLock<Vec<Arc<dyn ConfigChangeHandler>>>,
    init_handlers: RwLock<Vec<InitHandler>>,
    persistence: Arc<dyn ConfigPersistence>,
    publisher: Option<EventPublisher>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Create a store holding an empty tree. Call `load` to read the
    /// persisted configuration.
    pub fn new(persistence: Arc<dyn ConfigPersistence>, publisher: Option<EventPublisher>) -> Self {
        Self {
            trees: Mutex::new(Trees {
                running: ConfigTree::new(),
                staged: ConfigTree::new(),
            }),
            handlers: RwLock::new(Vec::new()),
            init_handlers: RwLock::new(Vec::new()),
            persistence,
            publisher,
        }
    }

    /// Call `handler` on every commit attempt and rollback.
    pub fn add_change_handler(&self, handler: Arc<dyn ConfigChangeHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Run `handler` on the fresh tree when nothing was persisted yet.
    pub fn add_init_handler<F>(&self, handler: F)
    where
        F: Fn(&mut ConfigTree) + Send + Sync + 'static,
    {
        self.init_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    /// Read the latest persisted configuration, or create and save the
    /// initial one.
    pub async fn load(&self) -> Result<(), StoreError> {
        let tree = match self.persistence.load_latest()? {
            Some(tree) => {
                info!(version = tree.version(), "Loaded configuration");
                tree
            }
            None => {
                let mut tree = ConfigTree::new();
                for init in self
                    .init_handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                {
                    init(&mut tree);
                }
                self.persistence.save(&tree)?;
                info!("Created initial configuration");
                tree
            }
        };

        let mut trees = self.trees.lock().await;
        trees.staged = tree.clone();
        trees.running = tree;
        Ok(())
    }

    pub async fn get_running(&self) -> ConfigTree {
        self.trees.lock().await.running.clone()
    }

    pub async fn get_staged(&self) -> ConfigTree {
        self.trees.lock().await.staged.clone()
    }

    /// Edit the staged tree in place.
    pub async fn update_staged<R>(&self, edit: impl FnOnce(&mut ConfigTree) -> R) -> R {
        edit(&mut self.trees.lock().await.staged)
    }

    /// Discard staged changes.
    pub async fn drop_staged(&self) {
        let mut trees = self.trees.lock().await;
        trees.staged = trees.running.clone();
    }

    /// Make the staged tree the running one.
    pub async fn commit(&self) -> CommitOutcome {
        let mut trees = self.trees.lock().await;

        match (
            serde_json::to_vec(&trees.staged),
            serde_json::to_vec(&trees.running),
        ) {
            (Ok(staged), Ok(running)) if staged == running => return CommitOutcome::Unchanged,
            (Ok(_), Ok(_)) => {}
            (Err(e), _) | (_, Err(e)) => {
                return CommitOutcome::Error {
                    message: format!("failed to serialize configuration: {e}"),
                }
            }
        }

        let previous = trees.running.clone();
        let mut next = trees.staged.clone();
        next.system.version = previous.version() + 1;
        next.system.committed_at = Some(Utc::now());
        trees.running = next;

        let handlers: Vec<Arc<dyn ConfigChangeHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failures = Vec::new();
        for handler in &handlers {
            if let Err(e) = handler.on_config_changed(&trees.running).await {
                error!(
                    handler = handler.name(),
                    version = trees.running.version(),
                    error = format!("{e:#}"),
                    "Change handler failed"
                );
                failures.push(format!("{}: {e:#}", handler.name()));
            }
        }

        if !failures.is_empty() {
            trees.running = previous;
            for handler in &handlers {
                if let Err(e) = handler.on_config_changed(&trees.running).await {
                    error!(
                        handler = handler.name(),
                        error = format!("{e:#}"),
                        "Change handler failed during rollback"
                    );
                }
            }
            warn!(version = trees.running.version(), "Commit rolled back");
            return CommitOutcome::Error {
                message: format!(
                    "commit failed ({}); configuration was rolled back and the system may be in a transitional state",
                    failures.join("; ")
                ),
            };
        }

        let version = trees.running.version();
        if let Err(e) = self.persistence.save(&trees.running) {
            error!(version, error = %e, "Failed to persist committed configuration");
        }
        trees.staged = trees.running.clone();

        if let (Some(publisher), Some(committed_at)) = (&self.publisher, trees.running.system.committed_at) {
            let event = Event::ConfigCommitted(ConfigCommitted {
                version,
                committed_at,
            });
            if let Err(e) = publisher.put(event) {
                warn!(version, error = %e, "Failed to publish commit event");
            }
        }

        info!(version, "Configuration committed");
        CommitOutcome::Success { version }
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Provider owning the configuration store.
///
/// With a `config_dir` keyword argument documents are kept as files in that
/// directory; without one they are kept in memory.
pub struct ConfigProvider {
    store: Arc<ConfigStore>,
}

impl ConfigProvider {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    pub fn from_injector(injector: &Injector<'_>) -> anyhow::Result<Self> {
        let persistence: Arc<dyn ConfigPersistence> =
            match injector.kwarg::<PathBuf>("config_dir")? {
                Some(dir) => Arc::new(FileConfigPersistence::new(dir)),
                None => Arc::new(MemoryPersistence::new()),
            };
        Ok(Self::new(Arc::new(ConfigStore::new(
            persistence,
            Some(injector.hub().publisher()),
        ))))
    }

    pub fn store(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl Provider for ConfigProvider {
    async fn start(&self) -> anyhow::Result<()> {
        self.store.load().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::bus;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ConfigChangeHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_config_changed(&self, _tree: &ConfigTree) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("rejected");
            }
            Ok(())
        }
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn test_init_handlers_run_without_persisted_config() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = ConfigStore::new(persistence.clone(), None);
        store.add_init_handler(|tree| tree.route.tables.push(RouteTableConfig::new(254, Some("main"))));

        store.load().await.unwrap();
        assert!(store.get_running().await.route_table(254).is_some());
        assert_eq!(persistence.saved().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_publishes_event() {
        let (publisher, mut bus) = bus::channel();
        let store = ConfigStore::new(Arc::new(MemoryPersistence::new()), Some(publisher));
        store.load().await.unwrap();

        store
            .update_staged(|tree| tree.interfaces.push(InterfaceConfig::new("eth0", InterfaceKind::Ethernet)))
            .await;
        assert_eq!(store.commit().await, CommitOutcome::Success { version: 1 });

        let Ok(Event::ConfigCommitted(committed)) = bus.get() else {
            panic!("expected commit event");
        };
        assert_eq!(committed.version, 1);
        assert!(store.get_running().await.system.committed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_handler_calls_everyone_twice() {
        let store = ConfigStore::new(Arc::new(MemoryPersistence::new()), None);
        let good = counting(false);
        let bad = counting(true);
        store.add_change_handler(good.clone());
        store.add_change_handler(bad.clone());

        store.update_staged(|tree| tree.dns = serde_json::json!({"forwarders": []})).await;
        let outcome = store.commit().await;

        assert!(matches!(outcome, CommitOutcome::Error { ref message } if message.contains("counting: rejected")));
        assert_eq!(good.calls.load(Ordering::SeqCst), 2);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_running().await.version(), 0);
        assert!(!store.get_staged().await.dns.is_null());
    }
}
