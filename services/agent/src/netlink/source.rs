//! Kernel event source provider.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::EventPublisher;
use crate::kernel::KernelProvider;
use crate::runtime::{Injector, Provider};

use super::{DumpKind, EventDecoder, MessageStream, MonitorCloser, NetlinkBinding, SharedIndex};

struct Worker {
    closer: MonitorCloser,
    handle: JoinHandle<()>,
}

/// Publishes kernel objects as events: a startup enumeration followed by
/// live notifications read on a dedicated thread.
pub struct KernelEventSource {
    binding: Arc<dyn NetlinkBinding>,
    index: SharedIndex,
    publisher: EventPublisher,
    worker: Mutex<Option<Worker>>,
}

impl KernelEventSource {
    pub fn new(binding: Arc<dyn NetlinkBinding>, index: SharedIndex, publisher: EventPublisher) -> Self {
        Self {
            binding,
            index,
            publisher,
            worker: Mutex::new(None),
        }
    }

    /// Constructor used by the runtime; depends on `KernelProvider` as
    /// `kernel`.
    pub fn from_injector(injector: &Injector<'_>) -> anyhow::Result<Self> {
        let kernel: Arc<KernelProvider> = injector.get("kernel")?;
        Ok(Self::new(
            kernel.binding(),
            kernel.index(),
            injector.hub().publisher(),
        ))
    }

    /// True while the monitor thread is alive.
    pub fn is_monitoring(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }
}

#[async_trait]
impl Provider for KernelEventSource {
    async fn start(&self) -> anyhow::Result<()> {
        // Subscribe before enumerating so that nothing changing in between
        // is missed. Objects seen twice are harmless: apply is idempotent.
        let (messages, closer) = self
            .binding
            .monitor()
            .context("failed to open kernel monitor")?
            .into_parts();

        let binding = Arc::clone(&self.binding);
        let publisher = self.publisher.clone();
        let decoder = EventDecoder::new(Arc::clone(&self.index));
        let enumerated =
            tokio::task::spawn_blocking(move || enumerate(binding.as_ref(), decoder, &publisher))
                .await
                .context("kernel enumeration task failed")
                .and_then(|result| result);

        let decoder = match enumerated {
            Ok(decoder) => decoder,
            Err(e) => {
                closer();
                return Err(e);
            }
        };

        let publisher = self.publisher.clone();
        let spawned = std::thread::Builder::new()
            .name("netlink-monitor".to_string())
            .spawn(move || monitor_loop(messages, decoder, publisher));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                closer();
                return Err(e).context("failed to spawn kernel monitor thread");
            }
        };

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Worker { closer, handle });
        info!("Kernel event source started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Worker { closer, handle }) = worker else {
            return Ok(());
        };

        closer();
        let joined = tokio::task::spawn_blocking(move || handle.join())
            .await
            .context("failed to join kernel monitor thread")?;
        if joined.is_err() {
            anyhow::bail!("kernel monitor thread panicked");
        }

        info!("Kernel event source stopped");
        Ok(())
    }
}

fn enumerate(
    binding: &dyn NetlinkBinding,
    mut decoder: EventDecoder,
    publisher: &EventPublisher,
) -> anyhow::Result<EventDecoder> {
    for kind in DumpKind::ENUMERATION_ORDER {
        let messages = binding
            .dump(kind)
            .with_context(|| format!("failed to enumerate {}", kind.as_str()))?;

        let mut published = 0usize;
        for message in messages {
            for event in decoder.decode(message) {
                publisher.put(event)?;
                published += 1;
            }
        }
        info!(kind = kind.as_str(), published, "Enumerated kernel objects");
    }

    if decoder.deferred_count() > 0 {
        debug!(
            deferred = decoder.deferred_count(),
            "Objects still waiting for their interface after enumeration"
        );
    }
    Ok(decoder)
}

fn monitor_loop(messages: MessageStream, mut decoder: EventDecoder, publisher: EventPublisher) {
    for item in messages {
        let message = match item {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to read kernel message");
                continue;
            }
        };

        for event in decoder.decode(message) {
            if publisher.put(event).is_err() {
                debug!("Event bus closed, stopping kernel monitor");
                return;
            }
        }
    }
    info!("Kernel monitor stream ended");
}
