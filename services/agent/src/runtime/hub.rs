//! Subscription table and publishing handle shared with providers.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, error};

use routekeeper_events::{Event, EventKind};

use crate::bus::{BusError, EventPublisher};

type Callback = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    name: Arc<str>,
    filter: Option<Filter>,
    callback: Callback,
}

struct HubInner {
    publisher: EventPublisher,
    table: RwLock<HashMap<EventKind, Arc<[Subscriber]>>>,
    next_id: AtomicU64,
}

/// Publishing handle plus the subscription table.
///
/// Subscriber lists are copy-on-write: dispatch works on a snapshot, so
/// subscribing or unsubscribing never races an event in flight.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").finish_non_exhaustive()
    }
}

impl EventHub {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            inner: Arc::new(HubInner {
                publisher,
                table: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A publisher for producers living outside the scheduler.
    pub fn publisher(&self) -> EventPublisher {
        self.inner.publisher.clone()
    }

    /// Queue an event for dispatch.
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        self.inner.publisher.put(event)
    }

    /// Call `callback` for every event of `kind`.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(kind, name, None, callback)
    }

    /// Call `callback` for events of `kind` that match `filter`.
    pub fn subscribe_filtered<P, F, Fut>(
        &self,
        kind: EventKind,
        name: &str,
        filter: P,
        callback: F,
    ) -> SubscriptionId
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(kind, name, Some(Arc::new(filter)), callback)
    }

    fn insert<F, Fut>(
        &self,
        kind: EventKind,
        name: &str,
        filter: Option<Filter>,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber {
            id,
            name: Arc::from(name),
            filter,
            callback: Arc::new(move |event: Event| callback(event).boxed()),
        };

        let mut table = self
            .inner
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = table.get(&kind).map(|s| s.to_vec()).unwrap_or_default();
        next.push(subscriber);
        table.insert(kind, next.into());

        debug!(kind = %kind, subscriber = name, "Subscribed");
        id
    }

    /// Remove a subscription. Returns false if it was not found.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self
            .inner
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for subscribers in table.values_mut() {
            if subscribers.iter().any(|s| s.id == id) {
                let remaining: Vec<Subscriber> =
                    subscribers.iter().filter(|s| s.id != id).cloned().collect();
                *subscribers = remaining.into();
                return true;
            }
        }
        false
    }

    /// Number of subscribers registered for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.snapshot(kind).len()
    }

    fn snapshot(&self, kind: EventKind) -> Arc<[Subscriber]> {
        let table = self
            .inner
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        table.get(&kind).cloned().unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Pass one event to every subscriber of its kind, in subscription order.
    ///
    /// A failing or panicking subscriber is logged; the rest still run.
    pub async fn dispatch(self, event: Event) {
        let kind = event.kind();
        let subscribers = self.snapshot(kind);

        for subscriber in subscribers.iter() {
            if let Some(filter) = &subscriber.filter {
                if !filter(&event) {
                    continue;
                }
            }

            let call = (subscriber.callback)(event.clone());
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        kind = %kind,
                        subscriber = %subscriber.name,
                        error = format!("{e:#}"),
                        "Event subscriber failed"
                    );
                }
                Err(_) => {
                    error!(
                        kind = %kind,
                        subscriber = %subscriber.name,
                        "Event subscriber panicked"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use routekeeper_events::InterfaceRemove;

    use crate::bus;

    fn removed(name: &str) -> Event {
        Event::InterfaceRemove(InterfaceRemove {
            ifindex: 7,
            ifname: name.to_string(),
        })
    }

    async fn fail(_: Event) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }

    async fn explode(_: Event) -> anyhow::Result<()> {
        panic!("boom")
    }

    fn recorder(hub: &EventHub, name: &str, log: &Arc<Mutex<Vec<String>>>) -> SubscriptionId {
        let log = Arc::clone(log);
        let tag = name.to_string();
        hub.subscribe(EventKind::InterfaceRemove, name, move |_| {
            let log = Arc::clone(&log);
            let tag = tag.clone();
            async move {
                log.lock().unwrap().push(tag);
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    #[tokio::test]
    async fn test_dispatch_in_subscription_order() {
        let (publisher, _bus) = bus::channel();
        let hub = EventHub::new(publisher);
        let log = Arc::new(Mutex::new(Vec::new()));

        recorder(&hub, "first", &log);
        recorder(&hub, "second", &log);

        hub.clone().dispatch(removed("eth0")).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_stop_others() {
        let (publisher, _bus) = bus::channel();
        let hub = EventHub::new(publisher);
        let log = Arc::new(Mutex::new(Vec::new()));

        hub.subscribe(EventKind::InterfaceRemove, "failing", fail);
        hub.subscribe(EventKind::InterfaceRemove, "panicking", explode);
        recorder(&hub, "after", &log);

        hub.clone().dispatch(removed("eth0")).await;
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn test_filter_and_unsubscribe() {
        let (publisher, _bus) = bus::channel();
        let hub = EventHub::new(publisher);
        let log = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&log);
        hub.subscribe_filtered(
            EventKind::InterfaceRemove,
            "eth1-only",
            |event| event.interface_name() == Some("eth1"),
            move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock()
                        .unwrap()
                        .push(event.interface_name().unwrap_or_default().to_string());
                    Ok::<(), anyhow::Error>(())
                }
            },
        );
        let id = recorder(&hub, "all", &log);

        hub.clone().dispatch(removed("eth0")).await;
        hub.clone().dispatch(removed("eth1")).await;
        assert_eq!(*log.lock().unwrap(), vec!["all", "eth1", "all"]);

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.subscriber_count(EventKind::InterfaceRemove), 1);
    }
}
