//! Entity managers.
//!
//! One manager per kernel object kind keeps a map from a stable key to an
//! entity pairing what is wanted with what the kernel last reported, and
//! issues the minimal kernel command that makes the two match:
//!
//! | Manager            | Key                     | Depends on           |
//! |--------------------|-------------------------|----------------------|
//! | `InterfaceManager` | name                    | master, trunk, underlay |
//! | `AddressManager`   | (interface, address)    | interface            |
//! | `RouteManager`     | (table, destination)    | nexthop interfaces, gateway reachability |
//!
//! Entity maps are owned by their manager and only touched while its lock
//! is held; handlers for concurrent events serialize on that lock.

mod address;
mod interface;
mod route;

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use routekeeper_events::{Event, EventKind};

use crate::kernel::KernelError;
use crate::runtime::EventHub;

pub use address::{AddressManager, AddressStatusReport};
pub use interface::{InterfaceManager, InterfaceStatusReport};
pub use route::{
    default_route_tables, NexthopReport, RouteManager, RouteStatusReport, RouteTableSummary,
};

/// How a kernel command ended under the convergence error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Done, or the object already existed.
    Applied,

    /// The interface vanished; retry when it comes back.
    Vanished,
}

/// Absorb the expected kernel errors; everything else is returned with the
/// entity key and operation attached.
fn settle(
    result: Result<(), KernelError>,
    key: &dyn Display,
    operation: &'static str,
) -> anyhow::Result<Outcome> {
    match result {
        Ok(()) => Ok(Outcome::Applied),
        Err(KernelError::Exists) => {
            debug!(key = %key, operation, "Object already exists");
            Ok(Outcome::Applied)
        }
        Err(KernelError::NoDevice) => {
            debug!(key = %key, operation, "Interface vanished, deferring");
            Ok(Outcome::Vanished)
        }
        Err(e) => {
            error!(key = %key, operation, error = %e, "Kernel command failed");
            Err(anyhow::Error::new(e).context(format!("{operation} for {key} failed")))
        }
    }
}

/// Keep the first error of a reconciliation pass.
fn first_error(result: &mut anyhow::Result<()>, next: anyhow::Result<()>) {
    if result.is_ok() {
        *result = next;
    }
}

#[async_trait]
trait EntityEvents: Send + Sync + 'static {
    async fn handle_event(&self, event: Event) -> anyhow::Result<()>;
}

fn subscribe<H: EntityEvents>(hub: &EventHub, name: &str, kinds: &[EventKind], handler: &Arc<H>) {
    for kind in kinds {
        let handler = Arc::clone(handler);
        hub.subscribe(*kind, name, move |event: Event| {
            let handler = Arc::clone(&handler);
            async move { handler.handle_event(event).await }
        });
    }
}
