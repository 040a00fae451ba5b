//! Kernel event source.
//!
//! An OS netlink binding delivers structured rtnetlink messages; this module
//! turns them into events, keeps the interface name/index map and runs the
//! blocking monitor on its own thread:
//!
//! ```text
//! binding.monitor() ──► [monitor thread] ──► EventDecoder ──► EventPublisher
//!                                                 │
//!                                           SharedIndex ◄── kernel commands
//! ```

mod decode;
mod fake;
mod index;
mod message;
mod source;

use thiserror::Error;

pub use decode::{EventDecoder, MAX_DEFERRED_PER_INDEX};
pub use fake::FakeBinding;
pub use index::{InterfaceIndex, SharedIndex};
pub use message::{
    AddressFamily, AddressMessage, DumpKind, KernelMessage, LinkMessage, NeighbourMessage,
    NexthopMessage, RouteMessage, RouteType,
};
pub use source::KernelEventSource;

/// Errors from a netlink binding.
#[derive(Debug, Error)]
pub enum BindingError {
    /// The binding could not be started or read.
    #[error("netlink binding I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be understood.
    #[error("failed to decode kernel message: {0}")]
    Decode(String),

    /// The monitor was already taken or has been closed.
    #[error("netlink monitor is unavailable")]
    MonitorUnavailable,
}

/// Stream of kernel messages read by the monitor thread.
pub type MessageStream = Box<dyn Iterator<Item = Result<KernelMessage, BindingError>> + Send>;

/// Handle that makes a blocked `MessageStream` end.
pub type MonitorCloser = Box<dyn FnOnce() + Send>;

/// An open monitor subscription.
pub struct Monitor {
    messages: MessageStream,
    closer: MonitorCloser,
}

impl Monitor {
    pub fn new(messages: MessageStream, closer: MonitorCloser) -> Self {
        Self { messages, closer }
    }

    pub fn into_parts(self) -> (MessageStream, MonitorCloser) {
        (self.messages, self.closer)
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor").finish_non_exhaustive()
    }
}

/// OS netlink binding: blocking dumps and a blocking monitor stream.
///
/// Both are called off the cooperative scheduler, from `spawn_blocking` and
/// from the monitor thread respectively.
pub trait NetlinkBinding: Send + Sync + 'static {
    /// Every object of one class currently in the kernel.
    fn dump(&self, kind: DumpKind) -> Result<Vec<KernelMessage>, BindingError>;

    /// Subscribe to link, address, route and neighbour notifications.
    fn monitor(&self) -> Result<Monitor, BindingError>;
}
