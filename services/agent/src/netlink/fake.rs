//! In-memory netlink binding for tests.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};

use super::{BindingError, DumpKind, KernelMessage, Monitor, NetlinkBinding};

enum Feed {
    Message(Result<KernelMessage, BindingError>),
    Close,
}

/// Binding with canned dumps and a monitor fed through a channel.
pub struct FakeBinding {
    dumps: Mutex<HashMap<DumpKind, Vec<KernelMessage>>>,
    requested: Mutex<Vec<DumpKind>>,
    sender: mpsc::Sender<Feed>,
    receiver: Mutex<Option<mpsc::Receiver<Feed>>>,
}

impl Default for FakeBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FakeBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeBinding").finish_non_exhaustive()
    }
}

impl FakeBinding {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            dumps: Mutex::new(HashMap::new()),
            requested: Mutex::new(Vec::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Objects returned by `dump(kind)`.
    pub fn with_dump(self, kind: DumpKind, messages: Vec<KernelMessage>) -> Self {
        self.dumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, messages);
        self
    }

    /// Deliver a message on the monitor stream.
    pub fn push(&self, message: KernelMessage) {
        let _ = self.sender.send(Feed::Message(Ok(message)));
    }

    /// Deliver a read error on the monitor stream.
    pub fn push_error(&self, error: BindingError) {
        let _ = self.sender.send(Feed::Message(Err(error)));
    }

    /// Dump kinds requested so far, in order.
    pub fn dumps_requested(&self) -> Vec<DumpKind> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NetlinkBinding for FakeBinding {
    fn dump(&self, kind: DumpKind) -> Result<Vec<KernelMessage>, BindingError> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(kind);
        Ok(self
            .dumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }

    fn monitor(&self) -> Result<Monitor, BindingError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BindingError::MonitorUnavailable)?;

        let messages = receiver.into_iter().map_while(|feed| match feed {
            Feed::Message(message) => Some(message),
            Feed::Close => None,
        });
        let sender = self.sender.clone();
        Ok(Monitor::new(
            Box::new(messages),
            Box::new(move || {
                let _ = sender.send(Feed::Close);
            }),
        ))
    }
}
