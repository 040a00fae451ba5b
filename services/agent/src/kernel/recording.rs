//! Recording kernel for tests and dry runs.
//!
//! Records every command instead of touching the host. Failures can be
//! scripted per operation to exercise the convergence error policy.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{AddressSpec, Kernel, KernelError, LinkParams, LinkSpec, RouteSpec};

/// One command issued to the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KernelCall {
    LinkAdd(LinkSpec),
    LinkSet { ifindex: u32, params: LinkParams },
    LinkDelete { ifindex: u32 },
    AddressAdd(AddressSpec),
    AddressRemove(AddressSpec),
    AddressFlush { ifindex: u32, protocol: u8 },
    RouteReplace(RouteSpec),
    RouteDelete(RouteSpec),
}

impl KernelCall {
    /// Operation name, as used by `RecordingKernel::fail_next`.
    pub fn operation(&self) -> &'static str {
        match self {
            KernelCall::LinkAdd(_) => "link_add",
            KernelCall::LinkSet { .. } => "link_set",
            KernelCall::LinkDelete { .. } => "link_delete",
            KernelCall::AddressAdd(_) => "address_add",
            KernelCall::AddressRemove(_) => "address_remove",
            KernelCall::AddressFlush { .. } => "address_flush",
            KernelCall::RouteReplace(_) => "route_replace",
            KernelCall::RouteDelete(_) => "route_delete",
        }
    }
}

/// Kernel double that records commands.
#[derive(Debug, Default)]
pub struct RecordingKernel {
    calls: Mutex<Vec<KernelCall>>,
    failures: Mutex<VecDeque<(&'static str, KernelError)>>,
}

impl RecordingKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command issued so far, including failed ones.
    pub fn calls(&self) -> Vec<KernelCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commands issued so far, clearing the record.
    pub fn take_calls(&self) -> Vec<KernelCall> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Commands of one operation.
    pub fn calls_of(&self, operation: &str) -> Vec<KernelCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation() == operation)
            .collect()
    }

    /// Make the next `operation` command fail with `error`.
    pub fn fail_next(&self, operation: &'static str, error: KernelError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((operation, error));
    }

    fn record(&self, call: KernelCall) -> Result<(), KernelError> {
        let operation = call.operation();
        debug!(operation, "[RECORDING] Kernel command");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match failures.iter().position(|(op, _)| *op == operation) {
            Some(position) => match failures.remove(position) {
                Some((_, error)) => Err(error),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Kernel for RecordingKernel {
    async fn link_add(&self, link: &LinkSpec) -> Result<(), KernelError> {
        self.record(KernelCall::LinkAdd(link.clone()))
    }

    async fn link_set(&self, ifindex: u32, params: &LinkParams) -> Result<(), KernelError> {
        self.record(KernelCall::LinkSet {
            ifindex,
            params: params.clone(),
        })
    }

    async fn link_delete(&self, ifindex: u32) -> Result<(), KernelError> {
        self.record(KernelCall::LinkDelete { ifindex })
    }

    async fn address_add(&self, address: &AddressSpec) -> Result<(), KernelError> {
        self.record(KernelCall::AddressAdd(address.clone()))
    }

    async fn address_remove(&self, address: &AddressSpec) -> Result<(), KernelError> {
        self.record(KernelCall::AddressRemove(address.clone()))
    }

    async fn address_flush(&self, ifindex: u32, protocol: u8) -> Result<(), KernelError> {
        self.record(KernelCall::AddressFlush { ifindex, protocol })
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), KernelError> {
        self.record(KernelCall::RouteReplace(route.clone()))
    }

    async fn route_delete(&self, route: &RouteSpec) -> Result<(), KernelError> {
        self.record(KernelCall::RouteDelete(route.clone()))
    }
}
