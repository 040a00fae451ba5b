//! In-process RPC boundary.
//!
//! Methods are registered with typed request and response types and called
//! with JSON values. The boundary only reads entity state and edits the
//! staged configuration; it never issues kernel commands.

mod methods;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::ConfigError;

pub use methods::{DhcpEvent, RouteSelector, RpcProvider};

/// Errors returned to RPC callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("no such method: {0}")]
    NoSuchMethod(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Stable code sent to callers.
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::NoSuchMethod(_) => "NO_SUCH_METHOD",
            RpcError::InvalidRequest(_) => "INVALID_REQUEST",
            RpcError::InvalidArgument(_) => "INVALID_ARGUMENT",
            RpcError::AlreadyExists(_) => "ALREADY_EXISTS",
            RpcError::NotFound(_) => "NOT_FOUND",
            RpcError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<ConfigError> for RpcError {
    fn from(e: ConfigError) -> Self {
        RpcError::InvalidArgument(e.to_string())
    }
}

/// Code of a successful call.
pub const CODE_OK: &str = "OK";

/// Result of `Rpc::call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    fn ok(body: Value) -> Self {
        Self {
            code: CODE_OK.to_string(),
            body: (!body.is_null()).then_some(body),
            error: None,
        }
    }

    fn failed(error: &RpcError) -> Self {
        Self {
            code: error.code().to_string(),
            body: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// Deserialize the body of a successful response.
    pub fn body<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        if !self.is_ok() {
            anyhow::bail!("{}: {}", self.code, self.error.as_deref().unwrap_or_default());
        }
        Ok(serde_json::from_value(self.body.clone().unwrap_or(Value::Null))?)
    }
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// Method table.
#[derive(Default)]
pub struct Rpc {
    methods: RwLock<BTreeMap<String, Handler>>,
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("methods", &self.methods())
            .finish()
    }
}

impl Rpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as `method`, replacing any earlier registration.
    pub fn register<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |request: Value| {
            let parsed = serde_json::from_value::<Req>(request)
                .map_err(|e| RpcError::InvalidRequest(e.to_string()));
            let handler = Arc::clone(&handler);
            async move {
                let response = handler(parsed?).await?;
                serde_json::to_value(response).map_err(|e| RpcError::Internal(e.to_string()))
            }
            .boxed()
        });

        let previous = self
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), erased);
        if previous.is_some() {
            warn!(method, "RPC method registered twice");
        }
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub async fn call(&self, method: &str, request: Value) -> RpcResponse {
        let handler = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned();

        let result = match handler {
            Some(handler) => handler(request).await,
            None => Err(RpcError::NoSuchMethod(method.to_string())),
        };

        match result {
            Ok(body) => {
                debug!(method, "RPC call succeeded");
                RpcResponse::ok(body)
            }
            Err(e) => {
                debug!(method, code = e.code(), error = %e, "RPC call failed");
                RpcResponse::failed(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    async fn add(request: Add) -> Result<i64, RpcError> {
        request
            .a
            .checked_add(request.b)
            .ok_or_else(|| RpcError::InvalidArgument("overflow".to_string()))
    }

    #[tokio::test]
    async fn test_typed_call() {
        let rpc = Rpc::new();
        rpc.register("math/add", add);

        let response = rpc.call("math/add", json!({"a": 2, "b": 3})).await;
        assert!(response.is_ok());
        assert_eq!(response.body::<i64>().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_error_codes() {
        let rpc = Rpc::new();
        rpc.register("math/add", add);

        let missing = rpc.call("math/sub", Value::Null).await;
        assert_eq!(missing.code, "NO_SUCH_METHOD");

        let malformed = rpc.call("math/add", json!({"a": "two"})).await;
        assert_eq!(malformed.code, "INVALID_REQUEST");

        let overflow = rpc.call("math/add", json!({"a": i64::MAX, "b": 1})).await;
        assert_eq!(overflow.code, "INVALID_ARGUMENT");
        assert!(overflow.body::<i64>().is_err());
    }

    #[tokio::test]
    async fn test_unit_request_and_response() {
        let rpc = Rpc::new();
        rpc.register("noop", |()| async { Ok::<(), RpcError>(()) });

        let response = rpc.call("noop", Value::Null).await;
        assert!(response.is_ok());
        assert!(response.body.is_none());
    }
}
