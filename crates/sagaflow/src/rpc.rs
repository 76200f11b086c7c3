//! Remote procedure-call collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single remote invocation: a query name and positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub query: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
        }
    }

    /// Append a positional parameter.
    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Failures reported by an [`RpcBackend`].
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The backend answered with a structured error.
    #[error("{message}")]
    Remote {
        message: String,
        data: Option<Value>,
    },

    /// The response body was not valid structured data.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The request never reached the backend.
    #[error("transport error: {0}")]
    Transport(String),
}

/// The backend every `Call` effect ultimately reaches.
///
/// Implementations are responsible for aborting or ignoring a stale
/// in-flight call; the coordinator only stops listening for its result.
#[async_trait]
pub trait RpcBackend: Send + Sync + 'static {
    async fn invoke(&self, request: RpcRequest) -> Result<Value, RpcError>;
}

/// Backend used when none was configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRpc;

#[async_trait]
impl RpcBackend for UnavailableRpc {
    async fn invoke(&self, request: RpcRequest) -> Result<Value, RpcError> {
        Err(RpcError::Transport(format!(
            "no rpc backend configured for '{}'",
            request.query
        )))
    }
}
