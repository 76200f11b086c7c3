//! # JSON-RPC Dashboard Demo
//!
//! Drives the project workflows against a JSON-RPC 2.0 server over HTTP.
//!
//! ```text
//! RPC_URL=http://127.0.0.1:8008/jsonrpc RUST_LOG=info \
//!     cargo run -p jsonrpc-dashboard-demo -- /path/to/project uno
//! ```
//!
//! Loads the project list, then inspects the given project and environment
//! when both are passed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use sagaflow_core::{
    async_trait, kinds, ConsentDecision, ConsentPrompter, ConsentRecord, EngineBuilder, Navigator,
    RpcBackend, RpcError, RpcRequest,
};
use sagaflow_projects::actions::{self, InspectConfiguration};
use sagaflow_projects::{keys, register_all, ProjectSettings};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8008/jsonrpc";

// ============================================================================
// JSON-RPC over HTTP
// ============================================================================

struct HttpRpc {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpRpc {
    fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Value,
    error: Option<RemoteError>,
}

#[derive(Deserialize)]
struct RemoteError {
    message: String,
    data: Option<Value>,
}

#[async_trait]
impl RpcBackend for HttpRpc {
    async fn invoke(&self, request: RpcRequest) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": request.query,
            "params": request.params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))?;

        match envelope.error {
            Some(RemoteError { message, data }) => Err(RpcError::Remote { message, data }),
            None => Ok(envelope.result),
        }
    }
}

// ============================================================================
// Console collaborators
// ============================================================================

struct LogNavigator;

impl Navigator for LogNavigator {
    fn go_to(&self, path: &str) {
        info!(path, "navigate");
    }
}

/// Accepts every prompt after logging it.
struct LogPrompter;

#[async_trait]
impl ConsentPrompter for LogPrompter {
    async fn decide(&self, record: &ConsentRecord) -> ConsentDecision {
        info!(id = %record.id, content = %record.content, "consent accepted");
        ConsentDecision::Accepted
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let url = std::env::var("RPC_URL").unwrap_or_else(|_| DEFAULT_RPC_URL.to_string());
    let mut args = std::env::args().skip(1);
    let project_dir = args.next();
    let env = args.next();

    let builder = EngineBuilder::new()
        .with_rpc(Arc::new(HttpRpc::new(url.clone())))
        .with_navigator(Arc::new(LogNavigator))
        .with_prompter(Arc::new(LogPrompter));
    let handle = register_all(builder, ProjectSettings::default()).build().start();

    let mut notifications = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(action) = notifications.recv().await {
            let title = action.payload()["title"].as_str().unwrap_or_default().to_string();
            if action.is(kinds::NOTIFY_ERROR) {
                warn!(%title, "error notification");
            } else if action.is(kinds::NOTIFY_SUCCESS) {
                info!(%title, "success notification");
            }
        }
    });

    info!(%url, "loading projects");
    handle.dispatch_and_settle(actions::load_projects(true)).await;
    let projects = handle.select(|state| state.entity(keys::PROJECTS).cloned());
    let count = projects.as_ref().and_then(Value::as_array).map_or(0, Vec::len);
    info!(count, "projects loaded");

    if let (Some(project_dir), Some(env)) = (project_dir, env) {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let inspect = actions::inspect_project(InspectConfiguration {
            project_dir,
            env,
            memory: true,
            code: true,
        })
        .on_end(move |error, result| {
            let _ = sender.send((error, result));
        });
        handle.dispatch(inspect);

        let (error, result) = receiver.await.context("inspection ended without completion")?;
        match error {
            Some(error) => warn!(kind = ?error.kind, message = %error.message, "inspection failed"),
            None => info!(result = %result.unwrap_or_default(), "inspection finished"),
        }
    }

    handle.settled().await;
    Ok(())
}
