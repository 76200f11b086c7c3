//! Testing utilities for sagaflow workflows.
//!
//! Doubles for every collaborator an engine talks to, plus a [`Harness`]
//! that wires them into an [`EngineBuilder`].
//!
//! ```ignore
//! let harness = Harness::new();
//! harness.rpc.respond("project.get_projects", json!([]));
//! let handle = harness.builder().register(...).build().start();
//!
//! let done = CompletionRecorder::new();
//! handle.dispatch(Action::new("LOAD").with_completion(done.completion()));
//! let (error, result) = done.wait().await;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sagaflow_core::{
    Action, Completion, ConsentDecision, ConsentPrompter, ConsentRecord, EngineBuilder, ErrorRecord,
    Navigator, RpcBackend, RpcError, RpcRequest,
};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Scripted RPC backend
// ============================================================================

#[derive(Clone)]
struct Scripted {
    delay: Duration,
    result: Result<Value, RpcError>,
}

/// RPC backend answering from per-query scripts.
///
/// Responses for a query are consumed in order; the last one is repeated.
/// Unscripted queries fail with a transport error.
#[derive(Default)]
pub struct MockRpc {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<RpcRequest>>,
    answered: Mutex<Vec<String>>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, query: &str, delay: Duration, result: Result<Value, RpcError>) -> &Self {
        lock(&self.scripts)
            .entry(query.to_string())
            .or_default()
            .push_back(Scripted { delay, result });
        self
    }

    pub fn respond(&self, query: &str, value: Value) -> &Self {
        self.script(query, Duration::ZERO, Ok(value))
    }

    pub fn respond_after(&self, query: &str, delay: Duration, value: Value) -> &Self {
        self.script(query, delay, Ok(value))
    }

    pub fn fail(&self, query: &str, message: &str, data: Option<Value>) -> &Self {
        self.script(
            query,
            Duration::ZERO,
            Err(RpcError::Remote {
                message: message.to_string(),
                data,
            }),
        )
    }

    pub fn fail_after(&self, query: &str, delay: Duration, message: &str) -> &Self {
        self.script(
            query,
            delay,
            Err(RpcError::Remote {
                message: message.to_string(),
                data: None,
            }),
        )
    }

    pub fn fail_malformed(&self, query: &str) -> &Self {
        self.script(query, Duration::ZERO, Err(RpcError::Malformed("unexpected token".into())))
    }

    /// Every request received, in order, including abandoned ones.
    pub fn calls(&self) -> Vec<RpcRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, query: &str) -> usize {
        lock(&self.calls).iter().filter(|call| call.query == query).count()
    }

    /// Parameters of each request for `query`.
    pub fn params_of(&self, query: &str) -> Vec<Vec<Value>> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.query == query)
            .map(|call| call.params.clone())
            .collect()
    }

    /// Queries whose response was produced (not abandoned mid-delay).
    pub fn answered(&self) -> Vec<String> {
        lock(&self.answered).clone()
    }

    fn next(&self, query: &str) -> Option<Scripted> {
        let mut scripts = lock(&self.scripts);
        let queue = scripts.get_mut(query)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl RpcBackend for MockRpc {
    async fn invoke(&self, request: RpcRequest) -> Result<Value, RpcError> {
        debug!(query = %request.query, params = ?request.params, "mock rpc call");
        lock(&self.calls).push(request.clone());

        let Some(scripted) = self.next(&request.query) else {
            return Err(RpcError::Transport(format!("unscripted rpc call '{}'", request.query)));
        };
        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }
        lock(&self.answered).push(request.query);
        scripted.result
    }
}

// ============================================================================
// Navigation
// ============================================================================

/// Navigator that records every route change.
pub struct RecordingNavigator {
    router: bool,
    visited: Mutex<Vec<String>>,
}

impl Default for RecordingNavigator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self {
            router: true,
            visited: Mutex::new(Vec::new()),
        }
    }

    /// A navigator reporting that no router is mounted.
    pub fn without_router() -> Self {
        Self {
            router: false,
            ..Self::new()
        }
    }

    pub fn visited(&self) -> Vec<String> {
        lock(&self.visited).clone()
    }

    pub fn last(&self) -> Option<String> {
        lock(&self.visited).last().cloned()
    }
}

impl Navigator for RecordingNavigator {
    fn has_router(&self) -> bool {
        self.router
    }

    fn go_to(&self, path: &str) {
        lock(&self.visited).push(path.to_string());
    }
}

// ============================================================================
// Consent
// ============================================================================

/// Prompter answering from a queue of decisions, then a default.
pub struct ScriptedPrompter {
    default: ConsentDecision,
    queued: Mutex<VecDeque<ConsentDecision>>,
    prompts: Mutex<Vec<ConsentRecord>>,
}

impl ScriptedPrompter {
    pub fn accepting() -> Self {
        Self::answering(ConsentDecision::Accepted)
    }

    pub fn rejecting() -> Self {
        Self::answering(ConsentDecision::Rejected)
    }

    fn answering(default: ConsentDecision) -> Self {
        Self {
            default,
            queued: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer the next prompt with `decision`.
    pub fn then(&self, decision: ConsentDecision) -> &Self {
        lock(&self.queued).push_back(decision);
        self
    }

    pub fn prompts(&self) -> Vec<ConsentRecord> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl ConsentPrompter for ScriptedPrompter {
    async fn decide(&self, record: &ConsentRecord) -> ConsentDecision {
        lock(&self.prompts).push(record.clone());
        lock(&self.queued).pop_front().unwrap_or(self.default)
    }
}

// ============================================================================
// Completion recorder
// ============================================================================

type Fired = Vec<(Option<ErrorRecord>, Option<Value>)>;

/// Records what a completion callback received.
#[derive(Clone, Default)]
pub struct CompletionRecorder {
    fired: Arc<Mutex<Fired>>,
    notify: Arc<Notify>,
}

impl CompletionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A completion handle feeding this recorder.
    pub fn completion(&self) -> Completion {
        let fired = self.fired.clone();
        let notify = self.notify.clone();
        Completion::new(move |error, result| {
            lock(&fired).push((error, result));
            notify.notify_waiters();
        })
    }

    pub fn calls(&self) -> Fired {
        lock(&self.fired).clone()
    }

    pub fn fired_once(&self) -> bool {
        lock(&self.fired).len() == 1
    }

    pub fn last(&self) -> Option<(Option<ErrorRecord>, Option<Value>)> {
        lock(&self.fired).last().cloned()
    }

    /// Wait for the first callback.
    ///
    /// # Panics
    ///
    /// Panics if nothing fires within five seconds.
    pub async fn wait(&self) -> (Option<ErrorRecord>, Option<Value>) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(first) = lock(&self.fired).first().cloned() {
                    return first;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), wait).await {
            Ok(fired) => fired,
            Err(_) => panic!("completion callback never fired"),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Collaborator doubles shared between a test and its engine.
pub struct Harness {
    pub rpc: Arc<MockRpc>,
    pub navigator: Arc<RecordingNavigator>,
    pub prompter: Arc<ScriptedPrompter>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Unscripted RPC, a mounted router and a prompter that accepts.
    pub fn new() -> Self {
        Self {
            rpc: Arc::new(MockRpc::new()),
            navigator: Arc::new(RecordingNavigator::new()),
            prompter: Arc::new(ScriptedPrompter::accepting()),
        }
    }

    pub fn rejecting_consent(mut self) -> Self {
        self.prompter = Arc::new(ScriptedPrompter::rejecting());
        self
    }

    pub fn builder(&self) -> EngineBuilder {
        EngineBuilder::new()
            .with_rpc(self.rpc.clone())
            .with_navigator(self.navigator.clone())
            .with_prompter(self.prompter.clone())
    }
}

/// Everything buffered on `receiver`, without waiting.
pub fn drain(receiver: &mut broadcast::Receiver<Action>) -> Vec<Action> {
    let mut actions = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(action) => actions.push(action),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return actions,
        }
    }
}

/// Kinds of the drained actions, in dispatch order.
pub fn kinds_of(actions: &[Action]) -> Vec<String> {
    actions.iter().map(|action| action.kind().to_string()).collect()
}
