//! Engine wiring: builder, running handle and the dispatch path.
//!
//! Dispatch is synchronous with respect to policy evaluation: by the time
//! [`EngineHandle::dispatch`] returns, a superseded single-flight run has
//! been cancelled and the new runs have been spawned.
//!
//! Runs take turns: a run holds the engine's turn lock between
//! suspensions, so the stretch from one suspension to the next never
//! interleaves with another run's, whatever runtime flavor drives them.
//! Cancellation and a run's state changes both happen under the dispatch
//! lock, so a change either lands before the superseding dispatch or not
//! at all.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use smallvec::SmallVec;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{kinds, Action, Completion, Notification};
use crate::bus::ActionBus;
use crate::config::EngineConfig;
use crate::consent::{AutoReject, ConsentGate, ConsentPrompter};
use crate::context::{RunInfo, RunRecord, TaskContext};
use crate::error::{classify, CallbackPolicy, ErrorRecord, FlowError};
use crate::navigation::{Navigator, NoopNavigator};
use crate::patch::PatchLedger;
use crate::registry::{Policy, Queued, Watcher, WatcherEntry, WatcherRegistry, Workflow};
use crate::rpc::{RpcBackend, UnavailableRpc};
use crate::state::{KeyPattern, SharedState, StateView};
use crate::storage::{hydrate_state, persist_state, MemoryStorage, StorageBackend};

/// Shared-state key holding the last uncaught failure of a watcher.
pub fn error_entity_key(watcher: &str) -> String {
    format!("error/{watcher}")
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Counts runs (and queued sequential actions) that have not finished.
#[derive(Debug, Default)]
pub struct InflightTracker {
    count: AtomicUsize,
    idle: Notify,
}

impl InflightTracker {
    pub(crate) fn begin(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            tracker: self.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once nothing is in flight.
    pub async fn settled(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct InflightGuard {
    tracker: Arc<InflightTracker>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

// ============================================================================
// Dispatch receipt
// ============================================================================

enum RunWaiter {
    Spawned(JoinHandle<()>),
    Queued(oneshot::Receiver<()>),
}

/// What a dispatch started.
pub struct DispatchReceipt {
    seq: u64,
    waiters: SmallVec<[RunWaiter; 4]>,
}

impl DispatchReceipt {
    /// Sequence number the bus assigned to the action.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Runs started or queued by this dispatch.
    pub fn run_count(&self) -> usize {
        self.waiters.len()
    }

    /// Wait for the runs this dispatch started. Runs started by actions
    /// those runs dispatch are not included.
    pub async fn settled(self) {
        for waiter in self.waiters {
            match waiter {
                RunWaiter::Spawned(handle) => {
                    if let Err(e) = handle.await {
                        warn!(error = %e, "run task ended abnormally");
                    }
                }
                RunWaiter::Queued(done) => {
                    let _ = done.await;
                }
            }
        }
    }
}

// ============================================================================
// Engine internals
// ============================================================================

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) state: SharedState,
    pub(crate) bus: ActionBus,
    pub(crate) registry: WatcherRegistry,
    pub(crate) consent: ConsentGate,
    pub(crate) rpc: Arc<dyn RpcBackend>,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) navigator: Arc<dyn Navigator>,
    pub(crate) patches: Arc<PatchLedger>,
    /// Held by a run between suspensions.
    pub(crate) turn: Arc<tokio::sync::Mutex<()>>,
    runs: dashmap::DashMap<Uuid, Arc<RunRecord>>,
    inflight: Arc<InflightTracker>,
    dispatch_lock: Mutex<()>,
}

/// Removes a run from the active set however its task ends.
struct ActiveRun {
    engine: Arc<EngineInner>,
    id: Uuid,
    _inflight: InflightGuard,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.engine.runs.remove(&self.id);
    }
}

impl EngineInner {
    pub(crate) fn dispatch(self: &Arc<Self>, action: Action) -> DispatchReceipt {
        let _serial = self.dispatch_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.dispatch_locked(action)
    }

    /// Apply `change` unless `token` has been cancelled. Cancellation only
    /// happens under the same lock, so the check cannot go stale before
    /// the change lands.
    pub(crate) fn commit<R>(
        self: &Arc<Self>,
        token: &CancellationToken,
        change: impl FnOnce(&Arc<Self>) -> R,
    ) -> Result<R, FlowError> {
        let _serial = self.dispatch_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        Ok(change(self))
    }

    /// Publish and schedule. Caller holds `dispatch_lock`.
    pub(crate) fn dispatch_locked(self: &Arc<Self>, action: Action) -> DispatchReceipt {
        let action = self.bus.publish(action);
        let matching = self.registry.matching(action.kind());
        debug!(
            action = action.kind(),
            seq = action.seq(),
            watchers = matching.len(),
            "action dispatched"
        );

        let waiters = matching
            .into_iter()
            .map(|entry| self.schedule(entry, action.clone()))
            .collect();
        DispatchReceipt {
            seq: action.seq(),
            waiters,
        }
    }

    fn schedule(self: &Arc<Self>, entry: Arc<WatcherEntry>, action: Action) -> RunWaiter {
        match entry.watcher().policy() {
            Policy::ConcurrentEvery => {
                let run = RunRecord::new(entry.name(), action.kind(), CancellationToken::new());
                RunWaiter::Spawned(self.spawn_run(entry, action, run))
            }
            Policy::SingleFlightLatest => {
                let run = RunRecord::new(entry.name(), action.kind(), CancellationToken::new());
                if let Some(previous) = entry.replace_latest(run.id, run.token.clone()) {
                    if !previous.is_cancelled() {
                        debug!(watcher = entry.name(), seq = action.seq(), "superseding active run");
                        previous.cancel();
                    }
                }
                RunWaiter::Spawned(self.spawn_run(entry, action, run))
            }
            Policy::Sequential => {
                let (done, waiter) = oneshot::channel();
                let queued = Queued {
                    action,
                    done,
                    _inflight: self.inflight.begin(),
                };
                let engine = Arc::downgrade(self);
                let worker_entry = Arc::downgrade(&entry);
                let queue = entry.sequential_queue(|receiver| {
                    tokio::spawn(sequential_worker(engine, worker_entry, receiver));
                });
                if queue.send(queued).is_err() {
                    warn!(watcher = entry.name(), "sequential worker is gone; action dropped");
                }
                RunWaiter::Queued(waiter)
            }
        }
    }

    fn spawn_run(
        self: &Arc<Self>,
        entry: Arc<WatcherEntry>,
        action: Action,
        run: RunRecord,
    ) -> JoinHandle<()> {
        let run = Arc::new(run);
        let completion = action.completion().cloned();
        self.runs.insert(run.id, run.clone());
        let active = ActiveRun {
            engine: self.clone(),
            id: run.id,
            _inflight: self.inflight.begin(),
        };
        debug!(run_id = %run.id, watcher = entry.name(), action = action.kind(), "run started");

        tokio::spawn(async move {
            let engine = active.engine.clone();
            let turn = engine.turn.clone().lock_owned().await;
            let ctx = TaskContext::new(
                engine.clone(),
                run.clone(),
                action.seq(),
                completion.clone(),
                turn,
            );
            let workflow = entry.watcher().workflow().clone();
            let outcome = workflow.run(action, ctx).await;

            let _turn = engine.turn.lock().await;
            engine.settle(&entry, &run, completion, outcome);
            entry.clear_latest(run.id);
            drop(active);
        })
    }

    /// Route a finished run's outcome through the classifier.
    fn settle(
        self: &Arc<Self>,
        entry: &WatcherEntry,
        run: &RunRecord,
        completion: Option<Completion>,
        outcome: Result<(), FlowError>,
    ) {
        let elapsed_ms = (chrono::Utc::now() - run.started_at).num_milliseconds();
        let completion = completion.filter(|_| !run.is_handed_off());
        let failure = match outcome {
            Err(err) if !run.token.is_cancelled() => classify(&err).map(|record| (err, record)),
            Err(_) | Ok(()) => None,
        };

        let Some((err, record)) = failure else {
            if run.token.is_cancelled() {
                debug!(run_id = %run.id, watcher = entry.name(), "superseded run ended");
            } else {
                info!(run_id = %run.id, watcher = entry.name(), elapsed_ms, "run completed");
                let key = error_entity_key(entry.name());
                self.state
                    .write(|view| view.delete_entities(&KeyPattern::Exact(key)));
            }
            if let Some(completion) = completion {
                completion.fire(None, None);
            }
            return;
        };

        let disposition = record.kind.disposition();
        if disposition.notify {
            error!(
                run_id = %run.id,
                watcher = entry.name(),
                kind = ?record.kind,
                error = %err,
                elapsed_ms,
                "run failed"
            );
            self.surface_failure(entry, &err, &record, disposition.navigate);
        } else {
            debug!(run_id = %run.id, watcher = entry.name(), kind = ?record.kind, "run aborted");
        }

        if let Some(completion) = completion {
            match disposition.callback {
                CallbackPolicy::Error => completion.fire(Some(record), None),
                CallbackPolicy::Silent => completion.fire(None, None),
            };
        }
    }

    fn surface_failure(
        self: &Arc<Self>,
        entry: &WatcherEntry,
        err: &FlowError,
        record: &ErrorRecord,
        navigate: bool,
    ) {
        let value = serde_json::to_value(record).unwrap_or(Value::Null);
        let key = error_entity_key(entry.name());
        self.state.write(|view| view.set_entity(key, value));

        if self.config.notify_uncaught {
            let title = match entry.watcher().error_title() {
                Some(title) => title.to_string(),
                None => format!("{} failed", entry.name()),
            };
            let notification = Notification {
                title,
                detail: Some(err.describe()),
            };
            match serde_json::to_value(notification) {
                Ok(payload) => {
                    self.dispatch(Action::with_payload(kinds::NOTIFY_ERROR, payload));
                }
                Err(e) => warn!(error = %e, "could not encode failure notification"),
            }
        }

        if navigate && self.navigator.has_router() {
            if let Some(route) = entry.watcher().fallback_route() {
                debug!(watcher = entry.name(), route, "navigating to fallback route");
                self.navigator.go_to(route);
            }
        }
    }
}

async fn sequential_worker(
    engine: Weak<EngineInner>,
    entry: Weak<WatcherEntry>,
    mut receiver: mpsc::UnboundedReceiver<Queued>,
) {
    while let Some(queued) = receiver.recv().await {
        let (Some(engine), Some(entry)) = (engine.upgrade(), entry.upgrade()) else {
            break;
        };
        let run = RunRecord::new(entry.name(), queued.action.kind(), CancellationToken::new());
        let handle = engine.spawn_run(entry, queued.action, run);
        drop(engine);
        if let Err(e) = handle.await {
            warn!(error = %e, "sequential run ended abnormally");
        }
        let _ = queued.done.send(());
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles an [`Engine`] from collaborators, configuration and watchers.
pub struct EngineBuilder {
    config: EngineConfig,
    rpc: Arc<dyn RpcBackend>,
    storage: Arc<dyn StorageBackend>,
    navigator: Arc<dyn Navigator>,
    prompter: Arc<dyn ConsentPrompter>,
    watchers: Vec<Watcher>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Headless defaults: no RPC backend, in-memory storage, no router, and
    /// every consent prompt declined.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            rpc: Arc::new(UnavailableRpc),
            storage: Arc::new(MemoryStorage::new()),
            navigator: Arc::new(NoopNavigator),
            prompter: Arc::new(AutoReject),
            watchers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_rpc<R: RpcBackend>(mut self, rpc: Arc<R>) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_storage<S: StorageBackend>(mut self, storage: Arc<S>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_navigator<N: Navigator>(mut self, navigator: Arc<N>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn with_prompter<P: ConsentPrompter>(mut self, prompter: Arc<P>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Hydrate this storage item at start.
    pub fn persist_item(mut self, item_key: impl Into<String>) -> Self {
        self.config.persisted_items.push(item_key.into());
        self
    }

    pub fn with_watcher(mut self, watcher: Watcher) -> Self {
        self.watchers.push(watcher);
        self
    }

    /// Register `workflow` for `kind`, named after the kind.
    pub fn register(self, kind: &'static str, policy: Policy, workflow: impl Workflow) -> Self {
        self.with_watcher(Watcher::new(kind, policy, workflow).on(kind))
    }

    pub fn build(self) -> Engine {
        let registry = WatcherRegistry::new();
        registry.register(
            Watcher::new("sagaflow.persist", Policy::Sequential, persist_state).on(kinds::SAVE_STATE),
        );
        registry.register(
            Watcher::new("sagaflow.hydrate", Policy::Sequential, hydrate_state)
                .on(kinds::HYDRATE_STATE),
        );
        for watcher in self.watchers {
            registry.register(watcher);
        }

        let inner = EngineInner {
            bus: ActionBus::new(self.config.bus_capacity, self.config.history_len),
            config: self.config,
            state: SharedState::new(),
            registry,
            consent: ConsentGate::new(self.prompter),
            rpc: self.rpc,
            storage: self.storage,
            navigator: self.navigator,
            patches: Arc::new(PatchLedger::default()),
            turn: Arc::new(tokio::sync::Mutex::new(())),
            runs: dashmap::DashMap::new(),
            inflight: Arc::new(InflightTracker::default()),
            dispatch_lock: Mutex::new(()),
        };
        Engine {
            inner: Arc::new(inner),
        }
    }
}

// ============================================================================
// Engine and handle
// ============================================================================

/// A built, not yet started, engine.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start hydrating persisted storage items and return a handle.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> EngineHandle {
        info!(watchers = self.inner.registry.len(), "engine started");
        self.inner.dispatch(Action::new(kinds::HYDRATE_STATE));
        EngineHandle { inner: self.inner }
    }
}

/// Cloneable entry point for dispatching actions and reading state.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Dispatch an action. Policies are applied before this returns.
    pub fn dispatch(&self, action: Action) -> DispatchReceipt {
        self.inner.dispatch(action)
    }

    /// Dispatch and wait for the runs it started.
    pub async fn dispatch_and_settle(&self, action: Action) {
        self.dispatch(action).settled().await;
    }

    /// Register a watcher on the running engine. Does not start any run.
    pub fn register(&self, watcher: Watcher) {
        self.inner.registry.register(watcher);
    }

    pub fn watchers(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn state(&self) -> StateView {
        self.inner.state.snapshot()
    }

    pub fn select<R>(&self, selector: impl FnOnce(&StateView) -> R) -> R {
        self.inner.state.read(selector)
    }

    /// Live stream of dispatched actions.
    pub fn subscribe(&self) -> broadcast::Receiver<Action> {
        self.inner.bus.subscribe()
    }

    pub fn active_runs(&self) -> Vec<RunInfo> {
        self.inner
            .runs
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.inflight.in_flight()
    }

    /// Wait until no run is in flight.
    pub async fn settled(&self) {
        self.inner.inflight.settled().await;
    }
}
