//! The task coordinator's per-run interpreter.
//!
//! A workflow receives a [`TaskContext`] and advances by issuing effects
//! through it. `Put` and `Select` apply synchronously; `Call`, `Race`,
//! `Delay`, `Take` and consent requests suspend the run. Cancellation is
//! observed atomically with every `Put` and on both sides of every
//! suspension, so a superseded run applies nothing after the action that
//! superseded it. Between suspensions the run holds the engine's turn, so
//! a select followed by a put is never interleaved with another run.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{select_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::action::{kinds, Action, Completion, Notification};
use crate::config::EngineConfig;
use crate::consent::ConsentRecord;
use crate::effect::{Call, CallTarget, Effect, Outcome, Race, RaceOutcome};
use crate::engine::EngineInner;
use crate::error::{ErrorRecord, FlowError};
use crate::patch::{self, OptimisticPatch, PatchTarget};
use crate::rpc::RpcRequest;
use crate::state::{KeyPattern, Mutation, StateView};
use crate::storage::StorageBackend;

/// Bookkeeping for one in-flight run.
pub(crate) struct RunRecord {
    pub(crate) id: Uuid,
    pub(crate) watcher: String,
    pub(crate) trigger: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) token: CancellationToken,
    pending_races: AtomicUsize,
    handed_off: AtomicBool,
}

impl RunRecord {
    pub(crate) fn new(watcher: &str, trigger: &str, token: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            watcher: watcher.to_string(),
            trigger: trigger.to_string(),
            started_at: Utc::now(),
            token,
            pending_races: AtomicUsize::new(0),
            handed_off: AtomicBool::new(false),
        }
    }

    /// Whether the run passed its completion on to another action.
    pub(crate) fn is_handed_off(&self) -> bool {
        self.handed_off.load(Ordering::SeqCst)
    }

    pub(crate) fn info(&self) -> RunInfo {
        RunInfo {
            id: self.id,
            watcher: self.watcher.clone(),
            trigger: self.trigger.clone(),
            started_at: self.started_at,
            cancelled: self.token.is_cancelled(),
            pending_races: self.pending_races.load(Ordering::SeqCst),
        }
    }
}

/// Snapshot of an in-flight run.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub id: Uuid,
    pub watcher: String,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    /// Race branches currently started and unsettled.
    pub pending_races: usize,
}

/// Counts a race's branches as pending for as long as the race runs.
struct PendingRaces<'a> {
    run: &'a RunRecord,
    count: usize,
}

impl<'a> PendingRaces<'a> {
    fn enter(run: &'a RunRecord, count: usize) -> Self {
        run.pending_races.fetch_add(count, Ordering::SeqCst);
        Self { run, count }
    }
}

impl Drop for PendingRaces<'_> {
    fn drop(&mut self) {
        self.run.pending_races.fetch_sub(self.count, Ordering::SeqCst);
    }
}

/// Handle through which a workflow issues effects.
pub struct TaskContext {
    inner: Arc<EngineInner>,
    run: Arc<RunRecord>,
    cursor: u64,
    own_puts: SmallVec<[u64; 4]>,
    completion: Option<Completion>,
    turn: Option<OwnedMutexGuard<()>>,
}

impl TaskContext {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        run: Arc<RunRecord>,
        cursor: u64,
        completion: Option<Completion>,
        turn: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            inner,
            run,
            cursor,
            own_puts: SmallVec::new(),
            completion,
            turn: Some(turn),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn watcher(&self) -> &str {
        &self.run.watcher
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.token.is_cancelled()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn storage(&self) -> Arc<dyn StorageBackend> {
        self.inner.storage.clone()
    }

    fn ensure_active(&self) -> Result<(), FlowError> {
        if self.is_cancelled() {
            Err(FlowError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    /// Fire the triggering action's completion callback, if any. Call this
    /// after the run's last mutation. Returns `false` when there is no
    /// callback or it already fired.
    pub fn end(&self, error: Option<ErrorRecord>, result: Option<Value>) -> bool {
        match &self.completion {
            Some(completion) => completion.fire(error, result),
            None => false,
        }
    }

    /// Take the completion so it can travel with another action. The
    /// engine no longer fires it when this run ends.
    pub fn hand_off_completion(&mut self) -> Option<Completion> {
        let completion = self.completion.take()?;
        self.run.handed_off.store(true, Ordering::SeqCst);
        Some(completion)
    }

    // ------------------------------------------------------------------
    // Select
    // ------------------------------------------------------------------

    /// Read shared state. Never suspends.
    pub fn select<R>(&self, selector: impl FnOnce(&StateView) -> R) -> R {
        self.inner.state.read(selector)
    }

    // ------------------------------------------------------------------
    // Put
    // ------------------------------------------------------------------

    /// Apply a mutation. Never suspends; fails with
    /// [`FlowError::Cancelled`] once the run has been superseded.
    pub fn put(&mut self, mutation: Mutation) -> Result<(), FlowError> {
        let applied = self
            .inner
            .commit(&self.run.token, |inner| apply_mutation(inner, mutation))?;
        if let Some(seq) = applied {
            self.own_puts.push(seq);
        }
        Ok(())
    }

    pub fn update_entity(&mut self, key: impl Into<String>, value: Value) -> Result<(), FlowError> {
        self.put(Mutation::update_entity(key, value))
    }

    pub fn delete_entities(&mut self, pattern: KeyPattern) -> Result<(), FlowError> {
        self.put(Mutation::delete_entities(pattern))
    }

    pub fn update_storage_item(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), FlowError> {
        self.put(Mutation::update_storage_item(key, value))
    }

    pub fn dispatch(&mut self, action: Action) -> Result<(), FlowError> {
        self.put(Mutation::dispatch(action))
    }

    /// Dispatch a user-visible error notification.
    pub fn notify_error(&mut self, title: impl Into<String>, err: &FlowError) -> Result<(), FlowError> {
        let title = title.into();
        warn!(run_id = %self.run.id, watcher = %self.run.watcher, error = %err, "{title}");
        self.notify(kinds::NOTIFY_ERROR, title, Some(err.describe()))
    }

    /// Dispatch a user-visible success notification.
    pub fn notify_success(
        &mut self,
        title: impl Into<String>,
        detail: Option<String>,
    ) -> Result<(), FlowError> {
        self.notify(kinds::NOTIFY_SUCCESS, title.into(), detail)
    }

    fn notify(&mut self, kind: &'static str, title: String, detail: Option<String>) -> Result<(), FlowError> {
        let payload = serde_json::to_value(Notification { title, detail })?;
        self.dispatch(Action::with_payload(kind, payload))
    }

    pub(crate) fn mark_storage_ready(&mut self) -> Result<(), FlowError> {
        self.inner
            .commit(&self.run.token, |inner| inner.state.write(StateView::set_storage_ready))
    }

    // ------------------------------------------------------------------
    // Suspending effects
    // ------------------------------------------------------------------

    /// Interpret any effect descriptor.
    pub async fn run(&mut self, effect: Effect) -> Result<Outcome, FlowError> {
        match effect {
            Effect::Put(mutation) => {
                self.put(mutation)?;
                Ok(Outcome::Done)
            }
            Effect::Select(selector) => Ok(Outcome::Value(self.select(selector))),
            other => {
                let label = other.label().into_owned();
                let future = self.interpreter().interpret(other);
                self.suspend(&label, future).await
            }
        }
    }

    /// Suspend until the call settles. A rejection is returned as an error
    /// the workflow can handle.
    pub async fn call(&mut self, call: Call) -> Result<Value, FlowError> {
        let outcome = self.run(Effect::Call(call)).await?;
        Ok(outcome.into_value().unwrap_or(Value::Null))
    }

    /// `Call` against the RPC collaborator.
    pub async fn rpc(&mut self, request: RpcRequest) -> Result<Value, FlowError> {
        self.call(Call::rpc(request)).await
    }

    /// Start every branch, resolve with the first to settle and abandon
    /// the others.
    pub async fn race(&mut self, race: Race) -> Result<RaceOutcome, FlowError> {
        match self.run(Effect::Race(race)).await? {
            Outcome::Race(outcome) => Ok(*outcome),
            other => Err(FlowError::unknown(format!("race resolved to {other:?}"))),
        }
    }

    pub async fn delay(&mut self, duration: Duration) -> Result<(), FlowError> {
        self.run(Effect::Delay(duration)).await.map(|_| ())
    }

    /// Suspend until an action of `kind` is dispatched.
    pub async fn take(&mut self, kind: &str) -> Result<Action, FlowError> {
        let outcome = self.run(Effect::take(kind.to_string())).await?;
        outcome
            .into_action()
            .ok_or_else(|| FlowError::unknown(format!("take({kind}) resolved without an action")))
    }

    /// Wait for the user's decision on a consent gate.
    pub async fn consent(&mut self, record: ConsentRecord) -> Result<(), FlowError> {
        let label = format!("consent({})", record.id);
        let decision = self.inner.consent.request(record);
        let future = async move { decision.await.map(|()| Outcome::Done) }.boxed();
        self.suspend(&label, future).await.map(|_| ())
    }

    async fn suspend(
        &mut self,
        label: &str,
        future: BoxFuture<'static, Result<Outcome, FlowError>>,
    ) -> Result<Outcome, FlowError> {
        self.ensure_active()?;
        trace!(run_id = %self.run.id, effect = label, "suspending");

        let token = self.run.token.clone();
        drop(self.turn.take());
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(FlowError::Cancelled),
            result = future => result,
        };
        self.turn = Some(self.inner.turn.clone().lock_owned().await);

        self.cursor = self.inner.bus.position();
        self.own_puts.clear();
        trace!(run_id = %self.run.id, effect = label, "resumed");

        self.ensure_active()?;
        result
    }

    fn interpreter(&self) -> Interpreter {
        Interpreter {
            inner: self.inner.clone(),
            run: self.run.clone(),
            cursor: self.cursor,
            own_puts: self.own_puts.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Optimistic updates
    // ------------------------------------------------------------------

    /// Apply `partial` (a JSON object) to the target ahead of remote
    /// confirmation. Returns `None` if the target does not exist.
    pub fn patch(
        &mut self,
        target: PatchTarget,
        partial: Value,
    ) -> Result<Option<OptimisticPatch>, FlowError> {
        let Value::Object(partial) = partial else {
            return Err(FlowError::unknown("optimistic patch must be a JSON object"));
        };
        let entity = target.entity_key().to_string();
        let patch = self.inner.commit(&self.run.token, |inner| {
            inner
                .state
                .write(|view| patch::apply(view, &inner.patches, target, &partial))
        })?;
        debug!(run_id = %self.run.id, entity = %entity, applied = patch.is_some(), "optimistic patch");
        Ok(patch)
    }

    /// Restore the values a patch overwrote. Overlapping patches on the same
    /// field restore the newest value still awaiting confirmation, or the
    /// last confirmed one.
    ///
    /// Applies even once the run is cancelled: an unconfirmed value never
    /// outlives the run that patched it.
    pub fn rollback(&mut self, mut patch: OptimisticPatch) -> Result<(), FlowError> {
        let restored = self.inner.state.write(|view| patch::revert(view, &mut patch));
        if restored {
            debug!(run_id = %self.run.id, entity = patch.target().entity_key(), "optimistic patch rolled back");
        } else {
            warn!(entity = patch.target().entity_key(), "rollback target no longer exists");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    /// Fire-and-forget route change; skipped without a router or once the
    /// run is cancelled.
    pub fn navigate(&self, path: &str) {
        if self.is_cancelled() || !self.inner.navigator.has_router() {
            return;
        }
        debug!(run_id = %self.run.id, path, "navigate");
        self.inner.navigator.go_to(path);
    }
}

/// Apply a mutation to shared state or the bus. Returns the sequence number
/// of a dispatched action. Runs inside [`EngineInner::commit`].
fn apply_mutation(inner: &Arc<EngineInner>, mutation: Mutation) -> Option<u64> {
    match mutation {
        Mutation::UpdateEntity { key, value } => {
            inner.state.write(|view| view.set_entity(key, value));
        }
        Mutation::DeleteEntities(pattern) => {
            let removed = inner.state.write(|view| view.delete_entities(&pattern));
            trace!(?pattern, removed, "entities deleted");
        }
        Mutation::UpdateStorageItem { key, value } => {
            inner.state.write(|view| view.set_storage_item(key, value));
        }
        Mutation::Dispatch(action) => return Some(inner.dispatch_locked(action).seq()),
    }
    None
}

/// Owned interpreter for suspending effects, so race branches can run as
/// independent futures.
#[derive(Clone)]
struct Interpreter {
    inner: Arc<EngineInner>,
    run: Arc<RunRecord>,
    cursor: u64,
    own_puts: SmallVec<[u64; 4]>,
}

impl Interpreter {
    fn interpret(self, effect: Effect) -> BoxFuture<'static, Result<Outcome, FlowError>> {
        async move {
            match effect {
                Effect::Call(call) => self.call(call).await.map(Outcome::Value),
                Effect::Put(mutation) => {
                    let _turn = self.inner.turn.lock().await;
                    self.inner
                        .commit(&self.run.token, |inner| apply_mutation(inner, mutation))?;
                    Ok(Outcome::Done)
                }
                Effect::Select(selector) => Ok(Outcome::Value(self.inner.state.read(selector))),
                Effect::Race(race) => self.race(race).await,
                Effect::Delay(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(Outcome::Done)
                }
                Effect::Take(kind) => self.take(&kind).await.map(Outcome::Action),
            }
        }
        .boxed()
    }

    async fn call(&self, call: Call) -> Result<Value, FlowError> {
        match call.into_target() {
            CallTarget::Rpc(request) => {
                debug!(run_id = %self.run.id, query = %request.query, "rpc call");
                let rpc = self.inner.rpc.clone();
                Ok(rpc.invoke(request).await?)
            }
            CallTarget::Func { name, start } => {
                trace!(run_id = %self.run.id, call = %name, "function call");
                start().await
            }
        }
    }

    async fn race(&self, race: Race) -> Result<Outcome, FlowError> {
        if race.is_empty() {
            return Err(FlowError::unknown("race needs at least one branch"));
        }
        let (mut labels, branches): (Vec<String>, Vec<_>) = race
            .branches
            .into_iter()
            .map(|(label, effect)| (label, self.clone().interpret(effect)))
            .unzip();

        let _pending = PendingRaces::enter(&self.run, branches.len());
        let (result, index, losers) = select_all(branches).await;
        let label = labels.swap_remove(index);
        if !losers.is_empty() {
            // Dropping the losers abandons their in-flight work; a late
            // result from any of them is never observed.
            warn!(run_id = %self.run.id, winner = %label, discarded = ?labels, "race losers abandoned");
        }
        drop(losers);

        result.map(|outcome| Outcome::Race(Box::new(RaceOutcome { label, outcome })))
    }

    async fn take(&self, kind: &str) -> Result<Action, FlowError> {
        let accepts = |action: &Action| {
            action.is(kind) && action.seq() > self.cursor && !self.own_puts.contains(&action.seq())
        };

        let (backlog, mut receiver) = self.inner.bus.subscribe_since(self.cursor);
        if let Some(action) = backlog.into_iter().find(|action| accepts(action)) {
            return Ok(action);
        }

        loop {
            match receiver.recv().await {
                Ok(action) if accepts(&action) => return Ok(action),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(run_id = %self.run.id, kind, skipped, "take lagged behind the action bus");
                }
                Err(RecvError::Closed) => return Err(FlowError::unknown("action bus closed")),
            }
        }
    }
}
