//! Watchers bind action kinds to workflows under a dispatch policy.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::action::Action;
use crate::context::TaskContext;
use crate::engine::InflightGuard;
use crate::error::FlowError;

/// How a watcher reacts to matching actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// A new action cancels the watcher's active run and starts another.
    SingleFlightLatest,
    /// Every action starts an independent run.
    ConcurrentEvery,
    /// One run at a time, in arrival order. Actions that arrive while a
    /// run is active wait their turn.
    Sequential,
}

/// Orchestration logic started for a matching action.
///
/// Implemented for any `Fn(Action, TaskContext) -> impl Future`, so plain
/// `async fn`s can be registered directly.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    async fn run(&self, action: Action, ctx: TaskContext) -> Result<(), FlowError>;
}

#[async_trait]
impl<F, Fut> Workflow for F
where
    F: Fn(Action, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
{
    async fn run(&self, action: Action, ctx: TaskContext) -> Result<(), FlowError> {
        (self)(action, ctx).await
    }
}

/// A registration: trigger kinds, policy and workflow.
pub struct Watcher {
    name: String,
    trigger: SmallVec<[Cow<'static, str>; 2]>,
    policy: Policy,
    workflow: Arc<dyn Workflow>,
    fallback_route: Option<String>,
    error_title: Option<String>,
}

impl Watcher {
    pub fn new(name: impl Into<String>, policy: Policy, workflow: impl Workflow) -> Self {
        Self {
            name: name.into(),
            trigger: SmallVec::new(),
            policy,
            workflow: Arc::new(workflow),
            fallback_route: None,
            error_title: None,
        }
    }

    /// Add a trigger kind.
    pub fn on(mut self, kind: impl Into<Cow<'static, str>>) -> Self {
        self.trigger.push(kind.into());
        self
    }

    /// Route navigated to when a run fails with a kind that allows it.
    pub fn with_fallback_route(mut self, route: impl Into<String>) -> Self {
        self.fallback_route = Some(route.into());
        self
    }

    /// Title of the notification raised when a run fails uncaught.
    pub fn with_error_title(mut self, title: impl Into<String>) -> Self {
        self.error_title = Some(title.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn error_title(&self) -> Option<&str> {
        self.error_title.as_deref()
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn fallback_route(&self) -> Option<&str> {
        self.fallback_route.as_deref()
    }

    pub fn triggers(&self) -> impl Iterator<Item = &str> {
        self.trigger.iter().map(|kind| kind.as_ref())
    }

    pub fn matches(&self, kind: &str) -> bool {
        self.trigger.iter().any(|trigger| trigger == kind)
    }

    pub(crate) fn workflow(&self) -> &Arc<dyn Workflow> {
        &self.workflow
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("policy", &self.policy)
            .field("fallback_route", &self.fallback_route)
            .field("error_title", &self.error_title)
            .finish()
    }
}

/// An action waiting for a sequential watcher.
pub(crate) struct Queued {
    pub(crate) action: Action,
    pub(crate) done: oneshot::Sender<()>,
    pub(crate) _inflight: InflightGuard,
}

/// A registered watcher plus its dispatch state.
pub(crate) struct WatcherEntry {
    watcher: Watcher,
    latest: Mutex<Option<(Uuid, CancellationToken)>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Queued>>>,
}

impl WatcherEntry {
    pub(crate) fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    pub(crate) fn name(&self) -> &str {
        self.watcher.name()
    }

    /// Install the token of a new single-flight run, returning the token of
    /// the run it supersedes.
    pub(crate) fn replace_latest(
        &self,
        run_id: Uuid,
        token: CancellationToken,
    ) -> Option<CancellationToken> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((run_id, token))
            .map(|(_, previous)| previous)
    }

    /// Forget the active token if it still belongs to the finished run.
    pub(crate) fn clear_latest(&self, run_id: Uuid) {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if latest.as_ref().is_some_and(|(current, _)| *current == run_id) {
            *latest = None;
        }
    }

    /// Sender of the sequential queue, creating it with `start_worker` on
    /// first use.
    pub(crate) fn sequential_queue(
        &self,
        start_worker: impl FnOnce(mpsc::UnboundedReceiver<Queued>),
    ) -> mpsc::UnboundedSender<Queued> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = queue.as_ref() {
            return sender.clone();
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        start_worker(receiver);
        *queue = Some(sender.clone());
        sender
    }
}

/// All registered watchers. Registration is process-lifetime; there is no
/// unregister.
#[derive(Default)]
pub(crate) struct WatcherRegistry {
    entries: RwLock<Vec<Arc<WatcherEntry>>>,
}

impl WatcherRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a watcher. Does not start any run.
    pub(crate) fn register(&self, watcher: Watcher) {
        if watcher.trigger.is_empty() {
            warn!(watcher = watcher.name(), "watcher registered without trigger kinds");
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|entry| entry.name() == watcher.name()) {
            warn!(watcher = watcher.name(), "watcher name registered twice");
        }
        entries.push(Arc::new(WatcherEntry {
            watcher,
            latest: Mutex::new(None),
            queue: Mutex::new(None),
        }));
    }

    pub(crate) fn matching(&self, kind: &str) -> SmallVec<[Arc<WatcherEntry>; 4]> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.watcher.matches(kind))
            .cloned()
            .collect()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.name().to_string())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
