//! Effect descriptors.
//!
//! A workflow is a sequence of suspension points. Each one is described by
//! an [`Effect`] and interpreted by the run's
//! [`TaskContext`](crate::TaskContext).

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::action::Action;
use crate::error::FlowError;
use crate::rpc::RpcRequest;
use crate::state::{Mutation, StateView};

/// Future produced by a [`Call`].
pub type CallFuture = BoxFuture<'static, Result<Value, FlowError>>;

/// Selector run by a `Select` effect.
pub type Selector = Box<dyn FnOnce(&StateView) -> Value + Send>;

/// A callable suspended on by a `Call` effect.
pub struct Call {
    target: CallTarget,
}

pub(crate) enum CallTarget {
    Rpc(RpcRequest),
    Func {
        name: Cow<'static, str>,
        start: Box<dyn FnOnce() -> CallFuture + Send>,
    },
}

impl Call {
    /// Invoke the engine's RPC collaborator.
    pub fn rpc(request: RpcRequest) -> Self {
        Self {
            target: CallTarget::Rpc(request),
        }
    }

    /// Invoke an arbitrary async function.
    pub fn func<F, Fut>(name: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, FlowError>> + Send + 'static,
    {
        Self {
            target: CallTarget::Func {
                name: name.into(),
                start: Box::new(move || f().boxed()),
            },
        }
    }

    pub fn name(&self) -> &str {
        match &self.target {
            CallTarget::Rpc(request) => &request.query,
            CallTarget::Func { name, .. } => name,
        }
    }

    pub(crate) fn into_target(self) -> CallTarget {
        self.target
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            CallTarget::Rpc(request) => f.debug_tuple("Call::Rpc").field(request).finish(),
            CallTarget::Func { name, .. } => f.debug_tuple("Call::Func").field(name).finish(),
        }
    }
}

/// Labelled branches started together; the first to settle wins.
#[derive(Debug, Default)]
pub struct Race {
    pub(crate) branches: Vec<(String, Effect)>,
}

impl Race {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(mut self, label: impl Into<String>, effect: Effect) -> Self {
        self.branches.push((label.into(), effect));
        self
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|(label, _)| label.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

/// One suspension point of a workflow.
pub enum Effect {
    Call(Call),
    Put(Mutation),
    Select(Selector),
    Race(Race),
    Delay(Duration),
    Take(Cow<'static, str>),
}

impl Effect {
    pub fn call(call: Call) -> Self {
        Self::Call(call)
    }

    pub fn rpc(request: RpcRequest) -> Self {
        Self::Call(Call::rpc(request))
    }

    pub fn put(mutation: Mutation) -> Self {
        Self::Put(mutation)
    }

    pub fn select(selector: impl FnOnce(&StateView) -> Value + Send + 'static) -> Self {
        Self::Select(Box::new(selector))
    }

    pub fn race(race: Race) -> Self {
        Self::Race(race)
    }

    pub fn delay(duration: Duration) -> Self {
        Self::Delay(duration)
    }

    pub fn take(kind: impl Into<Cow<'static, str>>) -> Self {
        Self::Take(kind.into())
    }

    /// Short name for logs.
    pub fn label(&self) -> Cow<'_, str> {
        match self {
            Self::Call(call) => Cow::Owned(format!("call({})", call.name())),
            Self::Put(_) => Cow::Borrowed("put"),
            Self::Select(_) => Cow::Borrowed("select"),
            Self::Race(race) => Cow::Owned(format!(
                "race({})",
                race.labels().collect::<Vec<_>>().join(",")
            )),
            Self::Delay(duration) => Cow::Owned(format!("delay({}ms)", duration.as_millis())),
            Self::Take(kind) => Cow::Owned(format!("take({kind})")),
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(call) => call.fmt(f),
            Self::Put(mutation) => f.debug_tuple("Put").field(mutation).finish(),
            Self::Select(_) => f.write_str("Select(..)"),
            Self::Race(race) => f.debug_tuple("Race").field(&race.branches).finish(),
            Self::Delay(duration) => f.debug_tuple("Delay").field(duration).finish(),
            Self::Take(kind) => f.debug_tuple("Take").field(kind).finish(),
        }
    }
}

/// What an effect resolved to.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// `Put` and `Delay`.
    Done,
    /// `Call` and `Select`.
    Value(Value),
    /// `Take`.
    Action(Action),
    Race(Box<RaceOutcome>),
}

impl Outcome {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Race(race) => race.outcome.into_value(),
            _ => None,
        }
    }

    pub fn into_action(self) -> Option<Action> {
        match self {
            Self::Action(action) => Some(action),
            Self::Race(race) => race.outcome.into_action(),
            _ => None,
        }
    }
}

/// Result of a race: exactly the first settled label.
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    pub label: String,
    pub outcome: Outcome,
}

impl RaceOutcome {
    pub fn winner(&self) -> &str {
        &self.label
    }

    pub fn is(&self, label: &str) -> bool {
        self.label == label
    }

    /// The winning branch's value, if the winner is `label`.
    pub fn take_value(self, label: &str) -> Option<Value> {
        if self.is(label) {
            self.outcome.into_value()
        } else {
            None
        }
    }
}
