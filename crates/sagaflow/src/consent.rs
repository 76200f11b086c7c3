//! Consent gate for irreversible operations.
//!
//! A workflow awaits the gate before a destructive remote call. Accepting
//! resolves the request; declining rejects it with
//! [`FlowError::ConsentRejected`], which aborts only the requesting run.
//! Concurrent requests for the same consent id share one pending decision
//! instead of opening a second prompt.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FlowError;

/// A reusable confirmation prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: String,
    pub content: String,
    pub accept_label: String,
}

impl ConsentRecord {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        accept_label: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            accept_label: accept_label.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
    Accepted,
    Rejected,
}

/// Asks the user.
#[async_trait]
pub trait ConsentPrompter: Send + Sync + 'static {
    async fn decide(&self, record: &ConsentRecord) -> ConsentDecision;
}

/// Accepts every prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

#[async_trait]
impl ConsentPrompter for AutoAccept {
    async fn decide(&self, _record: &ConsentRecord) -> ConsentDecision {
        ConsentDecision::Accepted
    }
}

/// Declines every prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoReject;

#[async_trait]
impl ConsentPrompter for AutoReject {
    async fn decide(&self, _record: &ConsentRecord) -> ConsentDecision {
        ConsentDecision::Rejected
    }
}

type PendingDecision = Shared<BoxFuture<'static, Result<(), FlowError>>>;

pub(crate) struct ConsentGate {
    prompter: Arc<dyn ConsentPrompter>,
    pending: Arc<DashMap<String, PendingDecision>>,
}

impl ConsentGate {
    pub(crate) fn new(prompter: Arc<dyn ConsentPrompter>) -> Self {
        Self {
            prompter,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Request consent. Joins the pending decision when one exists for the
    /// same id. A resolved decision is forgotten, so a later request
    /// prompts again.
    pub(crate) fn request(&self, record: ConsentRecord) -> PendingDecision {
        let entry = self.pending.entry(record.id.clone());
        if let dashmap::Entry::Occupied(existing) = &entry {
            debug!(consent = %record.id, "joining pending consent decision");
            return existing.get().clone();
        }

        let prompter = self.prompter.clone();
        let pending = self.pending.clone();
        let decision = async move {
            let decision = prompter.decide(&record).await;
            pending.remove(&record.id);
            debug!(consent = %record.id, ?decision, "consent decided");
            match decision {
                ConsentDecision::Accepted => Ok(()),
                ConsentDecision::Rejected => Err(FlowError::ConsentRejected {
                    consent_id: record.id,
                }),
            }
        }
        .boxed()
        .shared();

        entry.or_insert(decision.clone());
        decision
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
