//! Optimistic patches.
//!
//! A patch applies a partial update to shared state ahead of remote
//! confirmation and remembers the values it overwrote. Every patch ends in
//! exactly one of [`OptimisticPatch::confirm`] or
//! [`TaskContext::rollback`](crate::TaskContext::rollback).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tracing::warn;

use crate::state::StateView;

/// What a patch applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchTarget {
    /// An entity holding a JSON object.
    Entity(String),
    /// The first object in an entity list whose `field` equals `value`.
    ListItem {
        entity: String,
        field: String,
        value: Value,
    },
}

impl PatchTarget {
    pub fn entity(key: impl Into<String>) -> Self {
        Self::Entity(key.into())
    }

    pub fn list_item(entity: impl Into<String>, field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::ListItem {
            entity: entity.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn entity_key(&self) -> &str {
        match self {
            Self::Entity(key) => key,
            Self::ListItem { entity, .. } => entity,
        }
    }

    fn locate<'a>(&self, view: &'a mut StateView) -> Option<&'a mut Map<String, Value>> {
        match self {
            Self::Entity(key) => view.entity_mut(key)?.as_object_mut(),
            Self::ListItem {
                entity,
                field,
                value,
            } => view
                .entity_mut(entity)?
                .as_array_mut()?
                .iter_mut()
                .filter_map(Value::as_object_mut)
                .find(|item| item.get(field) == Some(value)),
        }
    }
}

/// Unresolved patches per patched field.
///
/// While patches on the same field overlap, the field's `base` is the last
/// value the remote side is known to hold. Rolling back a patch restores
/// the newest value still awaiting confirmation, or the base once nothing
/// is pending.
#[derive(Debug, Default)]
pub(crate) struct PatchLedger {
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    next_id: u64,
    fields: Vec<PendingField>,
}

#[derive(Debug)]
struct PendingField {
    target: PatchTarget,
    field: String,
    base: Option<Value>,
    pending: Vec<(u64, Value)>,
}

impl LedgerState {
    fn position(&self, target: &PatchTarget, field: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|entry| entry.target == *target && entry.field == field)
    }

    /// Take patch `id` off a field's pending list. Returns the entry's
    /// index and the value the patch had applied.
    fn withdraw(&mut self, id: u64, target: &PatchTarget, field: &str) -> Option<(usize, Value)> {
        let index = self.position(target, field)?;
        let pending = &mut self.fields[index].pending;
        let slot = pending.iter().position(|(pending_id, _)| *pending_id == id)?;
        let (_, value) = pending.remove(slot);
        Some((index, value))
    }

    fn forget_if_idle(&mut self, index: usize) {
        if self.fields[index].pending.is_empty() {
            self.fields.swap_remove(index);
        }
    }
}

impl PatchLedger {
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> u64 {
        let mut state = self.lock();
        state.next_id += 1;
        state.next_id
    }

    fn record(&self, id: u64, target: &PatchTarget, field: &str, previous: &Option<Value>, value: &Value) {
        let mut state = self.lock();
        let index = match state.position(target, field) {
            Some(index) => index,
            None => {
                state.fields.push(PendingField {
                    target: target.clone(),
                    field: field.to_string(),
                    base: previous.clone(),
                    pending: Vec::new(),
                });
                state.fields.len() - 1
            }
        };
        state.fields[index].pending.push((id, value.clone()));
    }

    /// The remote side accepted the patch: its values become the base.
    fn settle_confirmed(&self, patch: &OptimisticPatch) {
        let mut state = self.lock();
        for (field, _) in &patch.previous {
            if let Some((index, value)) = state.withdraw(patch.id, &patch.target, field) {
                state.fields[index].base = Some(value);
                state.forget_if_idle(index);
            }
        }
    }

    /// Values each field of a rolled back patch must show afterwards.
    fn settle_rejected(&self, patch: &OptimisticPatch) -> Vec<(String, Option<Value>)> {
        let mut state = self.lock();
        patch
            .previous
            .iter()
            .map(|(field, previous)| {
                let Some((index, _)) = state.withdraw(patch.id, &patch.target, field) else {
                    return (field.clone(), previous.clone());
                };
                let entry = &state.fields[index];
                let restored = match entry.pending.last() {
                    Some((_, newer)) => Some(newer.clone()),
                    None => entry.base.clone(),
                };
                state.forget_if_idle(index);
                (field.clone(), restored)
            })
            .collect()
    }
}

/// An applied, not yet resolved, optimistic update.
#[must_use = "an optimistic patch must be confirmed or rolled back"]
#[derive(Debug)]
pub struct OptimisticPatch {
    id: u64,
    target: PatchTarget,
    previous: Vec<(String, Option<Value>)>,
    ledger: Arc<PatchLedger>,
    resolved: bool,
}

impl OptimisticPatch {
    pub fn target(&self) -> &PatchTarget {
        &self.target
    }

    /// Value a field held before the patch; `None` if it was absent.
    pub fn previous_value(&self, field: &str) -> Option<&Value> {
        self.previous
            .iter()
            .find(|(name, _)| name == field)
            .and_then(|(_, value)| value.as_ref())
    }

    /// The update that restores the pre-patch values.
    pub fn rollback_update(&self) -> Map<String, Value> {
        self.previous
            .iter()
            .map(|(field, value)| (field.clone(), value.clone().unwrap_or(Value::Null)))
            .collect()
    }

    /// The remote side accepted the change.
    pub fn confirm(mut self) {
        self.resolved = true;
        self.ledger.settle_confirmed(&self);
    }
}

impl Drop for OptimisticPatch {
    fn drop(&mut self) {
        if !self.resolved {
            warn!(
                entity = self.target.entity_key(),
                "optimistic patch dropped without confirmation or rollback"
            );
            self.ledger.settle_confirmed(self);
        }
    }
}

/// Apply `partial` to the target, returning the patch record, or `None`
/// when the target does not exist.
pub(crate) fn apply(
    view: &mut StateView,
    ledger: &Arc<PatchLedger>,
    target: PatchTarget,
    partial: &Map<String, Value>,
) -> Option<OptimisticPatch> {
    let object = target.locate(view)?;
    let id = ledger.begin();
    let previous = partial
        .iter()
        .map(|(field, value)| {
            let previous = object.insert(field.clone(), value.clone());
            ledger.record(id, &target, field, &previous, value);
            (field.clone(), previous)
        })
        .collect();
    Some(OptimisticPatch {
        id,
        target,
        previous,
        ledger: ledger.clone(),
        resolved: false,
    })
}

/// Resolve `patch` as rejected and restore its fields. A field still
/// covered by a newer unresolved patch keeps that patch's value; otherwise
/// it returns to its last confirmed value, or is removed if it had none.
pub(crate) fn revert(view: &mut StateView, patch: &mut OptimisticPatch) -> bool {
    patch.resolved = true;
    let restored = patch.ledger.settle_rejected(patch);
    let Some(object) = patch.target.locate(view) else {
        return false;
    };
    for (field, value) in restored {
        match value {
            Some(value) => {
                object.insert(field, value);
            }
            None => {
                object.remove(&field);
            }
        }
    }
    true
}
