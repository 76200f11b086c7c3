//! Process-wide shared state.
//!
//! Entities and storage items are plain JSON values keyed by name. Reads
//! are open to anyone through [`StateView`]; writes are crate-private and
//! reached only through a run's [`TaskContext`](crate::TaskContext), which
//! keeps all mutation on the coordinator's path.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use crate::action::Action;

/// Selects entity keys for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
}

impl KeyPattern {
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => key == exact,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

/// A state change issued by a `Put` effect.
#[derive(Debug, Clone)]
pub enum Mutation {
    UpdateEntity { key: String, value: Value },
    DeleteEntities(KeyPattern),
    UpdateStorageItem { key: String, value: Value },
    /// Dispatch an action onto the bus.
    Dispatch(Action),
}

impl Mutation {
    pub fn update_entity(key: impl Into<String>, value: Value) -> Self {
        Self::UpdateEntity {
            key: key.into(),
            value,
        }
    }

    pub fn delete_entities(pattern: KeyPattern) -> Self {
        Self::DeleteEntities(pattern)
    }

    pub fn update_storage_item(key: impl Into<String>, value: Value) -> Self {
        Self::UpdateStorageItem {
            key: key.into(),
            value,
        }
    }

    pub fn dispatch(action: Action) -> Self {
        Self::Dispatch(action)
    }
}

/// Read-only view of shared state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateView {
    entities: BTreeMap<String, Value>,
    storage: BTreeMap<String, Value>,
    storage_ready: bool,
}

impl StateView {
    pub fn entity(&self, key: &str) -> Option<&Value> {
        self.entities.get(key)
    }

    pub fn has_entity(&self, key: &str) -> bool {
        self.entities.contains_key(key)
    }

    pub fn entity_keys(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn storage_item(&self, key: &str) -> Option<&Value> {
        self.storage.get(key)
    }

    pub fn storage_items(&self) -> &BTreeMap<String, Value> {
        &self.storage
    }

    /// Whether persisted storage items have been hydrated.
    pub fn is_storage_ready(&self) -> bool {
        self.storage_ready
    }

    pub(crate) fn entity_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entities.get_mut(key)
    }

    pub(crate) fn set_entity(&mut self, key: String, value: Value) {
        self.entities.insert(key, value);
    }

    pub(crate) fn delete_entities(&mut self, pattern: &KeyPattern) -> usize {
        let before = self.entities.len();
        self.entities.retain(|key, _| !pattern.matches(key));
        before - self.entities.len()
    }

    pub(crate) fn set_storage_item(&mut self, key: String, value: Value) {
        self.storage.insert(key, value);
    }

    pub(crate) fn set_storage_ready(&mut self) {
        self.storage_ready = true;
    }
}

/// The single process-wide state store.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    view: RwLock<StateView>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run a selector against the current state.
    pub(crate) fn read<R>(&self, selector: impl FnOnce(&StateView) -> R) -> R {
        let view = self.view.read().unwrap_or_else(PoisonError::into_inner);
        selector(&view)
    }

    pub(crate) fn snapshot(&self) -> StateView {
        self.read(StateView::clone)
    }

    pub(crate) fn write<R>(&self, mutate: impl FnOnce(&mut StateView) -> R) -> R {
        let mut view = self.view.write().unwrap_or_else(PoisonError::into_inner);
        mutate(&mut view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_patterns_match_exact_and_prefix() {
        assert!(KeyPattern::exact("result").matches("result"));
        assert!(!KeyPattern::exact("result").matches("results"));
        assert!(KeyPattern::prefix("projects").matches("projects"));
        assert!(KeyPattern::prefix("projects").matches("projectsExamples"));
        assert!(!KeyPattern::prefix("projects").matches("project"));
    }

    #[test]
    fn delete_by_prefix_removes_every_match() {
        let state = SharedState::new();
        state.write(|view| {
            view.set_entity("projects".into(), json!([]));
            view.set_entity("projectExamples".into(), json!([]));
            view.set_entity("config".into(), json!({}));
        });

        let removed = state.write(|view| view.delete_entities(&KeyPattern::prefix("project")));

        assert_eq!(removed, 2);
        let keys: Vec<String> = state.read(|view| view.entity_keys().map(String::from).collect());
        assert_eq!(keys, vec!["config".to_string()]);
    }

    #[test]
    fn reads_observe_latest_write() {
        let state = SharedState::new();
        state.write(|view| view.set_entity("result".into(), json!(1)));
        state.write(|view| view.set_entity("result".into(), json!(2)));
        assert_eq!(state.read(|view| view.entity("result").cloned()), Some(json!(2)));
    }
}
