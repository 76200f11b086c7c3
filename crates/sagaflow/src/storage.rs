//! Durable storage collaborator and the built-in persistence workflows.
//!
//! Storage items live in shared state like entities do. They reach durable
//! storage only when a `SAVE_STATE` action is dispatched; the persistence
//! watcher writes every item and then dispatches `STATE_SAVED`, which
//! workflows can `take` to await completion. Last writer wins.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::action::{kinds, Action};
use crate::context::TaskContext;
use crate::effect::Call;
use crate::error::FlowError;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("could not persist '{item_key}': {reason}")]
    Write { item_key: String, reason: String },
}

/// Key/value persistence, namespaced by a storage key.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    async fn read_item(&self, storage_key: &str, item_key: &str)
        -> Result<Option<Value>, StorageError>;

    async fn write_item(
        &self,
        storage_key: &str,
        item_key: &str,
        value: Value,
    ) -> Result<(), StorageError>;
}

/// In-process storage backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: DashMap<(String, String), Value>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an item, as if it had been persisted by an earlier process.
    pub fn with_item(self, storage_key: &str, item_key: &str, value: Value) -> Self {
        self.items
            .insert((storage_key.to_string(), item_key.to_string()), value);
        self
    }

    pub fn get(&self, storage_key: &str, item_key: &str) -> Option<Value> {
        self.items
            .get(&(storage_key.to_string(), item_key.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read_item(
        &self,
        storage_key: &str,
        item_key: &str,
    ) -> Result<Option<Value>, StorageError> {
        Ok(self.get(storage_key, item_key))
    }

    async fn write_item(
        &self,
        storage_key: &str,
        item_key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        self.items
            .insert((storage_key.to_string(), item_key.to_string()), value);
        Ok(())
    }
}

/// Write every storage item, then announce `STATE_SAVED`.
pub(crate) async fn persist_state(_action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let items = ctx.select(|state| state.storage_items().clone());
    let storage = ctx.storage();
    let storage_key = ctx.config().storage_key.clone();
    let count = items.len();

    ctx.call(Call::func("storage.write_items", move || async move {
        for (item_key, value) in items {
            storage.write_item(&storage_key, &item_key, value).await?;
        }
        Ok(Value::Null)
    }))
    .await?;

    info!(items = count, "state persisted");
    ctx.dispatch(Action::new(kinds::STATE_SAVED))?;
    Ok(())
}

/// Load the configured storage items into shared state, then announce
/// `STORE_READY`.
pub(crate) async fn hydrate_state(_action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
    let storage = ctx.storage();
    let storage_key = ctx.config().storage_key.clone();
    let item_keys = ctx.config().persisted_items.clone();

    let loaded = ctx
        .call(Call::func("storage.read_items", move || async move {
            let mut loaded = serde_json::Map::new();
            for item_key in item_keys {
                if let Some(value) = storage.read_item(&storage_key, &item_key).await? {
                    loaded.insert(item_key, value);
                }
            }
            Ok(Value::Object(loaded))
        }))
        .await?;

    if let Value::Object(items) = loaded {
        for (item_key, value) in items {
            debug!(item = %item_key, "hydrated storage item");
            ctx.update_storage_item(item_key, value)?;
        }
    }
    ctx.mark_storage_ready()?;
    ctx.dispatch(Action::new(kinds::STORE_READY))?;
    Ok(())
}
