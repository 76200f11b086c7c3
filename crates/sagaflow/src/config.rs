use serde::{Deserialize, Serialize};

/// Engine settings.
///
/// Usually assembled through [`EngineBuilder`](crate::EngineBuilder); also
/// readable from JSON, with every field optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffer of the action broadcast channel.
    pub bus_capacity: usize,
    /// Recent actions retained for `Take`.
    pub history_len: usize,
    /// Namespace handed to the storage backend.
    pub storage_key: String,
    /// Storage items loaded at start.
    pub persisted_items: Vec<String>,
    /// Dispatch `NOTIFY_ERROR` for uncaught failures.
    pub notify_uncaught: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            history_len: 256,
            storage_key: "state".to_string(),
            persisted_items: Vec::new(),
            notify_uncaught: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
