//! Actions: typed records that trigger and sequence workflows.

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorRecord, FlowError};

/// Action kinds the engine itself produces or consumes.
pub mod kinds {
    /// Persist every storage item; answered by `STATE_SAVED`.
    pub const SAVE_STATE: &str = "SAVE_STATE";
    pub const STATE_SAVED: &str = "STATE_SAVED";
    /// Dispatched once storage items have been hydrated.
    pub const STORE_READY: &str = "STORE_READY";
    pub(crate) const HYDRATE_STATE: &str = "HYDRATE_STATE";
    pub const NOTIFY_ERROR: &str = "NOTIFY_ERROR";
    pub const NOTIFY_SUCCESS: &str = "NOTIFY_SUCCESS";
}

/// Completion callback: `(error, result)`.
pub type OnEnd = Box<dyn FnOnce(Option<ErrorRecord>, Option<Value>) + Send>;

/// Exactly-once handle on an `onEnd` callback.
///
/// Clones share the same callback; only the first `fire` invokes it.
#[derive(Clone)]
pub struct Completion {
    slot: Arc<Mutex<Option<OnEnd>>>,
}

impl Completion {
    pub fn new(on_end: impl FnOnce(Option<ErrorRecord>, Option<Value>) + Send + 'static) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(on_end)))),
        }
    }

    /// Invoke the callback. Returns `false` if it had already fired.
    pub fn fire(&self, error: Option<ErrorRecord>, result: Option<Value>) -> bool {
        let on_end = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match on_end {
            Some(on_end) => {
                on_end(error, result);
                true
            }
            None => false,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// An immutable `{type, payload}` record.
///
/// `seq` is assigned by the bus on dispatch. The completion handle travels
/// beside the payload and never appears in it.
#[derive(Debug, Clone)]
pub struct Action {
    kind: Cow<'static, str>,
    payload: Value,
    seq: u64,
    completion: Option<Completion>,
}

impl Action {
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: kind.into(),
            payload: Value::Null,
            seq: 0,
            completion: None,
        }
    }

    pub fn with_payload(kind: impl Into<Cow<'static, str>>, payload: Value) -> Self {
        Self {
            payload,
            ..Self::new(kind)
        }
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Attach an `onEnd(error, result)` callback.
    pub fn on_end(
        self,
        on_end: impl FnOnce(Option<ErrorRecord>, Option<Value>) + Send + 'static,
    ) -> Self {
        self.with_completion(Completion::new(on_end))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Sequence number assigned at dispatch; 0 before dispatch.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    /// Deserialize the payload into a typed record.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, FlowError> {
        let payload = match &self.payload {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(payload)
            .map_err(|e| FlowError::unknown(format!("invalid {} payload: {e}", self.kind)))
    }

    pub(crate) fn stamp(&mut self, seq: u64) {
        self.seq = seq;
    }
}

/// Payload of `NOTIFY_ERROR` / `NOTIFY_SUCCESS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completion_fires_once_across_clones() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let completion = Completion::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let other = completion.clone();

        assert!(completion.fire(None, Some(json!(1))));
        assert!(!other.fire(None, None));
        assert!(other.is_fired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parse_treats_missing_payload_as_empty_object() {
        #[derive(Deserialize)]
        struct Load {
            #[serde(default)]
            force: bool,
        }

        let load: Load = Action::new("LOAD").parse().unwrap();
        assert!(!load.force);

        let load: Load = Action::with_payload("LOAD", json!({"force": true}))
            .parse()
            .unwrap();
        assert!(load.force);
    }

    #[test]
    fn parse_reports_kind_on_bad_payload() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Open {
            project_dir: String,
        }

        let err = Action::with_payload("OPEN", json!({"project_dir": 3}))
            .parse::<Open>()
            .unwrap_err();
        assert!(err.to_string().contains("invalid OPEN payload"));
    }
}
