//! Error types and the failure taxonomy.
//!
//! Every failure a workflow can produce is a [`FlowError`]. The classifier
//! maps it onto the closed [`ErrorKind`] taxonomy and a [`Disposition`]
//! that tells the coordinator whether to notify, navigate to a safe
//! screen, and what the completion callback receives.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rpc::RpcError;
use crate::storage::StorageError;

/// Failure outcome of a workflow run or of a single effect.
///
/// Consent rejection and stale writes are expected control flow and are
/// distinguished from genuine failures by [`ErrorKind`], so callers can
/// match instead of comparing messages.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// The remote call was rejected with a structured error.
    #[error("{message}")]
    Rpc {
        message: String,
        data: Option<Value>,
    },

    /// The remote payload could not be parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The user declined a consent gate.
    #[error("consent '{consent_id}' was declined")]
    ConsentRejected { consent_id: String },

    /// The remote resource changed after it was loaded.
    #[error("file was modified at {modified_at} after it was loaded at {loaded_at}")]
    StaleWrite { loaded_at: f64, modified_at: f64 },

    /// A referenced entity does not exist.
    #[error("{0}")]
    PreconditionFailed(String),

    /// The run was superseded by a newer run of the same watcher.
    #[error("run was superseded")]
    Cancelled,

    /// Anything else.
    #[error("{0}")]
    Unknown(String),
}

impl FlowError {
    pub fn rpc(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Rpc {
            message: message.into(),
            data,
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Text shown to the user for this failure.
    ///
    /// RPC failures carry their data as JSON after the message, malformed
    /// payloads read "Bad JSON", everything else uses its display text.
    pub fn describe(&self) -> String {
        match self {
            Self::Rpc {
                message,
                data: Some(data),
            } => format!("{message}: {data}"),
            Self::Rpc { message, data: None } => message.clone(),
            Self::MalformedResponse(_) => "Bad JSON".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<RpcError> for FlowError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote { message, data } => Self::Rpc { message, data },
            RpcError::Malformed(detail) => Self::MalformedResponse(detail),
            RpcError::Transport(detail) => Self::Unknown(detail),
        }
    }
}

impl From<StorageError> for FlowError {
    fn from(err: StorageError) -> Self {
        Self::Unknown(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}

impl From<anyhow::Error> for FlowError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<FlowError>() {
            Ok(flow) => flow,
            Err(err) => match err.downcast::<RpcError>() {
                Ok(rpc) => rpc.into(),
                Err(err) => Self::Unknown(format!("{err:#}")),
            },
        }
    }
}

/// Closed failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RpcFailure,
    MalformedResponse,
    ConsentRejected,
    StaleWriteConflict,
    PreconditionFailed,
    Unknown,
}

/// What the completion callback receives for a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackPolicy {
    /// The callback receives the error record.
    Error,
    /// The callback receives neither error nor result.
    Silent,
}

/// How the coordinator reacts to a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition {
    /// Emit a user-visible notification.
    pub notify: bool,
    /// Navigate to the watcher's fallback route, if it has one.
    pub navigate: bool,
    pub callback: CallbackPolicy,
}

impl ErrorKind {
    pub fn disposition(self) -> Disposition {
        match self {
            Self::ConsentRejected => Disposition {
                notify: false,
                navigate: false,
                callback: CallbackPolicy::Silent,
            },
            Self::StaleWriteConflict => Disposition {
                notify: false,
                navigate: false,
                callback: CallbackPolicy::Error,
            },
            Self::RpcFailure | Self::MalformedResponse | Self::PreconditionFailed | Self::Unknown => {
                Disposition {
                    notify: true,
                    navigate: true,
                    callback: CallbackPolicy::Error,
                }
            }
        }
    }

    /// Expected outcomes never raise a generic error notification.
    pub fn is_expected(self) -> bool {
        !self.disposition().notify
    }
}

/// Anything that can be placed in the failure taxonomy.
pub trait Categorizable {
    /// `None` for outcomes outside the taxonomy (superseded runs).
    fn kind(&self) -> Option<ErrorKind>;
}

impl Categorizable for FlowError {
    fn kind(&self) -> Option<ErrorKind> {
        let kind = match self {
            Self::Rpc { .. } => ErrorKind::RpcFailure,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::ConsentRejected { .. } => ErrorKind::ConsentRejected,
            Self::StaleWrite { .. } => ErrorKind::StaleWriteConflict,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::Unknown(_) => ErrorKind::Unknown,
            Self::Cancelled => return None,
        };
        Some(kind)
    }
}

/// Normalized outcome of a failed workflow, as stored in shared state and
/// handed to completion callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Classify a failure. Returns `None` for superseded runs.
pub fn classify(err: &FlowError) -> Option<ErrorRecord> {
    let kind = err.kind()?;
    let data = match err {
        FlowError::Rpc { data, .. } => data.clone(),
        FlowError::StaleWrite {
            loaded_at,
            modified_at,
        } => Some(serde_json::json!({
            "loadedAt": loaded_at,
            "modifiedAt": modified_at,
        })),
        _ => None,
    };
    let message = match err {
        FlowError::Rpc { message, .. } => message.clone(),
        other => other.to_string(),
    };
    Some(ErrorRecord {
        kind,
        message,
        data,
    })
}
