//! # Sagaflow
//!
//! An orchestration engine for long-running, cancellable workflows that sit
//! between user-triggered actions and a remote procedure-call backend.
//!
//! ## Core Concepts
//!
//! - [`Action`] = what the user or system asked for
//! - [`Watcher`] = which workflow reacts to an action, under which [`Policy`]
//! - [`Effect`] = one step of a workflow (call, put, select, race, delay, take)
//!
//! Workflows never touch shared state directly: every read and write goes
//! through the [`TaskContext`] handed to the run.
//!
//! ## Architecture
//!
//! ```text
//! EngineHandle.dispatch(action)
//!     │
//!     ▼ stamp seq, keep in history
//! ActionBus ──────────────────────────────────────────┐
//!     │                                               │
//!     ▼ matching(kind)                                │
//! WatcherRegistry                                     │
//!     │                                               │
//!     ├─► SingleFlightLatest ─► cancel previous ──┐   │
//!     ├─► ConcurrentEvery ────────────────────────┤   │
//!     └─► Sequential ─► queue ─► worker ──────────┤   │
//!                                                 ▼   │
//!                                     TaskContext (one per run)
//!                                                 │   │
//!          Call ─► RpcBackend / function          │   │
//!          Put ──► SharedState, or dispatch ──────┼───┘
//!          Race / Delay / Take / consent          │
//!                                                 ▼
//!                                     classify ─► notify, navigate,
//!                                                 error entity, onEnd
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One active run per single-flight watcher** - a new action cancels the
//!    previous run before `dispatch` returns
//! 2. **Cancelled runs put nothing** - the token is checked atomically with
//!    every `Put` and on both sides of every suspension; only rollbacks
//!    still apply
//! 3. **Runs take turns** - code between two suspensions never interleaves
//!    with another run, on any runtime flavor
//! 4. **Race losers are dropped** - a late result is never observed
//! 5. **`onEnd` fires exactly once** - after the run's last mutation
//! 6. **Expected outcomes stay quiet** - consent rejection and stale writes
//!    never raise a generic error notification
//!
//! ## Example
//!
//! ```ignore
//! use sagaflow_core::{Action, EngineBuilder, FlowError, Policy, RpcRequest, TaskContext};
//!
//! async fn load_projects(_action: Action, mut ctx: TaskContext) -> Result<(), FlowError> {
//!     let projects = ctx.rpc(RpcRequest::new("project.get_projects")).await?;
//!     ctx.update_entity("projects", projects)?;
//!     Ok(())
//! }
//!
//! let handle = EngineBuilder::new()
//!     .with_rpc(rpc)
//!     .register("LOAD_PROJECTS", Policy::Sequential, load_projects)
//!     .build()
//!     .start();
//!
//! handle.dispatch_and_settle(Action::new("LOAD_PROJECTS")).await;
//! ```

// Core modules
mod action;
mod bus;
mod config;
mod consent;
mod context;
mod effect;
mod engine;
mod error;
mod navigation;
mod patch;
mod registry;
mod rpc;
mod state;
mod storage;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export action types
pub use action::{kinds, Action, Completion, Notification, OnEnd};

// Re-export configuration
pub use config::EngineConfig;

// Re-export consent types
pub use consent::{AutoAccept, AutoReject, ConsentDecision, ConsentPrompter, ConsentRecord};

// Re-export coordinator types
pub use context::{RunInfo, TaskContext};
pub use effect::{Call, CallFuture, Effect, Outcome, Race, RaceOutcome, Selector};

// Re-export engine types (primary entry point)
pub use engine::{error_entity_key, DispatchReceipt, Engine, EngineBuilder, EngineHandle, InflightTracker};

// Re-export error types
pub use error::{classify, CallbackPolicy, Categorizable, Disposition, ErrorKind, ErrorRecord, FlowError};

// Re-export collaborator types
pub use navigation::{Navigator, NoopNavigator};
pub use rpc::{RpcBackend, RpcError, RpcRequest, UnavailableRpc};
pub use storage::{MemoryStorage, StorageBackend, StorageError};

// Re-export patch and registry types
pub use patch::{OptimisticPatch, PatchTarget};
pub use registry::{Policy, Watcher, Workflow};

// Re-export state types
pub use state::{KeyPattern, Mutation, StateView};

// Re-export commonly used external types
pub use async_trait::async_trait;
