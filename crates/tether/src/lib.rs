//! Host platform for driving a sandboxed script engine.
//!
//! The [`Executor`] owns the session lifecycle and the translation between
//! domain types and the transport wire shapes; the transports themselves
//! live behind the [`CoreBindings`] family of traits so callers can swap
//! the in-process and worker-backed adapters freely. [`StatefulSession`]
//! layers variable persistence on top.

pub mod bindings;
pub mod error;
pub mod executor;
pub mod limits;
pub mod progress;
pub mod session;
pub mod wire;

pub use bindings::{CoreBindings, FutureBindings, SnapshotBindings};
pub use error::{Error, Result, ScriptError, TraceFrame};
pub use executor::{ExecOptions, Executor, SessionState};
pub use limits::{DEFAULT_RECURSION_CEILING, ResourceLimits, ResourceUsage};
pub use progress::{CallId, Completed, PendingCall, PendingFutures, Progress};
pub use session::{SESSION_PERSIST_FN, SESSION_RESTORE_FN, StatefulSession};
