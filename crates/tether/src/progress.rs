use serde_json::{Map, Value};

use crate::error::ScriptError;
use crate::limits::ResourceUsage;

/// Identifier correlating a paused external call with its resolution.
/// Guaranteed distinct within one execution; ordering is unspecified.
pub type CallId = u32;

/// Domain-level outcome of one execution step. Closed set: every consumer
/// matches exhaustively, so a new paused-state kind cannot be ignored
/// silently.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// The script ran to completion (possibly carrying a caught error).
    Complete(Completed),
    /// Execution is paused at an external capability call.
    Pending(PendingCall),
    /// Execution is parked until the listed future calls are resolved.
    ResolveFutures(PendingFutures),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub value: Value,
    /// An error the script caught and returned alongside a nominal value.
    /// Preserved rather than dropped so callers see both.
    pub error: Option<ScriptError>,
    pub usage: ResourceUsage,
    pub print_output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub call_id: CallId,
    /// `true` when the script used method-call syntax on a bound object.
    pub method_call: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingFutures {
    pub call_ids: Vec<CallId>,
}
