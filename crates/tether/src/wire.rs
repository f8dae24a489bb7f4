//! Adapter-normalized intermediate result shapes.
//!
//! Both transports reduce their native result encodings to these two types
//! before anything reaches the executor. Optional fields are omitted on the
//! wire, never encoded as `null`. Errors always travel in the dedicated
//! `error` field, never as a sentinel inside `value`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ScriptError, TraceFrame};
use crate::limits::ResourceUsage;
use crate::progress::CallId;

/// Wire form of a script exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<TraceFrame>,
}

impl RawError {
    #[must_use]
    pub fn from_script(err: ScriptError) -> Self {
        Self {
            message: err.message,
            exc_type: Some(err.exc_type),
            traceback: err.traceback,
        }
    }

    #[must_use]
    pub fn into_script(self) -> ScriptError {
        ScriptError {
            exc_type: self.exc_type.unwrap_or_else(|| "RuntimeError".to_string()),
            message: self.message,
            traceback: self.traceback,
            print_output: None,
        }
    }
}

/// "Script ran to completion or failed, with no pause."
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRunResult {
    pub ok: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RawError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawState {
    Complete,
    Pending,
    Error,
    ResolveFutures,
}

/// "Script is mid-execution and may be paused."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProgress {
    pub state: RawState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_call: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_call_ids: Option<Vec<CallId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RawError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_output: Option<String>,
}

impl RawProgress {
    #[must_use]
    const fn bare(state: RawState) -> Self {
        Self {
            state,
            value: None,
            function_name: None,
            args: None,
            kwargs: None,
            call_id: None,
            method_call: None,
            pending_call_ids: None,
            usage: None,
            error: None,
            print_output: None,
        }
    }

    #[must_use]
    pub fn complete(result: RawRunResult) -> Self {
        Self {
            value: Some(result.value),
            usage: result.usage,
            error: result.error,
            print_output: result.print_output,
            ..Self::bare(RawState::Complete)
        }
    }

    #[must_use]
    pub fn pending(
        function_name: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        call_id: CallId,
        method_call: bool,
    ) -> Self {
        Self {
            function_name: Some(function_name),
            args: Some(args),
            kwargs: Some(kwargs),
            call_id: Some(call_id),
            method_call: Some(method_call),
            ..Self::bare(RawState::Pending)
        }
    }

    #[must_use]
    pub fn resolve_futures(call_ids: Vec<CallId>) -> Self {
        Self {
            pending_call_ids: Some(call_ids),
            ..Self::bare(RawState::ResolveFutures)
        }
    }

    #[must_use]
    pub fn error(error: RawError, print_output: Option<String>) -> Self {
        Self {
            error: Some(error),
            print_output,
            ..Self::bare(RawState::Error)
        }
    }
}
