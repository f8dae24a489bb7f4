use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::SessionState;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Exception type tags that report an exhausted resource cap.
const LIMIT_EXC_TYPES: [&str; 4] = [
    "TimeLimitError",
    "MemoryLimitError",
    "AllocationLimitError",
    "RecursionError",
];

/// One traceback frame, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    pub filename: String,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_name: Option<String>,
}

impl TraceFrame {
    #[must_use]
    pub fn new(filename: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
            column,
            frame_name: None,
        }
    }

    #[must_use]
    pub fn frame_name(mut self, name: impl Into<String>) -> Self {
        self.frame_name = Some(name.into());
        self
    }
}

/// A runtime error raised by (or injected into) the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptError {
    pub exc_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<TraceFrame>,
    /// Print output the script produced before failing. Populated by the
    /// platform from the transport result, so nothing printed before an
    /// uncaught error is lost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_output: Option<String>,
}

impl ScriptError {
    #[must_use]
    pub fn new(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            message: message.into(),
            traceback: Vec::new(),
            print_output: None,
        }
    }

    #[must_use]
    pub fn with_frame(mut self, frame: TraceFrame) -> Self {
        self.traceback.push(frame);
        self
    }

    /// Whether this exception reports an exhausted resource cap.
    #[must_use]
    pub fn is_resource_limit(&self) -> bool {
        LIMIT_EXC_TYPES.contains(&self.exc_type.as_str())
    }
}

impl core::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.message)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// User code raised or triggered a runtime error.
    #[error("script error: {0}")]
    Script(ScriptError),

    /// A resource-policy cap was exceeded; retryable with a larger budget.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(ScriptError),

    /// Internal fault in the foreign component, contained at the boundary.
    #[error("binding fault: {0}")]
    Boundary(String),

    /// Operation is illegal in the current session state.
    #[error("`{operation}` is illegal while the session is {state}")]
    StateViolation {
        operation: &'static str,
        state: SessionState,
    },

    /// The other side of an asynchronous transport died or errored.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Intentionally unsupported feature.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Classify a script exception, splitting out resource-limit failures
    /// so callers can react differently to an exhausted budget.
    #[must_use]
    pub fn from_script(err: ScriptError) -> Self {
        if err.is_resource_limit() {
            Self::ResourceLimit(err)
        } else {
            Self::Script(err)
        }
    }

    /// The underlying script exception, if this error carries one.
    #[must_use]
    pub const fn script(&self) -> Option<&ScriptError> {
        match self {
            Self::Script(err) | Self::ResourceLimit(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_exceptions_are_classified() {
        let err = Error::from_script(ScriptError::new("TimeLimitError", "budget exhausted"));
        assert!(matches!(err, Error::ResourceLimit(_)));

        let err = Error::from_script(ScriptError::new("ZeroDivisionError", "division by zero"));
        assert!(matches!(err, Error::Script(_)));
    }

    #[test]
    fn script_error_displays_type_and_message() {
        let err = ScriptError::new("ValueError", "bad value");
        assert_eq!(err.to_string(), "ValueError: bad value");
    }

    #[test]
    fn empty_traceback_is_omitted_from_wire() {
        let json = serde_json::to_value(ScriptError::new("ValueError", "x")).unwrap();
        assert!(json.get("traceback").is_none());
    }
}
