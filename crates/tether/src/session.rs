//! Variable persistence across executions.
//!
//! The engine itself is stateless between runs. A [`StatefulSession`] wraps
//! each submitted script with a restore prelude and a persist epilogue, both
//! expressed as synthetic external calls that the session intercepts before
//! user-declared handlers ever see them.

use core::future::Future;
use core::fmt::Write as _;

use serde_json::{Map, Value};
use tracing::debug;

use crate::bindings::CoreBindings;
use crate::error::{Error, Result};
use crate::executor::{ExecOptions, Executor, SessionState};
use crate::progress::{Completed, PendingCall, Progress};

/// Synthetic external returning the previously persisted variable map.
pub const SESSION_RESTORE_FN: &str = "__session_restore__";
/// Synthetic external receiving the script's final locals for persistence.
pub const SESSION_PERSIST_FN: &str = "__session_persist__";

/// An executor plus a variable map that survives across `run` calls.
///
/// State is committed only when a run completes without an uncaught error;
/// a failing run leaves the map exactly as the previous successful run did.
pub struct StatefulSession<B: CoreBindings> {
    exec: Executor<B>,
    state: Map<String, Value>,
    staged: Option<Map<String, Value>>,
}

impl<B: CoreBindings> StatefulSession<B> {
    pub fn new(bindings: B) -> Self {
        Self {
            exec: Executor::new(bindings),
            state: Map::new(),
            staged: None,
        }
    }

    /// Seed the session with pre-existing variables.
    #[must_use]
    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.state = state;
        self
    }

    /// The variable map as of the last successful run.
    #[must_use]
    pub const fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    #[must_use]
    pub const fn session_state(&self) -> SessionState {
        self.exec.session_state()
    }

    /// Run one script, answering its external calls through `handler`.
    ///
    /// The completed result's value is the persisted variable map, since
    /// the persist epilogue is the final expression of the wrapped script.
    pub async fn run_with<F, Fut>(
        &mut self,
        code: &str,
        opts: &ExecOptions,
        mut handler: F,
    ) -> Result<Completed>
    where
        F: FnMut(PendingCall) -> Fut + Send,
        Fut: Future<Output = core::result::Result<Value, String>> + Send,
    {
        let wrapped = self.wrap_code(code);
        let mut opts = opts.clone();
        opts.external_functions.push(SESSION_RESTORE_FN.to_string());
        opts.external_functions.push(SESSION_PERSIST_FN.to_string());

        let mut progress = self.exec.start(&wrapped, &opts).await;
        loop {
            match progress {
                Err(e) => {
                    // Staged state from this run is abandoned; the map
                    // still reflects the last successful run.
                    self.staged = None;
                    return Err(e);
                }
                Ok(Progress::Complete(done)) => {
                    if done.error.is_none() {
                        if let Some(staged) = self.staged.take() {
                            debug!(variables = staged.len(), "session state committed");
                            self.state = staged;
                        }
                    } else {
                        self.staged = None;
                    }
                    return Ok(done);
                }
                Ok(Progress::Pending(call)) if call.function == SESSION_RESTORE_FN => {
                    let snapshot = Value::Object(self.state.clone());
                    progress = self.exec.resume(&snapshot).await;
                }
                Ok(Progress::Pending(call)) if call.function == SESSION_PERSIST_FN => {
                    let staged = stage_locals(call.args.first());
                    let snapshot = Value::Object(staged.clone());
                    self.staged = Some(staged);
                    progress = self.exec.resume(&snapshot).await;
                }
                Ok(Progress::Pending(call)) => {
                    progress = match handler(call).await {
                        Ok(value) => self.exec.resume(&value).await,
                        Err(message) => self.exec.resume_with_error(&message).await,
                    };
                }
                Ok(Progress::ResolveFutures(_)) => {
                    self.staged = None;
                    return Err(Error::Unsupported(
                        "future-based calls inside a stateful session".to_string(),
                    ));
                }
            }
        }
    }

    /// Run one script that declares no external functions of its own. Any
    /// unexpected pause raises inside the script.
    pub async fn run(&mut self, code: &str, opts: &ExecOptions) -> Result<Completed> {
        self.run_with(code, opts, |call| async move {
            Err(format!("no handler for external function `{}`", call.function))
        })
        .await
    }

    pub async fn dispose(&mut self) {
        self.exec.dispose().await;
    }

    /// Prefix the script with variable restoration and suffix it with
    /// persistence. The restore prelude is skipped while the map holds
    /// nothing restorable. Only valid identifiers are spliced into the
    /// generated source; any other seeded key stays out of the script
    /// and is dropped at the next persist.
    fn wrap_code(&self, code: &str) -> String {
        let mut wrapped = String::new();
        if self.state.keys().any(|name| is_identifier(name)) {
            wrapped.push_str("__session__ = __session_restore__()\n");
            for name in self.state.keys().filter(|name| is_identifier(name)) {
                let _ = writeln!(wrapped, "{name} = __session__[\"{name}\"]");
            }
        }
        wrapped.push_str(code);
        let _ = write!(wrapped, "\n{SESSION_PERSIST_FN}(__locals__())");
        wrapped
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Filter the reported locals down to persistable user variables. Names
/// with a leading underscore (including the wrapper's own plumbing) are
/// never persisted.
fn stage_locals(locals: Option<&Value>) -> Map<String, Value> {
    let Some(Value::Object(locals)) = locals else {
        return Map::new();
    };
    locals
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
