use serde_json::{Map, Value};
use tracing::debug;

use crate::bindings::{CoreBindings, FutureBindings, SnapshotBindings};
use crate::error::{Error, Result, ScriptError};
use crate::limits::ResourceLimits;
use crate::progress::{CallId, Completed, PendingCall, PendingFutures, Progress};
use crate::wire::{RawProgress, RawRunResult, RawState};

/// Lifecycle flag governing which operations are currently legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No execution in flight.
    Idle,
    /// Paused awaiting a resume decision.
    Active,
    /// Terminal; only a second dispose is tolerated.
    Disposed,
}

impl core::fmt::Display for SessionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Disposed => "disposed",
        })
    }
}

/// Per-call options for `run`/`start`.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub limits: Option<ResourceLimits>,
    /// Filename used in tracebacks; the engine picks a default when unset.
    pub script_name: Option<String>,
    /// External capability names the script may call (used by `start`).
    pub external_functions: Vec<String>,
    /// Reserved. Arbitrary input values are not supported; a non-empty map
    /// is rejected before any transport call.
    pub inputs: Map<String, Value>,
}

impl ExecOptions {
    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    #[must_use]
    pub fn script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn external_function(mut self, name: impl Into<String>) -> Self {
        self.external_functions.push(name.into());
        self
    }
}

/// Base execution platform: owns the per-session state machine, encodes
/// inputs for the transport, and translates intermediate results into the
/// domain progress model. Written once; both transports sit behind it.
pub struct Executor<B: CoreBindings> {
    bindings: B,
    state: SessionState,
    initialized: bool,
}

impl<B: CoreBindings> Executor<B> {
    pub const fn new(bindings: B) -> Self {
        Self {
            bindings,
            state: SessionState::Idle,
            initialized: false,
        }
    }

    #[must_use]
    pub const fn session_state(&self) -> SessionState {
        self.state
    }

    /// Direct access for transport-specific setup (e.g. preparing a
    /// program for snapshotting). Session-state legality still applies to
    /// everything routed through the executor itself.
    pub const fn bindings_mut(&mut self) -> &mut B {
        &mut self.bindings
    }

    fn guard(&self, operation: &'static str, legal: SessionState) -> Result<()> {
        if self.state == legal {
            Ok(())
        } else {
            Err(Error::StateViolation {
                operation,
                state: self.state,
            })
        }
    }

    async fn ensure_init(&mut self) -> Result<()> {
        if !self.initialized {
            self.bindings.init().await?;
            self.initialized = true;
        }
        Ok(())
    }

    /// Run code to completion. The returned result may carry a caught
    /// error alongside its value; an uncaught script error raises.
    pub async fn run(&mut self, code: &str, opts: &ExecOptions) -> Result<Completed> {
        self.guard("run", SessionState::Idle)?;
        reject_inputs(opts)?;
        self.ensure_init().await?;

        let limits_json = encode_limits(opts.limits.as_ref())?;
        debug!(limits = limits_json.as_deref(), "run");
        let raw = self
            .bindings
            .run(code, limits_json.as_deref(), opts.script_name.as_deref())
            .await?;
        translate_run(raw)
    }

    /// Start iterative execution; pauses at declared external calls.
    pub async fn start(&mut self, code: &str, opts: &ExecOptions) -> Result<Progress> {
        self.guard("start", SessionState::Idle)?;
        reject_inputs(opts)?;
        self.ensure_init().await?;

        let limits_json = encode_limits(opts.limits.as_ref())?;
        let externals_json = encode_externals(&opts.external_functions)?;
        debug!(
            limits = limits_json.as_deref(),
            externals = externals_json.as_deref(),
            "start"
        );
        let raw = self
            .bindings
            .start(
                code,
                externals_json.as_deref(),
                limits_json.as_deref(),
                opts.script_name.as_deref(),
            )
            .await;
        self.settle(raw)
    }

    /// Supply the paused external call's return value.
    pub async fn resume(&mut self, value: &Value) -> Result<Progress> {
        self.guard("resume", SessionState::Active)?;
        let value_json =
            serde_json::to_string(value).map_err(|e| Error::Boundary(e.to_string()))?;
        let raw = self.bindings.resume(&value_json).await;
        self.settle(raw)
    }

    /// Raise an error inside the script at the paused external call.
    pub async fn resume_with_error(&mut self, message: &str) -> Result<Progress> {
        self.guard("resume_with_error", SessionState::Active)?;
        let raw = self.bindings.resume_with_error(message).await;
        self.settle(raw)
    }

    /// Refresh the duration cap between resume phases, e.g. when a host
    /// call's own wall-clock time should not count against the script.
    pub async fn rearm_time_limit(&mut self, budget_ms: u64) -> Result<()> {
        self.guard("rearm_time_limit", SessionState::Active)?;
        self.bindings.rearm_time_limit(budget_ms).await
    }

    /// Release the transport. A second dispose is a no-op; every other
    /// operation on a disposed session is a state violation.
    pub async fn dispose(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        debug!("dispose");
        self.bindings.dispose().await;
        self.state = SessionState::Disposed;
    }

    /// Fold an adapter reply into session state and the domain model.
    fn settle(&mut self, raw: Result<RawProgress>) -> Result<Progress> {
        match raw {
            Err(e) => {
                // The adapter released its handle before propagating; the
                // session has nothing left to resume.
                self.state = SessionState::Idle;
                Err(e)
            }
            Ok(raw) => match translate_progress(raw) {
                Ok(progress) => {
                    self.state = match progress {
                        Progress::Complete(_) => SessionState::Idle,
                        Progress::Pending(_) | Progress::ResolveFutures(_) => SessionState::Active,
                    };
                    Ok(progress)
                }
                Err(e) => {
                    self.state = SessionState::Idle;
                    Err(e)
                }
            },
        }
    }
}

impl<B: SnapshotBindings> Executor<B> {
    /// Opaque snapshot of the compiled session. Same-build restore only.
    pub async fn snapshot(&mut self) -> Result<Vec<u8>> {
        self.guard("snapshot", SessionState::Idle)?;
        self.ensure_init().await?;
        self.bindings.snapshot().await
    }

    pub async fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        self.guard("restore", SessionState::Idle)?;
        self.ensure_init().await?;
        self.bindings.restore(bytes).await
    }
}

impl<B: FutureBindings> Executor<B> {
    /// Turn the pending call into a future and continue executing.
    pub async fn resume_as_future(&mut self) -> Result<Progress> {
        self.guard("resume_as_future", SessionState::Active)?;
        let raw = self.bindings.resume_as_future().await;
        self.settle(raw)
    }

    /// Resolve outstanding futures with values and/or injected errors.
    pub async fn resolve_futures(
        &mut self,
        results: &[(CallId, Value)],
        errors: &[(CallId, String)],
    ) -> Result<Progress> {
        self.guard("resolve_futures", SessionState::Active)?;
        let results_json = encode_id_map(results.iter().map(|(id, v)| (*id, v.clone())))?;
        let errors_json =
            encode_id_map(errors.iter().map(|(id, m)| (*id, Value::String(m.clone()))))?;
        let raw = self
            .bindings
            .resolve_futures(&results_json, &errors_json)
            .await;
        self.settle(raw)
    }
}

fn reject_inputs(opts: &ExecOptions) -> Result<()> {
    if opts.inputs.is_empty() {
        Ok(())
    } else {
        Err(Error::Unsupported(
            "input values are not supported; declare external functions and \
             resume with their results instead"
                .to_string(),
        ))
    }
}

/// Encode a resource policy, omitting the field entirely when there is
/// nothing to encode.
fn encode_limits(limits: Option<&ResourceLimits>) -> Result<Option<String>> {
    match limits {
        None => Ok(None),
        Some(l) if l.is_empty() => Ok(None),
        Some(l) => serde_json::to_string(l)
            .map(Some)
            .map_err(|e| Error::Boundary(e.to_string())),
    }
}

fn encode_externals(externals: &[String]) -> Result<Option<String>> {
    if externals.is_empty() {
        Ok(None)
    } else {
        serde_json::to_string(externals)
            .map(Some)
            .map_err(|e| Error::Boundary(e.to_string()))
    }
}

fn encode_id_map(entries: impl Iterator<Item = (CallId, Value)>) -> Result<String> {
    let map: Map<String, Value> = entries.map(|(id, v)| (id.to_string(), v)).collect();
    serde_json::to_string(&map).map_err(|e| Error::Boundary(e.to_string()))
}

fn translate_run(raw: RawRunResult) -> Result<Completed> {
    if raw.ok {
        Ok(Completed {
            value: raw.value,
            error: raw.error.map(crate::wire::RawError::into_script),
            usage: raw.usage.unwrap_or_default(),
            print_output: raw.print_output.unwrap_or_default(),
        })
    } else {
        let mut err = raw.error.map_or_else(
            || ScriptError::new("RuntimeError", "script failed"),
            crate::wire::RawError::into_script,
        );
        // Output printed before the failure still belongs to the caller.
        err.print_output = raw.print_output;
        Err(Error::from_script(err))
    }
}

fn translate_progress(raw: RawProgress) -> Result<Progress> {
    match raw.state {
        RawState::Complete => Ok(Progress::Complete(Completed {
            value: raw.value.unwrap_or(Value::Null),
            error: raw.error.map(crate::wire::RawError::into_script),
            usage: raw.usage.unwrap_or_default(),
            print_output: raw.print_output.unwrap_or_default(),
        })),
        RawState::Pending => {
            let function = raw
                .function_name
                .ok_or_else(|| Error::Boundary("pending progress without function_name".into()))?;
            let call_id = raw
                .call_id
                .ok_or_else(|| Error::Boundary("pending progress without call_id".into()))?;
            Ok(Progress::Pending(PendingCall {
                function,
                args: raw.args.unwrap_or_default(),
                kwargs: raw.kwargs.unwrap_or_default(),
                call_id,
                method_call: raw.method_call.unwrap_or(false),
            }))
        }
        RawState::ResolveFutures => Ok(Progress::ResolveFutures(PendingFutures {
            call_ids: raw.pending_call_ids.unwrap_or_default(),
        })),
        RawState::Error => {
            let mut err = raw.error.map_or_else(
                || ScriptError::new("RuntimeError", "script failed"),
                crate::wire::RawError::into_script,
            );
            err.print_output = raw.print_output;
            Err(Error::from_script(err))
        }
    }
}
