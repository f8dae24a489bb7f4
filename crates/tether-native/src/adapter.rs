//! In-process transport: the bindings contract implemented directly over
//! the handle lifecycle.

use core::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tether::bindings::{CoreBindings, FutureBindings, SnapshotBindings};
use tether::error::{Error, Result};
use tether::limits::ResourceLimits;
use tether::progress::CallId;
use tether::wire::{RawProgress, RawRunResult, RawState};

use tracing::debug;

use crate::handle::Handle;
use crate::vm::{Engine, HostOutcome};

/// Synchronous adapter owning at most one handle. Pure shape translation:
/// session-state legality lives a layer up, in the executor.
///
/// The handle is freed exactly when a call yields completion or an
/// unrecoverable fault, and retained across pause/resume otherwise. A
/// fault always releases the handle before propagating.
pub struct NativeBindings<E: Engine> {
    handle: Option<Handle<E>>,
}

impl<E: Engine> NativeBindings<E> {
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Compile without running, leaving a ready handle in place. The next
    /// `run`/`start` consumes it instead of compiling its own code, and
    /// `snapshot` serializes it. Code and externals submitted to that next
    /// call are ignored in favor of the prepared program.
    pub fn prepare(
        &mut self,
        code: &str,
        externals: Vec<String>,
        script_name: Option<&str>,
    ) -> Result<()> {
        self.handle = Some(Handle::new(code, externals, script_name)?);
        Ok(())
    }

    /// Take the prepared/restored handle, or compile a fresh one. A held
    /// handle wins over the submitted code.
    fn obtain(
        &mut self,
        code: &str,
        externals: Vec<String>,
        limits: Option<ResourceLimits>,
        script_name: Option<&str>,
    ) -> Result<Handle<E>> {
        let mut handle = match self.handle.take() {
            Some(handle) => {
                if !code.is_empty() {
                    debug!("prepared program supersedes submitted code");
                }
                handle
            }
            None => Handle::new(code, externals, script_name)?,
        };
        handle.set_limits(limits);
        Ok(handle)
    }

    /// Run one step against the live handle, retaining it only while the
    /// execution can still make progress.
    fn step(
        &mut self,
        op: impl FnOnce(&mut Handle<E>) -> Result<RawProgress>,
    ) -> Result<RawProgress> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::Boundary("no execution in flight".to_string()))?;
        let progress = op(&mut handle)?;
        self.retain_if_live(handle, &progress);
        Ok(progress)
    }

    fn retain_if_live(&mut self, mut handle: Handle<E>, progress: &RawProgress) {
        match progress.state {
            RawState::Pending | RawState::ResolveFutures => self.handle = Some(handle),
            RawState::Complete | RawState::Error => {
                // A live handle is never already freed.
                let _ = handle.free();
            }
        }
    }
}

impl<E: Engine> Default for NativeBindings<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: Engine> CoreBindings for NativeBindings<E> {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn run(
        &mut self,
        code: &str,
        limits_json: Option<&str>,
        script_name: Option<&str>,
    ) -> Result<RawRunResult> {
        let limits = parse_limits(limits_json)?;
        let mut handle = match self.obtain(code, Vec::new(), limits, script_name) {
            Ok(handle) => handle,
            Err(e) => return compile_failure_run(e),
        };
        handle.run()
    }

    async fn start(
        &mut self,
        code: &str,
        externals_json: Option<&str>,
        limits_json: Option<&str>,
        script_name: Option<&str>,
    ) -> Result<RawProgress> {
        let limits = parse_limits(limits_json)?;
        let externals = parse_externals(externals_json)?;
        let handle = match self.obtain(code, externals, limits, script_name) {
            Ok(handle) => handle,
            Err(e) => return compile_failure_progress(e),
        };
        self.handle = Some(handle);
        self.step(Handle::start)
    }

    async fn resume(&mut self, value_json: &str) -> Result<RawProgress> {
        let value: Value = serde_json::from_str(value_json)
            .map_err(|e| Error::Boundary(format!("invalid resume payload: {e}")))?;
        self.step(|handle| handle.resume(HostOutcome::Return(value)))
    }

    async fn resume_with_error(&mut self, message: &str) -> Result<RawProgress> {
        let outcome = HostOutcome::Error(message.to_string());
        self.step(|handle| handle.resume(outcome))
    }

    async fn rearm_time_limit(&mut self, budget_ms: u64) -> Result<()> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::Boundary("no execution in flight".to_string()))?
            .rearm(Duration::from_millis(budget_ms))
    }

    async fn dispose(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            let _ = handle.free();
        }
    }
}

#[async_trait]
impl<E: Engine> SnapshotBindings for NativeBindings<E> {
    async fn snapshot(&mut self) -> Result<Vec<u8>> {
        self.handle
            .as_ref()
            .ok_or_else(|| {
                Error::Boundary("no compiled program to snapshot; prepare or restore one".into())
            })?
            .snapshot()
    }

    async fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        self.handle = Some(Handle::restore(bytes)?);
        Ok(())
    }
}

#[async_trait]
impl<E: Engine> FutureBindings for NativeBindings<E> {
    async fn resume_as_future(&mut self) -> Result<RawProgress> {
        self.step(Handle::park)
    }

    async fn resolve_futures(
        &mut self,
        results_json: &str,
        errors_json: &str,
    ) -> Result<RawProgress> {
        let outcomes = decode_outcomes(results_json, errors_json)?;
        self.step(|handle| handle.resolve(outcomes))
    }
}

fn parse_limits(limits_json: Option<&str>) -> Result<Option<ResourceLimits>> {
    limits_json
        .map(|json| {
            serde_json::from_str(json)
                .map_err(|e| Error::Boundary(format!("invalid limits payload: {e}")))
        })
        .transpose()
}

fn parse_externals(externals_json: Option<&str>) -> Result<Vec<String>> {
    externals_json.map_or_else(
        || Ok(Vec::new()),
        |json| {
            serde_json::from_str(json)
                .map_err(|e| Error::Boundary(format!("invalid externals payload: {e}")))
        },
    )
}

/// Both arguments are JSON objects keyed by stringified call id: values
/// in the first, error messages in the second.
fn decode_outcomes(results_json: &str, errors_json: &str) -> Result<Vec<(CallId, HostOutcome)>> {
    let results: Map<String, Value> = serde_json::from_str(results_json)
        .map_err(|e| Error::Boundary(format!("invalid results payload: {e}")))?;
    let errors: Map<String, Value> = serde_json::from_str(errors_json)
        .map_err(|e| Error::Boundary(format!("invalid errors payload: {e}")))?;

    let mut outcomes = Vec::with_capacity(results.len() + errors.len());
    for (key, value) in results {
        outcomes.push((parse_call_id(&key)?, HostOutcome::Return(value)));
    }
    for (key, value) in errors {
        let Value::String(message) = value else {
            return Err(Error::Boundary(format!(
                "error for call {key} must be a string message"
            )));
        };
        outcomes.push((parse_call_id(&key)?, HostOutcome::Error(message)));
    }
    Ok(outcomes)
}

fn parse_call_id(key: &str) -> Result<CallId> {
    key.parse()
        .map_err(|_| Error::Boundary(format!("invalid call id `{key}`")))
}

/// A compile-time script error travels inside the result shape; only
/// genuine boundary faults propagate as transport errors.
fn compile_failure_run(e: Error) -> Result<RawRunResult> {
    match e {
        Error::Script(err) | Error::ResourceLimit(err) => Ok(RawRunResult {
            ok: false,
            value: Value::Null,
            usage: None,
            error: Some(tether::wire::RawError::from_script(err)),
            print_output: None,
        }),
        other => Err(other),
    }
}

fn compile_failure_progress(e: Error) -> Result<RawProgress> {
    match e {
        Error::Script(err) | Error::ResourceLimit(err) => Ok(RawProgress::error(
            tether::wire::RawError::from_script(err),
            None,
        )),
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_decoding_merges_results_and_errors() {
        let outcomes =
            decode_outcomes(r#"{"2":"ok","5":[1,2]}"#, r#"{"9":"lost connection"}"#).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(
            &outcomes[0],
            (2, HostOutcome::Return(Value::String(s))) if s == "ok"
        ));
        assert!(matches!(
            &outcomes[2],
            (9, HostOutcome::Error(m)) if m == "lost connection"
        ));
    }

    #[test]
    fn non_string_error_entries_are_rejected() {
        let err = decode_outcomes("{}", r#"{"1":42}"#).unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }

    #[test]
    fn bad_call_id_keys_are_rejected() {
        let err = decode_outcomes(r#"{"not-a-number":1}"#, "{}").unwrap_err();
        assert!(err.to_string().contains("invalid call id"));
    }

    #[test]
    fn malformed_limits_payload_is_a_boundary_error() {
        let err = parse_limits(Some("{not json")).unwrap_err();
        assert!(matches!(err, Error::Boundary(_)));
        assert_eq!(parse_limits(None).unwrap(), None);
    }
}
