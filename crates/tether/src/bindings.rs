use async_trait::async_trait;

use crate::error::Result;
use crate::wire::{RawProgress, RawRunResult};

/// Uniform transport contract. One implementation wraps the synchronous
/// in-process handle interface, another the asynchronous worker protocol;
/// the executor cannot tell them apart.
///
/// Implementations are pure shape/transport translators: session-state
/// legality is the executor's responsibility, never the adapter's. Errors
/// returned here are boundary or transport failures; script-level failures
/// travel inside the returned result shapes.
#[async_trait]
pub trait CoreBindings: Send + 'static {
    /// One-time transport initialization. The executor calls this lazily,
    /// exactly once, before the first execution.
    async fn init(&mut self) -> Result<()>;

    /// Run code to completion with no pause points.
    async fn run(
        &mut self,
        code: &str,
        limits_json: Option<&str>,
        script_name: Option<&str>,
    ) -> Result<RawRunResult>;

    /// Start iterative execution; may pause at declared external calls.
    async fn start(
        &mut self,
        code: &str,
        externals_json: Option<&str>,
        limits_json: Option<&str>,
        script_name: Option<&str>,
    ) -> Result<RawProgress>;

    /// Resume a paused call with a JSON-encoded return value.
    async fn resume(&mut self, value_json: &str) -> Result<RawProgress>;

    /// Resume a paused call by raising the given error inside the script.
    async fn resume_with_error(&mut self, message: &str) -> Result<RawProgress>;

    /// Refresh the duration cap of the currently paused phase without
    /// restarting the rest of the policy.
    async fn rearm_time_limit(&mut self, budget_ms: u64) -> Result<()>;

    /// Release all transport resources. Idempotent.
    async fn dispose(&mut self);
}

/// Marker capability: the transport can snapshot and restore compiled
/// state. Support is a compile-time bound; consumers that need it require
/// the trait instead of probing at runtime.
#[async_trait]
pub trait SnapshotBindings: CoreBindings {
    /// Opaque, same-build-only snapshot bytes.
    async fn snapshot(&mut self) -> Result<Vec<u8>>;

    async fn restore(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Marker capability: the transport supports converting paused calls into
/// futures and resolving them in batches.
#[async_trait]
pub trait FutureBindings: CoreBindings {
    /// Turn the currently pending call into a future and keep executing.
    async fn resume_as_future(&mut self) -> Result<RawProgress>;

    /// Resolve outstanding futures. Both arguments are JSON objects keyed
    /// by stringified call id: values for `results_json`, error messages
    /// for `errors_json`.
    async fn resolve_futures(
        &mut self,
        results_json: &str,
        errors_json: &str,
    ) -> Result<RawProgress>;
}
