//! The engine contract the handle lifecycle drives.
//!
//! An [`Engine`] is a compiled script plus the machinery to step it:
//! running to completion, pausing at external calls, parking calls as
//! futures, and resuming with host-supplied outcomes. The tracker kind
//! (resource-policy-bounded vs. unbounded-but-recursion-capped) travels in
//! the type so paused state for one kind can never be resumed as the other.

use core::time::Duration;

use serde_json::{Map, Value};
use tether::error::ScriptError;
use tether::limits::{ResourceLimits, ResourceUsage};
use tether::progress::CallId;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Metered {}
    impl Sealed for super::Unmetered {}
}

/// Type-level selector for how resource consumption is tracked during one
/// execution. Sealed: the handle state enum enumerates both kinds.
pub trait TrackerKind: sealed::Sealed + Send + Sized + 'static {
    /// What the engine needs to set this tracker up.
    type Config: Send;

    /// Normalize the config into the runtime enforcement policy.
    fn policy(config: Self::Config) -> TrackerPolicy;
}

/// Runtime view of a tracker config, for engines that enforce both kinds
/// with one mechanism.
#[derive(Debug, Clone)]
pub enum TrackerPolicy {
    Metered(ResourceLimits),
    Unmetered { recursion_ceiling: u32 },
}

/// Full resource-policy enforcement (allocations, time, memory, GC
/// cadence, recursion).
pub enum Metered {}

impl TrackerKind for Metered {
    type Config = ResourceLimits;

    fn policy(config: ResourceLimits) -> TrackerPolicy {
        TrackerPolicy::Metered(config)
    }
}

/// No policy, but a recursion ceiling still applies.
pub enum Unmetered {}

impl TrackerKind for Unmetered {
    /// The recursion ceiling.
    type Config = u32;

    fn policy(config: u32) -> TrackerPolicy {
        TrackerPolicy::Unmetered {
            recursion_ceiling: config,
        }
    }
}

/// The host's answer to a paused external call.
#[derive(Debug, Clone)]
pub enum HostOutcome {
    /// The call returns this value inside the script.
    Return(Value),
    /// The call raises a runtime error with this message inside the script.
    Error(String),
}

/// Print capture for one execution step. A fresh sink is attached before
/// every call into the engine and drained immediately after, on every
/// exit path.
#[derive(Debug, Default)]
pub struct PrintSink(String);

impl PrintSink {
    #[must_use]
    pub const fn new() -> Self {
        Self(String::new())
    }

    pub fn push_str(&mut self, text: &str) {
        self.0.push_str(text);
    }

    /// Append one printed line, newline-terminated.
    pub fn push_line(&mut self, line: &str) {
        self.0.push_str(line);
        self.0.push('\n');
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Where one execution step left the engine.
pub enum Phase<E: Engine, T: TrackerKind> {
    /// Ran to completion.
    Complete { value: Value, usage: ResourceUsage },
    /// Paused at an external call awaiting a [`HostOutcome`].
    Hostcall {
        function: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        call_id: CallId,
        method_call: bool,
        paused: E::Paused<T>,
    },
    /// Every runnable path is waiting on parked future calls.
    Blocked {
        call_ids: Vec<CallId>,
        parked: E::Parked<T>,
    },
}

/// A compiled script and the operations to step it. Consuming `self` (or
/// the paused/parked state) on every transition makes re-running a spent
/// execution unrepresentable.
pub trait Engine: Sized + Send + 'static {
    /// Execution paused at a single external call.
    type Paused<T: TrackerKind>: Send;
    /// Execution parked on a set of unresolved future calls.
    type Parked<T: TrackerKind>: Send;

    /// Compile source. `externals` are the host-provided function names
    /// the script may call.
    fn compile(code: &str, script_name: &str, externals: &[String]) -> Result<Self, ScriptError>;

    /// Run to completion with no pause points; external calls are errors.
    fn run<T: TrackerKind>(
        self,
        config: T::Config,
        print: &mut PrintSink,
    ) -> Result<(Value, ResourceUsage), ScriptError>;

    /// Begin iterative execution.
    fn start<T: TrackerKind>(
        self,
        config: T::Config,
        print: &mut PrintSink,
    ) -> Result<Phase<Self, T>, ScriptError>;

    /// Continue from a pause with the host's outcome for that call.
    fn resume<T: TrackerKind>(
        paused: Self::Paused<T>,
        outcome: HostOutcome,
        print: &mut PrintSink,
    ) -> Result<Phase<Self, T>, ScriptError>;

    /// Convert the paused call into a future and keep executing until
    /// completion, the next pause, or a block on unresolved futures.
    fn park<T: TrackerKind>(
        paused: Self::Paused<T>,
        print: &mut PrintSink,
    ) -> Result<Phase<Self, T>, ScriptError>;

    /// Deliver a batch of future outcomes and keep executing.
    fn resolve<T: TrackerKind>(
        parked: Self::Parked<T>,
        outcomes: Vec<(CallId, HostOutcome)>,
        print: &mut PrintSink,
    ) -> Result<Phase<Self, T>, ScriptError>;

    /// Replace the remaining time budget of a paused execution.
    fn rearm_deadline<T: TrackerKind>(paused: &mut Self::Paused<T>, budget: Duration);

    /// Serialize the compiled (not yet started) program. Opaque bytes,
    /// readable only by [`Engine::load`] in the same build.
    fn dump(&self) -> Result<Vec<u8>, String>;

    fn load(bytes: &[u8]) -> Result<Self, String>;
}
