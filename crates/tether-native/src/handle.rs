//! One interpreter instance per handle, advanced through
//! compile → run/pause → resume → free.

use core::mem;
use core::time::Duration;

use serde_json::Value;
use tether::error::{Error, Result, ScriptError};
use tether::limits::{DEFAULT_RECURSION_CEILING, ResourceLimits};
use tether::progress::CallId;
use tether::wire::{RawError, RawProgress, RawRunResult};
use tracing::debug;

use crate::boundary::contain;
use crate::vm::{Engine, HostOutcome, Metered, Phase, PrintSink, TrackerKind, Unmetered};

/// Folds a tracker kind's paused/parked engine state into the handle's
/// state representation, and derives the tracker's config from the
/// handle's policy. One generic step driver plus this extension point
/// replaces a per-(operation × tracker-kind) matrix of code paths.
trait Fold: TrackerKind {
    fn config(limits: Option<&ResourceLimits>) -> Self::Config;
    fn fold_paused<E: Engine>(paused: E::Paused<Self>) -> HandleState<E>;
    fn fold_parked<E: Engine>(parked: E::Parked<Self>) -> HandleState<E>;
}

impl Fold for Metered {
    fn config(limits: Option<&ResourceLimits>) -> ResourceLimits {
        limits.cloned().unwrap_or_default()
    }

    fn fold_paused<E: Engine>(paused: E::Paused<Self>) -> HandleState<E> {
        HandleState::PausedMetered(paused)
    }

    fn fold_parked<E: Engine>(parked: E::Parked<Self>) -> HandleState<E> {
        HandleState::ParkedMetered(parked)
    }
}

impl Fold for Unmetered {
    fn config(limits: Option<&ResourceLimits>) -> u32 {
        limits.map_or(DEFAULT_RECURSION_CEILING, ResourceLimits::recursion_ceiling)
    }

    fn fold_paused<E: Engine>(paused: E::Paused<Self>) -> HandleState<E> {
        HandleState::PausedUnmetered(paused)
    }

    fn fold_parked<E: Engine>(parked: E::Parked<Self>) -> HandleState<E> {
        HandleState::ParkedUnmetered(parked)
    }
}

enum HandleState<E: Engine> {
    /// Compiled, not yet started. The only snapshottable state.
    Ready(E),
    PausedMetered(E::Paused<Metered>),
    PausedUnmetered(E::Paused<Unmetered>),
    ParkedMetered(E::Parked<Metered>),
    ParkedUnmetered(E::Parked<Unmetered>),
    /// Execution finished; nothing left to resume.
    Complete,
    Freed,
}

impl<E: Engine> HandleState<E> {
    const fn describe(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::PausedMetered(_) | Self::PausedUnmetered(_) => "paused",
            Self::ParkedMetered(_) | Self::ParkedUnmetered(_) => "parked",
            Self::Complete => "complete",
            Self::Freed => "freed",
        }
    }
}

/// Owns one engine instance across its whole lifecycle. Errors returned
/// here are boundary faults; script-level failures travel inside the
/// returned wire shapes.
pub struct Handle<E: Engine> {
    state: HandleState<E>,
    limits: Option<ResourceLimits>,
    /// Print output accumulated across all steps so far.
    print_output: String,
}

impl<E: Engine> Handle<E> {
    /// Compile source into a ready handle. `script_name` sets the filename
    /// used in tracebacks; defaults to `"<input>"`.
    pub fn new(code: &str, externals: Vec<String>, script_name: Option<&str>) -> Result<Self> {
        let name = script_name.unwrap_or("<input>");
        let compiled =
            contain(|| E::compile(code, name, &externals)).map_err(Error::Boundary)?;
        let engine = compiled.map_err(Error::from_script)?;
        Ok(Self {
            state: HandleState::Ready(engine),
            limits: None,
            print_output: String::new(),
        })
    }

    pub fn set_limits(&mut self, limits: Option<ResourceLimits>) {
        self.limits = limits;
    }

    /// Run to completion with no pause points. Consumes the ready state;
    /// the handle ends up complete (or freed, after a fault).
    pub fn run(&mut self) -> Result<RawRunResult> {
        let engine = self.take_ready("run")?;
        if self.limits.is_some() {
            self.run_with::<Metered>(engine)
        } else {
            self.run_with::<Unmetered>(engine)
        }
    }

    /// Begin iterative execution.
    pub fn start(&mut self) -> Result<RawProgress> {
        let engine = self.take_ready("start")?;
        if self.limits.is_some() {
            self.drive::<Metered, _>(|config, print| engine.start(config, print))
        } else {
            self.drive::<Unmetered, _>(|config, print| engine.start(config, print))
        }
    }

    /// Continue a paused execution with the host's outcome.
    pub fn resume(&mut self, outcome: HostOutcome) -> Result<RawProgress> {
        match mem::replace(&mut self.state, HandleState::Freed) {
            HandleState::PausedMetered(paused) => {
                self.drive::<Metered, _>(|_, print| E::resume(paused, outcome, print))
            }
            HandleState::PausedUnmetered(paused) => {
                self.drive::<Unmetered, _>(|_, print| E::resume(paused, outcome, print))
            }
            other => self.reject(other, "resume", "paused"),
        }
    }

    /// Convert the paused call into a future and keep executing.
    pub fn park(&mut self) -> Result<RawProgress> {
        match mem::replace(&mut self.state, HandleState::Freed) {
            HandleState::PausedMetered(paused) => {
                self.drive::<Metered, _>(|_, print| E::park(paused, print))
            }
            HandleState::PausedUnmetered(paused) => {
                self.drive::<Unmetered, _>(|_, print| E::park(paused, print))
            }
            other => self.reject(other, "park", "paused"),
        }
    }

    /// Deliver a batch of future outcomes to a parked execution.
    pub fn resolve(&mut self, outcomes: Vec<(CallId, HostOutcome)>) -> Result<RawProgress> {
        match mem::replace(&mut self.state, HandleState::Freed) {
            HandleState::ParkedMetered(parked) => {
                self.drive::<Metered, _>(|_, print| E::resolve(parked, outcomes, print))
            }
            HandleState::ParkedUnmetered(parked) => {
                self.drive::<Unmetered, _>(|_, print| E::resolve(parked, outcomes, print))
            }
            other => self.reject(other, "resolve", "parked"),
        }
    }

    /// Replace the remaining time budget of a paused execution.
    pub fn rearm(&mut self, budget: Duration) -> Result<()> {
        match &mut self.state {
            HandleState::PausedMetered(paused) => {
                E::rearm_deadline(paused, budget);
                Ok(())
            }
            HandleState::PausedUnmetered(paused) => {
                E::rearm_deadline(paused, budget);
                Ok(())
            }
            other => Err(illegal("rearm", other.describe(), "paused")),
        }
    }

    /// Serialize the compiled program. Only legal before execution starts.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        match &self.state {
            HandleState::Ready(engine) => contain(|| engine.dump())
                .map_err(Error::Boundary)?
                .map_err(Error::Boundary),
            other => Err(illegal("snapshot", other.describe(), "ready")),
        }
    }

    /// Rebuild a ready handle from snapshot bytes produced by the same
    /// build.
    pub fn restore(bytes: &[u8]) -> Result<Self> {
        let engine = contain(|| E::load(bytes))
            .map_err(Error::Boundary)?
            .map_err(Error::Boundary)?;
        Ok(Self {
            state: HandleState::Ready(engine),
            limits: None,
            print_output: String::new(),
        })
    }

    /// Release the engine. Exactly once; a second free is a checked error.
    pub fn free(&mut self) -> Result<()> {
        if matches!(self.state, HandleState::Freed) {
            return Err(Error::Boundary("handle already freed".to_string()));
        }
        debug!(state = self.state.describe(), "handle freed");
        self.state = HandleState::Freed;
        Ok(())
    }

    #[must_use]
    pub const fn is_freed(&self) -> bool {
        matches!(self.state, HandleState::Freed)
    }

    fn take_ready(&mut self, operation: &str) -> Result<E> {
        match mem::replace(&mut self.state, HandleState::Freed) {
            HandleState::Ready(engine) => Ok(engine),
            other => {
                let described = other.describe();
                self.state = other;
                Err(illegal(operation, described, "ready"))
            }
        }
    }

    fn reject(
        &mut self,
        state: HandleState<E>,
        operation: &str,
        wanted: &str,
    ) -> Result<RawProgress> {
        let described = state.describe();
        self.state = state;
        Err(illegal(operation, described, wanted))
    }

    /// One step into the engine: attach a fresh print sink, contain
    /// panics, drain the sink on every exit path, fold the resulting
    /// phase back into handle state.
    fn drive<T, F>(&mut self, op: F) -> Result<RawProgress>
    where
        T: Fold,
        F: FnOnce(T::Config, &mut PrintSink) -> core::result::Result<Phase<E, T>, ScriptError>,
    {
        let config = T::config(self.limits.as_ref());
        let mut sink = PrintSink::new();
        let caught = contain(|| op(config, &mut sink));
        self.print_output.push_str(sink.as_str());
        match caught {
            Err(message) => {
                // The engine state moved into the closure and is gone.
                self.state = HandleState::Freed;
                Err(Error::Boundary(message))
            }
            Ok(phase) => Ok(self.settle(phase)),
        }
    }

    fn settle<T: Fold>(
        &mut self,
        phase: core::result::Result<Phase<E, T>, ScriptError>,
    ) -> RawProgress {
        let print = self.print_so_far();
        match phase {
            Ok(Phase::Complete { value, usage }) => {
                self.state = HandleState::Complete;
                RawProgress::complete(RawRunResult {
                    ok: true,
                    value,
                    usage: Some(usage),
                    error: None,
                    print_output: print,
                })
            }
            Ok(Phase::Hostcall {
                function,
                args,
                kwargs,
                call_id,
                method_call,
                paused,
            }) => {
                self.state = T::fold_paused::<E>(paused);
                let mut raw = RawProgress::pending(function, args, kwargs, call_id, method_call);
                raw.print_output = print;
                raw
            }
            Ok(Phase::Blocked { call_ids, parked }) => {
                self.state = T::fold_parked::<E>(parked);
                let mut raw = RawProgress::resolve_futures(call_ids);
                raw.print_output = print;
                raw
            }
            Err(err) => {
                self.state = HandleState::Complete;
                RawProgress::error(RawError::from_script(err), print)
            }
        }
    }

    fn run_with<T: Fold>(&mut self, engine: E) -> Result<RawRunResult> {
        let config = T::config(self.limits.as_ref());
        let mut sink = PrintSink::new();
        let caught = contain(|| engine.run::<T>(config, &mut sink));
        self.print_output.push_str(sink.as_str());
        let print = self.print_so_far();
        match caught {
            Err(message) => {
                self.state = HandleState::Freed;
                Err(Error::Boundary(message))
            }
            Ok(outcome) => {
                self.state = HandleState::Complete;
                Ok(match outcome {
                    Ok((value, usage)) => RawRunResult {
                        ok: true,
                        value,
                        usage: Some(usage),
                        error: None,
                        print_output: print,
                    },
                    Err(err) => RawRunResult {
                        ok: false,
                        value: Value::Null,
                        usage: None,
                        error: Some(RawError::from_script(err)),
                        print_output: print,
                    },
                })
            }
        }
    }

    fn print_so_far(&self) -> Option<String> {
        if self.print_output.is_empty() {
            None
        } else {
            Some(self.print_output.clone())
        }
    }
}

fn illegal(operation: &str, actual: &str, wanted: &str) -> Error {
    Error::Boundary(format!(
        "cannot {operation} a {actual} handle; expected {wanted}"
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tether::wire::RawState;

    use super::*;

    /// Toy engine driven by a semicolon-separated directive string:
    /// `print:<text>`, `pause:<fn>`, `panic:<msg>`, `finish:<int>`.
    /// A resumed pause completes with the host-supplied value once the
    /// plan is exhausted.
    struct StubEngine {
        plan: Vec<String>,
        next_call_id: CallId,
    }

    impl StubEngine {
        fn step<T: TrackerKind>(
            mut self,
            print: &mut PrintSink,
        ) -> core::result::Result<Phase<Self, T>, ScriptError> {
            while let Some(directive) = self.plan.first().cloned() {
                self.plan.remove(0);
                match directive.split_once(':') {
                    Some(("print", text)) => print.push_line(text),
                    Some(("pause", function)) => {
                        let call_id = self.next_call_id;
                        self.next_call_id += 1;
                        return Ok(Phase::Hostcall {
                            function: function.to_string(),
                            args: vec![],
                            kwargs: serde_json::Map::new(),
                            call_id,
                            method_call: false,
                            paused: self,
                        });
                    }
                    Some(("panic", message)) => panic!("{message}"),
                    Some(("finish", value)) => {
                        return Ok(Phase::Complete {
                            value: json!(value.parse::<i64>().unwrap()),
                            usage: tether::limits::ResourceUsage::default(),
                        });
                    }
                    Some(("fail", message)) => {
                        return Err(ScriptError::new("RuntimeError", message));
                    }
                    _ => panic!("bad directive {directive}"),
                }
            }
            Ok(Phase::Complete {
                value: Value::Null,
                usage: tether::limits::ResourceUsage::default(),
            })
        }
    }

    impl Engine for StubEngine {
        type Paused<T: TrackerKind> = Self;
        type Parked<T: TrackerKind> = Self;

        fn compile(
            code: &str,
            _script_name: &str,
            _externals: &[String],
        ) -> core::result::Result<Self, ScriptError> {
            Ok(Self {
                plan: code.split(';').map(str::to_string).collect(),
                next_call_id: 1,
            })
        }

        fn run<T: TrackerKind>(
            self,
            _config: T::Config,
            print: &mut PrintSink,
        ) -> core::result::Result<(Value, tether::limits::ResourceUsage), ScriptError> {
            match self.step::<T>(print)? {
                Phase::Complete { value, usage } => Ok((value, usage)),
                _ => Err(ScriptError::new("RuntimeError", "unexpected pause")),
            }
        }

        fn start<T: TrackerKind>(
            self,
            _config: T::Config,
            print: &mut PrintSink,
        ) -> core::result::Result<Phase<Self, T>, ScriptError> {
            self.step(print)
        }

        fn resume<T: TrackerKind>(
            paused: Self,
            outcome: HostOutcome,
            print: &mut PrintSink,
        ) -> core::result::Result<Phase<Self, T>, ScriptError> {
            match outcome {
                HostOutcome::Error(message) => Err(ScriptError::new("RuntimeError", message)),
                HostOutcome::Return(value) if paused.plan.is_empty() => Ok(Phase::Complete {
                    value,
                    usage: tether::limits::ResourceUsage::default(),
                }),
                HostOutcome::Return(_) => paused.step(print),
            }
        }

        fn park<T: TrackerKind>(
            paused: Self,
            _print: &mut PrintSink,
        ) -> core::result::Result<Phase<Self, T>, ScriptError> {
            let parked_id = paused.next_call_id - 1;
            Ok(Phase::Blocked {
                call_ids: vec![parked_id],
                parked: paused,
            })
        }

        fn resolve<T: TrackerKind>(
            parked: Self,
            outcomes: Vec<(CallId, HostOutcome)>,
            _print: &mut PrintSink,
        ) -> core::result::Result<Phase<Self, T>, ScriptError> {
            drop(parked);
            let (_, outcome) = outcomes.into_iter().next().expect("empty batch");
            match outcome {
                HostOutcome::Return(value) => Ok(Phase::Complete {
                    value,
                    usage: tether::limits::ResourceUsage::default(),
                }),
                HostOutcome::Error(message) => Err(ScriptError::new("RuntimeError", message)),
            }
        }

        fn rearm_deadline<T: TrackerKind>(_paused: &mut Self, _budget: Duration) {}

        fn dump(&self) -> core::result::Result<Vec<u8>, String> {
            Ok(self.plan.join(";").into_bytes())
        }

        fn load(bytes: &[u8]) -> core::result::Result<Self, String> {
            let code = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
            Self::compile(code, "<input>", &[]).map_err(|e| e.message)
        }
    }

    fn handle(code: &str) -> Handle<StubEngine> {
        Handle::new(code, vec![], None).unwrap()
    }

    #[test]
    fn start_to_completion() {
        let mut h = handle("finish:2");
        let progress = h.start().unwrap();
        assert_eq!(progress.state, RawState::Complete);
        assert_eq!(progress.value, Some(json!(2)));

        let err = h.start().unwrap_err();
        assert!(err.to_string().contains("cannot start a complete handle"));
    }

    #[test]
    fn pause_resume_and_print_accumulation() {
        let mut h = handle("print:a;pause:fetch;print:b;pause:send");
        let progress = h.start().unwrap();
        assert_eq!(progress.state, RawState::Pending);
        assert_eq!(progress.function_name.as_deref(), Some("fetch"));
        assert_eq!(progress.call_id, Some(1));
        assert_eq!(progress.print_output.as_deref(), Some("a\n"));

        let progress = h.resume(HostOutcome::Return(json!(1))).unwrap();
        assert_eq!(progress.function_name.as_deref(), Some("send"));
        assert_eq!(progress.call_id, Some(2));
        // Accumulated, not per-step.
        assert_eq!(progress.print_output.as_deref(), Some("a\nb\n"));

        let progress = h.resume(HostOutcome::Return(json!("done"))).unwrap();
        assert_eq!(progress.state, RawState::Complete);
        assert_eq!(progress.value, Some(json!("done")));
    }

    #[test]
    fn print_survives_script_error() {
        let mut h = handle("print:before;fail:boom");
        let progress = h.start().unwrap();
        assert_eq!(progress.state, RawState::Error);
        assert_eq!(progress.print_output.as_deref(), Some("before\n"));
        assert_eq!(progress.error.unwrap().message, "boom");
    }

    #[test]
    fn panic_is_contained_and_frees_the_handle() {
        let mut h = handle("print:x;panic:engine exploded");
        let err = h.start().unwrap_err();
        assert!(matches!(err, Error::Boundary(ref m) if m == "engine exploded"));
        assert!(h.is_freed());

        let err = h.resume(HostOutcome::Return(Value::Null)).unwrap_err();
        assert!(err.to_string().contains("freed"));
    }

    #[test]
    fn resume_with_error_raises_in_script() {
        let mut h = handle("pause:fetch");
        h.start().unwrap();
        let progress = h.resume(HostOutcome::Error("no network".into())).unwrap();
        assert_eq!(progress.state, RawState::Error);
        assert_eq!(progress.error.unwrap().message, "no network");
    }

    #[test]
    fn resume_before_start_is_rejected() {
        let mut h = handle("finish:1");
        let err = h.resume(HostOutcome::Return(Value::Null)).unwrap_err();
        assert!(err.to_string().contains("cannot resume a ready handle"));
        // The rejected call must not have corrupted the state.
        assert!(h.start().is_ok());
    }

    #[test]
    fn park_and_resolve() {
        let mut h = handle("pause:fetch");
        h.start().unwrap();
        let progress = h.park().unwrap();
        assert_eq!(progress.state, RawState::ResolveFutures);
        assert_eq!(progress.pending_call_ids, Some(vec![1]));

        let progress = h
            .resolve(vec![(1, HostOutcome::Return(json!("late")))])
            .unwrap();
        assert_eq!(progress.state, RawState::Complete);
        assert_eq!(progress.value, Some(json!("late")));
    }

    #[test]
    fn free_is_exactly_once() {
        let mut h = handle("finish:1");
        h.free().unwrap();
        assert!(h.is_freed());
        assert!(h.free().is_err());
    }

    #[test]
    fn snapshot_only_before_start() {
        let mut h = handle("pause:fetch;finish:1");
        let bytes = h.snapshot().unwrap();

        h.start().unwrap();
        assert!(h.snapshot().is_err());

        let mut restored = Handle::<StubEngine>::restore(&bytes).unwrap();
        let progress = restored.start().unwrap();
        assert_eq!(progress.state, RawState::Pending);
    }

    #[test]
    fn rearm_requires_a_pause() {
        let mut h = handle("finish:1");
        assert!(h.rearm(Duration::from_millis(5)).is_err());

        let mut h = handle("pause:fetch");
        h.start().unwrap();
        assert!(h.rearm(Duration::from_millis(5)).is_ok());
    }
}
