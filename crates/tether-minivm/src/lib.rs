//! Deterministic mini script engine for exercising the platform end to
//! end: newline-separated statements over JSON values, pausable external
//! calls, parked futures, and enforced resource caps.
//!
//! The language is deliberately tiny — assignments, arithmetic, strings,
//! subscripts, `print`, `__locals__`, and calls to declared external
//! functions. External calls are honored only as a whole statement or a
//! whole assignment right-hand side.

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;

use core::marker::PhantomData;
use core::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether::error::ScriptError;
use tether::limits::ResourceUsage;
use tether::progress::CallId;
use tether_native::{Engine, HostOutcome, Phase, PrintSink, TrackerKind};

use crate::ast::Stmt;
use crate::interp::{ExecState, StepEvent, Tracker};

/// A compiled program, ready to run or snapshot.
pub struct MiniVm {
    source: String,
    script_name: String,
    externals: Vec<String>,
    program: Vec<Stmt>,
}

impl MiniVm {
    fn into_state<T: TrackerKind>(self, config: T::Config) -> ExecState {
        ExecState::new(
            self.program,
            self.script_name,
            self.externals,
            Tracker::new(T::policy(config)),
        )
    }
}

/// Execution paused at one external call.
pub struct MiniPaused<T: TrackerKind> {
    state: ExecState,
    target: Option<String>,
    call_id: CallId,
    _kind: PhantomData<fn() -> T>,
}

/// Execution blocked on parked futures.
pub struct MiniParked<T: TrackerKind> {
    state: ExecState,
    _kind: PhantomData<fn() -> T>,
}

#[derive(Serialize, Deserialize)]
struct ProgramImage {
    source: String,
    script_name: String,
    externals: Vec<String>,
}

fn settle_state<T: TrackerKind>(
    mut state: ExecState,
    print: &mut PrintSink,
) -> Result<Phase<MiniVm, T>, ScriptError> {
    match state.advance(print)? {
        StepEvent::Done { value, usage } => Ok(Phase::Complete { value, usage }),
        StepEvent::Pause(call) => Ok(Phase::Hostcall {
            function: call.function,
            args: call.args,
            kwargs: call.kwargs,
            call_id: call.call_id,
            method_call: call.method_call,
            paused: MiniPaused {
                state,
                target: call.target,
                call_id: call.call_id,
                _kind: PhantomData,
            },
        }),
        StepEvent::Blocked { call_ids } => Ok(Phase::Blocked {
            call_ids,
            parked: MiniParked {
                state,
                _kind: PhantomData,
            },
        }),
    }
}

impl Engine for MiniVm {
    type Paused<T: TrackerKind> = MiniPaused<T>;
    type Parked<T: TrackerKind> = MiniParked<T>;

    fn compile(code: &str, script_name: &str, externals: &[String]) -> Result<Self, ScriptError> {
        let program = parser::parse(code, script_name)?;
        Ok(Self {
            source: code.to_string(),
            script_name: script_name.to_string(),
            externals: externals.to_vec(),
            program,
        })
    }

    fn run<T: TrackerKind>(
        self,
        config: T::Config,
        print: &mut PrintSink,
    ) -> Result<(Value, ResourceUsage), ScriptError> {
        let mut state = self.into_state::<T>(config);
        match state.advance(print)? {
            StepEvent::Done { value, usage } => Ok((value, usage)),
            StepEvent::Pause(call) => Err(ScriptError::new(
                "RuntimeError",
                format!(
                    "external function '{}' requires iterative execution",
                    call.function
                ),
            )),
            StepEvent::Blocked { .. } => Err(ScriptError::new(
                "RuntimeError",
                "unresolved futures in run mode",
            )),
        }
    }

    fn start<T: TrackerKind>(
        self,
        config: T::Config,
        print: &mut PrintSink,
    ) -> Result<Phase<Self, T>, ScriptError> {
        let state = self.into_state::<T>(config);
        settle_state(state, print)
    }

    fn resume<T: TrackerKind>(
        paused: MiniPaused<T>,
        outcome: HostOutcome,
        print: &mut PrintSink,
    ) -> Result<Phase<Self, T>, ScriptError> {
        let MiniPaused {
            mut state, target, ..
        } = paused;
        match outcome {
            HostOutcome::Return(value) => {
                state.resume_value(target, value);
                settle_state(state, print)
            }
            HostOutcome::Error(message) => Err(state.resume_error(&message)),
        }
    }

    fn park<T: TrackerKind>(
        paused: MiniPaused<T>,
        print: &mut PrintSink,
    ) -> Result<Phase<Self, T>, ScriptError> {
        let MiniPaused {
            mut state,
            target,
            call_id,
            ..
        } = paused;
        state.park_pending(target, call_id);
        settle_state(state, print)
    }

    fn resolve<T: TrackerKind>(
        parked: MiniParked<T>,
        outcomes: Vec<(CallId, HostOutcome)>,
        print: &mut PrintSink,
    ) -> Result<Phase<Self, T>, ScriptError> {
        let MiniParked { mut state, .. } = parked;
        state.resolve(outcomes)?;
        settle_state(state, print)
    }

    fn rearm_deadline<T: TrackerKind>(paused: &mut MiniPaused<T>, budget: Duration) {
        paused.state.tracker.rearm(budget);
    }

    fn dump(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&ProgramImage {
            source: self.source.clone(),
            script_name: self.script_name.clone(),
            externals: self.externals.clone(),
        })
        .map_err(|e| e.to_string())
    }

    fn load(bytes: &[u8]) -> Result<Self, String> {
        let image: ProgramImage =
            serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        Self::compile(&image.source, &image.script_name, &image.externals)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tether::limits::ResourceLimits;
    use tether_native::{Metered, Unmetered};

    use super::*;

    fn compile(code: &str, externals: &[&str]) -> MiniVm {
        let externals: Vec<String> = externals.iter().map(ToString::to_string).collect();
        MiniVm::compile(code, "<input>", &externals).unwrap()
    }

    #[test]
    fn arithmetic_to_completion() {
        let vm = compile("x = 2 * 3\nx + 4", &[]);
        let mut print = PrintSink::new();
        let (value, usage) = vm.run::<Unmetered>(1000, &mut print).unwrap();
        assert_eq!(value, json!(10));
        assert!(usage.allocations > 0);
    }

    #[test]
    fn pause_carries_args_kwargs_and_call_id() {
        let vm = compile("r = fetch('u', retries=2)\nr", &["fetch"]);
        let mut print = PrintSink::new();
        let Phase::Hostcall {
            function,
            args,
            kwargs,
            call_id,
            method_call,
            paused,
        } = vm.start::<Unmetered>(1000, &mut print).unwrap()
        else {
            panic!("expected a pause");
        };
        assert_eq!(function, "fetch");
        assert_eq!(args, vec![json!("u")]);
        assert_eq!(kwargs.get("retries"), Some(&json!(2)));
        // Zero is reserved; the first real call id is nonzero.
        assert_eq!(call_id, 1);
        assert!(!method_call);

        let Phase::Complete { value, .. } =
            MiniVm::resume(paused, HostOutcome::Return(json!("body")), &mut print).unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(value, json!("body"));
    }

    #[test]
    fn division_by_zero_has_a_traceback_frame() {
        let vm = compile("x = 1\n1 / 0", &[]);
        let mut print = PrintSink::new();
        let err = vm.run::<Unmetered>(1000, &mut print).unwrap_err();
        assert_eq!(err.exc_type, "ZeroDivisionError");
        assert_eq!(err.message, "division by zero");
        assert_eq!(err.traceback[0].line, 2);
        assert_eq!(err.traceback[0].filename, "<input>");
    }

    #[test]
    fn exhausted_time_budget_fails_before_the_first_statement() {
        let vm = compile("1 + 1", &[]);
        let limits = ResourceLimits::new().max_duration_ms(0);
        let mut print = PrintSink::new();
        let err = vm.run::<Metered>(limits, &mut print).unwrap_err();
        assert_eq!(err.exc_type, "TimeLimitError");
    }

    #[test]
    fn allocation_cap_is_enforced() {
        let vm = compile("x = 1 + 2 + 3 + 4\nx", &[]);
        let limits = ResourceLimits::new().max_allocations(2);
        let mut print = PrintSink::new();
        let err = vm.run::<Metered>(limits, &mut print).unwrap_err();
        assert_eq!(err.exc_type, "AllocationLimitError");
    }

    #[test]
    fn memory_cap_is_enforced() {
        let vm = compile("s = 'aaaaaaaaaaaaaaaa' + 'bbbbbbbbbbbbbbbb'\ns", &[]);
        let limits = ResourceLimits::new().max_memory_bytes(48);
        let mut print = PrintSink::new();
        let err = vm.run::<Metered>(limits, &mut print).unwrap_err();
        assert_eq!(err.exc_type, "MemoryLimitError");
    }

    #[test]
    fn recursion_ceiling_applies_without_a_policy() {
        let vm = compile("1 + (2 + (3 + (4 + 5)))", &[]);
        let mut print = PrintSink::new();
        let err = vm.run::<Unmetered>(2, &mut print).unwrap_err();
        assert_eq!(err.exc_type, "RecursionError");
    }

    #[test]
    fn parked_futures_block_when_combined() {
        let vm = compile("a = fetch('x')\nb = fetch('y')\nc = a + b\nc", &["fetch"]);
        let mut print = PrintSink::new();
        let Phase::Hostcall { paused, .. } = vm.start::<Unmetered>(1000, &mut print).unwrap()
        else {
            panic!("expected first pause");
        };
        let Phase::Hostcall { paused, call_id, .. } =
            MiniVm::park(paused, &mut print).unwrap()
        else {
            panic!("expected second pause");
        };
        assert_eq!(call_id, 2);
        let Phase::Blocked { call_ids, parked } = MiniVm::park(paused, &mut print).unwrap()
        else {
            panic!("expected a block");
        };
        assert_eq!(call_ids, vec![1, 2]);

        let Phase::Complete { value, .. } = MiniVm::resolve(
            parked,
            vec![
                (1, HostOutcome::Return(json!(40))),
                (2, HostOutcome::Return(json!(2))),
            ],
            &mut print,
        )
        .unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(value, json!(42));
    }

    #[test]
    fn partial_resolution_blocks_again_with_the_remainder() {
        let vm = compile("a = fetch('x')\nb = fetch('y')\na + b", &["fetch"]);
        let mut print = PrintSink::new();
        let Phase::Hostcall { paused, .. } = vm.start::<Unmetered>(1000, &mut print).unwrap()
        else {
            panic!("expected first pause");
        };
        let Phase::Hostcall { paused, .. } = MiniVm::park(paused, &mut print).unwrap() else {
            panic!("expected second pause");
        };
        let Phase::Blocked { parked, .. } = MiniVm::park(paused, &mut print).unwrap() else {
            panic!("expected a block");
        };
        let Phase::Blocked { call_ids, .. } =
            MiniVm::resolve(parked, vec![(1, HostOutcome::Return(json!(1)))], &mut print)
                .unwrap()
        else {
            panic!("expected to block again");
        };
        assert_eq!(call_ids, vec![2]);
    }

    #[test]
    fn snapshot_round_trip_preserves_the_program() {
        let vm = compile("x = 6\nx * 7", &[]);
        let bytes = vm.dump().unwrap();
        let restored = MiniVm::load(&bytes).unwrap();
        let mut print = PrintSink::new();
        let (value, _) = restored.run::<Unmetered>(1000, &mut print).unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn locals_reports_assigned_variables() {
        let vm = compile("x = 1\ny = 'two'\n__locals__()", &[]);
        let mut print = PrintSink::new();
        let (value, _) = vm.run::<Unmetered>(1000, &mut print).unwrap();
        assert_eq!(value, json!({"x": 1, "y": "two"}));
    }

    #[test]
    fn print_renders_python_style() {
        let vm = compile("print('total', 1 + 1, None, True)\n'done'", &[]);
        let mut print = PrintSink::new();
        let (value, _) = vm.run::<Unmetered>(1000, &mut print).unwrap();
        assert_eq!(value, json!("done"));
        assert_eq!(print.as_str(), "total 2 None True\n");
    }

    #[test]
    fn nested_external_call_is_rejected() {
        let vm = compile("x = 1 + fetch('u')", &["fetch"]);
        let mut print = PrintSink::new();
        let err = match vm.start::<Unmetered>(1000, &mut print) {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.exc_type, "RuntimeError");
        assert!(err.message.contains("whole statement"));
    }
}
