//! Statement-at-a-time evaluator with resource tracking and
//! pause/park/resolve support.
//!
//! External calls are only honored as a whole statement or the whole
//! right-hand side of an assignment; that restriction is what makes the
//! paused state a plain (environment, statement index) pair.

use std::time::{Duration, Instant};

use serde_json::{Map, Number, Value, json};
use tether::error::{ScriptError, TraceFrame};
use tether::limits::{ResourceLimits, ResourceUsage};
use tether::progress::CallId;
use tether_native::{HostOutcome, PrintSink, TrackerPolicy};

use crate::ast::{BinOp, Expr, Stmt, StmtKind};

/// Key marking a placeholder value for a parked (future) call.
pub const FUTURE_KEY: &str = "__future__";

/// First call id handed out. Zero is reserved and never identifies a
/// real call.
pub const FIRST_CALL_ID: CallId = 1;

const PRINT_FN: &str = "print";
const LOCALS_FN: &str = "__locals__";

/// Resource meter for one execution. Unmetered executions still carry one,
/// with everything but the recursion ceiling disabled.
pub struct Tracker {
    limits: ResourceLimits,
    ceiling: u32,
    started: Instant,
    deadline: Option<Instant>,
    allocations: u64,
    memory_bytes: u64,
    max_depth: u32,
}

impl Tracker {
    #[must_use]
    pub fn new(policy: TrackerPolicy) -> Self {
        let (limits, ceiling) = match policy {
            TrackerPolicy::Metered(limits) => {
                let ceiling = limits.recursion_ceiling();
                (limits, ceiling)
            }
            TrackerPolicy::Unmetered { recursion_ceiling } => {
                (ResourceLimits::new(), recursion_ceiling)
            }
        };
        let deadline = limits.max_duration().map(|budget| Instant::now() + budget);
        Self {
            limits,
            ceiling,
            started: Instant::now(),
            deadline,
            allocations: 0,
            memory_bytes: 0,
            max_depth: 0,
        }
    }

    fn check_time(&self) -> Result<(), ScriptError> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ScriptError::new("TimeLimitError", "time limit exceeded"));
        }
        Ok(())
    }

    fn enter(&mut self, depth: u32) -> Result<(), ScriptError> {
        self.max_depth = self.max_depth.max(depth);
        if depth > self.ceiling {
            return Err(ScriptError::new(
                "RecursionError",
                "maximum recursion depth exceeded",
            ));
        }
        Ok(())
    }

    fn charge(&mut self, bytes: u64) -> Result<(), ScriptError> {
        self.allocations += 1;
        self.memory_bytes += bytes;
        if self
            .limits
            .max_allocations
            .is_some_and(|cap| self.allocations > cap)
        {
            return Err(ScriptError::new(
                "AllocationLimitError",
                "allocation limit exceeded",
            ));
        }
        if self
            .limits
            .max_memory_bytes
            .is_some_and(|cap| self.memory_bytes > cap)
        {
            return Err(ScriptError::new(
                "MemoryLimitError",
                "memory limit exceeded",
            ));
        }
        Ok(())
    }

    pub fn rearm(&mut self, budget: Duration) {
        self.deadline = Some(Instant::now() + budget);
    }

    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            memory_bytes: self.memory_bytes,
            elapsed_ms: self.started.elapsed().as_secs_f64() * 1000.0,
            stack_depth: self.max_depth,
            allocations: self.allocations,
        }
    }
}

/// Why an expression could not produce a value.
enum Flow {
    Raise(ScriptError),
    /// An unresolved future was used; the statement must wait.
    Touched,
}

/// A paused external call as the evaluator reports it.
pub struct PendingCallInfo {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub call_id: CallId,
    pub method_call: bool,
    /// Assignment target awaiting the call's value, if any.
    pub target: Option<String>,
}

pub enum StepEvent {
    Done { value: Value, usage: ResourceUsage },
    Pause(PendingCallInfo),
    Blocked { call_ids: Vec<CallId> },
}

/// Mid-execution interpreter state: the environment plus a cursor into
/// the statement list.
pub struct ExecState {
    stmts: Vec<Stmt>,
    script_name: String,
    externals: Vec<String>,
    env: Map<String, Value>,
    index: usize,
    last_value: Value,
    next_call_id: CallId,
    outstanding: Vec<CallId>,
    pub tracker: Tracker,
}

impl ExecState {
    #[must_use]
    pub fn new(
        stmts: Vec<Stmt>,
        script_name: String,
        externals: Vec<String>,
        tracker: Tracker,
    ) -> Self {
        Self {
            stmts,
            script_name,
            externals,
            env: Map::new(),
            index: 0,
            last_value: Value::Null,
            next_call_id: FIRST_CALL_ID,
            outstanding: Vec::new(),
            tracker,
        }
    }

    /// Execute statements until completion, a pause, or a block.
    pub fn advance(&mut self, print: &mut PrintSink) -> Result<StepEvent, ScriptError> {
        loop {
            if self.index >= self.stmts.len() {
                return Ok(StepEvent::Done {
                    value: core::mem::take(&mut self.last_value),
                    usage: self.tracker.usage(),
                });
            }
            if let Err(e) = self.tracker.check_time() {
                return Err(self.fail(e));
            }

            let stmt = self.stmts[self.index].clone();
            let (target, expr) = match &stmt.kind {
                StmtKind::Assign { target, value } => (Some(target.clone()), value),
                StmtKind::Expr(expr) => (None, expr),
            };

            if let Expr::Call {
                function,
                method_call,
                args,
                kwargs,
            } = expr
            {
                if self.externals.iter().any(|name| name == function) {
                    return self.pause_at(function, *method_call, args, kwargs, target, print);
                }
            }

            match self.eval(expr, 1, print) {
                Ok(value) => self.finish_stmt(target, value),
                Err(Flow::Touched) => {
                    return Ok(StepEvent::Blocked {
                        call_ids: self.outstanding.clone(),
                    });
                }
                Err(Flow::Raise(e)) => return Err(self.fail(e)),
            }
        }
    }

    fn pause_at(
        &mut self,
        function: &str,
        method_call: bool,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        target: Option<String>,
        print: &mut PrintSink,
    ) -> Result<StepEvent, ScriptError> {
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            match self.eval(arg, 1, print) {
                Ok(value) if future_id(&value).is_some() => {
                    return Ok(StepEvent::Blocked {
                        call_ids: self.outstanding.clone(),
                    });
                }
                Ok(value) => arg_values.push(value),
                Err(Flow::Touched) => {
                    return Ok(StepEvent::Blocked {
                        call_ids: self.outstanding.clone(),
                    });
                }
                Err(Flow::Raise(e)) => return Err(self.fail(e)),
            }
        }
        let mut kwarg_values = Map::new();
        for (key, expr) in kwargs {
            match self.eval(expr, 1, print) {
                Ok(value) => {
                    kwarg_values.insert(key.clone(), value);
                }
                Err(Flow::Touched) => {
                    return Ok(StepEvent::Blocked {
                        call_ids: self.outstanding.clone(),
                    });
                }
                Err(Flow::Raise(e)) => return Err(self.fail(e)),
            }
        }

        let call_id = self.next_call_id;
        self.next_call_id += 1;
        Ok(StepEvent::Pause(PendingCallInfo {
            function: function.to_string(),
            args: arg_values,
            kwargs: kwarg_values,
            call_id,
            method_call,
            target,
        }))
    }

    /// Feed the host's return value into the paused statement and move on.
    pub fn resume_value(&mut self, target: Option<String>, value: Value) {
        self.finish_stmt(target, value);
    }

    /// Raise the host's error at the paused statement.
    pub fn resume_error(&mut self, message: &str) -> ScriptError {
        self.fail(ScriptError::new("RuntimeError", message))
    }

    /// Replace the paused call's value with a future placeholder.
    pub fn park_pending(&mut self, target: Option<String>, call_id: CallId) {
        self.outstanding.push(call_id);
        self.finish_stmt(target, json!({ FUTURE_KEY: call_id }));
    }

    /// Substitute resolved future values (first injected error wins).
    pub fn resolve(&mut self, outcomes: Vec<(CallId, HostOutcome)>) -> Result<(), ScriptError> {
        for (id, outcome) in outcomes {
            if !self.outstanding.contains(&id) {
                return Err(self.fail(ScriptError::new(
                    "RuntimeError",
                    format!("unknown call id {id}"),
                )));
            }
            match outcome {
                HostOutcome::Error(message) => {
                    return Err(self.fail(ScriptError::new("RuntimeError", message)));
                }
                HostOutcome::Return(value) => {
                    self.outstanding.retain(|&o| o != id);
                    substitute(&mut self.last_value, id, &value);
                    for slot in self.env.values_mut() {
                        substitute(slot, id, &value);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish_stmt(&mut self, target: Option<String>, value: Value) {
        match target {
            Some(name) => {
                self.env.insert(name, value);
            }
            None => self.last_value = value,
        }
        self.index += 1;
    }

    fn fail(&self, mut err: ScriptError) -> ScriptError {
        if err.traceback.is_empty() {
            let line = self.stmts.get(self.index).map_or(1, |s| s.line);
            err.traceback.push(TraceFrame::new(&self.script_name, line, 1));
        }
        err
    }

    fn eval(&mut self, expr: &Expr, depth: u32, print: &mut PrintSink) -> Result<Value, Flow> {
        self.tracker.enter(depth).map_err(Flow::Raise)?;
        match expr {
            Expr::Int(n) => self.alloc(json!(n)),
            Expr::Float(f) => self.alloc(json!(f)),
            Expr::Str(s) => self.alloc(Value::String(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::Null),
            Expr::Name(name) => self.env.get(name).cloned().map_or_else(
                || {
                    Err(Flow::Raise(ScriptError::new(
                        "NameError",
                        format!("name '{name}' is not defined"),
                    )))
                },
                Ok,
            ),
            Expr::Neg(inner) => {
                let value = self.eval(inner, depth + 1, print)?;
                if future_id(&value).is_some() {
                    return Err(Flow::Touched);
                }
                negate(&value).map_err(Flow::Raise)
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left, depth + 1, print)?;
                let r = self.eval(right, depth + 1, print)?;
                if future_id(&l).is_some() || future_id(&r).is_some() {
                    return Err(Flow::Touched);
                }
                let value = binary(*op, &l, &r).map_err(Flow::Raise)?;
                self.alloc(value)
            }
            Expr::Subscript { target, index } => {
                let t = self.eval(target, depth + 1, print)?;
                let i = self.eval(index, depth + 1, print)?;
                if future_id(&t).is_some() || future_id(&i).is_some() {
                    return Err(Flow::Touched);
                }
                subscript(&t, &i).map_err(Flow::Raise)
            }
            Expr::Call {
                function,
                args,
                kwargs,
                ..
            } => self.call_builtin(function, args, kwargs, depth, print),
        }
    }

    fn call_builtin(
        &mut self,
        function: &str,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        depth: u32,
        print: &mut PrintSink,
    ) -> Result<Value, Flow> {
        match function {
            PRINT_FN => {
                if !kwargs.is_empty() {
                    return Err(Flow::Raise(ScriptError::new(
                        "TypeError",
                        "print() takes no keyword arguments",
                    )));
                }
                let mut parts = Vec::with_capacity(args.len());
                for arg in args {
                    let value = self.eval(arg, depth + 1, print)?;
                    if future_id(&value).is_some() {
                        return Err(Flow::Touched);
                    }
                    parts.push(render(&value));
                }
                print.push_line(&parts.join(" "));
                Ok(Value::Null)
            }
            LOCALS_FN => {
                if !args.is_empty() || !kwargs.is_empty() {
                    return Err(Flow::Raise(ScriptError::new(
                        "TypeError",
                        "__locals__() takes no arguments",
                    )));
                }
                Ok(Value::Object(self.env.clone()))
            }
            _ if self.externals.iter().any(|name| name == function) => {
                Err(Flow::Raise(ScriptError::new(
                    "RuntimeError",
                    format!(
                        "external function '{function}' may only be called as a whole statement"
                    ),
                )))
            }
            _ => Err(Flow::Raise(ScriptError::new(
                "NameError",
                format!("name '{function}' is not defined"),
            ))),
        }
    }

    fn alloc(&mut self, value: Value) -> Result<Value, Flow> {
        self.tracker.charge(estimate(&value)).map_err(Flow::Raise)?;
        Ok(value)
    }
}

/// The placeholder's call id, if this value is a parked-future marker.
#[must_use]
pub fn future_id(value: &Value) -> Option<CallId> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(FUTURE_KEY)?.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn substitute(slot: &mut Value, id: CallId, replacement: &Value) {
    if future_id(slot) == Some(id) {
        *slot = replacement.clone();
        return;
    }
    match slot {
        Value::Array(items) => {
            for item in items {
                substitute(item, id, replacement);
            }
        }
        Value::Object(map) => {
            for value in map.values_mut() {
                substitute(value, id, replacement);
            }
        }
        _ => {}
    }
}

fn negate(value: &Value) -> Result<Value, ScriptError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.checked_neg().map(|i| json!(i)).ok_or_else(overflow)
            } else {
                Ok(json!(-n.as_f64().unwrap_or_default()))
            }
        }
        other => Err(ScriptError::new(
            "TypeError",
            format!("bad operand type for unary -: '{}'", type_name(other)),
        )),
    }
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, ScriptError> {
    match (l, r) {
        (Value::String(a), Value::String(b)) if op == BinOp::Add => {
            Ok(Value::String(format!("{a}{b}")))
        }
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => int_binary(op, x, y),
            _ => float_binary(
                op,
                a.as_f64().unwrap_or_default(),
                b.as_f64().unwrap_or_default(),
            ),
        },
        _ => Err(ScriptError::new(
            "TypeError",
            format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                type_name(l),
                type_name(r)
            ),
        )),
    }
}

fn int_binary(op: BinOp, x: i64, y: i64) -> Result<Value, ScriptError> {
    match op {
        BinOp::Add => x.checked_add(y).map(|v| json!(v)).ok_or_else(overflow),
        BinOp::Sub => x.checked_sub(y).map(|v| json!(v)).ok_or_else(overflow),
        BinOp::Mul => x.checked_mul(y).map(|v| json!(v)).ok_or_else(overflow),
        BinOp::Div => {
            if y == 0 {
                Err(zero_division())
            } else {
                float_value(x as f64 / y as f64)
            }
        }
    }
}

fn float_binary(op: BinOp, x: f64, y: f64) -> Result<Value, ScriptError> {
    match op {
        BinOp::Add => float_value(x + y),
        BinOp::Sub => float_value(x - y),
        BinOp::Mul => float_value(x * y),
        BinOp::Div => {
            if y == 0.0 {
                Err(zero_division())
            } else {
                float_value(x / y)
            }
        }
    }
}

fn float_value(f: f64) -> Result<Value, ScriptError> {
    Number::from_f64(f).map(Value::Number).ok_or_else(overflow)
}

fn overflow() -> ScriptError {
    ScriptError::new("OverflowError", "numeric result out of range")
}

fn zero_division() -> ScriptError {
    ScriptError::new("ZeroDivisionError", "division by zero")
}

fn subscript(target: &Value, index: &Value) -> Result<Value, ScriptError> {
    match (target, index) {
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| ScriptError::new("KeyError", format!("'{key}'"))),
        (Value::Array(items), Value::Number(n)) => {
            let idx = n
                .as_i64()
                .ok_or_else(|| ScriptError::new("TypeError", "list index must be an integer"))?;
            let len = items.len() as i64;
            let effective = if idx < 0 { idx + len } else { idx };
            usize::try_from(effective)
                .ok()
                .and_then(|i| items.get(i).cloned())
                .ok_or_else(|| ScriptError::new("IndexError", "list index out of range"))
        }
        _ => Err(ScriptError::new(
            "TypeError",
            format!("'{}' object is not subscriptable", type_name(target)),
        )),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.as_i64().is_some() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn estimate(value: &Value) -> u64 {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => 24 + s.len() as u64,
        Value::Array(items) => 16 + items.iter().map(estimate).sum::<u64>(),
        Value::Object(map) => {
            32 + map
                .iter()
                .map(|(k, v)| k.len() as u64 + estimate(v))
                .sum::<u64>()
        }
    }
}
