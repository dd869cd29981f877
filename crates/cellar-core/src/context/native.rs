//! In-process function table.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::ready;
use indexmap::IndexMap;

use super::{CallArgument, CallOptions, CallResult, Context, ContextError, ContextFuture};
use crate::error::ErrorRecord;
use crate::value::{Payload, Value};

/// A function callable through a [`FunctionContext`].
///
/// Receives decoded `(name, value)` arguments; an `Err` becomes a runtime
/// error record on the calling cell.
pub type NativeFunction =
    Arc<dyn Fn(&[(Option<String>, Value)]) -> Result<Value, String> + Send + Sync>;

/// Context backed by Rust closures.
///
/// It only offers named functions; `call_code` and `run_code` answer with a
/// runtime error since there is no interpreter behind it.
#[derive(Clone, Default)]
pub struct FunctionContext {
    functions: IndexMap<String, NativeFunction>,
}

impl FunctionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arithmetic and aggregate functions the expression operators desugar to.
    pub fn with_builtins() -> Self {
        Self::new()
            .function("add", |args| binary(args, "add", i64::checked_add, |a, b| a + b))
            .function("subtract", |args| {
                binary(args, "subtract", i64::checked_sub, |a, b| a - b)
            })
            .function("multiply", |args| {
                binary(args, "multiply", i64::checked_mul, |a, b| a * b)
            })
            .function("divide", divide)
            .function("negate", negate)
            .function("sum", sum)
            .function("mean", mean)
    }

    /// Register (or replace) a function.
    pub fn function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[(Option<String>, Value)]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    fn invoke(&self, name: &str, args: Vec<CallArgument>, options: CallOptions) -> CallResult {
        let Some(function) = self.functions.get(name) else {
            return CallResult::failed(vec![ErrorRecord::runtime(
                0,
                0,
                format!("unknown function '{name}'"),
            )]);
        };

        let mut decoded = Vec::with_capacity(args.len());
        for (arg_name, payload) in args {
            match payload.into_value() {
                Ok(value) => decoded.push((arg_name, value)),
                Err(e) => {
                    return CallResult::failed(vec![ErrorRecord::runtime(0, 0, e.to_string())]);
                }
            }
        }

        match function(&decoded) {
            Ok(value) => CallResult::ok(Payload::for_options(value, options.pack)),
            Err(message) => {
                CallResult::failed(vec![ErrorRecord::runtime(0, 0, format!("{name}: {message}"))])
            }
        }
    }
}

impl Context for FunctionContext {
    fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn call_function(
        &self,
        name: &str,
        args: Vec<CallArgument>,
        options: CallOptions,
    ) -> ContextFuture {
        let result = self.invoke(name, args, options);
        ready(Ok::<_, ContextError>(result)).boxed()
    }

    fn call_code(
        &self,
        _source: &str,
        _args: IndexMap<String, Payload>,
        _options: CallOptions,
    ) -> ContextFuture {
        ready(Ok(no_interpreter())).boxed()
    }

    fn run_code(&self, _source: &str, _options: CallOptions) -> ContextFuture {
        ready(Ok(no_interpreter())).boxed()
    }
}

impl std::fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionContext")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn no_interpreter() -> CallResult {
    CallResult::failed(vec![ErrorRecord::runtime(
        0,
        0,
        "this context cannot execute source code",
    )])
}

fn numeric(value: &Value, function: &str) -> Result<(), String> {
    match value {
        Value::Integer(_) | Value::Number(_) => Ok(()),
        other => Err(format!("{function} expects numbers, got {}", other.type_name())),
    }
}

fn binary(
    args: &[(Option<String>, Value)],
    function: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    let [(_, lhs), (_, rhs)] = args else {
        return Err(format!("expected 2 arguments, got {}", args.len()));
    };
    numeric(lhs, function)?;
    numeric(rhs, function)?;

    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        if let Some(result) = int_op(*a, *b) {
            return Ok(Value::Integer(result));
        }
    }
    // Overflowing integer arithmetic falls back to floats.
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Number(float_op(a, b))),
        _ => Err(format!("{function} expects numbers")),
    }
}

fn divide(args: &[(Option<String>, Value)]) -> Result<Value, String> {
    let [(_, lhs), (_, rhs)] = args else {
        return Err(format!("expected 2 arguments, got {}", args.len()));
    };
    numeric(lhs, "divide")?;
    numeric(rhs, "divide")?;

    match (lhs, rhs) {
        (_, Value::Integer(0)) => Err("division by zero".to_string()),
        (Value::Integer(a), Value::Integer(b)) if a.checked_rem(*b) == Some(0) => {
            Ok(Value::Integer(a / b))
        }
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Number(a / b)),
            _ => Err("divide expects numbers".to_string()),
        },
    }
}

fn negate(args: &[(Option<String>, Value)]) -> Result<Value, String> {
    match args {
        [(_, Value::Integer(i))] => Ok(i
            .checked_neg()
            .map(Value::Integer)
            .unwrap_or(Value::Number(-(*i as f64)))),
        [(_, Value::Number(n))] => Ok(Value::Number(-n)),
        [(_, other)] => Err(format!("negate expects a number, got {}", other.type_name())),
        _ => Err(format!("expected 1 argument, got {}", args.len())),
    }
}

/// Arguments flattened one level: array arguments contribute their elements.
fn operands(args: &[(Option<String>, Value)], function: &str) -> Result<Vec<Value>, String> {
    let mut out = Vec::new();
    for (_, value) in args {
        match value {
            Value::Array(items) => out.extend(items.iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    for value in &out {
        numeric(value, function)?;
    }
    Ok(out)
}

fn sum(args: &[(Option<String>, Value)]) -> Result<Value, String> {
    let values = operands(args, "sum")?;
    let integers: Option<Vec<i64>> = values.iter().map(Value::as_i64).collect();
    if let Some(integers) = integers {
        if let Some(total) = integers.iter().try_fold(0i64, |acc, i| acc.checked_add(*i)) {
            return Ok(Value::Integer(total));
        }
    }
    Ok(Value::Number(values.iter().filter_map(Value::as_f64).sum()))
}

fn mean(args: &[(Option<String>, Value)]) -> Result<Value, String> {
    let values = operands(args, "mean")?;
    if values.is_empty() {
        return Err("mean of no values".to_string());
    }
    let total: f64 = values.iter().filter_map(Value::as_f64).sum();
    Ok(Value::Number(total / values.len() as f64))
}
