//! Call dispatch: evaluating an expression tree against the contexts.
//!
//! Literals and variables evaluate locally. Every call is sent to a context:
//!
//! - `call(...)` and `run()` execute the owning cell's source in the context
//!   named by the cell's language;
//! - any other name goes to the first context offering that function.
//!
//! Diagnostics accumulate in the returned [`Evaluation`]. Only an
//! unresolvable function fails the evaluation as a whole.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::context::{CallOptions, CallResult, ContextError, ContextFuture, ContextRegistry};
use crate::document::NodeId;
use crate::error::{ErrorKind, ErrorRecord};
use crate::expr::{Argument, Call, Expr, PIPE_ARGUMENT};
use crate::value::{Regime, Value};

/// Variable bindings visible to an evaluation.
pub type Scope = FxHashMap<String, Value>;

/// Failures that reject an evaluation instead of being stored on the cell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Could not resolve function \"{0}\"")]
    UnresolvedFunction(String),
}

/// The cell an expression belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    pub cell: NodeId,
    /// Language of the cell; empty strings count as absent.
    pub language: Option<String>,
    pub source_code: String,
}

impl CallSite {
    fn language(&self) -> Option<&str> {
        self.language.as_deref().filter(|language| !language.is_empty())
    }
}

/// Outcome of evaluating one expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Absent when any fatal diagnostic was produced along the way.
    pub value: Option<Value>,
    pub diagnostics: Vec<ErrorRecord>,
}

/// Resolves calls to contexts and performs them.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    contexts: Arc<ContextRegistry>,
    native_language: Arc<str>,
}

impl Dispatcher {
    pub fn new(contexts: Arc<ContextRegistry>, native_language: impl Into<Arc<str>>) -> Self {
        Self {
            contexts,
            native_language: native_language.into(),
        }
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    /// Value regime for calls into the context named `context`.
    pub fn regime(&self, context: &str) -> Regime {
        Regime::for_context(context, &self.native_language)
    }

    /// Evaluate an expression tree.
    pub async fn evaluate(
        &self,
        root: &Expr,
        scope: &Scope,
        site: &CallSite,
    ) -> Result<Evaluation, DispatchError> {
        let mut diagnostics = Vec::new();
        let value = self.eval(root, scope, site, &mut diagnostics).await?;
        Ok(Evaluation { value, diagnostics })
    }

    fn eval<'a>(
        &'a self,
        expr: &'a Expr,
        scope: &'a Scope,
        site: &'a CallSite,
        diagnostics: &'a mut Vec<ErrorRecord>,
    ) -> BoxFuture<'a, Result<Option<Value>, DispatchError>> {
        async move {
            match expr {
                Expr::Literal(value) => Ok(Some(value.clone())),
                // Unbound variables read as null.
                Expr::Variable(name) => Ok(Some(scope.get(name).cloned().unwrap_or_default())),
                Expr::Call(call) => match call.name.as_str() {
                    "call" | "run" => self.external(call, scope, site, diagnostics).await,
                    _ => self.function(call, scope, site, diagnostics).await,
                },
            }
        }
        .boxed()
    }

    /// Evaluate arguments left to right; `None` if any of them is absent.
    async fn arguments<'a>(
        &self,
        args: &'a [Argument],
        scope: &Scope,
        site: &CallSite,
        diagnostics: &mut Vec<ErrorRecord>,
    ) -> Result<Option<Vec<(Option<&'a str>, Value)>>, DispatchError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match self.eval(&arg.value, scope, site, diagnostics).await? {
                Some(value) => values.push((arg.name.as_deref(), value)),
                None => return Ok(None),
            }
        }
        Ok(Some(values))
    }

    /// `call(...)` / `run()` against the cell's own language.
    async fn external(
        &self,
        call: &Call,
        scope: &Scope,
        site: &CallSite,
        diagnostics: &mut Vec<ErrorRecord>,
    ) -> Result<Option<Value>, DispatchError> {
        let Some(language) = site.language() else {
            diagnostics.push(ErrorRecord::dispatch(
                "Internal error: no cell associated with expression.",
            ));
            return Ok(None);
        };
        let Some(context) = self.contexts.get(language) else {
            diagnostics.push(ErrorRecord::dispatch(format!(
                "No context found for language {language}"
            )));
            return Ok(None);
        };

        let regime = self.regime(language);
        let options = CallOptions {
            pack: regime.is_packed(),
        };

        let future = if call.name == "run" {
            tracing::debug!("Running cell {} in {}", site.cell, language);
            context.run_code(&site.source_code, options)
        } else {
            let mut named = Vec::with_capacity(call.args.len());
            for (position, arg) in call.args.iter().enumerate() {
                match &arg.name {
                    Some(name) => named.push(Argument::named(name.clone(), arg.value.clone())),
                    None => {
                        tracing::warn!(
                            "Dropping unnamed argument {} to call() in cell {}",
                            position + 1,
                            site.cell
                        );
                        diagnostics.push(ErrorRecord::warning(format!(
                            "unnamed argument {} to call() was ignored",
                            position + 1
                        )));
                    }
                }
            }

            let Some(values) = self.arguments(&named, scope, site, diagnostics).await? else {
                return Ok(None);
            };
            let args: IndexMap<String, _> = values
                .into_iter()
                .filter_map(|(name, value)| name.map(|name| (name.to_string(), regime.encode(value))))
                .collect();
            tracing::debug!("Calling cell {} in {} with {} argument(s)", site.cell, language, args.len());
            context.call_code(&site.source_code, args, options)
        };

        Ok(unwrap_result(future, regime, diagnostics).await)
    }

    /// Named function call resolved by capability.
    async fn function(
        &self,
        call: &Call,
        scope: &Scope,
        site: &CallSite,
        diagnostics: &mut Vec<ErrorRecord>,
    ) -> Result<Option<Value>, DispatchError> {
        let Some((context_name, context)) = self.contexts.resolve_function(&call.name) else {
            return Err(DispatchError::UnresolvedFunction(call.name.clone()));
        };
        let regime = self.regime(context_name);
        let options = CallOptions {
            pack: regime.is_packed(),
        };

        let Some(values) = self.arguments(&call.args, scope, site, diagnostics).await? else {
            return Ok(None);
        };
        let args = values
            .into_iter()
            .map(|(name, value)| {
                let name = name.filter(|name| *name != PIPE_ARGUMENT).map(str::to_string);
                (name, regime.encode(value))
            })
            .collect();

        tracing::debug!("Calling {} in {}", call.name, context_name);
        let future = context.call_function(&call.name, args, options);
        Ok(unwrap_result(future, regime, diagnostics).await)
    }
}

/// Await a context call and turn its result into a value or diagnostics.
async fn unwrap_result(
    future: ContextFuture,
    regime: Regime,
    diagnostics: &mut Vec<ErrorRecord>,
) -> Option<Value> {
    let result = match future.await {
        Ok(result) => result,
        Err(e) => {
            diagnostics.push(context_failure(&e));
            return None;
        }
    };

    let CallResult { output, errors } = result;
    if !errors.is_empty() {
        diagnostics.extend(errors.into_iter().map(|mut record| {
            record.kind = ErrorKind::Runtime;
            record
        }));
        return None;
    }

    match regime.decode(output?) {
        Ok(value) => Some(value),
        Err(e) => {
            diagnostics.push(ErrorRecord::runtime(0, 0, e.to_string()));
            None
        }
    }
}

fn context_failure(error: &ContextError) -> ErrorRecord {
    ErrorRecord::runtime(0, 0, error.to_string())
}
