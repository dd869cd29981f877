//! Language runtimes ("contexts") and the registry that holds them.
//!
//! A context is an opaque runtime that can report whether it offers a
//! function and execute calls asynchronously. The engine never looks inside:
//! it only asks [`Context::has_function`] and awaits the returned futures.

mod native;
mod process;

pub use native::{FunctionContext, NativeFunction};
pub use process::{Operation, ProcessContext, Request, Response, WireArgument};

use std::sync::Arc;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use thiserror::Error;

use crate::error::ErrorRecord;
use crate::value::Payload;

/// Options attached to every context call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Arguments are packed envelopes and the output must be packed too.
    pub pack: bool,
}

/// What a context returns for a call.
///
/// A non-empty `errors` means the call failed inside the runtime; the
/// `output` is ignored in that case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallResult {
    pub output: Option<Payload>,
    pub errors: Vec<ErrorRecord>,
}

impl CallResult {
    pub fn ok(output: Payload) -> Self {
        Self {
            output: Some(output),
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<ErrorRecord>) -> Self {
        Self {
            output: None,
            errors,
        }
    }
}

/// Failures of the runtime itself, as opposed to errors in the user's code.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The runtime process could not be started.
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// The runtime went away or the pipe broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// The runtime answered something that is not a valid response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation is not offered by this runtime.
    #[error("{0} is not supported by this context")]
    Unsupported(&'static str),
}

/// Future returned by every context operation.
pub type ContextFuture = BoxFuture<'static, Result<CallResult, ContextError>>;

/// An argument of a named function call: optional name and value.
pub type CallArgument = (Option<String>, Payload);

/// A language runtime.
pub trait Context: Send + Sync {
    /// Whether a function with this name can be called.
    fn has_function(&self, name: &str) -> bool;

    /// Call a named function with ordered, optionally named arguments.
    fn call_function(
        &self,
        name: &str,
        args: Vec<CallArgument>,
        options: CallOptions,
    ) -> ContextFuture;

    /// Run `source` with variables bound by name.
    fn call_code(
        &self,
        source: &str,
        args: IndexMap<String, Payload>,
        options: CallOptions,
    ) -> ContextFuture;

    /// Run `source` with no bound variables.
    fn run_code(&self, source: &str, options: CallOptions) -> ContextFuture;
}

/// Ordered, immutable mapping from runtime name to context.
#[derive(Clone, Default)]
pub struct ContextRegistry {
    contexts: IndexMap<String, Arc<dyn Context>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context; registration order decides function resolution.
    pub fn with(mut self, name: impl Into<String>, context: impl Context + 'static) -> Self {
        self.insert(name, Arc::new(context));
        self
    }

    /// Add a shared context. A repeated name replaces the context but keeps
    /// its original position.
    pub fn insert(&mut self, name: impl Into<String>, context: Arc<dyn Context>) {
        self.contexts.insert(name.into(), context);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Context>> {
        self.contexts.get(name)
    }

    /// First context, in registration order, that offers `function`.
    pub fn resolve_function(&self, function: &str) -> Option<(&str, &Arc<dyn Context>)> {
        self.contexts
            .iter()
            .find(|(_, context)| context.has_function(function))
            .map(|(name, context)| (name.as_str(), context))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl std::fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("contexts", &self.contexts.keys().collect::<Vec<_>>())
            .finish()
    }
}
