//! Reactive cell engine for live documents.
//!
//! This crate provides:
//! - Document node model, mutation batches and node notifications
//! - Cell and input registries with explicit subscriptions
//! - An incremental dependency graph with debounced update passes
//! - Call dispatch to pluggable language runtimes ("contexts")
//! - A value codec for runtimes that exchange packed values

pub mod context;
pub mod dispatch;
pub mod document;
pub mod engine;
pub mod error;
pub mod expr;
pub mod graph;
pub mod reconcile;
pub mod registry;
pub mod subscription;
pub mod value;

pub use context::{
    CallOptions, CallResult, Context, ContextError, ContextFuture, ContextRegistry,
    FunctionContext, ProcessContext,
};
pub use dispatch::{CallSite, DispatchError, Dispatcher, Evaluation};
pub use document::{
    CellNode, DocumentEvent, DocumentNode, InputNode, MutationBatch, NodeDescriptor, NodeEvent,
    NodeId, NodeKind,
};
pub use engine::{CellEngine, EngineConfig, EngineEvent};
pub use error::{Error, ErrorKind, ErrorRecord, Result};
pub use expr::{Expr, Expression};
pub use graph::{Propagation, ReactiveGraph};
pub use reconcile::{ChangeReconciler, NodeRegistrar};
pub use registry::{Cell, CellRegistry, InputRegistry};
pub use subscription::{Subscription, Subscriptions, Topic};
pub use value::{Image, Payload, Regime, Table, Value, pack, unpack};
