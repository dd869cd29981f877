//! Incremental dependency graph for cell expressions.
//!
//! This module provides:
//! - Dependency tracking between expressions and named variables
//! - Topological ordering for evaluation
//! - Cycle detection

mod reactive;

pub use reactive::{Propagation, ReactiveGraph};
