//! Cell expressions.
//!
//! An [`Expression`] is the parsed form of a cell's expression text: an
//! optional output name and a call tree over literals and variables.
//! Operators and pipes are desugared into plain calls by the parser, so the
//! dispatcher only ever sees [`Expr::Call`].

mod parser;

pub use parser::{MAX_DEPTH, parse};

use crate::document::NodeId;
use crate::value::Value;

/// Argument name the parser gives to the left-hand side of `a | f()`.
pub const PIPE_ARGUMENT: &str = "_pipe";

/// A node of the call tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Call(Call),
}

/// A function call, `name(args...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    pub args: Vec<Argument>,
}

/// A call argument, optionally named (`name = value`).
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Expr,
}

impl Argument {
    pub fn positional(value: Expr) -> Self {
        Self { name: None, value }
    }

    pub fn named(name: impl Into<String>, value: Expr) -> Self {
        Self {
            name: Some(name.into()),
            value,
        }
    }
}

impl Expr {
    pub fn call(name: impl Into<String>, args: Vec<Argument>) -> Self {
        Expr::Call(Call {
            name: name.into(),
            args,
        })
    }

    /// Append every variable referenced in this subtree, without duplicates.
    fn collect_variables(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Variable(name) => {
                if !out.iter().any(|seen| seen == name) {
                    out.push(name.clone());
                }
            }
            Expr::Call(call) => {
                for arg in &call.args {
                    arg.value.collect_variables(out);
                }
            }
        }
    }
}

/// Parsed expression of one cell. Owned exclusively by that cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    id: NodeId,
    target: Option<String>,
    root: Expr,
    inputs: Vec<String>,
}

impl Expression {
    pub fn new(id: NodeId, target: Option<String>, root: Expr) -> Self {
        let mut inputs = Vec::new();
        root.collect_variables(&mut inputs);
        Self {
            id,
            target,
            root,
            inputs,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Variable the settled value is bound to, if any.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Referenced variables in first-use order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn references(&self, name: &str) -> bool {
        self.inputs.iter().any(|input| input == name)
    }
}
