//! Cell registry.

use indexmap::IndexMap;

use crate::document::{CellNode, NodeId, NodeKind};
use crate::error::{Error, ErrorKind, ErrorRecord, Result};
use crate::expr::{self, Expression};
use crate::graph::ReactiveGraph;
use crate::subscription::{Subscription, Subscriptions, Topic};
use crate::value::Value;

/// A computational cell and its last evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    node: CellNode,
    expression: Option<Expression>,
    errors: Vec<ErrorRecord>,
    output: Option<Value>,
}

impl Cell {
    fn new(node: CellNode) -> Self {
        let mut cell = Self {
            node,
            expression: None,
            errors: Vec::new(),
            output: None,
        };
        cell.reparse();
        cell
    }

    pub fn id(&self) -> &NodeId {
        &self.node.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.node.kind
    }

    /// Runtime the source targets; `None` for formula cells.
    pub fn language(&self) -> Option<&str> {
        self.node.language()
    }

    pub fn source_code(&self) -> &str {
        &self.node.source_code
    }

    /// Parsed expression; absent for blank or unparseable source.
    pub fn expression(&self) -> Option<&Expression> {
        self.expression.as_ref()
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn has_parse_error(&self) -> bool {
        self.errors.iter().any(|e| e.kind == ErrorKind::Parse)
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Replace diagnostics and output with the outcome of an evaluation.
    pub(crate) fn settle(&mut self, output: Option<Value>, errors: Vec<ErrorRecord>) {
        self.output = output;
        self.errors = errors;
    }

    pub(crate) fn fail(&mut self, error: ErrorRecord) {
        self.output = None;
        self.errors = vec![error];
    }

    /// Re-derive the expression from the current source.
    ///
    /// Runtime diagnostics of the previous source are dropped; a parse
    /// failure also drops the output.
    fn reparse(&mut self) {
        self.errors.clear();
        match expr::parse(&self.node.id, self.node.expression_text()) {
            Ok(expression) => self.expression = expression,
            Err(e) => {
                let record = match e {
                    Error::Parse {
                        line,
                        column,
                        message,
                    } => ErrorRecord::parse(line, column, message),
                    other => ErrorRecord::parse(0, 0, other.to_string()),
                };
                self.expression = None;
                self.output = None;
                self.errors.push(record);
            }
        }
    }
}

#[derive(Debug)]
struct CellEntry {
    cell: Cell,
    subscription: Subscription,
    /// Bumped on every dispatch and source change; settlements carrying an
    /// older generation are stale.
    generation: u64,
}

/// Registered cells keyed by node id, in registration order.
#[derive(Debug, Default)]
pub struct CellRegistry {
    cells: IndexMap<NodeId, CellEntry>,
    next_generation: u64,
}

impl CellRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a cell node: parse it, add its expression to the graph and
    /// subscribe to its source edits.
    ///
    /// A live registration under the same id is replaced. Returns whether the
    /// source parsed.
    pub fn register_cell(
        &mut self,
        node: CellNode,
        graph: &mut ReactiveGraph,
        subscriptions: &mut Subscriptions,
    ) -> bool {
        let id = node.id.clone();
        self.deregister_cell(&id, graph, subscriptions);

        let cell = Cell::new(node);
        let parsed = !cell.has_parse_error();
        if let Some(expression) = cell.expression() {
            graph.add_expression(expression.clone());
        }
        if !parsed {
            tracing::debug!("Cell {} registered with a parse error", id);
        }

        // Subscribed even on parse failure so that corrected source re-parses.
        let subscription = subscriptions.subscribe(&id, Topic::ExpressionUpdated);
        let generation = self.bump();
        self.cells.insert(
            id,
            CellEntry {
                cell,
                subscription,
                generation,
            },
        );
        parsed
    }

    /// Stop tracking a cell. Returns `false` if it was not registered.
    pub fn deregister_cell(
        &mut self,
        id: &NodeId,
        graph: &mut ReactiveGraph,
        subscriptions: &mut Subscriptions,
    ) -> bool {
        let Some(entry) = self.cells.shift_remove(id) else {
            return false;
        };
        subscriptions.release(entry.subscription);
        graph.remove_expression(id);
        tracing::debug!("Cell {} deregistered", id);
        true
    }

    /// Apply edited source: the old expression is removed from the graph and
    /// the new one (if it parses) added under the same id.
    ///
    /// Returns whether the new source parsed.
    pub fn update_cell(
        &mut self,
        id: &NodeId,
        language: Option<String>,
        source_code: String,
        expression: Option<String>,
        graph: &mut ReactiveGraph,
    ) -> Result<bool> {
        let generation = self.bump();
        let entry = self
            .cells
            .get_mut(id)
            .ok_or_else(|| Error::CellNotFound(id.clone()))?;

        graph.remove_expression(id);
        entry.generation = generation;
        entry.cell.node.language = language;
        entry.cell.node.source_code = source_code;
        entry.cell.node.expression = expression;
        entry.cell.reparse();

        if let Some(expression) = entry.cell.expression() {
            graph.add_expression(expression.clone());
        }
        Ok(!entry.cell.has_parse_error())
    }

    pub fn get(&self, id: &NodeId) -> Option<&Cell> {
        self.cells.get(id).map(|entry| &entry.cell)
    }

    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Option<&mut Cell> {
        self.cells.get_mut(id).map(|entry| &mut entry.cell)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.cells.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values().map(|entry| &entry.cell)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Start a new evaluation of a cell; returns its generation tag.
    pub(crate) fn begin_dispatch(&mut self, id: &NodeId) -> Option<u64> {
        let generation = self.bump();
        let entry = self.cells.get_mut(id)?;
        entry.generation = generation;
        Some(generation)
    }

    /// Whether a settlement tagged `generation` is still wanted.
    pub(crate) fn is_current(&self, id: &NodeId, generation: u64) -> bool {
        self.cells
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Drop every cell, releasing its subscription.
    pub(crate) fn clear(&mut self, graph: &mut ReactiveGraph, subscriptions: &mut Subscriptions) {
        for (id, entry) in self.cells.drain(..) {
            subscriptions.release(entry.subscription);
            graph.remove_expression(&id);
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}
