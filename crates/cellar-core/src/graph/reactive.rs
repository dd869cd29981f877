//! The reactive dependency graph.

use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::document::NodeId;
use crate::expr::Expression;
use crate::value::Value;

/// How soon a variable change should reach its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Wait for the next `update()` (after the idle window).
    Debounced,
    /// Admit dependents into the current pass right away.
    Immediate,
}

/// Dependency graph over cell expressions and named variables.
///
/// An expression depends on another when it references the variable the
/// other one binds its value to. Variables bound by inputs have no producer.
///
/// Evaluation state per expression:
/// - *dirty*: an input changed since it last settled;
/// - *admitted*: dirty and part of the current pass;
/// - *running*: handed out by [`take_ready`](Self::take_ready), not settled.
#[derive(Debug, Default)]
pub struct ReactiveGraph {
    /// Expressions in registration order.
    expressions: IndexMap<NodeId, Expression>,
    /// Current variable bindings.
    values: FxHashMap<String, Value>,
    /// Output name to producing expression.
    producers: FxHashMap<String, NodeId>,
    dirty: FxHashSet<NodeId>,
    admitted: FxHashSet<NodeId>,
    running: FxHashSet<NodeId>,
    /// Topological order of acyclic expressions.
    order: Vec<NodeId>,
    /// Strongly connected components larger than one node (or self loops).
    cycles: Vec<Vec<NodeId>>,
    structure_changed: bool,
}

impl ReactiveGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an expression; it is dirty until it first settles.
    ///
    /// An expression already registered under the same id is replaced.
    pub fn add_expression(&mut self, expression: Expression) {
        let id = expression.id().clone();
        if self.expressions.contains_key(&id) {
            self.remove_expression(&id);
        }
        if let Some(target) = expression.target() {
            self.producers.insert(target.to_string(), id.clone());
        }
        self.dirty.insert(id.clone());
        self.expressions.insert(id, expression);
        self.structure_changed = true;
    }

    /// Remove an expression, unbinding its output variable.
    ///
    /// Returns `None` if nothing was registered under `id`.
    pub fn remove_expression(&mut self, id: &NodeId) -> Option<Expression> {
        let expression = self.expressions.shift_remove(id)?;
        self.dirty.remove(id);
        self.admitted.remove(id);
        self.running.remove(id);
        self.structure_changed = true;

        if let Some(target) = expression.target() {
            if self.producers.get(target) == Some(id) {
                self.producers.remove(target);
                self.set_value(target, None, Propagation::Debounced);
            }
        }
        Some(expression)
    }

    /// Bind (or with `None`, unbind) a variable.
    ///
    /// Dependents are marked dirty only if the binding actually changed.
    /// Returns whether it changed.
    pub fn set_value(&mut self, name: &str, value: Option<Value>, mode: Propagation) -> bool {
        let changed = match &value {
            Some(value) => self.values.get(name) != Some(value),
            None => self.values.contains_key(name),
        };
        if !changed {
            return false;
        }

        match value {
            Some(value) => {
                self.values.insert(name.to_string(), value);
            }
            None => {
                self.values.remove(name);
            }
        }

        let cycles = &self.cycles;
        for (id, expression) in &self.expressions {
            if expression.references(name) {
                self.dirty.insert(id.clone());
                let cyclic = cycles.iter().any(|cycle| cycle.contains(id));
                if mode == Propagation::Immediate && !cyclic {
                    self.admitted.insert(id.clone());
                }
            }
        }
        true
    }

    /// Recompute the dependency order if the structure changed and admit
    /// every dirty expression into the current pass.
    ///
    /// Idempotent: calling it again without intervening changes does nothing.
    pub fn update(&mut self) {
        self.ensure_order();
        for id in &self.order {
            if self.dirty.contains(id) {
                self.admitted.insert(id.clone());
            }
        }
    }

    /// Hand out admitted expressions whose upstream is settled.
    ///
    /// An expression is blocked while any transitive producer of its inputs
    /// is dirty (outside a cycle), admitted or running. Returned ids move to
    /// the running state.
    pub fn take_ready(&mut self) -> Vec<NodeId> {
        self.ensure_order();

        let mut blocked: FxHashSet<&NodeId> = FxHashSet::default();
        let mut ready = Vec::new();
        for id in &self.order {
            let Some(expression) = self.expressions.get(id) else {
                continue;
            };
            let waiting = expression.inputs().iter().any(|input| {
                self.producers.get(input).is_some_and(|producer| {
                    producer != id
                        && (self.admitted.contains(producer)
                            || self.running.contains(producer)
                            || (self.dirty.contains(producer) && !self.is_cyclic(producer))
                            || blocked.contains(producer))
                })
            });
            if waiting {
                blocked.insert(id);
            } else if self.admitted.contains(id) {
                ready.push(id.clone());
            }
        }

        for id in &ready {
            self.admitted.remove(id);
            self.dirty.remove(id);
            self.running.insert(id.clone());
        }
        ready
    }

    /// Mark a running expression as settled.
    pub fn settle(&mut self, id: &NodeId) -> bool {
        self.running.remove(id)
    }

    /// No expression is admitted or running.
    pub fn is_settled(&self) -> bool {
        self.admitted.is_empty() && self.running.is_empty()
    }

    /// Admitted work is waiting to be handed out.
    pub fn has_admitted(&self) -> bool {
        !self.admitted.is_empty()
    }

    /// Expressions that changed but are not yet part of a pass.
    pub fn has_pending(&self) -> bool {
        self.dirty.iter().any(|id| !self.admitted.contains(id) && !self.is_cyclic(id))
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Snapshot the bindings an expression reads; unbound inputs are absent.
    pub fn scope_for(&self, expression: &Expression) -> FxHashMap<String, Value> {
        expression
            .inputs()
            .iter()
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.expressions.contains_key(id)
    }

    pub fn expression(&self, id: &NodeId) -> Option<&Expression> {
        self.expressions.get(id)
    }

    pub fn len(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    /// Dependency cycles found by the last order computation.
    pub fn cycles(&mut self) -> &[Vec<NodeId>] {
        self.ensure_order();
        &self.cycles
    }

    fn is_cyclic(&self, id: &NodeId) -> bool {
        self.cycles.iter().any(|cycle| cycle.contains(id))
    }

    /// Direct dependents of an expression.
    pub fn dependents(&self, id: &NodeId) -> Vec<NodeId> {
        let Some(target) = self.expressions.get(id).and_then(Expression::target) else {
            return Vec::new();
        };
        self.expressions
            .iter()
            .filter(|(other, expression)| *other != id && expression.references(target))
            .map(|(other, _)| other.clone())
            .collect()
    }

    /// Rebuild the topological order and cycle list after structural edits.
    fn ensure_order(&mut self) {
        use petgraph::algo::kosaraju_scc;

        if !self.structure_changed {
            return;
        }
        self.structure_changed = false;

        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut indices: FxHashMap<&NodeId, NodeIndex> = FxHashMap::default();
        for id in self.expressions.keys() {
            indices.insert(id, graph.add_node(id.clone()));
        }

        let mut self_loops = FxHashSet::default();
        for (consumer, expression) in &self.expressions {
            for input in expression.inputs() {
                let Some(producer) = self.producers.get(input) else {
                    continue;
                };
                if producer == consumer {
                    self_loops.insert(consumer.clone());
                }
                if let (Some(&from), Some(&to)) = (indices.get(producer), indices.get(consumer)) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        // SCCs come out in reverse topological order.
        let mut sccs = kosaraju_scc(&graph);
        sccs.reverse();

        self.order.clear();
        self.cycles.clear();
        for scc in sccs {
            let ids: Vec<NodeId> = scc.iter().map(|&idx| graph[idx].clone()).collect();
            if ids.len() > 1 || self_loops.contains(&ids[0]) {
                for id in &ids {
                    self.admitted.remove(id);
                }
                self.cycles.push(ids);
            } else {
                self.order.extend(ids);
            }
        }

        if !self.cycles.is_empty() {
            tracing::debug!("Dependency graph has {} cycle(s)", self.cycles.len());
        }
    }
}
