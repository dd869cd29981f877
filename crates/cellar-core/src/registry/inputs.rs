//! Input registry.

use indexmap::IndexMap;

use crate::document::{InputNode, NodeId};
use crate::graph::{Propagation, ReactiveGraph};
use crate::subscription::{Subscription, Subscriptions, Topic};
use crate::value::Value;

#[derive(Debug)]
struct InputEntry {
    input: InputNode,
    subscriptions: Vec<Subscription>,
}

/// Registered input widgets keyed by node id.
#[derive(Debug, Default)]
pub struct InputRegistry {
    inputs: IndexMap<NodeId, InputEntry>,
}

impl InputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an input; a named input binds its variable (debounced).
    pub fn register_input(
        &mut self,
        input: InputNode,
        graph: &mut ReactiveGraph,
        subscriptions: &mut Subscriptions,
    ) {
        let id = input.id.clone();
        self.deregister_input(&id, graph, subscriptions);

        if let Some(name) = input.name() {
            graph.set_value(name, Some(input.value.clone()), Propagation::Debounced);
        }
        let handles = vec![
            subscriptions.subscribe(&id, Topic::NameUpdated),
            subscriptions.subscribe(&id, Topic::ValueUpdated),
        ];
        tracing::debug!("Input {} registered as {:?}", id, input.name());
        self.inputs.insert(
            id,
            InputEntry {
                input,
                subscriptions: handles,
            },
        );
    }

    /// Stop tracking an input, clearing its binding. Returns `false` if it
    /// was not registered.
    pub fn deregister_input(
        &mut self,
        id: &NodeId,
        graph: &mut ReactiveGraph,
        subscriptions: &mut Subscriptions,
    ) -> bool {
        let Some(entry) = self.inputs.shift_remove(id) else {
            return false;
        };
        subscriptions.release_all(entry.subscriptions);
        if let Some(name) = entry.input.name() {
            graph.set_value(name, None, Propagation::Debounced);
        }
        true
    }

    /// Rebind an input under a new name.
    ///
    /// The old binding is cleared and the new one set before control returns,
    /// so dependents never observe both or neither. Returns whether anything
    /// changed.
    pub fn on_name_changed(
        &mut self,
        id: &NodeId,
        name: Option<String>,
        graph: &mut ReactiveGraph,
    ) -> bool {
        let Some(entry) = self.inputs.get_mut(id) else {
            return false;
        };
        let name = name.filter(|name| !name.is_empty());
        if entry.input.name() == name.as_deref() {
            return false;
        }

        if let Some(old) = entry.input.name() {
            graph.set_value(old, None, Propagation::Immediate);
        }
        entry.input.name = name;
        if let Some(new) = entry.input.name() {
            graph.set_value(new, Some(entry.input.value.clone()), Propagation::Immediate);
        }
        true
    }

    /// Store a new value and propagate it immediately if the input is named.
    pub fn on_value_changed(&mut self, id: &NodeId, value: Value, graph: &mut ReactiveGraph) -> bool {
        let Some(entry) = self.inputs.get_mut(id) else {
            return false;
        };
        entry.input.value = value;
        match entry.input.name() {
            Some(name) => graph.set_value(name, Some(entry.input.value.clone()), Propagation::Immediate),
            None => false,
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&InputNode> {
        self.inputs.get(id).map(|entry| &entry.input)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputNode> {
        self.inputs.values().map(|entry| &entry.input)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub(crate) fn clear(&mut self, graph: &mut ReactiveGraph, subscriptions: &mut Subscriptions) {
        let ids: Vec<NodeId> = self.inputs.keys().cloned().collect();
        for id in ids {
            self.deregister_input(&id, graph, subscriptions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr;

    fn setup() -> (InputRegistry, ReactiveGraph, Subscriptions) {
        (InputRegistry::new(), ReactiveGraph::new(), Subscriptions::new())
    }

    #[test]
    fn test_named_input_binds_variable() {
        let (mut inputs, mut graph, mut subs) = setup();
        inputs.register_input(InputNode::range("i1", "x", 5i64), &mut graph, &mut subs);

        assert_eq!(graph.value("x"), Some(&Value::Integer(5)));
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn test_unnamed_input_stays_out_of_graph() {
        let (mut inputs, mut graph, mut subs) = setup();
        let node = InputNode::new("i1", "select".into(), None, "a");
        inputs.register_input(node, &mut graph, &mut subs);

        assert_eq!(inputs.len(), 1);
        assert!(!inputs.on_value_changed(&NodeId::from("i1"), Value::from("b"), &mut graph));
    }

    #[test]
    fn test_rename_rebinds_atomically() {
        let (mut inputs, mut graph, mut subs) = setup();
        let id = NodeId::from("i1");
        graph.add_expression(expr::parse(&NodeId::from("c1"), "add(y, 1)").unwrap().unwrap());
        inputs.register_input(
            InputNode::new("i1", "range-input".into(), None, 3i64),
            &mut graph,
            &mut subs,
        );

        assert!(inputs.on_name_changed(&id, Some("x".to_string()), &mut graph));
        assert!(inputs.on_name_changed(&id, Some("y".to_string()), &mut graph));

        assert_eq!(graph.value("x"), None);
        assert_eq!(graph.value("y"), Some(&Value::Integer(3)));
        assert!(!inputs.on_name_changed(&id, Some("y".to_string()), &mut graph));
    }

    #[test]
    fn test_deregister_clears_binding_and_subscriptions() {
        let (mut inputs, mut graph, mut subs) = setup();
        let id = NodeId::from("i1");
        inputs.register_input(InputNode::range("i1", "x", 1i64), &mut graph, &mut subs);

        assert!(inputs.deregister_input(&id, &mut graph, &mut subs));
        assert!(!inputs.deregister_input(&id, &mut graph, &mut subs));
        assert_eq!(graph.value("x"), None);
        assert!(subs.is_empty());
    }

    #[test]
    fn test_value_change_propagates() {
        let (mut inputs, mut graph, mut subs) = setup();
        let id = NodeId::from("i1");
        inputs.register_input(InputNode::range("i1", "x", 1i64), &mut graph, &mut subs);

        assert!(inputs.on_value_changed(&id, Value::Integer(2), &mut graph));
        assert!(!inputs.on_value_changed(&id, Value::Integer(2), &mut graph));
        assert_eq!(graph.value("x"), Some(&Value::Integer(2)));
        assert_eq!(inputs.get(&id).unwrap().value, Value::Integer(2));
    }
}
