//! Explicit subscription tokens for node notifications.
//!
//! Registries subscribe to the notifications of the nodes they track and
//! keep the returned [`Subscription`] handles. A notification is delivered
//! only while a live subscription exists for its `(node, topic)` pair, so
//! releasing the handles on deregistration guarantees that nothing fires for
//! a removed node.

use rustc_hash::FxHashMap;

use crate::document::{NodeEvent, NodeId};

/// Notification channel of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ExpressionUpdated,
    NameUpdated,
    ValueUpdated,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ExpressionUpdated => "expression:updated",
            Topic::NameUpdated => "name:updated",
            Topic::ValueUpdated => "value:updated",
        }
    }

    pub fn of(event: &NodeEvent) -> Self {
        match event {
            NodeEvent::ExpressionUpdated { .. } => Topic::ExpressionUpdated,
            NodeEvent::NameUpdated { .. } => Topic::NameUpdated,
            NodeEvent::ValueUpdated { .. } => Topic::ValueUpdated,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned by [`Subscriptions::subscribe`].
///
/// Not `Clone`; exactly one owner releases it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a subscription without releasing it leaves it live"]
pub struct Subscription {
    token: u64,
    node: NodeId,
    topic: Topic,
}

impl Subscription {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Table of live subscriptions.
#[derive(Debug, Default)]
pub struct Subscriptions {
    next_token: u64,
    live: FxHashMap<(NodeId, Topic), u64>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic` on `node`, superseding any previous subscription
    /// for the same pair.
    pub fn subscribe(&mut self, node: &NodeId, topic: Topic) -> Subscription {
        self.next_token += 1;
        let token = self.next_token;
        self.live.insert((node.clone(), topic), token);
        Subscription {
            token,
            node: node.clone(),
            topic,
        }
    }

    /// Release a subscription.
    ///
    /// Returns `false` if it had already been superseded, in which case the
    /// newer subscription stays live.
    pub fn release(&mut self, subscription: Subscription) -> bool {
        let key = (subscription.node, subscription.topic);
        match self.live.get(&key) {
            Some(&token) if token == subscription.token => {
                self.live.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Release every handle in `subscriptions`.
    pub fn release_all(&mut self, subscriptions: impl IntoIterator<Item = Subscription>) {
        for subscription in subscriptions {
            self.release(subscription);
        }
    }

    /// Whether `event` should be delivered.
    pub fn accepts(&self, event: &NodeEvent) -> bool {
        self.is_live(event.node_id(), Topic::of(event))
    }

    pub fn is_live(&self, node: &NodeId, topic: Topic) -> bool {
        self.live.contains_key(&(node.clone(), topic))
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn clear(&mut self) {
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_subscribe_and_release() {
        let mut subs = Subscriptions::new();
        let node = NodeId::from("i1");
        let sub = subs.subscribe(&node, Topic::ValueUpdated);

        assert!(subs.is_live(&node, Topic::ValueUpdated));
        assert!(!subs.is_live(&node, Topic::NameUpdated));
        assert!(subs.release(sub));
        assert!(subs.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_release_newer_subscription() {
        let mut subs = Subscriptions::new();
        let node = NodeId::from("c1");
        let old = subs.subscribe(&node, Topic::ExpressionUpdated);
        let _new = subs.subscribe(&node, Topic::ExpressionUpdated);

        assert!(!subs.release(old));
        assert!(subs.is_live(&node, Topic::ExpressionUpdated));
    }

    #[test]
    fn test_accepts_routes_by_topic() {
        let mut subs = Subscriptions::new();
        let node = NodeId::from("i1");
        let _sub = subs.subscribe(&node, Topic::NameUpdated);

        let rename = NodeEvent::NameUpdated {
            id: node.clone(),
            name: Some("x".to_string()),
        };
        let change = NodeEvent::ValueUpdated {
            id: node,
            value: Value::Integer(1),
        };
        assert!(subs.accepts(&rename));
        assert!(!subs.accepts(&change));
    }
}
