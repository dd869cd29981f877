//! Applying document mutation batches to the registries.

use crate::document::{DocumentNode, MutationBatch, NodeDescriptor, NodeRole};

/// Receiver of the register/deregister calls a batch turns into.
pub trait NodeRegistrar {
    fn register_node(&mut self, node: DocumentNode);
    fn deregister_node(&mut self, descriptor: &NodeDescriptor);
    fn request_update(&mut self);
}

/// Turns mutation batches into registry operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeReconciler;

impl ChangeReconciler {
    /// Apply `batch`: every deletion first, then every creation, then at most
    /// one update request. Returns whether a tracked kind was touched.
    pub fn apply(batch: MutationBatch, registrar: &mut impl NodeRegistrar) -> bool {
        let mut touched = false;

        for descriptor in &batch.deleted {
            if descriptor.kind.role() == NodeRole::Ignored {
                continue;
            }
            registrar.deregister_node(descriptor);
            touched = true;
        }

        for node in batch.created {
            if node.kind().role() == NodeRole::Ignored {
                continue;
            }
            registrar.register_node(node);
            touched = true;
        }

        if touched {
            registrar.request_update();
        }
        touched
    }
}
