//! The reactive cell engine.
//!
//! [`CellEngine`] owns the registries, the dependency graph and the
//! subscription table, and drives evaluation:
//!
//! 1. Document events update the registries. Structural changes and source
//!    edits request an update pass, which is debounced by
//!    [`EngineConfig::idle_wait`]; input changes are propagated immediately.
//! 2. A pass admits every expression whose inputs changed. Ready expressions
//!    are evaluated by spawned tasks that talk to the contexts.
//! 3. Each task sends a settlement back over a channel. The owner of the
//!    engine applies it with [`CellEngine::tick`], which stores the result,
//!    binds the cell's output variable and dispatches newly ready dependents.
//!
//! Every dispatch is tagged with a generation. Settlements for cells that
//! were edited or removed in the meantime are discarded.

mod config;

pub use config::{DEFAULT_IDLE_WAIT, DEFAULT_NATIVE_LANGUAGE, EngineConfig};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep_until};

use crate::context::ContextRegistry;
use crate::dispatch::{CallSite, DispatchError, Dispatcher, Evaluation};
use crate::document::{
    DocumentEvent, DocumentNode, InputNode, NodeDescriptor, NodeEvent, NodeId, NodeRole,
};
use crate::error::ErrorRecord;
use crate::graph::{Propagation, ReactiveGraph};
use crate::reconcile::{ChangeReconciler, NodeRegistrar};
use crate::registry::{Cell, CellRegistry, InputRegistry};
use crate::subscription::{Subscriptions, Topic};
use crate::value::Value;

/// Capacity for the event broadcast channel.
/// Slow subscribers lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification broadcast to engine subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A cell was registered or re-parsed without errors.
    Updated { id: NodeId },
    /// A cell finished evaluating; read its state through [`CellEngine::cell`].
    CellSettled { id: NodeId },
    /// A cell's evaluation was rejected (e.g. an unresolvable function).
    CallRejected { id: NodeId, message: String },
    /// A result arrived for a cell that changed or disappeared meanwhile.
    ResultDiscarded { id: NodeId },
}

#[derive(Debug)]
struct Settlement {
    id: NodeId,
    generation: u64,
    outcome: Result<Evaluation, DispatchError>,
}

/// Reactive engine over a document's cells and inputs.
pub struct CellEngine {
    config: EngineConfig,
    dispatcher: Dispatcher,
    graph: ReactiveGraph,
    subscriptions: Subscriptions,
    cells: CellRegistry,
    inputs: InputRegistry,
    events: broadcast::Sender<EngineEvent>,
    settle_tx: mpsc::UnboundedSender<Settlement>,
    settle_rx: mpsc::UnboundedReceiver<Settlement>,
    /// When the pending update pass fires; `None` if none is requested.
    update_deadline: Option<Instant>,
    /// Spawned evaluations whose settlement has not been received.
    in_flight: usize,
    disposed: bool,
}

impl CellEngine {
    /// Create an engine over the document's current nodes.
    ///
    /// Nothing is evaluated until the first update pass, one idle window
    /// from now.
    pub fn new(
        config: EngineConfig,
        contexts: ContextRegistry,
        nodes: impl IntoIterator<Item = DocumentNode>,
    ) -> Self {
        let dispatcher = Dispatcher::new(Arc::new(contexts), config.native_language.as_str());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (settle_tx, settle_rx) = mpsc::unbounded_channel();

        let mut engine = Self {
            config,
            dispatcher,
            graph: ReactiveGraph::new(),
            subscriptions: Subscriptions::new(),
            cells: CellRegistry::new(),
            inputs: InputRegistry::new(),
            events,
            settle_tx,
            settle_rx,
            update_deadline: None,
            in_flight: 0,
            disposed: false,
        };

        for node in nodes {
            engine.register_node(node);
        }
        tracing::info!(
            "Engine started with {} cell(s), {} input(s), {} context(s)",
            engine.cells.len(),
            engine.inputs.len(),
            engine.dispatcher.contexts().len()
        );
        engine.schedule_update();
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Apply a document event.
    ///
    /// Must be called within a tokio runtime: input changes dispatch
    /// evaluations right away.
    pub fn handle(&mut self, event: DocumentEvent) {
        if self.disposed {
            tracing::debug!("Ignoring document event after dispose");
            return;
        }
        match event {
            DocumentEvent::Changed(batch) => {
                ChangeReconciler::apply(batch, self);
            }
            DocumentEvent::Node(event) => self.handle_node_event(event),
        }
    }

    fn handle_node_event(&mut self, event: NodeEvent) {
        if !self.subscriptions.accepts(&event) {
            tracing::warn!(
                "Ignoring {} for unsubscribed node {}",
                Topic::of(&event),
                event.node_id()
            );
            return;
        }

        match event {
            NodeEvent::ExpressionUpdated {
                id,
                language,
                source_code,
                expression,
            } => {
                match self
                    .cells
                    .update_cell(&id, language, source_code, expression, &mut self.graph)
                {
                    Ok(true) => self.emit(EngineEvent::Updated { id }),
                    Ok(false) => tracing::debug!("Cell {} no longer parses", id),
                    Err(e) => tracing::warn!("{}", e),
                }
                self.schedule_update();
            }
            NodeEvent::NameUpdated { id, name } => {
                if self.inputs.on_name_changed(&id, name, &mut self.graph) {
                    self.dispatch_ready();
                }
            }
            NodeEvent::ValueUpdated { id, value } => {
                if self.inputs.on_value_changed(&id, value, &mut self.graph) {
                    self.dispatch_ready();
                }
            }
        }
    }

    /// Request an update pass; it runs once no further request arrives for
    /// the idle window.
    pub fn request_update(&mut self) {
        self.schedule_update();
    }

    fn schedule_update(&mut self) {
        if self.disposed {
            return;
        }
        self.update_deadline = Some(Instant::now() + self.config.idle_wait);
    }

    /// Run the pending update pass now.
    pub fn flush(&mut self) {
        self.update_deadline = None;
        if self.disposed {
            return;
        }
        self.graph.update();
        self.mark_cycles();
        self.dispatch_ready();
    }

    /// Wait for the next settlement or the update deadline and process it.
    ///
    /// Returns `false` without waiting when there is nothing to wait for.
    pub async fn tick(&mut self) -> bool {
        let waiting = self.in_flight > 0;
        let deadline = self.update_deadline;
        if !waiting && deadline.is_none() {
            return false;
        }

        tokio::select! {
            biased;
            Some(settlement) = self.settle_rx.recv(), if waiting => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.apply_settlement(settlement);
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                tracing::debug!("Idle window elapsed, running update pass");
                self.flush();
            }
            else => {}
        }
        true
    }

    /// Process settlements and update passes until none are pending.
    pub async fn run_until_idle(&mut self) {
        while self.tick().await {}
    }

    /// Drive the engine from a stream of document events until the stream
    /// closes and all pending work has settled.
    pub async fn run(&mut self, mut documents: mpsc::Receiver<DocumentEvent>) {
        loop {
            tokio::select! {
                event = documents.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = self.tick(), if !self.is_idle() => {}
            }
        }
        self.run_until_idle().await;
    }

    /// No evaluation is in flight and no update pass is pending.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.update_deadline.is_none()
    }

    pub fn cell(&self, id: &NodeId) -> Option<&Cell> {
        self.cells.get(id)
    }

    /// Registered cells in registration order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }

    pub fn input(&self, id: &NodeId) -> Option<&InputNode> {
        self.inputs.get(id)
    }

    /// Current binding of a graph variable.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.graph.value(name)
    }

    pub fn graph(&self) -> &ReactiveGraph {
        &self.graph
    }

    /// Deregister everything. Later document events are ignored and
    /// outstanding results are discarded as they arrive.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.cells.clear(&mut self.graph, &mut self.subscriptions);
        self.inputs.clear(&mut self.graph, &mut self.subscriptions);
        self.subscriptions.clear();
        self.update_deadline = None;
        self.disposed = true;
        tracing::info!("Engine disposed with {} evaluation(s) in flight", self.in_flight);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Attach a dependency error to every cell on a cycle.
    fn mark_cycles(&mut self) {
        let cycles = self.graph.cycles().to_vec();
        for cycle in cycles {
            let mut names: Vec<String> = cycle
                .iter()
                .map(|id| {
                    self.graph
                        .expression(id)
                        .and_then(|e| e.target())
                        .map_or_else(|| id.to_string(), str::to_string)
                })
                .collect();
            if let Some(first) = names.first().cloned() {
                names.push(first);
            }
            let message = format!("Cyclic dependency detected: {}", names.join(" → "));
            tracing::warn!("{}", message);

            for id in &cycle {
                if let Some(cell) = self.cells.get_mut(id) {
                    cell.fail(ErrorRecord::dependency(message.clone()));
                }
            }
        }
    }

    fn dispatch_ready(&mut self) {
        for id in self.graph.take_ready() {
            self.dispatch(id);
        }
    }

    fn dispatch(&mut self, id: NodeId) {
        let (Some(expression), Some(cell)) = (self.graph.expression(&id), self.cells.get(&id)) else {
            self.graph.settle(&id);
            return;
        };
        let root = expression.root().clone();
        let scope = self.graph.scope_for(expression);
        let site = CallSite {
            cell: id.clone(),
            language: cell.language().map(str::to_string),
            source_code: cell.source_code().to_string(),
        };
        let Some(generation) = self.cells.begin_dispatch(&id) else {
            self.graph.settle(&id);
            return;
        };

        tracing::debug!("Dispatching cell {} (generation {})", id, generation);
        let dispatcher = self.dispatcher.clone();
        let tx = self.settle_tx.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(dispatcher.evaluate(&root, &scope, &site))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Ok(Evaluation {
                        value: None,
                        diagnostics: vec![ErrorRecord::runtime(0, 0, "context panicked")],
                    })
                });
            let _ = tx.send(Settlement {
                id,
                generation,
                outcome,
            });
        });
    }

    fn apply_settlement(&mut self, settlement: Settlement) {
        let Settlement {
            id,
            generation,
            outcome,
        } = settlement;

        if !self.cells.is_current(&id, generation) {
            tracing::debug!("Discarding stale result for cell {} (generation {})", id, generation);
            self.emit(EngineEvent::ResultDiscarded { id });
            return;
        }
        self.graph.settle(&id);

        let value = match outcome {
            Ok(Evaluation { value, diagnostics }) => {
                if let Some(cell) = self.cells.get_mut(&id) {
                    cell.settle(value.clone(), diagnostics);
                }
                self.emit(EngineEvent::CellSettled { id: id.clone() });
                value
            }
            Err(e) => {
                tracing::error!("Evaluation of cell {} rejected: {}", id, e);
                if let Some(cell) = self.cells.get_mut(&id) {
                    cell.settle(None, Vec::new());
                }
                self.emit(EngineEvent::CallRejected {
                    id: id.clone(),
                    message: e.to_string(),
                });
                None
            }
        };

        let target = self
            .graph
            .expression(&id)
            .and_then(|e| e.target())
            .map(str::to_string);
        if let Some(target) = target {
            self.graph.set_value(&target, value, Propagation::Immediate);
        }
        self.dispatch_ready();
    }
}

impl NodeRegistrar for CellEngine {
    fn register_node(&mut self, node: DocumentNode) {
        match node {
            DocumentNode::Cell(cell) => {
                let id = cell.id.clone();
                if self
                    .cells
                    .register_cell(cell, &mut self.graph, &mut self.subscriptions)
                {
                    self.emit(EngineEvent::Updated { id });
                }
            }
            DocumentNode::Input(input) => {
                self.inputs
                    .register_input(input, &mut self.graph, &mut self.subscriptions);
            }
            DocumentNode::Other { .. } => {}
        }
    }

    fn deregister_node(&mut self, descriptor: &NodeDescriptor) {
        match descriptor.kind.role() {
            NodeRole::Cell => {
                self.cells
                    .deregister_cell(&descriptor.id, &mut self.graph, &mut self.subscriptions);
            }
            NodeRole::Input => {
                self.inputs
                    .deregister_input(&descriptor.id, &mut self.graph, &mut self.subscriptions);
            }
            NodeRole::Ignored => {}
        }
    }

    fn request_update(&mut self) {
        self.schedule_update();
    }
}

impl std::fmt::Debug for CellEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellEngine")
            .field("cells", &self.cells.len())
            .field("inputs", &self.inputs.len())
            .field("in_flight", &self.in_flight)
            .field("disposed", &self.disposed)
            .finish()
    }
}
