//! End-to-end engine behavior against scripted contexts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellar_core::{
    CallOptions, CallResult, CellEngine, CellNode, Context, ContextFuture, ContextRegistry,
    DocumentEvent, DocumentNode, EngineConfig, EngineEvent, ErrorKind, FunctionContext, InputNode,
    MutationBatch, NodeDescriptor, NodeEvent, NodeId, NodeKind, Payload, Value,
};
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Context that logs every call and answers with a fixed output.
#[derive(Clone, Default)]
struct Scripted {
    functions: Vec<&'static str>,
    log: Arc<Mutex<Vec<String>>>,
    output: Option<Value>,
    delay: Option<Duration>,
}

impl Scripted {
    fn answering(output: impl Into<Value>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    fn offering(mut self, functions: &[&'static str]) -> Self {
        self.functions = functions.to_vec();
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn reply(&self, entry: String, options: CallOptions) -> ContextFuture {
        self.log.lock().unwrap().push(entry);
        let output = self
            .output
            .clone()
            .map(|value| Payload::for_options(value, options.pack));
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(CallResult {
                output,
                errors: Vec::new(),
            })
        })
    }
}

impl Context for Scripted {
    fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|function| *function == name)
    }

    fn call_function(
        &self,
        name: &str,
        args: Vec<(Option<String>, Payload)>,
        options: CallOptions,
    ) -> ContextFuture {
        self.reply(format!("{name}/{}", args.len()), options)
    }

    fn call_code(
        &self,
        source: &str,
        args: IndexMap<String, Payload>,
        options: CallOptions,
    ) -> ContextFuture {
        let names: Vec<&str> = args.keys().map(String::as_str).collect();
        self.reply(
            format!("call_code({source}; {}; pack={})", names.join(","), options.pack),
            options,
        )
    }

    fn run_code(&self, source: &str, options: CallOptions) -> ContextFuture {
        self.reply(format!("run_code({source}; pack={})", options.pack), options)
    }
}

fn native() -> ContextRegistry {
    ContextRegistry::new().with("rust", FunctionContext::with_builtins())
}

fn id(id: &str) -> NodeId {
    NodeId::from(id)
}

fn output(engine: &CellEngine, cell: &str) -> Option<Value> {
    engine.cell(&id(cell)).and_then(|cell| cell.output().cloned())
}

fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

async fn settled(nodes: Vec<DocumentNode>, contexts: ContextRegistry) -> CellEngine {
    let mut engine = CellEngine::new(EngineConfig::default(), contexts, nodes);
    engine.run_until_idle().await;
    engine
}

#[tokio::test(start_paused = true)]
async fn test_run_in_foreign_context_packs_and_unpacks() {
    let r = Scripted::answering(6i64);
    let contexts = ContextRegistry::new().with("r", r.clone());
    let nodes = vec![
        CellNode::external("c1", "r", "x + 1", "run(x)").into(),
        InputNode::range("i1", "x", 5i64).into(),
    ];
    let mut engine = settled(nodes, contexts).await;

    assert_eq!(r.calls(), vec!["run_code(x + 1; pack=true)".to_string()]);
    assert_eq!(output(&engine, "c1"), Some(Value::Integer(6)));
    assert!(engine.cell(&id("c1")).unwrap().errors().is_empty());

    engine.handle(DocumentEvent::Node(NodeEvent::ValueUpdated {
        id: id("i1"),
        value: Value::Integer(7),
    }));
    engine.run_until_idle().await;

    assert_eq!(r.calls().len(), 2);
    assert_eq!(r.calls()[1], "run_code(x + 1; pack=true)");
}

#[tokio::test(start_paused = true)]
async fn test_blank_foreign_expression_has_no_inputs() {
    let r = Scripted::answering(6i64);
    let contexts = ContextRegistry::new().with("r", r.clone());
    let nodes = vec![
        CellNode::external("c1", "r", "x + 1", "").into(),
        InputNode::range("i1", "x", 5i64).into(),
    ];
    let mut engine = settled(nodes, contexts).await;

    engine.handle(DocumentEvent::Node(NodeEvent::ValueUpdated {
        id: id("i1"),
        value: Value::Integer(7),
    }));
    engine.run_until_idle().await;

    assert_eq!(r.calls(), vec!["run_code(x + 1; pack=true)".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_context_only_affects_its_cell() {
    let nodes = vec![
        CellNode::external("c1", "julia", "a + 1", "call(a = 1)").into(),
        CellNode::formula("c2", "add(2, 3)").into(),
    ];
    let engine = settled(nodes, native()).await;

    let c1 = engine.cell(&id("c1")).unwrap();
    assert_eq!(c1.output(), None);
    assert_eq!(c1.errors().len(), 1);
    assert_eq!(c1.errors()[0].kind, ErrorKind::Dispatch);
    assert_eq!(c1.errors()[0].message, "No context found for language julia");
    assert_eq!(output(&engine, "c2"), Some(Value::Integer(5)));
}

#[tokio::test(start_paused = true)]
async fn test_parse_error_is_never_dispatched() {
    let scripted = Scripted::answering(1i64).offering(&["add"]);
    let contexts = ContextRegistry::new().with("py", scripted.clone());
    let engine = settled(vec![CellNode::formula("c1", "add(1,").into()], contexts).await;

    let cell = engine.cell(&id("c1")).unwrap();
    assert!(cell.expression().is_none());
    assert_eq!(cell.errors()[0].kind, ErrorKind::Parse);
    assert!(scripted.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_corrected_source_is_reparsed_and_evaluated() {
    let mut engine = settled(vec![CellNode::formula("c1", "add(1,").into()], native()).await;
    let mut events = engine.subscribe();

    engine.handle(DocumentEvent::Node(NodeEvent::ExpressionUpdated {
        id: id("c1"),
        language: None,
        source_code: "add(1, 2)".to_string(),
        expression: None,
    }));
    engine.run_until_idle().await;

    assert_eq!(output(&engine, "c1"), Some(Value::Integer(3)));
    assert!(engine.cell(&id("c1")).unwrap().errors().is_empty());
    let events = drain(&mut events);
    assert_eq!(events[0], EngineEvent::Updated { id: id("c1") });
    assert!(events.contains(&EngineEvent::CellSettled { id: id("c1") }));
}

#[tokio::test(start_paused = true)]
async fn test_rename_leaves_only_new_binding() {
    let nodes = vec![
        InputNode::new("i1", NodeKind::RangeInput, None, 5i64).into(),
        CellNode::formula("cx", "x").into(),
        CellNode::formula("cy", "y").into(),
    ];
    let mut engine = settled(nodes, native()).await;

    for name in ["x", "y"] {
        engine.handle(DocumentEvent::Node(NodeEvent::NameUpdated {
            id: id("i1"),
            name: Some(name.to_string()),
        }));
    }
    engine.run_until_idle().await;

    assert_eq!(engine.value("x"), None);
    assert_eq!(engine.value("y"), Some(&Value::Integer(5)));
    assert_eq!(output(&engine, "cx"), Some(Value::Null));
    assert_eq!(output(&engine, "cy"), Some(Value::Integer(5)));
}

#[tokio::test(start_paused = true)]
async fn test_input_changes_bypass_debounce() {
    let nodes = vec![
        InputNode::range("i1", "x", 1i64).into(),
        CellNode::formula("c1", "x * 10").into(),
    ];
    let mut engine = settled(nodes, native()).await;
    assert_eq!(output(&engine, "c1"), Some(Value::Integer(10)));

    let before = Instant::now();
    engine.handle(DocumentEvent::Node(NodeEvent::ValueUpdated {
        id: id("i1"),
        value: Value::Integer(4),
    }));
    engine.run_until_idle().await;

    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(output(&engine, "c1"), Some(Value::Integer(40)));
}

#[tokio::test(start_paused = true)]
async fn test_results_flow_downstream() {
    let nodes = vec![
        InputNode::range("i1", "x", 2i64).into(),
        CellNode::formula("c1", "y = x + 1").into(),
        CellNode::formula("c2", "z = y * y").into(),
        CellNode::formula("c3", "z - x").into(),
    ];
    let engine = settled(nodes, native()).await;

    assert_eq!(engine.value("y"), Some(&Value::Integer(3)));
    assert_eq!(engine.value("z"), Some(&Value::Integer(9)));
    assert_eq!(output(&engine, "c3"), Some(Value::Integer(7)));
}

#[tokio::test(start_paused = true)]
async fn test_replace_cell_in_one_batch() {
    let nodes = vec![
        CellNode::formula("c1", "y = 1").into(),
        CellNode::formula("c2", "y + 0").into(),
    ];
    let mut engine = settled(nodes, native()).await;
    assert_eq!(output(&engine, "c2"), Some(Value::Integer(1)));
    let mut events = engine.subscribe();

    engine.handle(DocumentEvent::Changed(MutationBatch {
        deleted: vec![NodeDescriptor::new("c1", NodeKind::Cell)],
        created: vec![CellNode::formula("c1b", "y = 2").into()],
    }));
    assert!(engine.cell(&id("c1")).is_none());
    assert!(!engine.graph().contains(&id("c1")));
    engine.run_until_idle().await;

    assert_eq!(output(&engine, "c1b"), Some(Value::Integer(2)));
    assert_eq!(output(&engine, "c2"), Some(Value::Integer(2)));

    let settled: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, EngineEvent::CellSettled { .. }))
        .collect();
    assert_eq!(
        settled,
        vec![
            EngineEvent::CellSettled { id: id("c1b") },
            EngineEvent::CellSettled { id: id("c2") },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_deletion_is_harmless() {
    let mut engine = settled(vec![CellNode::formula("c1", "1").into()], native()).await;
    let deleted = NodeDescriptor::new("c1", NodeKind::Cell);

    engine.handle(DocumentEvent::Changed(MutationBatch {
        deleted: vec![deleted.clone(), deleted],
        created: Vec::new(),
    }));
    engine.run_until_idle().await;

    assert!(engine.cell(&id("c1")).is_none());
    assert!(engine.graph().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_first_matching_context_wins() {
    let a = Scripted::answering("a").offering(&["foo"]);
    let b = Scripted::answering("b").offering(&["foo"]);
    let contexts = ContextRegistry::new().with("a", a.clone()).with("b", b.clone());
    let engine = settled(vec![CellNode::formula("c1", "foo(1)").into()], contexts).await;

    assert_eq!(output(&engine, "c1"), Some(Value::from("a")));
    assert_eq!(a.calls().len(), 1);
    assert!(b.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_call_keeps_named_arguments_only() {
    let py = Scripted::answering(1i64);
    let contexts = ContextRegistry::new().with("py", py.clone());
    let nodes = vec![
        InputNode::range("i1", "x", 1i64).into(),
        CellNode::external("c1", "py", "df.fit()", "call(x, df = x)").into(),
    ];
    let engine = settled(nodes, contexts).await;

    assert_eq!(py.calls(), vec!["call_code(df.fit(); df; pack=true)".to_string()]);
    let errors = engine.cell(&id("c1")).unwrap().errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::Warning);
    assert_eq!(output(&engine, "c1"), Some(Value::Integer(1)));
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_function_rejects_call() {
    let mut engine = CellEngine::new(
        EngineConfig::default(),
        native(),
        vec![CellNode::formula("c1", "frobnicate(1)").into()],
    );
    let mut events = engine.subscribe();
    engine.run_until_idle().await;

    let cell = engine.cell(&id("c1")).unwrap();
    assert!(cell.output().is_none());
    assert!(cell.errors().is_empty());
    assert!(drain(&mut events).contains(&EngineEvent::CallRejected {
        id: id("c1"),
        message: "Could not resolve function \"frobnicate\"".to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_edit_during_evaluation_discards_stale_result() {
    let slow = Scripted::answering(1i64)
        .offering(&["slow"])
        .delayed(Duration::from_secs(5));
    let contexts = ContextRegistry::new().with("py", slow).with("rust", FunctionContext::with_builtins());
    let mut engine = CellEngine::new(
        EngineConfig::default(),
        contexts,
        vec![CellNode::formula("c1", "slow()").into()],
    );
    let mut events = engine.subscribe();
    engine.flush();

    engine.handle(DocumentEvent::Node(NodeEvent::ExpressionUpdated {
        id: id("c1"),
        language: None,
        source_code: "add(40, 2)".to_string(),
        expression: None,
    }));
    engine.run_until_idle().await;

    assert_eq!(output(&engine, "c1"), Some(Value::Integer(42)));
    assert!(drain(&mut events).contains(&EngineEvent::ResultDiscarded { id: id("c1") }));
}

#[tokio::test(start_paused = true)]
async fn test_dependents_wait_for_edited_upstream() {
    let slow = Scripted::answering(1i64)
        .offering(&["slow"])
        .delayed(Duration::from_secs(1));
    let contexts = ContextRegistry::new().with("py", slow).with("rust", FunctionContext::with_builtins());
    let nodes = vec![
        InputNode::range("i1", "x", 1i64).into(),
        InputNode::range("i2", "z", 100i64).into(),
        CellNode::formula("c1", "y = slow(x)").into(),
        CellNode::formula("c2", "add(y, z)").into(),
    ];
    let mut engine = settled(nodes, contexts).await;
    assert_eq!(output(&engine, "c2"), Some(Value::Integer(101)));
    let mut events = engine.subscribe();

    engine.handle(DocumentEvent::Node(NodeEvent::ValueUpdated {
        id: id("i1"),
        value: Value::Integer(2),
    }));
    engine.handle(DocumentEvent::Node(NodeEvent::ExpressionUpdated {
        id: id("c1"),
        language: None,
        source_code: "y = slow(x)".to_string(),
        expression: None,
    }));
    engine.handle(DocumentEvent::Node(NodeEvent::ValueUpdated {
        id: id("i2"),
        value: Value::Integer(200),
    }));
    engine.run_until_idle().await;

    let settled_ids: Vec<NodeId> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            EngineEvent::CellSettled { id } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(settled_ids, vec![id("c1"), id("c2")]);
    assert_eq!(output(&engine, "c2"), Some(Value::Integer(201)));
    assert!(engine.cell(&id("c2")).unwrap().errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overly_nested_formula_is_a_parse_error() {
    let nodes = vec![
        CellNode::formula("c1", vec!["1"; 3000].join(" + ")).into(),
        CellNode::formula("c2", "add(2, 3)").into(),
    ];
    let engine = settled(nodes, native()).await;

    let cell = engine.cell(&id("c1")).unwrap();
    assert!(cell.expression().is_none());
    assert_eq!(cell.errors()[0].kind, ErrorKind::Parse);
    assert_eq!(output(&engine, "c2"), Some(Value::Integer(5)));
}

#[tokio::test(start_paused = true)]
async fn test_events_for_removed_nodes_are_dropped() {
    let nodes = vec![
        InputNode::range("i1", "x", 1i64).into(),
        CellNode::formula("c1", "x").into(),
    ];
    let mut engine = settled(nodes, native()).await;

    engine.handle(DocumentEvent::Changed(MutationBatch {
        deleted: vec![NodeDescriptor::new("i1", NodeKind::RangeInput)],
        created: Vec::new(),
    }));
    engine.run_until_idle().await;
    assert_eq!(output(&engine, "c1"), Some(Value::Null));

    engine.handle(DocumentEvent::Node(NodeEvent::ValueUpdated {
        id: id("i1"),
        value: Value::Integer(9),
    }));
    assert!(engine.is_idle());
    assert_eq!(engine.value("x"), None);
}

#[tokio::test(start_paused = true)]
async fn test_document_events_from_json() {
    let mut engine = settled(
        vec![InputNode::range("i1", "x", 1i64).into(), CellNode::formula("c1", "x + 1").into()],
        native(),
    )
    .await;

    let event: DocumentEvent =
        serde_json::from_str(r#"{"event": "value_updated", "id": "i1", "value": 41}"#).unwrap();
    engine.handle(event);
    engine.run_until_idle().await;
    assert_eq!(output(&engine, "c1"), Some(Value::Integer(42)));
}
