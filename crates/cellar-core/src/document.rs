//! Document-side types consumed by the engine.
//!
//! The document itself (rendering, editing, collaboration) lives elsewhere.
//! The engine only sees node snapshots, mutation batches and per-node
//! change notifications.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Stable identifier of a document node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// How the engine treats a node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Cell,
    Input,
    Ignored,
}

/// Document node type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    /// Block-level cell.
    Cell,
    /// Cell embedded in running text.
    InlineCell,
    /// Drop-down selector.
    Select,
    /// Slider over a numeric range.
    RangeInput,
    /// Any other node type (paragraphs, headings, images...).
    Other(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Cell => "cell",
            NodeKind::InlineCell => "inline-cell",
            NodeKind::Select => "select",
            NodeKind::RangeInput => "range-input",
            NodeKind::Other(name) => name,
        }
    }

    pub fn role(&self) -> NodeRole {
        match self {
            NodeKind::Cell | NodeKind::InlineCell => NodeRole::Cell,
            NodeKind::Select | NodeKind::RangeInput => NodeRole::Input,
            NodeKind::Other(_) => NodeRole::Ignored,
        }
    }
}

impl From<String> for NodeKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "cell" => NodeKind::Cell,
            "inline-cell" => NodeKind::InlineCell,
            "select" => NodeKind::Select,
            "range-input" => NodeKind::RangeInput,
            _ => NodeKind::Other(name),
        }
    }
}

impl From<&str> for NodeKind {
    fn from(name: &str) -> Self {
        NodeKind::from(name.to_string())
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Snapshot of a cell node.
#[derive(Debug, Clone, PartialEq)]
pub struct CellNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Runtime the cell's source targets; `None` for formula-only cells.
    pub language: Option<String>,
    pub source_code: String,
    /// Mini expression invoking foreign source, e.g. `y = call(x)`.
    /// Ignored for formula-only cells, which parse `source_code` instead.
    pub expression: Option<String>,
}

impl CellNode {
    /// Formula-only block cell.
    pub fn formula(id: impl Into<NodeId>, source_code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Cell,
            language: None,
            source_code: source_code.into(),
            expression: None,
        }
    }

    /// Block cell whose source is run by the `language` runtime.
    ///
    /// The engine cannot see inside foreign source, so `expression` must name
    /// every variable the cell reads, as in `run(x)` or `call(x = x)`. A blank
    /// expression becomes `run()`, which depends on nothing.
    pub fn external(
        id: impl Into<NodeId>,
        language: impl Into<String>,
        source_code: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Cell,
            language: Some(language.into()),
            source_code: source_code.into(),
            expression: Some(expression.into()),
        }
    }

    /// Language with empty strings treated as absent.
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref().filter(|language| !language.is_empty())
    }

    /// Text handed to the expression parser.
    pub fn expression_text(&self) -> &str {
        match self.language() {
            None => &self.source_code,
            Some(_) => self
                .expression
                .as_deref()
                .filter(|expr| !expr.trim().is_empty())
                .unwrap_or("run()"),
        }
    }
}

/// Snapshot of an input widget node.
#[derive(Debug, Clone, PartialEq)]
pub struct InputNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: Option<String>,
    pub value: Value,
}

impl InputNode {
    pub fn new(
        id: impl Into<NodeId>,
        kind: NodeKind,
        name: Option<&str>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.map(str::to_string),
            value: value.into(),
        }
    }

    pub fn range(id: impl Into<NodeId>, name: &str, value: impl Into<Value>) -> Self {
        Self::new(id, NodeKind::RangeInput, Some(name), value)
    }

    /// Name with empty strings treated as absent.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }
}

/// A node as delivered by the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawNode", into = "RawNode")]
pub enum DocumentNode {
    Cell(CellNode),
    Input(InputNode),
    Other { id: NodeId, kind: NodeKind },
}

impl DocumentNode {
    pub fn id(&self) -> &NodeId {
        match self {
            DocumentNode::Cell(cell) => &cell.id,
            DocumentNode::Input(input) => &input.id,
            DocumentNode::Other { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        match self {
            DocumentNode::Cell(cell) => &cell.kind,
            DocumentNode::Input(input) => &input.kind,
            DocumentNode::Other { kind, .. } => kind,
        }
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id().clone(),
            kind: self.kind().clone(),
        }
    }
}

impl From<CellNode> for DocumentNode {
    fn from(cell: CellNode) -> Self {
        DocumentNode::Cell(cell)
    }
}

impl From<InputNode> for DocumentNode {
    fn from(input: InputNode) -> Self {
        DocumentNode::Input(input)
    }
}

/// Flat wire form of a [`DocumentNode`]; the `type` field selects the role.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNode {
    id: NodeId,
    #[serde(rename = "type")]
    kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

impl From<RawNode> for DocumentNode {
    fn from(raw: RawNode) -> Self {
        match raw.kind.role() {
            NodeRole::Cell => DocumentNode::Cell(CellNode {
                id: raw.id,
                kind: raw.kind,
                language: raw.language,
                source_code: raw.source_code.unwrap_or_default(),
                expression: raw.expression,
            }),
            NodeRole::Input => DocumentNode::Input(InputNode {
                id: raw.id,
                kind: raw.kind,
                name: raw.name,
                value: raw.value.unwrap_or_default(),
            }),
            NodeRole::Ignored => DocumentNode::Other {
                id: raw.id,
                kind: raw.kind,
            },
        }
    }
}

impl From<DocumentNode> for RawNode {
    fn from(node: DocumentNode) -> Self {
        let mut raw = RawNode {
            id: node.id().clone(),
            kind: node.kind().clone(),
            language: None,
            source_code: None,
            expression: None,
            name: None,
            value: None,
        };
        match node {
            DocumentNode::Cell(cell) => {
                raw.language = cell.language;
                raw.source_code = Some(cell.source_code);
                raw.expression = cell.expression;
            }
            DocumentNode::Input(input) => {
                raw.name = input.name;
                raw.value = Some(input.value);
            }
            DocumentNode::Other { .. } => {}
        }
        raw
    }
}

/// Identity of a deleted node; its content is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Structural change produced by a single document edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    #[serde(default)]
    pub deleted: Vec<NodeDescriptor>,
    #[serde(default)]
    pub created: Vec<DocumentNode>,
}

impl MutationBatch {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.created.is_empty()
    }
}

/// Change notification raised by a live node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    /// `expression:updated` - the cell's source was edited.
    ExpressionUpdated {
        id: NodeId,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        source_code: String,
        #[serde(default)]
        expression: Option<String>,
    },
    /// `name:updated` - an input was renamed.
    NameUpdated { id: NodeId, name: Option<String> },
    /// `value:updated` - an input's value changed.
    ValueUpdated { id: NodeId, value: Value },
}

impl NodeEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            NodeEvent::ExpressionUpdated { id, .. }
            | NodeEvent::NameUpdated { id, .. }
            | NodeEvent::ValueUpdated { id, .. } => id,
        }
    }
}

/// Anything the document tells the engine.
///
/// Node events carry an `event` tag; untagged objects are mutation batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentEvent {
    Node(NodeEvent),
    Changed(MutationBatch),
}
