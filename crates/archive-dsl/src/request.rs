//! Abstract syntax for parsed requests.
//!
//! The predicate tree is a tagged union with one variant per leaf kind plus
//! the two combinators; backends each get an explicit recursive translator
//! over this enum rather than any open-ended dispatch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which record collection a stage (or a whole request) addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Units,
    ObjectGroups,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

/// One predicate tree. `And`/`Or` nest arbitrarily; everything else is a
/// leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Query {
    And { queries: Vec<Query> },
    Or { queries: Vec<Query> },
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Nin { field: String, values: Vec<Value> },
    Exists { field: String },
    Missing { field: String },
    IsNull { field: String },
    Compare { op: CompareOp, field: String, value: Value },
    Range { field: String, bounds: Vec<(CompareOp, Value)> },
    /// Exact-term matches, AND-implicit across pairs.
    Term { terms: BTreeMap<String, Value> },
    /// Tokenized full-text match; always routed to the search index.
    Match { field: String, text: String },
    /// Array length equality.
    Size { field: String, size: u64 },
    /// Direct id lookup, bypassing predicate evaluation.
    Path { ids: Vec<String> },
}

impl Query {
    /// True if the tree contains at least one full-text leaf; such a stage
    /// routes to the search index.
    pub fn has_fulltext(&self) -> bool {
        match self {
            Query::Match { .. } => true,
            Query::And { queries } | Query::Or { queries } => {
                queries.iter().any(Query::has_fulltext)
            }
            _ => false,
        }
    }

    /// True if the tree is a bare `$path` lookup (possibly the only node).
    pub fn as_path(&self) -> Option<&[String]> {
        match self {
            Query::Path { ids } => Some(ids),
            _ => None,
        }
    }
}

/// One evaluation step of a chained query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub query: Query,
    /// Bounds how many closure hops from the running root set are eligible.
    pub depth_limit: Option<u32>,
    /// Restricts the stage to one record kind.
    pub hint: Option<RecordKind>,
}

/// Projection: everything, or an explicit allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Projection {
    All,
    Fields { names: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Asc,
    Desc,
}

/// Ordering/pagination, passed through unmodified to whichever backend
/// executes the final stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectFilter {
    pub order_by: Vec<(String, SortDir)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// One field mutation of an Update request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    Set { field: String, value: Value },
    Unset { field: String },
    Inc { field: String, delta: i64 },
    /// Clamp the field to at most `value` (store keeps the minimum).
    Min { field: String, value: Value },
    Push { field: String, values: Vec<Value> },
    AddToSet { field: String, values: Vec<Value> },
}

impl Action {
    pub fn field(&self) -> &str {
        match self {
            Action::Set { field, .. }
            | Action::Unset { field }
            | Action::Inc { field, .. }
            | Action::Min { field, .. }
            | Action::Push { field, .. }
            | Action::AddToSet { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectRequest {
    pub roots: Vec<String>,
    pub stages: Vec<Stage>,
    pub projection: Projection,
    pub filter: SelectFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRequest {
    pub roots: Vec<String>,
    pub stages: Vec<Stage>,
    pub data: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub roots: Vec<String>,
    pub stages: Vec<Stage>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub roots: Vec<String>,
    pub stages: Vec<Stage>,
}

/// A parsed, kind-tagged request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Select(SelectRequest),
    Insert(InsertRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
}

impl Request {
    pub fn roots(&self) -> &[String] {
        match self {
            Request::Select(r) => &r.roots,
            Request::Insert(r) => &r.roots,
            Request::Update(r) => &r.roots,
            Request::Delete(r) => &r.roots,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        match self {
            Request::Select(r) => &r.stages,
            Request::Insert(r) => &r.stages,
            Request::Update(r) => &r.stages,
            Request::Delete(r) => &r.stages,
        }
    }
}
