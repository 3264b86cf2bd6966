//! Backend collaborator interfaces.
//!
//! The engine talks to exactly two stores, kept deliberately distinct: the
//! **document store** is authoritative, the **search index** is an
//! eventually-consistent secondary. Both are narrow async traits over the
//! engine-owned translated forms ([`StoreFilter`], [`StoreUpdate`],
//! [`IndexQuery`]); connection pooling, retries and transport live behind
//! the trait, never in the engine.
//!
//! A third, one-way collaborator receives ancestry-change events for the
//! external closure-repair job ([`RepairSink`]); this engine never cascades
//! closure recomputation to stored descendants itself.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use archive_dsl::{CompareOp, RecordKind, SortDir};

use crate::TenantId;

/// Failure inside a backend call: unreachable, timed out, or the translated
/// query was rejected. Mapped to `EngineError::ExecutionFailed`, the only
/// retryable error kind.
#[derive(Debug, Error)]
#[error("backend failure: {0}")]
pub struct BackendError(#[from] pub anyhow::Error);

impl BackendError {
    pub fn msg(reason: impl Into<String>) -> Self {
        Self(anyhow::anyhow!(reason.into()))
    }
}

// ============================================================================
// Document-store forms
// ============================================================================

/// The document store's native filter form, produced by translating a
/// predicate tree. Full-text leaves never appear here; routing sends those
/// stages to the search index instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreFilter {
    /// Matches every document of the tenant.
    All,
    And { filters: Vec<StoreFilter> },
    Or { filters: Vec<StoreFilter> },
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Nin { field: String, values: Vec<Value> },
    Exists { field: String },
    Missing { field: String },
    Null { field: String },
    Cmp { op: CompareOp, field: String, value: Value },
    /// Array length equality (the store's unwind-style array predicate).
    Size { field: String, size: u64 },
    /// Id-set constraint, used for scoping a call to an eligible set.
    IdIn { ids: BTreeSet<String> },
}

/// One field mutation of a per-document atomic update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpdateOp {
    Set { field: String, value: Value },
    Unset { field: String },
    Inc { field: String, delta: i64 },
    Min { field: String, value: Value },
    Push { field: String, values: Vec<Value> },
    AddToSet { field: String, values: Vec<Value> },
}

/// A field-mutation list applied atomically per document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub ops: Vec<UpdateOp>,
}

/// Ordering/pagination options for a find call. Passed through unmodified
/// from the request's select filter.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Restrict the call to this id set (eligible-set constraint).
    pub id_scope: Option<BTreeSet<String>>,
    pub order_by: Vec<(String, SortDir)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl FindOptions {
    pub fn scoped(ids: BTreeSet<String>) -> Self {
        Self {
            id_scope: Some(ids),
            ..Self::default()
        }
    }
}

/// The authoritative document store. Every call is tenant-scoped
/// individually; single-document writes are atomic, nothing spans
/// documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a full document body by its `_id`.
    async fn upsert(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        doc: Map<String, Value>,
    ) -> Result<(), BackendError>;

    async fn get(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<Map<String, Value>>, BackendError>;

    /// Conditional find returning full documents.
    async fn find(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        filter: &StoreFilter,
        options: &FindOptions,
    ) -> Result<Vec<Map<String, Value>>, BackendError>;

    /// Apply a field-mutation list to every listed document, atomically per
    /// document. Returns the number of matched documents.
    async fn update(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        ids: &BTreeSet<String>,
        update: &StoreUpdate,
    ) -> Result<u64, BackendError>;

    /// Delete by id set. Returns the number of deleted documents.
    async fn delete(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        ids: &BTreeSet<String>,
    ) -> Result<u64, BackendError>;
}

// ============================================================================
// Search-index forms
// ============================================================================

/// Boolean query form of the search index. Structural leaves of a
/// full-text-routed stage translate to [`IndexQuery::All`]: the index
/// over-approximates and the planner re-checks candidates against
/// authoritative documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IndexQuery {
    All,
    And { queries: Vec<IndexQuery> },
    Or { queries: Vec<IndexQuery> },
    /// Tokenized match: every token must occur in the field (prefix
    /// tolerant).
    Match { field: String, tokens: Vec<String> },
    /// Exact term on an unanalyzed field.
    Term { field: String, value: Value },
}

/// The eventually-consistent full-text index. A write becomes visible to
/// queries only after the index catches up; `refresh` is the explicit
/// read-your-write opt-in.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Upsert a denormalized, tenant-tagged representation of a record.
    async fn index(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        doc: Map<String, Value>,
    ) -> Result<(), BackendError>;

    /// Execute a boolean query, returning matching ids.
    async fn query(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        query: &IndexQuery,
    ) -> Result<BTreeSet<String>, BackendError>;

    async fn remove(&self, tenant: TenantId, kind: RecordKind, id: &str)
        -> Result<(), BackendError>;

    /// Flush pending writes so subsequent queries observe them.
    async fn refresh(&self) -> Result<(), BackendError>;
}

// ============================================================================
// Closure-repair interface
// ============================================================================

/// "Record X's ancestry changed", emitted whenever an insert attaches
/// parents, and on deletes that may orphan descendants. The external repair
/// job recomputes descendants' closures; this engine does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestryChanged {
    pub tenant: TenantId,
    pub id: String,
    pub parents: BTreeSet<String>,
}

#[async_trait]
pub trait RepairSink: Send + Sync {
    async fn ancestry_changed(&self, event: AncestryChanged) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // The comparison filter carries its own `op` field, so the enum tag
    // must not collide with it.
    #[test]
    fn comparison_filter_survives_serde() {
        let filter = StoreFilter::And {
            filters: vec![
                StoreFilter::Cmp {
                    op: CompareOp::Lt,
                    field: "Pages".to_string(),
                    value: json!(100),
                },
                StoreFilter::Eq {
                    field: "Title".to_string(),
                    value: json!("Budget series"),
                },
            ],
        };
        let encoded = serde_json::to_value(&filter).expect("serialize");
        assert_eq!(encoded["kind"], "and");
        assert_eq!(encoded["filters"][0]["op"], "lt");
        let back: StoreFilter = serde_json::from_value(encoded).expect("deserialize");
        assert_eq!(back, filter);
    }
}
