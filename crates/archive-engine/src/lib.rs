//! Query planning, staged execution and mutations for archival metadata.
//!
//! The engine sits between the parsed request AST ([`archive_dsl`]) and two
//! backends: an authoritative document store and an eventually-consistent
//! search index. A select request is a chain of stages; each stage is
//! routed to exactly one backend, its result ids become the root set of the
//! next stage, and the final id set is materialized from the document
//! store. Mutations stamp the closure fields of [`archive_graph`] and keep
//! the index in step on a best-effort basis.
//!
//! ```text
//! wire JSON ──parse──▶ Request ──plan/route──▶ StoreFilter / IndexQuery
//!                                   │
//!                          running id set R per stage
//!                                   ▼
//!                        materialize from the store
//! ```

pub mod backend;
pub mod executor;
mod fulltext;
pub mod memory;
pub mod mutation;
pub mod translate;


use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use archive_dsl::{MalformedRequest, RecordKind};
use archive_graph::CycleDetected;

pub use backend::{
    AncestryChanged, BackendError, DocumentStore, FindOptions, IndexQuery, RepairSink,
    SearchIndex, StoreFilter, StoreUpdate, UpdateOp,
};
pub use executor::QueryExecutor;
pub use mutation::MutationExecutor;

/// Numeric tenant identifier; every backend call carries one.
pub type TenantId = u64;

// ============================================================================
// Reserved document fields
// ============================================================================

/// Record identifier.
pub const FIELD_ID: &str = "_id";
/// Owning tenant.
pub const FIELD_TENANT: &str = "_tenant";
/// Monotonic document version, bumped on every update.
pub const FIELD_VERSION: &str = "_v";
/// Creation timestamp (RFC 3339).
pub const FIELD_CREATED: &str = "_cd";
/// Last-update timestamp (RFC 3339).
pub const FIELD_UPDATED: &str = "_ud";

// ============================================================================
// Errors
// ============================================================================

/// Everything a request execution can fail with. Only `ExecutionFailed`
/// is worth retrying; the rest are deterministic rejections.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Malformed(#[from] MalformedRequest),

    #[error(transparent)]
    Cycle(#[from] CycleDetected),

    #[error("record {id} already exists")]
    AlreadyExists { id: String },

    #[error("parent record {id} not found")]
    ParentNotFound { id: String },

    #[error("field {field} is engine-managed and cannot be mutated")]
    ForbiddenFieldMutation { field: String },

    #[error(transparent)]
    ExecutionFailed(#[from] BackendError),
}

impl EngineError {
    /// Transient backend failures may succeed on retry; everything else is
    /// deterministic and will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ExecutionFailed(_))
    }
}

// ============================================================================
// Execution context and results
// ============================================================================

/// Per-request execution context. The tenant comes from the caller's
/// session, never from the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant: TenantId,
}

impl RequestContext {
    pub fn new(tenant: TenantId) -> Self {
        Self { tenant }
    }
}

/// Outcome of an executed request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Record kind the final stage resolved against.
    pub kind: Option<RecordKind>,
    /// Final ids, in materialization order.
    pub ids: Vec<String>,
    /// Projected documents (selects only; mutations leave this empty).
    pub documents: Vec<Map<String, Value>>,
    /// Documents matched by the last stage, before offset/limit.
    pub matched: u64,
}

impl ResultSet {
    pub(crate) fn empty(kind: Option<RecordKind>) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn id_set(&self) -> BTreeSet<String> {
        self.ids.iter().cloned().collect()
    }
}
