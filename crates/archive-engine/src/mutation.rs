//! Insert, update and delete execution.
//!
//! The document store is the unit of truth: every mutation lands there
//! first, synchronously. The search index is kept in step on a best-effort
//! basis afterwards; an index failure is logged and never fails the
//! mutation. Closure maintenance is forward-only: inserts stamp the full
//! closure of the new record from its parents' stored closures, and any
//! change that could invalidate stored descendants is handed to the
//! external repair job through the [`RepairSink`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use archive_dsl::{
    DeleteRequest, InsertRequest, MalformedRequest, RecordKind, UpdateRequest,
};
use archive_graph::Closure;

use crate::backend::{
    AncestryChanged, DocumentStore, FindOptions, RepairSink, SearchIndex, StoreFilter,
    UpdateOp,
};
use crate::executor::{timed, QueryExecutor, DEFAULT_CALL_TIMEOUT};
use crate::translate::{self, map_field};
use crate::{
    EngineError, RequestContext, ResultSet, FIELD_CREATED, FIELD_ID, FIELD_TENANT,
    FIELD_UPDATED, FIELD_VERSION,
};

/// Wire field naming the record's originating agency, required on insert.
const AGENCY_FIELD: &str = "OriginatingAgency";

/// Executes mutation requests. Update and delete targets are resolved with
/// the same stage chain as selects.
pub struct MutationExecutor<S, I, R> {
    store: Arc<S>,
    index: Arc<I>,
    repair: Arc<R>,
    queries: QueryExecutor<S, I>,
    call_timeout: Duration,
}

impl<S, I, R> MutationExecutor<S, I, R>
where
    S: DocumentStore,
    I: SearchIndex,
    R: RepairSink,
{
    pub fn new(store: Arc<S>, index: Arc<I>, repair: Arc<R>) -> Self {
        Self {
            queries: QueryExecutor::new(Arc::clone(&store), Arc::clone(&index)),
            store,
            index,
            repair,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self.queries = QueryExecutor::new(Arc::clone(&self.store), Arc::clone(&self.index))
            .with_call_timeout(timeout);
        self
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Insert one record, attached under the request's roots. The new
    /// record's closure is derived from its parents' stored closures in one
    /// pass; no stored document is revisited.
    pub async fn insert(
        &self,
        ctx: RequestContext,
        request: &InsertRequest,
    ) -> Result<ResultSet, EngineError> {
        let kind = request
            .stages
            .iter()
            .rev()
            .find_map(|s| s.hint)
            .unwrap_or(RecordKind::Units);

        let mut data = request.data.clone();
        for key in data.keys() {
            if key.starts_with('_') {
                return Err(EngineError::ForbiddenFieldMutation { field: key.clone() });
            }
        }

        let id = match data.remove("#id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(_) => {
                return Err(MalformedRequest {
                    reason: "#id must be a non-empty string".to_string(),
                }
                .into())
            }
            None => Uuid::new_v4().to_string(),
        };
        let agency = match data.get(AGENCY_FIELD).and_then(Value::as_str) {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => {
                return Err(MalformedRequest {
                    reason: format!("insert data requires {AGENCY_FIELD}"),
                }
                .into())
            }
        };

        // Ids are unique per tenant across both collections, not per kind.
        for existing_kind in [RecordKind::Units, RecordKind::ObjectGroups] {
            if self
                .timed(self.store.get(ctx.tenant, existing_kind, &id))
                .await?
                .is_some()
            {
                return Err(EngineError::AlreadyExists { id });
            }
        }

        // All parents must exist before any closure math; a cycle error
        // later leaves nothing written. Parents are always units, whatever
        // kind the record itself lands in.
        let mut closure = Closure::new(id.clone(), agency);
        let parents: BTreeSet<String> = request.roots.iter().cloned().collect();
        for parent_id in &parents {
            let parent_doc = self
                .timed(self.store.get(ctx.tenant, RecordKind::Units, parent_id))
                .await?
                .ok_or_else(|| EngineError::ParentNotFound {
                    id: parent_id.clone(),
                })?;
            let parent = Closure::from_document(parent_id, &parent_doc).ok_or_else(|| {
                EngineError::ParentNotFound {
                    id: parent_id.clone(),
                }
            })?;
            closure.add_parent(&parent)?;
        }

        let now = Utc::now().to_rfc3339();
        let mut doc = data;
        doc.insert(FIELD_ID.to_string(), Value::String(id.clone()));
        doc.insert(FIELD_TENANT.to_string(), Value::from(ctx.tenant));
        doc.insert(FIELD_VERSION.to_string(), Value::from(0));
        doc.insert(FIELD_CREATED.to_string(), Value::String(now.clone()));
        doc.insert(FIELD_UPDATED.to_string(), Value::String(now));
        closure.embed(&mut doc);

        self.timed(self.store.upsert(ctx.tenant, kind, doc.clone()))
            .await?;
        debug!(id = %id, kind = ?kind, parents = parents.len(), "record inserted");

        self.reindex(ctx, kind, doc).await;
        if !parents.is_empty() {
            self.emit(AncestryChanged {
                tenant: ctx.tenant,
                id: id.clone(),
                parents,
            })
            .await;
        }

        Ok(ResultSet {
            kind: Some(kind),
            ids: vec![id],
            documents: Vec::new(),
            matched: 1,
        })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply the action list to every record the stage chain resolves.
    /// Engine-managed fields are off limits; the version counter and the
    /// update timestamp are bumped alongside.
    pub async fn update(
        &self,
        ctx: RequestContext,
        request: &UpdateRequest,
    ) -> Result<ResultSet, EngineError> {
        for action in &request.actions {
            let wire = action.field();
            let mapped = map_field(wire).ok_or_else(|| MalformedRequest {
                reason: format!("unknown wire field {wire}"),
            })?;
            if mapped.starts_with('_') {
                return Err(EngineError::ForbiddenFieldMutation {
                    field: wire.to_string(),
                });
            }
        }

        let (kind, ids) = self
            .queries
            .resolve(ctx, &request.roots, &request.stages, RecordKind::Units)
            .await?;
        if ids.is_empty() {
            return Ok(ResultSet::empty(Some(kind)));
        }

        let mut update = translate::to_store_update(&request.actions)?;
        update.ops.push(UpdateOp::Inc {
            field: FIELD_VERSION.to_string(),
            delta: 1,
        });
        update.ops.push(UpdateOp::Set {
            field: FIELD_UPDATED.to_string(),
            value: Value::String(Utc::now().to_rfc3339()),
        });

        let matched = self
            .timed(self.store.update(ctx.tenant, kind, &ids, &update))
            .await?;
        debug!(kind = ?kind, matched, "records updated");

        // Re-read and push the fresh bodies to the index.
        let docs = self
            .timed(self.store.find(
                ctx.tenant,
                kind,
                &StoreFilter::All,
                &FindOptions::scoped(ids.clone()),
            ))
            .await?;
        for doc in docs {
            self.reindex(ctx, kind, doc).await;
        }

        Ok(ResultSet {
            kind: Some(kind),
            ids: ids.into_iter().collect(),
            documents: Vec::new(),
            matched,
        })
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete every record the stage chain resolves. Descendant closures
    /// are not rewritten here; each surviving child is reported to the
    /// repair sink.
    pub async fn delete(
        &self,
        ctx: RequestContext,
        request: &DeleteRequest,
    ) -> Result<ResultSet, EngineError> {
        let (kind, ids) = self
            .queries
            .resolve(ctx, &request.roots, &request.stages, RecordKind::Units)
            .await?;
        if ids.is_empty() {
            return Ok(ResultSet::empty(Some(kind)));
        }

        let target_values: Vec<Value> = ids.iter().cloned().map(Value::String).collect();
        for child_kind in [RecordKind::Units, RecordKind::ObjectGroups] {
            let children = self
                .timed(self.store.find(
                    ctx.tenant,
                    child_kind,
                    &StoreFilter::In {
                        field: archive_graph::UP.to_string(),
                        values: target_values.clone(),
                    },
                    &FindOptions::default(),
                ))
                .await?;
            for child in children {
                let Some(child_id) = child.get(FIELD_ID).and_then(Value::as_str) else {
                    continue;
                };
                if ids.contains(child_id) {
                    continue;
                }
                let surviving: BTreeSet<String> = child
                    .get(archive_graph::UP)
                    .and_then(Value::as_array)
                    .map(|parents| {
                        parents
                            .iter()
                            .filter_map(Value::as_str)
                            .filter(|p| !ids.contains(*p))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                warn!(
                    child = %child_id,
                    "deleting a parented record, child ancestry left to repair"
                );
                self.emit(AncestryChanged {
                    tenant: ctx.tenant,
                    id: child_id.to_string(),
                    parents: surviving,
                })
                .await;
            }
        }

        let deleted = self
            .timed(self.store.delete(ctx.tenant, kind, &ids))
            .await?;
        debug!(kind = ?kind, deleted, "records deleted");

        for id in &ids {
            if let Err(err) = timed(
                self.call_timeout,
                self.index.remove(ctx.tenant, kind, id),
            )
            .await
            {
                warn!(id = %id, error = %err, "index removal failed, left to catch up");
            }
        }

        Ok(ResultSet {
            kind: Some(kind),
            ids: ids.into_iter().collect(),
            documents: Vec::new(),
            matched: deleted,
        })
    }

    // ------------------------------------------------------------------
    // Best-effort side channels
    // ------------------------------------------------------------------

    /// Push one record body to the index, closure internals stripped. Never
    /// fails the surrounding mutation.
    async fn reindex(&self, ctx: RequestContext, kind: RecordKind, mut doc: Map<String, Value>) {
        doc.remove(archive_graph::UDS);
        doc.remove(archive_graph::GRAPH);
        let id = doc
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Err(err) = timed(self.call_timeout, self.index.index(ctx.tenant, kind, doc)).await
        {
            warn!(id = %id, error = %err, "index write failed, left to catch up");
        }
    }

    async fn emit(&self, event: AncestryChanged) {
        let id = event.id.clone();
        if let Err(err) = timed(self.call_timeout, self.repair.ancestry_changed(event)).await {
            warn!(id = %id, error = %err, "repair event lost");
        }
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, crate::BackendError>>,
    ) -> Result<T, crate::BackendError> {
        timed(self.call_timeout, fut).await
    }
}
