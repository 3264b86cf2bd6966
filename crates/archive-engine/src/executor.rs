//! Staged select execution over the two backends.
//!
//! A select is resolved stage by stage: the running id set `R` starts as
//! the request's roots, each stage computes the next `R` from the records
//! eligible under its depth limit, and the final `R` is materialized from
//! the document store with the request's projection and sort applied.
//!
//! Routing is per stage and deterministic: any full-text leaf sends the
//! whole stage to the search index, everything else goes to the document
//! store. Index candidates are never trusted for field values; the full
//! predicate tree is re-checked against authoritative documents.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use archive_dsl::{Projection, RecordKind, SelectRequest, Stage};
use archive_graph::Closure;

use crate::backend::{
    BackendError, DocumentStore, FindOptions, SearchIndex, StoreFilter,
};
use crate::translate::{self, map_field};
use crate::{EngineError, RequestContext, ResultSet, FIELD_ID};

/// Default per-backend-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes select requests against a document store and a search index.
pub struct QueryExecutor<S, I> {
    store: Arc<S>,
    index: Arc<I>,
    call_timeout: Duration,
}

impl<S: DocumentStore, I: SearchIndex> QueryExecutor<S, I> {
    pub fn new(store: Arc<S>, index: Arc<I>) -> Self {
        Self {
            store,
            index,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Execute a parsed select end to end.
    pub async fn select(
        &self,
        ctx: RequestContext,
        request: &SelectRequest,
    ) -> Result<ResultSet, EngineError> {
        let (kind, ids) = self
            .resolve(ctx, &request.roots, &request.stages, RecordKind::Units)
            .await?;
        if ids.is_empty() {
            return Ok(ResultSet::empty(Some(kind)));
        }
        self.materialize(ctx, kind, ids, request).await
    }

    /// Run the stage chain and return the final id set plus the kind the
    /// last stage resolved against. Shared with the mutation side, which
    /// resolves its targets the same way.
    pub(crate) async fn resolve(
        &self,
        ctx: RequestContext,
        roots: &[String],
        stages: &[Stage],
        default_kind: RecordKind,
    ) -> Result<(RecordKind, BTreeSet<String>), EngineError> {
        let mut running: BTreeSet<String> = roots.iter().cloned().collect();
        let mut kind = default_kind;
        let mut first = true;

        for (n, stage) in stages.iter().enumerate() {
            kind = stage.hint.unwrap_or(kind);

            // An empty running set with roots (or from a previous stage)
            // can match nothing further.
            if running.is_empty() && !first {
                debug!(stage = n, "running set drained, short-circuiting");
                return Ok((kind, BTreeSet::new()));
            }

            let next = if let Some(ids) = stage.query.as_path() {
                self.resolve_path(ctx, kind, ids, stage, &running).await?
            } else if stage.query.has_fulltext() {
                self.resolve_via_index(ctx, kind, stage, &running).await?
            } else {
                self.resolve_via_store(ctx, kind, stage, &running).await?
            };

            debug!(
                stage = n,
                kind = ?kind,
                fulltext = stage.query.has_fulltext(),
                matched = next.len(),
                "stage resolved"
            );
            running = next;
            first = false;
        }
        Ok((kind, running))
    }

    /// `$path`: verify the listed ids exist for this tenant and fall inside
    /// the eligible set, no predicate evaluation.
    async fn resolve_path(
        &self,
        ctx: RequestContext,
        kind: RecordKind,
        ids: &[String],
        stage: &Stage,
        running: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let wanted: BTreeSet<String> = ids.iter().cloned().collect();
        let mut filters = vec![StoreFilter::IdIn { ids: wanted }];
        if let Some(scope) = eligibility_filter(running, stage.depth_limit) {
            filters.push(scope);
        }
        let filter = if filters.len() == 1 {
            filters.remove(0)
        } else {
            StoreFilter::And { filters }
        };
        let docs = self
            .timed(self.store.find(ctx.tenant, kind, &filter, &FindOptions::default()))
            .await?;
        Ok(apply_depth_check(docs, running, stage.depth_limit))
    }

    async fn resolve_via_store(
        &self,
        ctx: RequestContext,
        kind: RecordKind,
        stage: &Stage,
        running: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let mut filters = vec![translate::to_store_filter(&stage.query)?];
        if let Some(scope) = eligibility_filter(running, stage.depth_limit) {
            filters.push(scope);
        }
        let filter = if filters.len() == 1 {
            filters.remove(0)
        } else {
            StoreFilter::And { filters }
        };

        let docs = self
            .timed(self.store.find(ctx.tenant, kind, &filter, &FindOptions::default()))
            .await?;
        Ok(apply_depth_check(docs, running, stage.depth_limit))
    }

    /// Full-text route: candidates from the index, then the full predicate
    /// tree re-checked on authoritative documents.
    async fn resolve_via_index(
        &self,
        ctx: RequestContext,
        kind: RecordKind,
        stage: &Stage,
        running: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let index_query = translate::to_index_query(&stage.query)?;
        let candidates = self
            .timed(self.index.query(ctx.tenant, kind, &index_query))
            .await?;
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut filters = vec![StoreFilter::IdIn { ids: candidates }];
        if let Some(scope) = eligibility_filter(running, stage.depth_limit) {
            filters.push(scope);
        }
        let docs = self
            .timed(self.store.find(
                ctx.tenant,
                kind,
                &StoreFilter::And { filters },
                &FindOptions::default(),
            ))
            .await?;

        let confirmed: Vec<Map<String, Value>> = docs
            .into_iter()
            .filter(|doc| translate::matches(&stage.query, doc))
            .collect();
        Ok(apply_depth_check(confirmed, running, stage.depth_limit))
    }

    /// Fetch the final documents, apply sort and pagination in the store,
    /// then project.
    async fn materialize(
        &self,
        ctx: RequestContext,
        kind: RecordKind,
        ids: BTreeSet<String>,
        request: &SelectRequest,
    ) -> Result<ResultSet, EngineError> {
        let matched = ids.len() as u64;

        let mut order_by = Vec::with_capacity(request.filter.order_by.len());
        for (name, dir) in &request.filter.order_by {
            let mapped = map_field(name)
                .ok_or_else(|| BackendError::msg(format!("unknown sort field {name}")))?;
            order_by.push((mapped, *dir));
        }
        let options = FindOptions {
            id_scope: Some(ids),
            order_by,
            limit: request.filter.limit,
            offset: request.filter.offset,
        };

        let docs = self
            .timed(self.store.find(ctx.tenant, kind, &StoreFilter::All, &options))
            .await?;

        let mut out_ids = Vec::with_capacity(docs.len());
        let mut documents = Vec::with_capacity(docs.len());
        for doc in docs {
            if let Some(id) = doc.get(FIELD_ID).and_then(Value::as_str) {
                out_ids.push(id.to_string());
            }
            documents.push(project(doc, &request.projection));
        }

        Ok(ResultSet {
            kind: Some(kind),
            ids: out_ids,
            documents,
            matched,
        })
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        timed(self.call_timeout, fut).await
    }
}

/// Bound one backend call by the configured deadline.
pub(crate) async fn timed<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::msg("backend call deadline exceeded")),
    }
}

/// Store-side narrowing for a depth-limited stage. Depth 0 is the running
/// set itself; depth 1 adds direct children; anything deeper uses the
/// ancestor list and is re-checked per hop count afterwards.
fn eligibility_filter(running: &BTreeSet<String>, depth: Option<u32>) -> Option<StoreFilter> {
    if running.is_empty() {
        return None;
    }
    let depth = depth?;
    let root_values: Vec<Value> = running.iter().cloned().map(Value::String).collect();
    let self_filter = StoreFilter::IdIn {
        ids: running.clone(),
    };
    Some(match depth {
        0 => self_filter,
        1 => StoreFilter::Or {
            filters: vec![
                StoreFilter::In {
                    field: archive_graph::UP.to_string(),
                    values: root_values,
                },
                self_filter,
            ],
        },
        _ => StoreFilter::Or {
            filters: vec![
                StoreFilter::In {
                    field: archive_graph::US.to_string(),
                    values: root_values,
                },
                self_filter,
            ],
        },
    })
}

/// Exact hop-count check on the matched documents' embedded closures. The
/// store filter over-approximates beyond one hop.
fn apply_depth_check(
    docs: Vec<Map<String, Value>>,
    running: &BTreeSet<String>,
    depth: Option<u32>,
) -> BTreeSet<String> {
    let Some(depth) = depth else {
        return doc_ids(&docs);
    };
    if running.is_empty() || depth <= 1 {
        return doc_ids(&docs);
    }
    docs.iter()
        .filter_map(|doc| {
            let id = doc.get(FIELD_ID)?.as_str()?;
            let closure = Closure::from_document(id, doc)?;
            closure
                .within_depth(running.iter().map(String::as_str), depth)
                .then(|| id.to_string())
        })
        .collect()
}

fn doc_ids(docs: &[Map<String, Value>]) -> BTreeSet<String> {
    docs.iter()
        .filter_map(|doc| doc.get(FIELD_ID).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Apply a projection to one document. The identifier always survives.
fn project(doc: Map<String, Value>, projection: &Projection) -> Map<String, Value> {
    match projection {
        Projection::All => doc,
        Projection::Fields { names } => {
            let mut keep: BTreeSet<String> = names
                .iter()
                .filter_map(|name| map_field(name))
                .collect();
            keep.insert(FIELD_ID.to_string());
            doc.into_iter()
                .filter(|(key, _)| keep.contains(key))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn depth_zero_scopes_to_the_running_set_itself() {
        let running: BTreeSet<String> = ["U1".to_string()].into();
        let filter = eligibility_filter(&running, Some(0)).unwrap();
        assert_eq!(filter, StoreFilter::IdIn { ids: running });
    }

    #[test]
    fn no_depth_limit_means_no_scoping() {
        let running: BTreeSet<String> = ["U1".to_string()].into();
        assert_eq!(eligibility_filter(&running, None), None);
    }

    #[test]
    fn projection_keeps_the_identifier() {
        let doc = json!({ "_id": "U1", "Title": "t", "Secret": "s" })
            .as_object()
            .unwrap()
            .clone();
        let projected = project(
            doc,
            &Projection::Fields {
                names: vec!["Title".to_string()],
            },
        );
        assert_eq!(projected.len(), 2);
        assert!(projected.contains_key("_id"));
        assert!(projected.contains_key("Title"));
    }
}
