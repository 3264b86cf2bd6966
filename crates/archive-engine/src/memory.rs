//! In-memory reference backends.
//!
//! These implement the backend traits with the exact visibility semantics
//! the engine is written against: the store is immediately consistent, the
//! index buffers every write until an explicit `refresh`. They back the
//! test suites and any embedded usage that does not need a real cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use archive_dsl::{RecordKind, SortDir};

use crate::backend::{
    AncestryChanged, BackendError, DocumentStore, FindOptions, IndexQuery, RepairSink,
    SearchIndex, StoreFilter, StoreUpdate, UpdateOp,
};
use crate::translate::{eval_filter, field_value, index_match, index_term_eq};
use crate::{TenantId, FIELD_ID};

type Collection = BTreeMap<String, Map<String, Value>>;
type Collections = HashMap<(TenantId, RecordKind), Collection>;

// ============================================================================
// Document store
// ============================================================================

/// Immediately consistent document store over per-tenant, per-kind maps.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents, across tenants and kinds.
    pub fn len(&self) -> usize {
        self.collections.read().values().map(Collection::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        doc: Map<String, Value>,
    ) -> Result<(), BackendError> {
        let id = doc
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::msg("document body lacks _id"))?
            .to_string();
        self.collections
            .write()
            .entry((tenant, kind))
            .or_default()
            .insert(id, doc);
        Ok(())
    }

    async fn get(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        id: &str,
    ) -> Result<Option<Map<String, Value>>, BackendError> {
        Ok(self
            .collections
            .read()
            .get(&(tenant, kind))
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn find(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        filter: &StoreFilter,
        options: &FindOptions,
    ) -> Result<Vec<Map<String, Value>>, BackendError> {
        let collections = self.collections.read();
        let mut matched: Vec<Map<String, Value>> = collections
            .get(&(tenant, kind))
            .map(|c| {
                c.values()
                    .filter(|doc| in_scope(doc, options) && eval_filter(filter, doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(collections);

        if !options.order_by.is_empty() {
            matched.sort_by(|a, b| order_docs(a, b, &options.order_by));
        }
        let offset = options.offset.unwrap_or(0) as usize;
        let matched = matched.into_iter().skip(offset);
        Ok(match options.limit {
            Some(limit) => matched.take(limit as usize).collect(),
            None => matched.collect(),
        })
    }

    async fn update(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        ids: &BTreeSet<String>,
        update: &StoreUpdate,
    ) -> Result<u64, BackendError> {
        let mut collections = self.collections.write();
        let Some(collection) = collections.get_mut(&(tenant, kind)) else {
            return Ok(0);
        };
        let mut matched = 0;
        for id in ids {
            if let Some(doc) = collection.get_mut(id) {
                apply_update(doc, update);
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn delete(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        ids: &BTreeSet<String>,
    ) -> Result<u64, BackendError> {
        let mut collections = self.collections.write();
        let Some(collection) = collections.get_mut(&(tenant, kind)) else {
            return Ok(0);
        };
        let mut deleted = 0;
        for id in ids {
            if collection.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn in_scope(doc: &Map<String, Value>, options: &FindOptions) -> bool {
    match &options.id_scope {
        None => true,
        Some(ids) => doc
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .is_some_and(|id| ids.contains(id)),
    }
}

fn order_docs(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    order_by: &[(String, SortDir)],
) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    for (field, dir) in order_by {
        let ord = cmp_values(field_value(a, field), field_value(b, field));
        let ord = match dir {
            SortDir::Asc => ord,
            SortDir::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Missing sorts before present; numbers and strings compare naturally;
/// mixed types fall back to equal.
fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.cmp(y),
                _ => Ordering::Equal,
            },
        },
    }
}

/// One document's atomic field-mutation pass.
fn apply_update(doc: &mut Map<String, Value>, update: &StoreUpdate) {
    for op in &update.ops {
        match op {
            UpdateOp::Set { field, value } => {
                set_path(doc, field, value.clone());
            }
            UpdateOp::Unset { field } => {
                unset_path(doc, field);
            }
            UpdateOp::Inc { field, delta } => {
                let current = path_value(doc, field).and_then(Value::as_i64).unwrap_or(0);
                set_path(doc, field, Value::from(current + delta));
            }
            UpdateOp::Min { field, value } => {
                let keep_current = path_value(doc, field)
                    .is_some_and(|current| cmp_values(Some(current), Some(value)).is_le());
                if !keep_current {
                    set_path(doc, field, value.clone());
                }
            }
            UpdateOp::Push { field, values } => {
                let array = array_at(doc, field);
                array.extend(values.iter().cloned());
            }
            UpdateOp::AddToSet { field, values } => {
                let array = array_at(doc, field);
                for value in values {
                    if !array.contains(value) {
                        array.push(value.clone());
                    }
                }
            }
        }
    }
}

fn path_value<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    field_value(doc, path)
}

fn set_path(doc: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("object just ensured");
    }
}

fn unset_path(doc: &mut Map<String, Value>, path: &str) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.remove(part);
            return;
        }
        match current.get_mut(part).and_then(Value::as_object_mut) {
            Some(next) => current = next,
            None => return,
        }
    }
}

fn array_at<'a>(doc: &'a mut Map<String, Value>, path: &str) -> &'a mut Vec<Value> {
    set_path_default(doc, path);
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    loop {
        let part = parts.next().expect("path ensured");
        if parts.peek().is_none() {
            return current
                .get_mut(part)
                .and_then(Value::as_array_mut)
                .expect("array just ensured");
        }
        current = current
            .get_mut(part)
            .and_then(Value::as_object_mut)
            .expect("objects just ensured");
    }
}

fn set_path_default(doc: &mut Map<String, Value>, path: &str) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("object just ensured");
    }
}

// ============================================================================
// Search index
// ============================================================================

enum PendingWrite {
    Index {
        tenant: TenantId,
        kind: RecordKind,
        doc: Map<String, Value>,
    },
    Remove {
        tenant: TenantId,
        kind: RecordKind,
        id: String,
    },
}

/// Index with explicit refresh semantics: writes buffer until `refresh`,
/// queries only see flushed state.
#[derive(Default)]
pub struct MemorySearchIndex {
    live: RwLock<Collections>,
    pending: Mutex<Vec<PendingWrite>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes buffered but not yet visible.
    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn index(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        doc: Map<String, Value>,
    ) -> Result<(), BackendError> {
        if doc.get(FIELD_ID).and_then(Value::as_str).is_none() {
            return Err(BackendError::msg("index body lacks _id"));
        }
        self.pending
            .lock()
            .push(PendingWrite::Index { tenant, kind, doc });
        Ok(())
    }

    async fn query(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        query: &IndexQuery,
    ) -> Result<BTreeSet<String>, BackendError> {
        let live = self.live.read();
        Ok(live
            .get(&(tenant, kind))
            .map(|collection| {
                collection
                    .iter()
                    .filter(|(_, doc)| eval_index_query(query, doc))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove(
        &self,
        tenant: TenantId,
        kind: RecordKind,
        id: &str,
    ) -> Result<(), BackendError> {
        self.pending.lock().push(PendingWrite::Remove {
            tenant,
            kind,
            id: id.to_string(),
        });
        Ok(())
    }

    async fn refresh(&self) -> Result<(), BackendError> {
        let drained: Vec<PendingWrite> = std::mem::take(&mut *self.pending.lock());
        let mut live = self.live.write();
        for write in drained {
            match write {
                PendingWrite::Index { tenant, kind, doc } => {
                    let id = doc
                        .get(FIELD_ID)
                        .and_then(Value::as_str)
                        .expect("checked at index time")
                        .to_string();
                    live.entry((tenant, kind)).or_default().insert(id, doc);
                }
                PendingWrite::Remove { tenant, kind, id } => {
                    if let Some(collection) = live.get_mut(&(tenant, kind)) {
                        collection.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }
}

fn eval_index_query(query: &IndexQuery, doc: &Map<String, Value>) -> bool {
    match query {
        IndexQuery::All => true,
        IndexQuery::And { queries } => queries.iter().all(|q| eval_index_query(q, doc)),
        IndexQuery::Or { queries } => queries.iter().any(|q| eval_index_query(q, doc)),
        IndexQuery::Match { field, tokens } => index_match(field_value(doc, field), tokens),
        IndexQuery::Term { field, value } => {
            field_value(doc, field).is_some_and(|v| index_term_eq(v, value))
        }
    }
}

// ============================================================================
// Repair sink
// ============================================================================

/// Collects ancestry-change events for inspection.
#[derive(Default)]
pub struct MemoryRepairSink {
    events: Mutex<Vec<AncestryChanged>>,
}

impl MemoryRepairSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AncestryChanged> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl RepairSink for MemoryRepairSink {
    async fn ancestry_changed(&self, event: AncestryChanged) -> Result<(), BackendError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().expect("object").clone()
    }

    #[tokio::test]
    async fn index_writes_are_invisible_until_refresh() {
        let index = MemorySearchIndex::new();
        index
            .index(0, RecordKind::Units, doc(json!({ "_id": "U1", "Title": "budget" })))
            .await
            .unwrap();

        let q = IndexQuery::Match {
            field: "Title".into(),
            tokens: vec!["budget".into()],
        };
        assert!(index.query(0, RecordKind::Units, &q).await.unwrap().is_empty());
        assert_eq!(index.pending_writes(), 1);

        index.refresh().await.unwrap();
        let hits = index.query(0, RecordKind::Units, &q).await.unwrap();
        assert_eq!(hits, BTreeSet::from(["U1".to_string()]));
    }

    #[tokio::test]
    async fn store_update_applies_each_op_semantics() {
        let store = MemoryStore::new();
        store
            .upsert(
                0,
                RecordKind::Units,
                doc(json!({ "_id": "U1", "Count": 2, "Keep": 5, "Tags": ["a"] })),
            )
            .await
            .unwrap();

        let ids = BTreeSet::from(["U1".to_string()]);
        let update = StoreUpdate {
            ops: vec![
                UpdateOp::Inc { field: "Count".into(), delta: 3 },
                UpdateOp::Min { field: "Keep".into(), value: json!(3) },
                UpdateOp::Min { field: "Floor".into(), value: json!(9) },
                UpdateOp::Push { field: "Tags".into(), values: vec![json!("a")] },
                UpdateOp::AddToSet { field: "Tags".into(), values: vec![json!("a"), json!("b")] },
                UpdateOp::Set { field: "Management.note".into(), value: json!("x") },
                UpdateOp::Unset { field: "Keep".into() },
            ],
        };
        assert_eq!(store.update(0, RecordKind::Units, &ids, &update).await.unwrap(), 1);

        let updated = store.get(0, RecordKind::Units, "U1").await.unwrap().unwrap();
        assert_eq!(updated.get("Count"), Some(&json!(5)));
        assert_eq!(updated.get("Floor"), Some(&json!(9)));
        assert_eq!(updated.get("Tags"), Some(&json!(["a", "a", "b"])));
        assert_eq!(
            updated.get("Management").and_then(|m| m.get("note")),
            Some(&json!("x"))
        );
        assert!(!updated.contains_key("Keep"));
    }

    #[tokio::test]
    async fn find_sorts_and_paginates() {
        let store = MemoryStore::new();
        for (id, year) in [("U1", 3), ("U2", 1), ("U3", 2)] {
            store
                .upsert(0, RecordKind::Units, doc(json!({ "_id": id, "Year": year })))
                .await
                .unwrap();
        }
        let options = FindOptions {
            id_scope: None,
            order_by: vec![("Year".to_string(), SortDir::Desc)],
            limit: Some(2),
            offset: Some(1),
        };
        let found = store
            .find(0, RecordKind::Units, &StoreFilter::All, &options)
            .await
            .unwrap();
        let ids: Vec<&str> = found
            .iter()
            .filter_map(|d| d.get("_id").and_then(Value::as_str))
            .collect();
        assert_eq!(ids, vec!["U3", "U2"]);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = MemoryStore::new();
        store
            .upsert(0, RecordKind::Units, doc(json!({ "_id": "U1" })))
            .await
            .unwrap();
        assert!(store.get(1, RecordKind::Units, "U1").await.unwrap().is_none());
        assert_eq!(
            store
                .find(1, RecordKind::Units, &StoreFilter::All, &FindOptions::default())
                .await
                .unwrap()
                .len(),
            0
        );
    }
}
