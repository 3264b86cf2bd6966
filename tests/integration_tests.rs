//! Integration tests for the complete metadata pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - Wire JSON → DSL parsing → Request AST
//! - Mutations → closure stamping → document store + search index
//! - Staged selects → routing → materialized results
//!
//! Run with: cargo test --test integration_tests

use std::sync::Arc;

use serde_json::json;

use archive_dsl::{parse_delete, parse_insert, parse_select, parse_update, RecordKind, Request};
use archive_engine::memory::{MemoryRepairSink, MemorySearchIndex, MemoryStore};
use archive_engine::{
    DocumentStore, EngineError, MutationExecutor, QueryExecutor, RequestContext, SearchIndex,
};

// ============================================================================
// Wire format → AST
// ============================================================================

#[test]
fn test_request_body_dispatch() {
    let select = Request::parse_query_body(&json!({
        "$roots": ["U1"],
        "$query": [{ "$exists": "Title" }]
    }))
    .expect("should parse");
    assert!(matches!(select, Request::Select(_)));

    let insert = Request::parse_query_body(&json!({
        "$data": { "Title": "t", "OriginatingAgency": "AG1" }
    }))
    .expect("should parse");
    assert!(matches!(insert, Request::Insert(_)));

    let update = Request::parse_query_body(&json!({
        "$query": [{ "$path": ["U1"] }],
        "$action": [{ "$set": { "Title": "t" } }]
    }))
    .expect("should parse");
    assert!(matches!(update, Request::Update(_)));
}

// ============================================================================
// Full pipeline: mutate, query, mutate again
// ============================================================================

struct Platform {
    store: Arc<MemoryStore>,
    index: Arc<MemorySearchIndex>,
    sink: Arc<MemoryRepairSink>,
    queries: QueryExecutor<MemoryStore, MemorySearchIndex>,
    mutations: MutationExecutor<MemoryStore, MemorySearchIndex, MemoryRepairSink>,
}

fn platform() -> Platform {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    let sink = Arc::new(MemoryRepairSink::new());
    Platform {
        queries: QueryExecutor::new(Arc::clone(&store), Arc::clone(&index)),
        mutations: MutationExecutor::new(
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&sink),
        ),
        store,
        index,
        sink,
    }
}

#[tokio::test]
async fn test_archive_lifecycle_end_to_end() {
    let p = platform();
    let ctx = RequestContext::new(0);

    // A producer deposits a fonds: one root unit, one child attached to it.
    let root = parse_insert(&json!({
        "$data": {
            "#id": "U1",
            "OriginatingAgency": "AG1",
            "Title": "Fonds ministère des finances",
            "DescriptionLevel": "fonds"
        }
    }))
    .unwrap();
    p.mutations.insert(ctx, &root).await.unwrap();

    let child = parse_insert(&json!({
        "$roots": ["U1"],
        "$data": {
            "#id": "U2",
            "OriginatingAgency": "AG2",
            "Title": "Annual budgetary report 1998",
            "DescriptionLevel": "item"
        }
    }))
    .unwrap();
    p.mutations.insert(ctx, &child).await.unwrap();

    // The child's stored body carries the full derived closure.
    let doc = p.store.get(0, RecordKind::Units, "U2").await.unwrap().unwrap();
    assert_eq!(doc.get("_up"), Some(&json!(["U1"])));
    assert_eq!(doc.get("_us"), Some(&json!(["U1"])));
    assert_eq!(doc.get("_min"), Some(&json!(2)));
    assert_eq!(doc.get("_sps"), Some(&json!(["AG1", "AG2"])));
    assert_eq!(
        p.sink.events().iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
        vec!["U2"]
    );

    // Structural select under the root, one hop down.
    let select = parse_select(&json!({
        "$roots": ["U1"],
        "$query": [{ "$eq": { "DescriptionLevel": "item" }, "$depth": 1 }],
        "$projection": { "$fields": { "Title": 1 } }
    }))
    .unwrap();
    let result = p.queries.select(ctx, &select).await.unwrap();
    assert_eq!(result.ids, vec!["U2"]);
    assert_eq!(result.kind, Some(RecordKind::Units));
    assert!(result.documents[0].contains_key("Title"));

    // Full-text needs an index refresh first.
    let search = parse_select(&json!({
        "$query": [{ "$match": { "Title": "budget 1998" } }]
    }))
    .unwrap();
    assert!(p.queries.select(ctx, &search).await.unwrap().ids.is_empty());
    p.index.refresh().await.unwrap();
    assert_eq!(p.queries.select(ctx, &search).await.unwrap().ids, vec!["U2"]);

    // Another tenant sees nothing.
    let other = RequestContext::new(9);
    assert!(p.queries.select(other, &search).await.unwrap().ids.is_empty());

    // Update through the same stage machinery.
    let update = parse_update(&json!({
        "$query": [{ "$path": ["U2"] }],
        "$action": [{ "$set": { "DescriptionLevel": "file" } }]
    }))
    .unwrap();
    assert_eq!(p.mutations.update(ctx, &update).await.unwrap().matched, 1);
    let doc = p.store.get(0, RecordKind::Units, "U2").await.unwrap().unwrap();
    assert_eq!(doc.get("DescriptionLevel"), Some(&json!("file")));
    assert_eq!(doc.get("_v"), Some(&json!(1)));

    // Deleting the root orphans the child; the repair sink hears about it.
    let delete = parse_delete(&json!({
        "$query": [{ "$path": ["U1"] }]
    }))
    .unwrap();
    assert_eq!(p.mutations.delete(ctx, &delete).await.unwrap().matched, 1);
    assert!(p.store.get(0, RecordKind::Units, "U1").await.unwrap().is_none());
    assert!(p
        .sink
        .events()
        .iter()
        .any(|e| e.id == "U2" && e.parents.is_empty()));
}

#[tokio::test]
async fn test_insert_only_leaves_keep_the_graph_acyclic() {
    let p = platform();
    let ctx = RequestContext::new(0);

    for (id, roots) in [("A", vec![]), ("B", vec!["A"])] {
        let req = parse_insert(&json!({
            "$roots": roots,
            "$data": { "#id": id, "OriginatingAgency": "AG1" }
        }))
        .unwrap();
        p.mutations.insert(ctx, &req).await.unwrap();
    }

    // "A under B" would close the loop A → B → A.
    let looped = parse_insert(&json!({
        "$roots": ["B"],
        "$data": { "#id": "A", "OriginatingAgency": "AG1" }
    }))
    .unwrap();
    let err = p.mutations.insert(ctx, &looped).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists { .. }));

    // A fresh record pointing at both ends of a chain is fine (diamond),
    // but making an existing ancestor a child is not expressible at all:
    // inserts only ever create new leaves, so the closure stays acyclic.
    let diamond = parse_insert(&json!({
        "$roots": ["A", "B"],
        "$data": { "#id": "C", "OriginatingAgency": "AG2" }
    }))
    .unwrap();
    p.mutations.insert(ctx, &diamond).await.unwrap();
    let doc = p.store.get(0, RecordKind::Units, "C").await.unwrap().unwrap();
    assert_eq!(doc.get("_min"), Some(&json!(2)));
    assert_eq!(doc.get("_max"), Some(&json!(3)));
}

#[tokio::test]
async fn test_object_group_hint_switches_collections() {
    let p = platform();
    let ctx = RequestContext::new(0);

    let unit = parse_insert(&json!({
        "$data": { "#id": "U1", "OriginatingAgency": "AG1", "Title": "unit" }
    }))
    .unwrap();
    p.mutations.insert(ctx, &unit).await.unwrap();

    let group = parse_insert(&json!({
        "$query": [{ "$exists": "#id", "$hint": "objectgroups" }],
        "$data": { "#id": "G1", "OriginatingAgency": "AG1", "Title": "group" }
    }))
    .unwrap();
    p.mutations.insert(ctx, &group).await.unwrap();

    let groups = parse_select(&json!({
        "$query": [{ "$exists": "Title", "$hint": "objectgroups" }]
    }))
    .unwrap();
    let result = p.queries.select(ctx, &groups).await.unwrap();
    assert_eq!(result.kind, Some(RecordKind::ObjectGroups));
    assert_eq!(result.ids, vec!["G1"]);

    let units = parse_select(&json!({
        "$query": [{ "$exists": "Title" }]
    }))
    .unwrap();
    assert_eq!(p.queries.select(ctx, &units).await.unwrap().ids, vec!["U1"]);
}
