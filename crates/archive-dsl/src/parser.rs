//! Wire-format parser: JSON request trees → [`Request`].
//!
//! The parser is a recursive walk over the document tree. It performs no
//! I/O and knows nothing about backends; everything it rejects is a
//! [`MalformedRequest`] with a reason string, surfaced to the caller and
//! never retried.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::request::{
    Action, CompareOp, DeleteRequest, InsertRequest, Projection, Query, RecordKind, Request,
    SelectFilter, SelectRequest, SortDir, Stage, UpdateRequest,
};

/// DSL parse failure. Not retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed request: {reason}")]
pub struct MalformedRequest {
    pub reason: String,
}

fn malformed(reason: impl Into<String>) -> MalformedRequest {
    MalformedRequest {
        reason: reason.into(),
    }
}

// ============================================================================
// Request kinds
// ============================================================================

/// Parse a Select request: `$roots`, `$query`, optional `$projection` and
/// `$filter`.
pub fn parse_select(value: &Value) -> Result<SelectRequest, MalformedRequest> {
    let obj = top_level(value, &["$roots", "$query", "$projection", "$filter"], "select")?;
    let (roots, stages) = roots_and_stages(obj)?;
    let projection = match obj.get("$projection") {
        Some(p) => parse_projection(p)?,
        None => Projection::All,
    };
    let filter = match obj.get("$filter") {
        Some(f) => parse_filter(f)?,
        None => SelectFilter::default(),
    };
    Ok(SelectRequest {
        roots,
        stages,
        projection,
        filter,
    })
}

/// Parse an Insert request: `$roots`, `$query`, mandatory `$data`.
pub fn parse_insert(value: &Value) -> Result<InsertRequest, MalformedRequest> {
    let obj = top_level(value, &["$roots", "$query", "$data"], "insert")?;
    let (roots, stages) = roots_and_stages(obj)?;
    let data = obj
        .get("$data")
        .ok_or_else(|| malformed("insert requires $data"))?
        .as_object()
        .ok_or_else(|| malformed("$data must be an object"))?
        .clone();
    Ok(InsertRequest {
        roots,
        stages,
        data,
    })
}

/// Parse an Update request: `$roots`, `$query`, mandatory non-empty
/// `$action`.
pub fn parse_update(value: &Value) -> Result<UpdateRequest, MalformedRequest> {
    let obj = top_level(value, &["$roots", "$query", "$action"], "update")?;
    let (roots, stages) = roots_and_stages(obj)?;
    let actions = obj
        .get("$action")
        .ok_or_else(|| malformed("update requires $action"))?
        .as_array()
        .ok_or_else(|| malformed("$action must be an array"))?
        .iter()
        .map(parse_action)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    if actions.is_empty() {
        return Err(malformed("update requires at least one action"));
    }
    Ok(UpdateRequest {
        roots,
        stages,
        actions,
    })
}

/// Parse a Delete request: `$roots` and `$query` only.
pub fn parse_delete(value: &Value) -> Result<DeleteRequest, MalformedRequest> {
    let obj = top_level(value, &["$roots", "$query"], "delete")?;
    let (roots, stages) = roots_and_stages(obj)?;
    Ok(DeleteRequest { roots, stages })
}

impl Request {
    /// Dispatch on the request body shape: `$data` marks an Insert,
    /// `$action` an Update; `delete` must be requested explicitly via
    /// [`parse_delete`] since it is Select-shaped.
    pub fn parse_query_body(value: &Value) -> Result<Request, MalformedRequest> {
        let obj = value
            .as_object()
            .ok_or_else(|| malformed("request must be an object"))?;
        let has_data = obj.contains_key("$data");
        let has_action = obj.contains_key("$action");
        if has_data && has_action {
            return Err(malformed("$data and $action cannot be combined"));
        }
        if has_action && obj.contains_key("$projection") {
            return Err(malformed("$projection and $action cannot be combined"));
        }
        if has_data {
            Ok(Request::Insert(parse_insert(value)?))
        } else if has_action {
            Ok(Request::Update(parse_update(value)?))
        } else {
            Ok(Request::Select(parse_select(value)?))
        }
    }
}

fn top_level<'a>(
    value: &'a Value,
    allowed: &[&str],
    kind: &str,
) -> Result<&'a Map<String, Value>, MalformedRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed(format!("{kind} request must be an object")))?;
    for key in obj.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(malformed(format!("{key} is not part of a {kind} request")));
        }
    }
    Ok(obj)
}

fn roots_and_stages(obj: &Map<String, Value>) -> Result<(Vec<String>, Vec<Stage>), MalformedRequest> {
    let roots = match obj.get("$roots") {
        None => Vec::new(),
        Some(v) => v
            .as_array()
            .ok_or_else(|| malformed("$roots must be an array of ids"))?
            .iter()
            .map(|id| {
                id.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("$roots entries must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()?,
    };
    let stages = match obj.get("$query") {
        None => Vec::new(),
        Some(v) => v
            .as_array()
            .ok_or_else(|| malformed("$query must be an array of stages"))?
            .iter()
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok((roots, stages))
}

// ============================================================================
// Stages and predicate trees
// ============================================================================

fn parse_stage(value: &Value) -> Result<Stage, MalformedRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("stage must be an object"))?;

    let depth_limit = match obj.get("$depth") {
        None => None,
        Some(d) => Some(
            d.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| malformed("$depth must be a non-negative integer"))?,
        ),
    };
    let hint = match obj.get("$hint") {
        None => None,
        Some(h) => Some(match h.as_str() {
            Some("units") => RecordKind::Units,
            Some("objectgroups") => RecordKind::ObjectGroups,
            _ => return Err(malformed("$hint must be \"units\" or \"objectgroups\"")),
        }),
    };

    let operators: Vec<(&String, &Value)> = obj
        .iter()
        .filter(|(k, _)| k.as_str() != "$depth" && k.as_str() != "$hint")
        .collect();
    let (key, body) = match operators.as_slice() {
        [single] => *single,
        [] => return Err(malformed("stage has no query operator")),
        _ => return Err(malformed("stage must hold exactly one query operator")),
    };
    let query = parse_operator(key, body)?;

    // A full-text leaf with a zero hop budget and no kind hint cannot
    // resolve to any eligible record kind.
    if query.has_fulltext() && depth_limit == Some(0) && hint.is_none() {
        return Err(malformed(
            "$match with $depth 0 and no $hint resolves to no record kind",
        ));
    }

    Ok(Stage {
        query,
        depth_limit,
        hint,
    })
}

fn parse_nested(value: &Value) -> Result<Query, MalformedRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("query node must be an object"))?;
    match obj.iter().collect::<Vec<_>>().as_slice() {
        [(key, body)] => parse_operator(key, body),
        _ => Err(malformed("query node must hold exactly one operator")),
    }
}

fn parse_operator(key: &str, body: &Value) -> Result<Query, MalformedRequest> {
    match key {
        "$and" | "$or" => {
            let queries = body
                .as_array()
                .ok_or_else(|| malformed(format!("{key} body must be an array")))?
                .iter()
                .map(parse_nested)
                .collect::<Result<Vec<_>, _>>()?;
            if queries.is_empty() {
                return Err(malformed(format!("{key} requires at least one operand")));
            }
            Ok(if key == "$and" {
                Query::And { queries }
            } else {
                Query::Or { queries }
            })
        }
        "$eq" | "$ne" => {
            let (field, value) = single_pair(key, body)?;
            Ok(if key == "$eq" {
                Query::Eq { field, value }
            } else {
                Query::Ne { field, value }
            })
        }
        "$in" | "$nin" => {
            let (field, value) = single_pair(key, body)?;
            let values = value
                .as_array()
                .ok_or_else(|| malformed(format!("{key} values must be an array")))?
                .clone();
            Ok(if key == "$in" {
                Query::In { field, values }
            } else {
                Query::Nin { field, values }
            })
        }
        "$exists" | "$missing" | "$isNull" => {
            let field = body
                .as_str()
                .ok_or_else(|| malformed(format!("{key} takes a field name")))?
                .to_string();
            Ok(match key {
                "$exists" => Query::Exists { field },
                "$missing" => Query::Missing { field },
                _ => Query::IsNull { field },
            })
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let (field, value) = single_pair(key, body)?;
            Ok(Query::Compare {
                op: compare_op(key),
                field,
                value,
            })
        }
        "$range" => {
            let (field, spec) = single_pair(key, body)?;
            let spec = spec
                .as_object()
                .ok_or_else(|| malformed("$range bounds must be an object"))?;
            let mut bounds = Vec::new();
            for (op_key, bound) in spec {
                match op_key.as_str() {
                    "$gt" | "$gte" | "$lt" | "$lte" => {
                        bounds.push((compare_op(op_key), bound.clone()));
                    }
                    other => {
                        return Err(malformed(format!("{other} is not a range bound")));
                    }
                }
            }
            if bounds.is_empty() {
                return Err(malformed("$range requires at least one bound"));
            }
            Ok(Query::Range {
                field,
                bounds,
            })
        }
        "$term" => {
            let terms = body
                .as_object()
                .ok_or_else(|| malformed("$term body must be an object"))?;
            if terms.is_empty() {
                return Err(malformed("$term requires at least one pair"));
            }
            Ok(Query::Term {
                terms: terms
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
        }
        "$match" => {
            let (field, value) = single_pair(key, body)?;
            let text = value
                .as_str()
                .ok_or_else(|| malformed("$match text must be a string"))?
                .to_string();
            Ok(Query::Match { field, text })
        }
        "$size" => {
            let (field, value) = single_pair(key, body)?;
            let size = value
                .as_u64()
                .ok_or_else(|| malformed("$size takes a non-negative length"))?;
            Ok(Query::Size { field, size })
        }
        "$path" => {
            let ids = body
                .as_array()
                .ok_or_else(|| malformed("$path body must be an array of ids"))?
                .iter()
                .map(|id| {
                    id.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| malformed("$path ids must be strings"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if ids.is_empty() {
                return Err(malformed("$path requires at least one id"));
            }
            Ok(Query::Path { ids })
        }
        other => Err(malformed(format!("unknown query operator {other}"))),
    }
}

fn compare_op(key: &str) -> CompareOp {
    match key {
        "$gt" => CompareOp::Gt,
        "$gte" => CompareOp::Gte,
        "$lt" => CompareOp::Lt,
        _ => CompareOp::Lte,
    }
}

fn single_pair(key: &str, body: &Value) -> Result<(String, Value), MalformedRequest> {
    let obj = body
        .as_object()
        .ok_or_else(|| malformed(format!("{key} body must be an object")))?;
    match obj.iter().collect::<Vec<_>>().as_slice() {
        [(field, value)] => Ok(((*field).clone(), (*value).clone())),
        _ => Err(malformed(format!("{key} takes exactly one field"))),
    }
}

// ============================================================================
// Projection, filter, actions
// ============================================================================

fn parse_projection(value: &Value) -> Result<Projection, MalformedRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("$projection must be an object"))?;
    let Some(fields) = obj.get("$fields") else {
        return Err(malformed("$projection requires $fields"));
    };
    let fields = fields
        .as_object()
        .ok_or_else(|| malformed("$fields must be an object"))?;
    if fields.is_empty() {
        return Ok(Projection::All);
    }
    let mut names = Vec::new();
    for (name, flag) in fields {
        if flag.as_u64() != Some(1) {
            return Err(malformed("$fields is an allow-list: values must be 1"));
        }
        names.push(name.clone());
    }
    Ok(Projection::Fields { names })
}

fn parse_filter(value: &Value) -> Result<SelectFilter, MalformedRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("$filter must be an object"))?;
    let mut filter = SelectFilter::default();
    for (key, body) in obj {
        match key.as_str() {
            "$orderby" => {
                // Array of single-pair objects so the sort-key order is
                // preserved on the wire.
                let entries = body
                    .as_array()
                    .ok_or_else(|| malformed("$orderby must be an array"))?;
                for entry in entries {
                    let (field, dir) = single_pair("$orderby", entry)?;
                    let dir = match dir.as_i64() {
                        Some(1) => SortDir::Asc,
                        Some(-1) => SortDir::Desc,
                        _ => return Err(malformed("$orderby direction must be 1 or -1")),
                    };
                    filter.order_by.push((field, dir));
                }
            }
            "$limit" => {
                filter.limit = Some(
                    body.as_u64()
                        .ok_or_else(|| malformed("$limit must be a non-negative integer"))?,
                );
            }
            "$offset" => {
                filter.offset = Some(
                    body.as_u64()
                        .ok_or_else(|| malformed("$offset must be a non-negative integer"))?,
                );
            }
            other => return Err(malformed(format!("unknown filter {other}"))),
        }
    }
    Ok(filter)
}

fn parse_action(value: &Value) -> Result<Vec<Action>, MalformedRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("action must be an object"))?;
    let (key, body) = match obj.iter().collect::<Vec<_>>().as_slice() {
        [single] => *single,
        _ => return Err(malformed("action must hold exactly one operator")),
    };
    match key.as_str() {
        "$set" => {
            let pairs = body
                .as_object()
                .ok_or_else(|| malformed("$set body must be an object"))?;
            Ok(pairs
                .iter()
                .map(|(field, value)| Action::Set {
                    field: field.clone(),
                    value: value.clone(),
                })
                .collect())
        }
        "$unset" => {
            let fields = body
                .as_array()
                .ok_or_else(|| malformed("$unset body must be an array of field names"))?;
            fields
                .iter()
                .map(|f| {
                    f.as_str()
                        .map(|field| Action::Unset {
                            field: field.to_string(),
                        })
                        .ok_or_else(|| malformed("$unset entries must be strings"))
                })
                .collect()
        }
        "$inc" => {
            let (field, delta) = single_pair("$inc", body)?;
            let delta = delta
                .as_i64()
                .ok_or_else(|| malformed("$inc delta must be an integer"))?;
            Ok(vec![Action::Inc { field, delta }])
        }
        "$min" => {
            let (field, value) = single_pair("$min", body)?;
            Ok(vec![Action::Min { field, value }])
        }
        "$push" | "$add" => {
            let (field, value) = single_pair(key, body)?;
            let values = each_values(value);
            Ok(vec![if key == "$push" {
                Action::Push { field, values }
            } else {
                Action::AddToSet { field, values }
            }])
        }
        other => Err(malformed(format!("unknown action {other}"))),
    }
}

/// `$push`/`$add` accept either one value or `{"$each": [v, ...]}`.
fn each_values(value: Value) -> Vec<Value> {
    if let Some(each) = value.as_object().and_then(|o| o.get("$each")) {
        if let Some(items) = each.as_array() {
            return items.clone();
        }
    }
    vec![value]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_two_stage_select() {
        let req = parse_select(&json!({
            "$roots": ["U1"],
            "$query": [
                { "$term": { "Title": "budget" }, "$depth": 1, "$hint": "units" },
                { "$and": [ { "$eq": { "Status": "filed" } },
                            { "$gte": { "Year": 2001 } } ] }
            ],
            "$projection": { "$fields": { "Title": 1, "Year": 1 } },
            "$filter": { "$orderby": [ { "Year": -1 } ], "$limit": 10 }
        }))
        .expect("parse select");

        assert_eq!(req.roots, vec!["U1"]);
        assert_eq!(req.stages.len(), 2);
        assert_eq!(req.stages[0].depth_limit, Some(1));
        assert_eq!(req.stages[0].hint, Some(RecordKind::Units));
        assert!(!req.stages[1].query.has_fulltext());
        assert_eq!(
            req.projection,
            Projection::Fields {
                names: vec!["Title".to_string(), "Year".to_string()]
            }
        );
        assert_eq!(req.filter.order_by, vec![("Year".to_string(), SortDir::Desc)]);
        assert_eq!(req.filter.limit, Some(10));
    }

    #[test]
    fn match_marks_the_tree_fulltext() {
        let req = parse_select(&json!({
            "$query": [
                { "$and": [ { "$eq": { "Status": "filed" } },
                            { "$match": { "Description": "tax returns" } } ] }
            ]
        }))
        .unwrap();
        assert!(req.stages[0].query.has_fulltext());
    }

    #[test]
    fn rejects_fulltext_with_zero_depth_and_no_hint() {
        let err = parse_select(&json!({
            "$query": [ { "$match": { "Title": "x" }, "$depth": 0 } ]
        }))
        .unwrap_err();
        assert!(err.reason.contains("$match"));

        // A kind hint makes the same stage resolvable.
        parse_select(&json!({
            "$query": [ { "$match": { "Title": "x" }, "$depth": 0, "$hint": "units" } ]
        }))
        .unwrap();
    }

    #[test]
    fn rejects_mixed_parts() {
        let err = Request::parse_query_body(&json!({
            "$projection": { "$fields": { "Title": 1 } },
            "$action": [ { "$set": { "Title": "t" } } ]
        }))
        .unwrap_err();
        assert!(err.reason.contains("$projection"));

        let err = parse_select(&json!({
            "$action": [ { "$set": { "Title": "t" } } ]
        }))
        .unwrap_err();
        assert!(err.reason.contains("$action"));
    }

    #[test]
    fn parses_update_actions_in_order() {
        let req = parse_update(&json!({
            "$query": [ { "$eq": { "Status": "open" } } ],
            "$action": [
                { "$set": { "Status": "closed" } },
                { "$inc": { "Revision": 1 } },
                { "$push": { "Tags": { "$each": ["a", "b"] } } },
                { "$unset": ["Draft"] },
                { "$add": { "Agencies": "AG9" } },
                { "$min": { "Priority": 3 } }
            ]
        }))
        .expect("parse update");
        assert_eq!(req.actions.len(), 6);
        assert_eq!(req.actions[0].field(), "Status");
        assert_eq!(
            req.actions[2],
            Action::Push {
                field: "Tags".to_string(),
                values: vec![json!("a"), json!("b")]
            }
        );
    }

    #[test]
    fn parses_insert_and_delete_shapes() {
        let ins = parse_insert(&json!({
            "$roots": ["U1"],
            "$data": { "#id": "U2", "Title": "child" }
        }))
        .expect("parse insert");
        assert_eq!(ins.data.get("#id"), Some(&json!("U2")));

        parse_insert(&json!({ "$roots": [] })).unwrap_err();

        let del = parse_delete(&json!({
            "$query": [ { "$path": ["U2"] } ]
        }))
        .expect("parse delete");
        assert_eq!(del.stages[0].query.as_path(), Some(&["U2".to_string()][..]));

        parse_delete(&json!({ "$data": {} })).unwrap_err();
    }

    #[test]
    fn rejects_unknown_operators_and_bad_shapes() {
        parse_select(&json!({ "$query": [ { "$frob": { "a": 1 } } ] })).unwrap_err();
        parse_select(&json!({ "$query": [ { "$eq": { "a": 1, "b": 2 } } ] })).unwrap_err();
        parse_select(&json!({ "$query": [ { "$and": [] } ] })).unwrap_err();
        parse_select(&json!({ "$query": [ { "$eq": { "a": 1 }, "$ne": { "b": 2 } } ] }))
            .unwrap_err();
        parse_select(&json!({ "$query": [ { "$depth": -1, "$eq": { "a": 1 } } ] })).unwrap_err();
        parse_select(&json!({ "$query": "not-an-array" })).unwrap_err();
        parse_select(&json!("not-an-object")).unwrap_err();
    }

    #[test]
    fn range_keeps_every_bound() {
        let req = parse_select(&json!({
            "$query": [ { "$range": { "Year": { "$gte": 1990, "$lt": 2000 } } } ]
        }))
        .unwrap();
        match &req.stages[0].query {
            Query::Range { field, bounds } => {
                assert_eq!(field, "Year");
                assert_eq!(bounds.len(), 2);
            }
            other => panic!("expected range, got {other:?}"),
        }
    }
}
