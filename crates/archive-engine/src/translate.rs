//! Predicate-tree translators, one per backend target, plus the document
//! evaluators used by the planner's post-filter and the in-memory store.
//!
//! Each translator is an explicit recursive function over the `Query`
//! tagged union. A translation failure (full-text leaf sent to the
//! document store, unknown `#` field) is a backend-boundary error and
//! surfaces as `ExecutionFailed`.

use serde_json::{Map, Value};

use archive_dsl::{Action, CompareOp, Query};

use crate::backend::{BackendError, IndexQuery, StoreFilter, StoreUpdate, UpdateOp};
use crate::fulltext::{all_tokens_match, tokenize};
use crate::{FIELD_ID, FIELD_TENANT, FIELD_VERSION};

// ============================================================================
// Wire field names
// ============================================================================

/// Map an external `#name` to its reserved document field. Plain names pass
/// through untouched.
pub(crate) fn map_field(name: &str) -> Option<String> {
    if let Some(short) = name.strip_prefix('#') {
        let mapped = match short {
            "id" => FIELD_ID,
            "tenant" => FIELD_TENANT,
            "version" => FIELD_VERSION,
            "min" => archive_graph::MIN,
            "max" => archive_graph::MAX,
            "up" => archive_graph::UP,
            "agencies" => archive_graph::SPS,
            _ => return None,
        };
        return Some(mapped.to_string());
    }
    Some(name.to_string())
}

fn field(name: &str) -> Result<String, BackendError> {
    map_field(name).ok_or_else(|| BackendError::msg(format!("unknown wire field {name}")))
}

// ============================================================================
// Document-store translation
// ============================================================================

/// Translate a structural predicate tree to the store's filter form.
pub fn to_store_filter(query: &Query) -> Result<StoreFilter, BackendError> {
    match query {
        Query::And { queries } => Ok(StoreFilter::And {
            filters: queries
                .iter()
                .map(to_store_filter)
                .collect::<Result<_, _>>()?,
        }),
        Query::Or { queries } => Ok(StoreFilter::Or {
            filters: queries
                .iter()
                .map(to_store_filter)
                .collect::<Result<_, _>>()?,
        }),
        Query::Eq { field: f, value } => Ok(StoreFilter::Eq {
            field: field(f)?,
            value: value.clone(),
        }),
        Query::Ne { field: f, value } => Ok(StoreFilter::Ne {
            field: field(f)?,
            value: value.clone(),
        }),
        Query::In { field: f, values } => Ok(StoreFilter::In {
            field: field(f)?,
            values: values.clone(),
        }),
        Query::Nin { field: f, values } => Ok(StoreFilter::Nin {
            field: field(f)?,
            values: values.clone(),
        }),
        Query::Exists { field: f } => Ok(StoreFilter::Exists { field: field(f)? }),
        Query::Missing { field: f } => Ok(StoreFilter::Missing { field: field(f)? }),
        Query::IsNull { field: f } => Ok(StoreFilter::Null { field: field(f)? }),
        Query::Compare { op, field: f, value } => Ok(StoreFilter::Cmp {
            op: *op,
            field: field(f)?,
            value: value.clone(),
        }),
        Query::Range { field: f, bounds } => {
            let f = field(f)?;
            Ok(StoreFilter::And {
                filters: bounds
                    .iter()
                    .map(|(op, value)| StoreFilter::Cmp {
                        op: *op,
                        field: f.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            })
        }
        // Exact terms are AND-implicit equality on unanalyzed values.
        Query::Term { terms } => Ok(StoreFilter::And {
            filters: terms
                .iter()
                .map(|(f, value)| {
                    Ok(StoreFilter::Eq {
                        field: field(f)?,
                        value: value.clone(),
                    })
                })
                .collect::<Result<_, BackendError>>()?,
        }),
        Query::Size { field: f, size } => Ok(StoreFilter::Size {
            field: field(f)?,
            size: *size,
        }),
        Query::Match { .. } => Err(BackendError::msg(
            "full-text predicate cannot run on the document store",
        )),
        Query::Path { .. } => Err(BackendError::msg(
            "path lookup is resolved by the planner, not the store",
        )),
    }
}

// ============================================================================
// Search-index translation
// ============================================================================

/// Translate a predicate tree to the index's boolean form. Structural
/// leaves become `All`: the index over-approximates and the planner
/// re-checks candidates against authoritative documents.
pub fn to_index_query(query: &Query) -> Result<IndexQuery, BackendError> {
    match query {
        Query::And { queries } => {
            let mut out: Vec<IndexQuery> = Vec::new();
            for q in queries {
                match to_index_query(q)? {
                    IndexQuery::All => {}
                    other => out.push(other),
                }
            }
            Ok(match out.len() {
                0 => IndexQuery::All,
                1 => out.remove(0),
                _ => IndexQuery::And { queries: out },
            })
        }
        Query::Or { queries } => {
            let out = queries
                .iter()
                .map(to_index_query)
                .collect::<Result<Vec<_>, _>>()?;
            if out.iter().any(|q| matches!(q, IndexQuery::All)) {
                return Ok(IndexQuery::All);
            }
            Ok(IndexQuery::Or { queries: out })
        }
        Query::Match { field: f, text } => Ok(IndexQuery::Match {
            field: field(f)?,
            tokens: tokenize(text),
        }),
        Query::Term { terms } => {
            let mut out = Vec::with_capacity(terms.len());
            for (f, value) in terms {
                out.push(IndexQuery::Term {
                    field: field(f)?,
                    value: value.clone(),
                });
            }
            Ok(if out.len() == 1 {
                out.remove(0)
            } else {
                IndexQuery::And { queries: out }
            })
        }
        Query::Path { .. } => Err(BackendError::msg(
            "path lookup is resolved by the planner, not the index",
        )),
        // Structural leaves are post-filtered on store documents.
        _ => Ok(IndexQuery::All),
    }
}

// ============================================================================
// Update translation
// ============================================================================

/// Translate an action list to the store's update form.
pub fn to_store_update(actions: &[Action]) -> Result<StoreUpdate, BackendError> {
    let mut ops = Vec::with_capacity(actions.len());
    for action in actions {
        ops.push(match action {
            Action::Set { field: f, value } => UpdateOp::Set {
                field: field(f)?,
                value: value.clone(),
            },
            Action::Unset { field: f } => UpdateOp::Unset { field: field(f)? },
            Action::Inc { field: f, delta } => UpdateOp::Inc {
                field: field(f)?,
                delta: *delta,
            },
            Action::Min { field: f, value } => UpdateOp::Min {
                field: field(f)?,
                value: value.clone(),
            },
            Action::Push { field: f, values } => UpdateOp::Push {
                field: field(f)?,
                values: values.clone(),
            },
            Action::AddToSet { field: f, values } => UpdateOp::AddToSet {
                field: field(f)?,
                values: values.clone(),
            },
        });
    }
    Ok(StoreUpdate { ops })
}

// ============================================================================
// Document evaluation
// ============================================================================

/// Resolve a dotted field path inside a document body.
pub(crate) fn field_value<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut current: &Value = doc.get(path.split('.').next()?)?;
    for part in path.split('.').skip(1) {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Membership with array unwinding: an array field matches when any
/// element does.
fn value_in(doc_value: &Value, values: &[Value]) -> bool {
    match doc_value.as_array() {
        Some(items) => items
            .iter()
            .any(|item| values.iter().any(|v| value_eq(item, v))),
        None => values.iter().any(|v| value_eq(doc_value, v)),
    }
}

fn compare(op: CompareOp, doc_value: &Value, bound: &Value) -> bool {
    let ord = match (doc_value.as_f64(), bound.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (doc_value.as_str(), bound.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    };
    let Some(ord) = ord else {
        return false;
    };
    match op {
        CompareOp::Gt => ord.is_gt(),
        CompareOp::Gte => ord.is_ge(),
        CompareOp::Lt => ord.is_lt(),
        CompareOp::Lte => ord.is_le(),
    }
}

fn match_text(doc_value: Option<&Value>, text: &str) -> bool {
    let query_tokens = tokenize(text);
    let doc_tokens = match doc_value {
        Some(Value::String(s)) => tokenize(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .flat_map(tokenize)
            .collect(),
        _ => return false,
    };
    all_tokens_match(&query_tokens, &doc_tokens)
}

/// Evaluate a full predicate tree against an authoritative document.
///
/// This is the planner's post-filter for full-text-routed stages: fields
/// always come from the document store, never from the index.
pub fn matches(query: &Query, doc: &Map<String, Value>) -> bool {
    match query {
        Query::And { queries } => queries.iter().all(|q| matches(q, doc)),
        Query::Or { queries } => queries.iter().any(|q| matches(q, doc)),
        Query::Eq { field, value } => lookup(doc, field).is_some_and(|v| value_eq(v, value)),
        Query::Ne { field, value } => !lookup(doc, field).is_some_and(|v| value_eq(v, value)),
        Query::In { field, values } => lookup(doc, field).is_some_and(|v| value_in(v, values)),
        Query::Nin { field, values } => !lookup(doc, field).is_some_and(|v| value_in(v, values)),
        Query::Exists { field } => lookup(doc, field).is_some(),
        Query::Missing { field } => lookup(doc, field).is_none(),
        Query::IsNull { field } => lookup(doc, field).is_some_and(Value::is_null),
        Query::Compare { op, field, value } => {
            lookup(doc, field).is_some_and(|v| compare(*op, v, value))
        }
        Query::Range { field, bounds } => bounds.iter().all(|(op, value)| {
            lookup(doc, field).is_some_and(|v| compare(*op, v, value))
        }),
        Query::Term { terms } => terms.iter().all(|(field, value)| {
            lookup(doc, field).is_some_and(|v| value_eq(v, value))
        }),
        Query::Match { field, text } => match_text(lookup(doc, field), text),
        Query::Size { field, size } => lookup(doc, field)
            .and_then(Value::as_array)
            .is_some_and(|items| items.len() as u64 == *size),
        Query::Path { ids } => doc
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .is_some_and(|id| ids.iter().any(|i| i == id)),
    }
}

fn lookup<'a>(doc: &'a Map<String, Value>, wire_name: &str) -> Option<&'a Value> {
    let name = map_field(wire_name)?;
    field_value(doc, &name)
}

/// Evaluate a translated store filter against a stored document. Used by
/// the in-memory reference store.
pub fn eval_filter(filter: &StoreFilter, doc: &Map<String, Value>) -> bool {
    match filter {
        StoreFilter::All => true,
        StoreFilter::And { filters } => filters.iter().all(|f| eval_filter(f, doc)),
        StoreFilter::Or { filters } => filters.iter().any(|f| eval_filter(f, doc)),
        StoreFilter::Eq { field, value } => {
            field_value(doc, field).is_some_and(|v| value_eq(v, value))
        }
        StoreFilter::Ne { field, value } => {
            !field_value(doc, field).is_some_and(|v| value_eq(v, value))
        }
        StoreFilter::In { field, values } => {
            field_value(doc, field).is_some_and(|v| value_in(v, values))
        }
        StoreFilter::Nin { field, values } => {
            !field_value(doc, field).is_some_and(|v| value_in(v, values))
        }
        StoreFilter::Exists { field } => field_value(doc, field).is_some(),
        StoreFilter::Missing { field } => field_value(doc, field).is_none(),
        StoreFilter::Null { field } => field_value(doc, field).is_some_and(Value::is_null),
        StoreFilter::Cmp { op, field, value } => {
            field_value(doc, field).is_some_and(|v| compare(*op, v, value))
        }
        StoreFilter::Size { field, size } => field_value(doc, field)
            .and_then(Value::as_array)
            .is_some_and(|items| items.len() as u64 == *size),
        StoreFilter::IdIn { ids } => doc
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .is_some_and(|id| ids.contains(id)),
    }
}

/// Exact-value comparison used by the in-memory index's term queries.
pub(crate) fn index_term_eq(doc_value: &Value, value: &Value) -> bool {
    value_in(doc_value, std::slice::from_ref(value))
}

/// Tokenized match used by the in-memory index.
pub(crate) fn index_match(doc_value: Option<&Value>, tokens: &[String]) -> bool {
    let doc_tokens = match doc_value {
        Some(Value::String(s)) => tokenize(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .flat_map(tokenize)
            .collect(),
        _ => return false,
    };
    all_tokens_match(tokens, &doc_tokens)
}
