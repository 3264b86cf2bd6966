//! Query DSL for the archival metadata engine.
//!
//! A request is a JSON document tree in one of four kinds (Select, Insert,
//! Update, Delete) sharing a common scaffold:
//!
//! ```text
//! {
//!   "$roots": [ id, ... ],                    // starting scope, [] = tenant
//!   "$query": [ stage, stage, ... ],          // ordered predicate stages
//!   "$filter": { "$orderby": .., "$limit": .., "$offset": .. },
//!   "$projection": { "$fields": { name: 1, ... } },   // Select only
//!   "$action": [ { "$set": {..} }, ... ],             // Update only
//!   "$data": { ... }                                  // Insert only
//! }
//! ```
//!
//! Each stage is a combinator tree (`$and`/`$or`, arbitrarily nested) over
//! leaf predicates, annotated with an optional `$depth` hop limit and an
//! optional `$hint` restricting the stage to one record kind.
//!
//! Parsing is pure: no I/O, no backend knowledge. The output is a
//! kind-tagged [`Request`] ready for planning; routing decisions (document
//! store vs. search index) are taken downstream from [`Query::has_fulltext`].

pub mod parser;
pub mod request;

pub use parser::{parse_delete, parse_insert, parse_select, parse_update, MalformedRequest};
pub use request::{
    Action, CompareOp, DeleteRequest, InsertRequest, Projection, Query, RecordKind, Request,
    SelectFilter, SelectRequest, SortDir, Stage, UpdateRequest,
};
