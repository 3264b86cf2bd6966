//! Closure model for the archival unit graph.
//!
//! Records form a multi-parent DAG: a unit can be attached under several
//! parent units at once, and an object group under several units. Rather
//! than walking parent chains at query time, every record carries a
//! precomputed **closure**: its full ancestor set, per-ancestor minimum hop
//! counts, shortest/longest path depth to a root, a flattened
//! `"self/ancestor"` edge index, and the union of originating agencies
//! inherited along every lineage.
//!
//! The closure is pure data plus merge functions. It is computed once, at
//! the moment a record is attached to its parents, from the parents'
//! already-computed closures; cascading recomputation of stored descendants
//! is the job of an external repair process, not this crate.
//!
//! Conventions (kept deliberately, they drive depth-limited query
//! semantics):
//! - an unparented record has `min_depth == max_depth == 1` ("own depth");
//! - a direct parent sits at hop count 1 in `depth_layers`;
//! - multiple paths to the same ancestor collapse to the minimum hop count.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

// ============================================================================
// Reserved document field names
// ============================================================================

/// Direct parents: `_up: [id, ...]`.
pub const UP: &str = "_up";
/// Ancestor set (transitive closure of `_up`): `_us: [id, ...]`.
pub const US: &str = "_us";
/// Depth layers: `_uds: { ancestor_id: hops, ... }` (minimum hops per id).
pub const UDS: &str = "_uds";
/// Shortest path length to a root: `_min: n`.
pub const MIN: &str = "_min";
/// Longest path length to a root: `_max: n`.
pub const MAX: &str = "_max";
/// Flattened edge pairs: `_graph: ["self/ancestor", ...]`.
pub const GRAPH: &str = "_graph";
/// Originating agencies, own plus inherited: `_sps: [agency, ...]`.
pub const SPS: &str = "_sps";

/// All closure-owned field names, in document order.
pub const COMPUTED_FIELDS: &[&str] = &[UP, US, UDS, MIN, MAX, GRAPH, SPS];

// ============================================================================
// Errors
// ============================================================================

/// Attaching a parent whose closure already contains the child would create
/// a cycle. The closure is left unmodified when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cycle detected: {parent} is a descendant of (or equal to) {child}")]
pub struct CycleDetected {
    pub child: String,
    pub parent: String,
}

// ============================================================================
// Closure
// ============================================================================

/// The computed ancestry of one record.
///
/// `add_parent` is idempotent and order-insensitive: building the same DAG
/// through any sequence of merges yields an identical closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    self_id: String,
    direct_parents: BTreeSet<String>,
    ancestors: BTreeSet<String>,
    /// ancestor id -> minimum hop count (direct parent = 1).
    depth_layers: BTreeMap<String, u32>,
    min_depth: u32,
    max_depth: u32,
    graph_edges: BTreeSet<String>,
    originating_agencies: BTreeSet<String>,
}

impl Closure {
    /// Closure of an unparented record. Depth is 1 by convention.
    pub fn new(self_id: impl Into<String>, own_agency: impl Into<String>) -> Self {
        let mut originating_agencies = BTreeSet::new();
        originating_agencies.insert(own_agency.into());
        Self {
            self_id: self_id.into(),
            direct_parents: BTreeSet::new(),
            ancestors: BTreeSet::new(),
            depth_layers: BTreeMap::new(),
            min_depth: 1,
            max_depth: 1,
            graph_edges: BTreeSet::new(),
            originating_agencies,
        }
    }

    /// Merge a direct parent's closure into this one.
    ///
    /// All-or-nothing: on `CycleDetected` the closure is unchanged. Safe to
    /// call repeatedly with the same parent (set semantics throughout).
    pub fn add_parent(&mut self, parent: &Closure) -> Result<(), CycleDetected> {
        if parent.self_id == self.self_id || parent.ancestors.contains(&self.self_id) {
            return Err(CycleDetected {
                child: self.self_id.clone(),
                parent: parent.self_id.clone(),
            });
        }

        let first_parent = self.direct_parents.is_empty();
        self.direct_parents.insert(parent.self_id.clone());

        // Parent at hop 1, parent's own layers shifted by one hop, keeping
        // the minimum per ancestor across all paths.
        merge_layer(&mut self.depth_layers, &parent.self_id, 1);
        for (ancestor, hops) in &parent.depth_layers {
            merge_layer(&mut self.depth_layers, ancestor, hops + 1);
        }

        self.ancestors.insert(parent.self_id.clone());
        self.ancestors.extend(parent.ancestors.iter().cloned());

        self.originating_agencies
            .extend(parent.originating_agencies.iter().cloned());

        // min/max are over full paths, so they come from the parents'
        // min/max rather than from the collapsed layers.
        let (min, max) = (parent.min_depth + 1, parent.max_depth + 1);
        if first_parent {
            self.min_depth = min;
            self.max_depth = max;
        } else {
            self.min_depth = self.min_depth.min(min);
            self.max_depth = self.max_depth.max(max);
        }

        for ancestor in &self.ancestors {
            self.graph_edges.insert(edge(&self.self_id, ancestor));
        }
        Ok(())
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn direct_parents(&self) -> &BTreeSet<String> {
        &self.direct_parents
    }

    pub fn ancestors(&self) -> &BTreeSet<String> {
        &self.ancestors
    }

    pub fn depth_layers(&self) -> &BTreeMap<String, u32> {
        &self.depth_layers
    }

    pub fn min_depth(&self) -> u32 {
        self.min_depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn graph_edges(&self) -> &BTreeSet<String> {
        &self.graph_edges
    }

    pub fn originating_agencies(&self) -> &BTreeSet<String> {
        &self.originating_agencies
    }

    /// Minimum hop count to `ancestor_id`, if it is an ancestor at all.
    pub fn depth_of(&self, ancestor_id: &str) -> Option<u32> {
        self.depth_layers.get(ancestor_id).copied()
    }

    /// True if some id in `roots` is reachable within `limit` hops, or is
    /// this record itself (a record is always eligible from its own id).
    pub fn within_depth<'a, I>(&self, roots: I, limit: u32) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        roots.into_iter().any(|root| {
            root == self.self_id || self.depth_layers.get(root).is_some_and(|d| *d <= limit)
        })
    }

    // ------------------------------------------------------------------
    // Document embedding
    // ------------------------------------------------------------------

    /// Write the computed fields into a document body under the reserved
    /// `_*` names. Overwrites any previous values.
    pub fn embed(&self, doc: &mut Map<String, Value>) {
        doc.insert(UP.to_string(), json!(self.direct_parents));
        doc.insert(US.to_string(), json!(self.ancestors));
        doc.insert(UDS.to_string(), json!(self.depth_layers));
        doc.insert(MIN.to_string(), json!(self.min_depth));
        doc.insert(MAX.to_string(), json!(self.max_depth));
        doc.insert(GRAPH.to_string(), json!(self.graph_edges));
        doc.insert(SPS.to_string(), json!(self.originating_agencies));
    }

    /// Rebuild a closure from a stored document. Returns `None` when the
    /// reserved fields are absent or malformed (hand-edited documents).
    pub fn from_document(self_id: &str, doc: &Map<String, Value>) -> Option<Self> {
        let direct_parents = string_set(doc.get(UP)?)?;
        let ancestors = string_set(doc.get(US)?)?;
        let depth_layers = doc
            .get(UDS)?
            .as_object()?
            .iter()
            .map(|(k, v)| Some((k.clone(), u32::try_from(v.as_u64()?).ok()?)))
            .collect::<Option<BTreeMap<_, _>>>()?;
        let min_depth = u32::try_from(doc.get(MIN)?.as_u64()?).ok()?;
        let max_depth = u32::try_from(doc.get(MAX)?.as_u64()?).ok()?;
        let graph_edges = string_set(doc.get(GRAPH)?)?;
        let originating_agencies = string_set(doc.get(SPS)?)?;
        Some(Self {
            self_id: self_id.to_string(),
            direct_parents,
            ancestors,
            depth_layers,
            min_depth,
            max_depth,
            graph_edges,
            originating_agencies,
        })
    }
}

fn merge_layer(layers: &mut BTreeMap<String, u32>, ancestor: &str, hops: u32) {
    layers
        .entry(ancestor.to_string())
        .and_modify(|d| *d = (*d).min(hops))
        .or_insert(hops);
}

fn edge(child: &str, ancestor: &str) -> String {
    format!("{child}/{ancestor}")
}

fn string_set(value: &Value) -> Option<BTreeSet<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn child_of(id: &str, agency: &str, parents: &[&Closure]) -> Closure {
        let mut c = Closure::new(id, agency);
        for p in parents {
            c.add_parent(p).expect("attach parent");
        }
        c
    }

    #[test]
    fn unparented_root_has_own_depth_one() {
        let root = Closure::new("D", "AG0");
        assert_eq!(root.min_depth(), 1);
        assert_eq!(root.max_depth(), 1);
        assert!(root.ancestors().is_empty());
        assert!(root.originating_agencies().contains("AG0"));
    }

    #[test]
    fn chain_depth_counts_every_hop() {
        // Root D carries its own depth 1, so each link below adds one.
        let d = Closure::new("D", "AG0");
        let c = child_of("C", "AG0", &[&d]);
        let b = child_of("B", "AG0", &[&c]);
        let a = child_of("A", "AG0", &[&b]);
        assert_eq!(a.min_depth(), 4);
        assert_eq!(a.max_depth(), 4);
        assert_eq!(a.depth_of("B"), Some(1));
        assert_eq!(a.depth_of("C"), Some(2));
        assert_eq!(a.depth_of("D"), Some(3));
        assert_eq!(
            a.ancestors().iter().cloned().collect::<Vec<_>>(),
            vec!["B", "C", "D"]
        );
    }

    #[test]
    fn diamond_collapses_to_min_depth_per_ancestor() {
        let d = Closure::new("D", "AG0");
        let b = child_of("B", "AG0", &[&d]);
        let c = child_of("C", "AG0", &[&d]);
        let a = child_of("A", "AG0", &[&b, &c]);
        assert_eq!(a.min_depth(), 3);
        assert_eq!(a.max_depth(), 3);
        assert_eq!(a.depth_of("D"), Some(2));
    }

    #[test]
    fn uneven_diamond_keeps_min_and_max_apart() {
        // A -> B -> D and A -> C -> E -> D: shortest path two links,
        // longest three, on top of the root's own depth 1.
        let d = Closure::new("D", "AG0");
        let b = child_of("B", "AG0", &[&d]);
        let e = child_of("E", "AG0", &[&d]);
        let c = child_of("C", "AG0", &[&e]);
        let a = child_of("A", "AG0", &[&b, &c]);
        assert_eq!(a.min_depth(), 3);
        assert_eq!(a.max_depth(), 4);
        assert_eq!(a.depth_of("D"), Some(2));
    }

    #[test]
    fn re_attach_is_idempotent() {
        let p = Closure::new("P", "AG1");
        let mut once = Closure::new("X", "AG2");
        once.add_parent(&p).unwrap();
        let mut twice = once.clone();
        twice.add_parent(&p).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_order_does_not_matter() {
        let r = Closure::new("R", "AG0");
        let p = child_of("P", "AG1", &[&r]);
        let q = child_of("Q", "AG2", &[&r]);
        let pq = child_of("X", "AG3", &[&p, &q]);
        let qp = child_of("X", "AG3", &[&q, &p]);
        assert_eq!(pq, qp);
    }

    #[test]
    fn cycle_rejection_leaves_closure_untouched() {
        let top = Closure::new("T", "AG0");
        let mut mid = Closure::new("M", "AG0");
        mid.add_parent(&top).unwrap();
        let snapshot = mid.clone();

        let mut bottom = Closure::new("B", "AG0");
        bottom.add_parent(&mid).unwrap();

        let err = mid.add_parent(&bottom).unwrap_err();
        assert_eq!(err.child, "M");
        assert_eq!(err.parent, "B");
        assert_eq!(mid, snapshot);

        // Self-parenting is the degenerate cycle.
        let clone = mid.clone();
        assert!(mid.add_parent(&clone).is_err());
    }

    #[test]
    fn agencies_propagate_from_every_lineage() {
        let left = Closure::new("L", "AG1");
        let right = Closure::new("R", "AG2");
        let x = child_of("X", "AG3", &[&left, &right]);
        let got: Vec<_> = x.originating_agencies().iter().cloned().collect();
        assert_eq!(got, vec!["AG1", "AG2", "AG3"]);
    }

    #[test]
    fn graph_edges_index_every_ancestor_pair() {
        let r = Closure::new("R", "AG0");
        let p = child_of("P", "AG0", &[&r]);
        let x = child_of("X", "AG0", &[&p]);
        let edges: Vec<_> = x.graph_edges().iter().cloned().collect();
        assert_eq!(edges, vec!["X/P", "X/R"]);
    }

    #[test]
    fn within_depth_honors_limit_and_self() {
        let r = Closure::new("R", "AG0");
        let p = child_of("P", "AG0", &[&r]);
        let x = child_of("X", "AG0", &[&p]);
        assert!(x.within_depth(["P"], 1));
        assert!(!x.within_depth(["R"], 1));
        assert!(x.within_depth(["R"], 2));
        assert!(x.within_depth(["X"], 0));
    }

    #[test]
    fn embeds_and_reloads_through_a_document() {
        let r = Closure::new("R", "AG0");
        let x = child_of("X", "AG1", &[&r]);
        let mut doc = Map::new();
        x.embed(&mut doc);
        assert_eq!(doc.get(MIN), Some(&json!(2)));
        let back = Closure::from_document("X", &doc).expect("reload closure");
        assert_eq!(back, x);
    }
}
