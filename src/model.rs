//! Aggregated CPU call-tree model.
//!
//! Nodes live in an arena owned by the model. Children are stored top-down
//! in first-seen order; the parent link is an index used for lookups only.
//! Each thread owns its own list of root frames.

use serde::{Deserialize, Serialize};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

use crate::DumpEnvelope;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodId {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

impl MethodId {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            signature: signature.into(),
        }
    }

    /// Parses `com.acme.Foo.run` or `com.acme.Foo.run(I)V`.
    pub fn parse_qualified(s: &str) -> Option<Self> {
        let (name, signature) = match s.find('(') {
            Some(idx) => (&s[..idx], &s[idx..]),
            None => (s, ""),
        };
        let (class_name, method_name) = name.rsplit_once('.')?;
        if class_name.is_empty() || method_name.is_empty() {
            return None;
        }
        Some(Self::new(class_name, method_name, signature))
    }

    /// Matches on class and method name; the signature only counts when the
    /// query carries one.
    pub fn matches_query(&self, query: &MethodId) -> bool {
        self.class_name == query.class_name
            && self.method_name == query.method_name
            && (query.signature.is_empty() || self.signature == query.signature)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.method_name, self.signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct CallTreeNode {
    pub method: MethodId,
    pub invocation_count: u64,
    pub self_value: u64,
    pub cumulative_value: u64,
    pub thread: usize,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl CallTreeNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

#[derive(Debug, Clone)]
pub struct ThreadTree {
    pub name: String,
    roots: Vec<NodeId>,
}

impl ThreadTree {
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }
}

/// Largest values across all nodes, used to scale charts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxValues {
    pub self_value: u64,
    pub cumulative_value: u64,
    pub invocation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotSpot {
    pub method: MethodId,
    pub invocation_count: u64,
    pub self_value: u64,
    pub self_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEdge {
    pub method: MethodId,
    pub invocation_count: u64,
    pub cumulative_value: u64,
}

#[derive(Debug, Clone, Default)]
struct CallerCalleeIndex {
    callers: HashMap<MethodId, BTreeMap<MethodId, (u64, u64)>>,
    callees: HashMap<MethodId, BTreeMap<MethodId, (u64, u64)>>,
}

#[derive(Debug, Clone, Default)]
pub struct CallTreeModel {
    pub envelope: Option<DumpEnvelope>,
    threads: Vec<ThreadTree>,
    nodes: Vec<CallTreeNode>,
    max: MaxValues,
    index: OnceLock<CallerCalleeIndex>,
}

impl CallTreeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn threads(&self) -> &[ThreadTree] {
        &self.threads
    }

    pub fn node(&self, id: NodeId) -> &CallTreeNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &CallTreeNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn thread_index(&self, name: &str) -> Option<usize> {
        self.threads.iter().position(|t| t.name == name)
    }

    pub fn ensure_thread(&mut self, name: &str) -> usize {
        if let Some(idx) = self.thread_index(name) {
            return idx;
        }
        self.threads.push(ThreadTree {
            name: name.to_string(),
            roots: Vec::new(),
        });
        self.threads.len() - 1
    }

    /// Adds `count` invocations and `cumulative` time to the frame `method`
    /// below `parent` (or at the thread root), creating it on first sight.
    pub fn add_frame(
        &mut self,
        thread: usize,
        parent: Option<NodeId>,
        method: &MethodId,
        count: u64,
        cumulative: u64,
    ) -> NodeId {
        self.index = OnceLock::new();
        let siblings = match parent {
            Some(p) => &self.nodes[p.0].children,
            None => &self.threads[thread].roots,
        };
        let existing = siblings
            .iter()
            .copied()
            .find(|id| self.nodes[id.0].method == *method);
        if let Some(id) = existing {
            let node = &mut self.nodes[id.0];
            node.invocation_count = node.invocation_count.saturating_add(count);
            node.cumulative_value = node.cumulative_value.saturating_add(cumulative);
            return id;
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(CallTreeNode {
            method: method.clone(),
            invocation_count: count,
            self_value: 0,
            cumulative_value: cumulative,
            thread,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(p) => self.nodes[p.0].children.push(id),
            None => self.threads[thread].roots.push(id),
        }
        id
    }

    pub fn add_frame_value(&mut self, id: NodeId, value: u64) {
        self.index = OnceLock::new();
        let node = &mut self.nodes[id.0];
        node.cumulative_value = node.cumulative_value.saturating_add(value);
    }

    /// Recomputes self values as cumulative minus the children's cumulative.
    /// Rounding in the source can make children exceed their parent; such
    /// nodes get a self value of zero.
    pub fn recompute_self_values(&mut self) {
        for i in 0..self.nodes.len() {
            let children_total = self.nodes[i]
                .children
                .iter()
                .map(|c| self.nodes[c.0].cumulative_value)
                .fold(0u64, u64::saturating_add);
            let node = &mut self.nodes[i];
            node.self_value = node.cumulative_value.saturating_sub(children_total);
        }
    }

    /// Adds every frame of `other` into this model, keyed by the call path.
    /// Frames only present here keep their values.
    pub fn merge(&mut self, other: &CallTreeModel) {
        for thread in &other.threads {
            let target_thread = self.ensure_thread(&thread.name);
            let mut stack: Vec<(NodeId, Option<NodeId>)> =
                thread.roots.iter().rev().map(|r| (*r, None)).collect();
            while let Some((src, parent)) = stack.pop() {
                let node = &other.nodes[src.0];
                let dst = self.add_frame(
                    target_thread,
                    parent,
                    &node.method,
                    node.invocation_count,
                    node.cumulative_value,
                );
                stack.extend(node.children.iter().rev().map(|c| (*c, Some(dst))));
            }
        }
        if self.envelope.is_none() {
            self.envelope = other.envelope.clone();
        }
        self.recompute_self_values();
        self.refresh_max_values();
    }

    pub fn refresh_max_values(&mut self) {
        let mut max = MaxValues::default();
        for node in &self.nodes {
            max.self_value = max.self_value.max(node.self_value);
            max.cumulative_value = max.cumulative_value.max(node.cumulative_value);
            max.invocation_count = max.invocation_count.max(node.invocation_count);
        }
        self.max = max;
    }

    pub fn max_values(&self) -> MaxValues {
        self.max
    }

    pub fn remove_all(&mut self) {
        self.envelope = None;
        self.threads.clear();
        self.nodes.clear();
        self.max = MaxValues::default();
        self.index = OnceLock::new();
    }

    pub fn total_invocations(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.invocation_count)
            .fold(0, u64::saturating_add)
    }

    /// Sum of the root frames' cumulative values for one thread.
    pub fn thread_total(&self, thread: usize) -> u64 {
        self.threads
            .get(thread)
            .map(|t| {
                t.roots
                    .iter()
                    .map(|r| self.nodes[r.0].cumulative_value)
                    .fold(0, u64::saturating_add)
            })
            .unwrap_or(0)
    }

    pub fn grand_total(&self) -> u64 {
        (0..self.threads.len())
            .map(|t| self.thread_total(t))
            .fold(0, u64::saturating_add)
    }

    /// Share of the owning thread's total spent in this node, in percent.
    pub fn percentage(&self, id: NodeId) -> f64 {
        let node = &self.nodes[id.0];
        ratio_percent(node.cumulative_value, self.thread_total(node.thread))
    }

    /// Flat ranking of methods by self value, aggregated across threads.
    pub fn hot_spots(&self) -> Vec<HotSpot> {
        let mut by_method: HashMap<&MethodId, (u64, u64)> = HashMap::new();
        for node in &self.nodes {
            let entry = by_method.entry(&node.method).or_default();
            entry.0 = entry.0.saturating_add(node.invocation_count);
            entry.1 = entry.1.saturating_add(node.self_value);
        }
        let total = self.grand_total();
        let mut out: Vec<HotSpot> = by_method
            .into_iter()
            .map(|(method, (count, self_value))| HotSpot {
                method: method.clone(),
                invocation_count: count,
                self_value,
                self_percentage: ratio_percent(self_value, total),
            })
            .collect();
        out.sort_by(|a, b| {
            b.self_value
                .cmp(&a.self_value)
                .then_with(|| b.invocation_count.cmp(&a.invocation_count))
                .then_with(|| a.method.cmp(&b.method))
        });
        out
    }

    /// Methods that call `method`, aggregated over every call site.
    pub fn callers_of(&self, method: &MethodId) -> Vec<CallEdge> {
        collect_edges(&self.index().callers, method)
    }

    /// Methods called by `method`, aggregated over every call site.
    pub fn callees_of(&self, method: &MethodId) -> Vec<CallEdge> {
        collect_edges(&self.index().callees, method)
    }

    /// Known methods whose name matches `query` (see [`MethodId::matches_query`]).
    pub fn find_methods(&self, query: &MethodId) -> Vec<MethodId> {
        let mut out: Vec<MethodId> = self
            .nodes
            .iter()
            .filter(|n| n.method.matches_query(query))
            .map(|n| n.method.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    fn index(&self) -> &CallerCalleeIndex {
        self.index.get_or_init(|| {
            let mut index = CallerCalleeIndex::default();
            for node in &self.nodes {
                let Some(parent) = node.parent else {
                    continue;
                };
                let caller = &self.nodes[parent.0].method;
                let stats = index
                    .callers
                    .entry(node.method.clone())
                    .or_default()
                    .entry(caller.clone())
                    .or_default();
                stats.0 = stats.0.saturating_add(node.invocation_count);
                stats.1 = stats.1.saturating_add(node.cumulative_value);
                let stats = index
                    .callees
                    .entry(caller.clone())
                    .or_default()
                    .entry(node.method.clone())
                    .or_default();
                stats.0 = stats.0.saturating_add(node.invocation_count);
                stats.1 = stats.1.saturating_add(node.cumulative_value);
            }
            index
        })
    }
}

fn collect_edges(
    map: &HashMap<MethodId, BTreeMap<MethodId, (u64, u64)>>,
    method: &MethodId,
) -> Vec<CallEdge> {
    let mut out: Vec<CallEdge> = map
        .get(method)
        .map(|edges| {
            edges
                .iter()
                .map(|(m, (count, value))| CallEdge {
                    method: m.clone(),
                    invocation_count: *count,
                    cumulative_value: *value,
                })
                .collect()
        })
        .unwrap_or_default();
    out.sort_by(|a, b| match b.cumulative_value.cmp(&a.cumulative_value) {
        Ordering::Equal => a.method.cmp(&b.method),
        other => other,
    });
    out
}

fn ratio_percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(class: &str, method: &str) -> MethodId {
        MethodId::new(class, method, "()V")
    }

    fn sample() -> CallTreeModel {
        let mut model = CallTreeModel::new();
        let t = model.ensure_thread("main");
        let run = model.add_frame(t, None, &m("com.acme.App", "run"), 1, 100);
        let load = model.add_frame(t, Some(run), &m("com.acme.Db", "load"), 4, 60);
        model.add_frame(t, Some(load), &m("com.acme.Io", "read"), 8, 50);
        model.add_frame(t, Some(run), &m("com.acme.Io", "read"), 2, 30);
        model.recompute_self_values();
        model.refresh_max_values();
        model
    }

    #[test]
    fn self_values_subtract_children() {
        let model = sample();
        let run = model.threads()[0].roots()[0];
        assert_eq!(model.node(run).self_value, 10);
        assert_eq!(model.node(run).children().len(), 2);
        assert_eq!(model.total_invocations(), 15);
        assert_eq!(model.percentage(run), 100.0);
    }

    #[test]
    fn children_exceeding_parent_clamp_to_zero() {
        let mut model = CallTreeModel::new();
        let t = model.ensure_thread("main");
        let a = model.add_frame(t, None, &m("A", "a"), 1, 10);
        model.add_frame(t, Some(a), &m("B", "b"), 1, 11);
        model.recompute_self_values();
        assert_eq!(model.node(a).self_value, 0);
    }

    #[test]
    fn hot_spots_aggregate_across_call_sites() {
        let model = sample();
        let hot = model.hot_spots();
        assert_eq!(hot[0].method, m("com.acme.Io", "read"));
        assert_eq!(hot[0].self_value, 80);
        assert_eq!(hot[0].invocation_count, 10);
        assert!((hot[0].self_percentage - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn caller_callee_index_follows_mutation() {
        let mut model = sample();
        let callers = model.callers_of(&m("com.acme.Io", "read"));
        assert_eq!(callers.len(), 2);
        assert_eq!(callers[0].method, m("com.acme.Db", "load"));
        assert_eq!(callers[0].cumulative_value, 50);

        let t = model.ensure_thread("worker");
        let root = model.add_frame(t, None, &m("com.acme.Job", "exec"), 1, 5);
        model.add_frame(t, Some(root), &m("com.acme.Io", "read"), 1, 5);
        assert_eq!(model.callers_of(&m("com.acme.Io", "read")).len(), 3);
        assert_eq!(
            model.callees_of(&m("com.acme.App", "run"))[0].method,
            m("com.acme.Db", "load")
        );
    }

    #[test]
    fn merge_is_additive_and_keeps_absent_nodes() {
        let mut model = sample();
        let mut newer = CallTreeModel::new();
        let t = newer.ensure_thread("main");
        let run = newer.add_frame(t, None, &m("com.acme.App", "run"), 1, 40);
        newer.add_frame(t, Some(run), &m("com.acme.Io", "read"), 1, 40);
        newer.recompute_self_values();

        model.merge(&newer);
        let run = model.threads()[0].roots()[0];
        assert_eq!(model.node(run).cumulative_value, 140);
        assert_eq!(model.node(run).invocation_count, 2);
        let load = model.node(run).children()[0];
        assert_eq!(model.node(load).cumulative_value, 60);
        assert_eq!(model.max_values().cumulative_value, 140);
        assert_eq!(model.node_count(), 4);
    }

    #[test]
    fn remove_all_resets_everything() {
        let mut model = sample();
        model.remove_all();
        assert!(model.is_empty());
        assert!(model.threads().is_empty());
        assert_eq!(model.max_values(), MaxValues::default());
        assert!(model.hot_spots().is_empty());
    }

    #[test]
    fn qualified_names_parse_with_and_without_signature() {
        let id = MethodId::parse_qualified("com.acme.Foo.run(I)V").expect("parse");
        assert_eq!(id, MethodId::new("com.acme.Foo", "run", "(I)V"));
        assert_eq!(id.to_string(), "com.acme.Foo.run(I)V");
        let query = MethodId::parse_qualified("com.acme.Foo.run").expect("parse");
        assert!(id.matches_query(&query));
        assert!(MethodId::parse_qualified("run").is_none());
    }
}
