//! Prereq-edge DAG and deterministic topological sort.
//!
//! An edge `add_edge(dependent, prereq)` declares that `prereq` must reach
//! a terminal state before `dependent` may start — the vocabulary used
//! throughout the scheduler. Internally the graph is stored in execution
//! order (prereq -> dependent) so that Kahn's algorithm can walk it as an
//! ordinary source-first topological sort.

use petgraph::{graph::NodeIndex, Direction};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use taskgraph_uri::Uri;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DagError {
    #[error("cycle detected in dependency graph; edges remain unresolved: {0:?}")]
    Cycle(Vec<(String, String)>),
    #[error("uri {0:?} is not registered in the graph")]
    UnknownNode(String),
}

#[derive(Debug, Default)]
pub struct Dag {
    graph: petgraph::Graph<Uri, ()>,
    index: BTreeMap<Uri, NodeIndex>,
}

impl Dag {
    pub fn new() -> Self {
        Dag {
            graph: petgraph::Graph::new(),
            index: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, uri: Uri) -> NodeIndex {
        if let Some(idx) = self.index.get(&uri) {
            return *idx;
        }
        let idx = self.graph.add_node(uri.clone());
        self.index.insert(uri, idx);
        idx
    }

    fn node_index(&self, uri: &Uri) -> Option<NodeIndex> {
        self.index.get(uri).copied()
    }

    pub fn contains(&self, uri: &Uri) -> bool {
        self.index.contains_key(uri)
    }

    /// Declares that `prereq` must complete before `dependent` may run.
    /// Both URIs are registered as nodes if not already present.
    pub fn add_edge(&mut self, dependent: &Uri, prereq: &Uri) {
        let d = self.add_node(dependent.clone());
        let p = self.add_node(prereq.clone());
        if !self.graph.contains_edge(p, d) {
            self.graph.add_edge(p, d, ());
        }
    }

    /// All URIs reachable from `root` by repeatedly following prereq edges,
    /// including `root` itself.
    pub fn transitive_prereqs(&self, root: &Uri) -> Result<BTreeSet<Uri>, DagError> {
        let root_idx = self
            .node_index(root)
            .ok_or_else(|| DagError::UnknownNode(root.as_str().to_owned()))?;
        let mut seen = BTreeSet::new();
        seen.insert(root.clone());
        let mut queue = VecDeque::new();
        queue.push_back(root_idx);
        while let Some(idx) = queue.pop_front() {
            for pred in self.graph.neighbors_directed(idx, Direction::Incoming) {
                let uri = self.graph[pred].clone();
                if seen.insert(uri) {
                    queue.push_back(pred);
                }
            }
        }
        Ok(seen)
    }

    /// Kahn's algorithm over the subgraph induced by `subset`, emitting
    /// prereqs before their dependents. Ties are broken by ascending `Uri`
    /// so the same input always yields the same order.
    pub fn topological_sort(&self, subset: &BTreeSet<Uri>) -> Result<Vec<Uri>, DagError> {
        let mut indegree: BTreeMap<Uri, usize> = BTreeMap::new();
        for uri in subset {
            let idx = self
                .node_index(uri)
                .ok_or_else(|| DagError::UnknownNode(uri.as_str().to_owned()))?;
            let count = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter(|pred| subset.contains(&self.graph[*pred]))
                .count();
            indegree.insert(uri.clone(), count);
        }

        let mut ready: BTreeSet<Uri> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(u, _)| u.clone())
            .collect();

        let mut order = Vec::with_capacity(subset.len());
        while let Some(uri) = ready.iter().next().cloned() {
            ready.remove(&uri);
            order.push(uri.clone());
            let idx = self.node_index(&uri).expect("uri was validated above");
            for succ in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let succ_uri = self.graph[succ].clone();
                if !subset.contains(&succ_uri) {
                    continue;
                }
                let remaining = indegree.get_mut(&succ_uri).expect("tracked above");
                *remaining -= 1;
                if *remaining == 0 {
                    ready.insert(succ_uri);
                }
            }
        }

        if order.len() != subset.len() {
            let mut unresolved = Vec::new();
            for uri in subset {
                if indegree[uri] == 0 {
                    continue;
                }
                let idx = self.node_index(uri).expect("uri was validated above");
                for pred in self.graph.neighbors_directed(idx, Direction::Incoming) {
                    let pred_uri = self.graph[pred].clone();
                    if subset.contains(&pred_uri) {
                        unresolved.push((pred_uri.as_str().to_owned(), uri.as_str().to_owned()));
                    }
                }
            }
            return Err(DagError::Cycle(unresolved));
        }

        Ok(order)
    }
}
