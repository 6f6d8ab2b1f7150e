//! Affinity graph and solver artifact.
//!
//! The artifact is the only thing the external solver reads:
//!
//! ```json
//! {
//!   "CLI": { "groupSize": 2, "outputFolder": "/data/t@x.com/maths" },
//!   "Graph": {
//!     "alice@school.edu": [ { "secondNode": "bob@school.edu", "weight": 1 } ],
//!     "bob@school.edu":   [ { "secondNode": "alice@school.edu", "weight": 1 } ]
//!   }
//! }
//! ```
//!
//! Every undirected edge is listed from both endpoints. The solver only keeps
//! one direction, so both copies must carry the same weight.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::roster::Roster;

/// Weight given to every pair under the complete-graph policy.
pub const DEFAULT_WEIGHT: i64 = 1;

/// Graph construction errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A graph needs at least one student.
    #[error("roster is empty")]
    EmptyRoster,

    /// A required solver parameter is absent.
    #[error("solver configuration is missing {0}")]
    MissingConfig(&'static str),
}

/// Parameters handed to the solver through the artifact's `CLI` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverConfig {
    /// Target number of students per group.
    pub group_size: u32,
    /// Directory the solver writes its result into.
    pub output_folder: String,
}

/// One half of an undirected edge, stored under its first endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub second_node: String,
    pub weight: i64,
}

/// Adjacency lists keyed by student email.
///
/// Keys are kept sorted so serialization is stable for a given roster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AffinityGraph(BTreeMap<String, Vec<Edge>>);

impl AffinityGraph {
    /// Complete graph over `roster`: every ordered pair of distinct students
    /// gets an edge of `weight`. Edge lists follow roster order.
    pub fn complete(roster: &Roster, weight: i64) -> Self {
        let nodes = roster
            .iter()
            .map(|node| {
                let edges = roster
                    .iter()
                    .filter(|other| *other != node)
                    .map(|other| Edge {
                        second_node: other.to_string(),
                        weight,
                    })
                    .collect();
                (node.to_string(), edges)
            })
            .collect();

        Self(nodes)
    }

    pub fn node_count(&self) -> usize {
        self.0.len()
    }

    /// Number of undirected edges, counting each pair once.
    pub fn edge_count(&self) -> usize {
        self.0.values().map(Vec::len).sum::<usize>() / 2
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn edges(&self, node: &str) -> Option<&[Edge]> {
        self.0.get(node).map(Vec::as_slice)
    }

    /// Check the structural invariants the solver relies on: no self-loops,
    /// no edge to an unknown node, no duplicate edge and every edge mirrored
    /// with the same weight.
    pub fn is_well_formed(&self) -> bool {
        self.0.iter().all(|(node, edges)| {
            let mut targets = std::collections::HashSet::new();
            edges.iter().all(|edge| {
                edge.second_node != *node
                    && targets.insert(edge.second_node.as_str())
                    && self.0.get(&edge.second_node).is_some_and(|back| {
                        back.iter()
                            .any(|b| b.second_node == *node && b.weight == edge.weight)
                    })
            })
        })
    }
}

/// The serialized unit stored as `graph.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphArtifact {
    #[serde(rename = "CLI")]
    pub cli: SolverConfig,
    #[serde(rename = "Graph")]
    pub graph: AffinityGraph,
}

/// Build the solver artifact for `roster`.
///
/// Uses the complete-graph policy with [`DEFAULT_WEIGHT`]. The config is
/// copied into the artifact as-is once both fields are present.
pub fn build(roster: &Roster, config: SolverConfig) -> Result<GraphArtifact, GraphError> {
    if roster.is_empty() {
        return Err(GraphError::EmptyRoster);
    }
    if config.group_size == 0 {
        return Err(GraphError::MissingConfig("groupSize"));
    }
    if config.output_folder.is_empty() {
        return Err(GraphError::MissingConfig("outputFolder"));
    }

    Ok(GraphArtifact {
        cli: config,
        graph: AffinityGraph::complete(roster, DEFAULT_WEIGHT),
    })
}
