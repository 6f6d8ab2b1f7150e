//! # clustree-affinity
//!
//! The artifact side of group formation:
//!
//! - [`roster`]: turn an uploaded CSV or JSON file into a deduplicated list of
//!   student emails
//! - [`graph`]: build the weighted affinity graph and the solver artifact
//!   (`{"CLI": ..., "Graph": ...}`) from a roster
//! - [`segment`]: validated path segments used to address artifacts
//! - [`store`]: the on-disk artifact tree, one `graph.json` per
//!   (owner, cluster) directory
//!
//! Nothing here talks to a database or spawns processes.

pub mod graph;
pub mod roster;
pub mod segment;
pub mod store;

pub use graph::{build, AffinityGraph, Edge, GraphArtifact, GraphError, SolverConfig};
pub use roster::{parse, Roster, RosterError, RosterSource};
pub use segment::{KeyError, SafeSegment};
pub use store::{ArtifactKey, ArtifactStore, StoreError, WriteOutcome};
