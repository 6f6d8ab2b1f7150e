//! External solver invocation.
//!
//! The solver is an opaque executable invoked as `<script> <graph.json>` from
//! the cluster directory. It is expected to write `result.json` next to the
//! artifact and exit 0.
//!
//! At most one job runs per cluster. The slot is tracked in a process-local
//! [`JobTable`]; running several replicas needs a shared lock instead.

mod jobs;
mod runner;

pub use jobs::{JobState, JobStatus, JobTable, RunningJob};
pub use runner::{JobHandle, RunnerConfig, SolverJobRunner};

use std::path::PathBuf;
use std::time::Duration;

use clustree_affinity::{KeyError, StoreError};
use clustree_id::JobId;
use serde::Serialize;
use thiserror::Error;

/// Solver errors.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("a solver job is already running for {key} ({job_id})")]
    AlreadyRunning { key: String, job_id: JobId },

    #[error("solver script '{0}' not found")]
    ScriptNotFound(String),

    #[error("no graph.json for {key}; create the cluster first")]
    InputArtifactMissing { key: String },

    #[error("invalid solver script name: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("solver timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    /// Non-zero exit or anything written to stderr.
    #[error("solver failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to start solver {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("solver I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("solver job ended without reporting a result")]
    Aborted,
}

/// Non-fatal findings attached to a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobWarning {
    /// The solver exited cleanly but left no result file.
    MissingResult { path: PathBuf },
}

/// Outcome of a successful solver run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SolverJobResult {
    pub job_id: JobId,
    pub status: JobState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Set when the solver produced its result file.
    pub result_file: Option<PathBuf>,
    pub warnings: Vec<JobWarning>,
}
