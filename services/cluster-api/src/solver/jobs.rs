//! Per-cluster job slots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use clustree_affinity::ArtifactKey;
use clustree_id::JobId;
use serde::Serialize;
use tracing::warn;

use super::{SolverError, SolverJobResult};

/// Lifecycle of a cluster's solver job.
///
/// `Idle -> Running -> {Succeeded, Failed}`. Terminal states only move on
/// through a new run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Last known job for a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub job_id: Option<JobId>,
    pub script: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<SolverJobResult>,
    pub error: Option<String>,
}

impl JobStatus {
    pub fn idle() -> Self {
        Self {
            state: JobState::Idle,
            job_id: None,
            script: None,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }
}

/// A cluster's job record. `forgotten` marks a running job whose cluster went
/// away; its record is dropped when the job completes.
#[derive(Debug)]
struct Slot {
    status: JobStatus,
    forgotten: bool,
}

/// In-memory registry of job slots keyed by cluster.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Mutex<HashMap<ArtifactKey, Slot>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ArtifactKey, Slot>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self, key: &ArtifactKey) -> JobStatus {
        self.lock()
            .get(key)
            .map(|slot| slot.status.clone())
            .unwrap_or_else(JobStatus::idle)
    }

    /// Take the running slot for `key`. Check and insert happen under one
    /// lock, so exactly one of two racing callers wins.
    pub fn claim(self: &Arc<Self>, key: &ArtifactKey, script: &str) -> Result<RunningJob, SolverError> {
        let mut jobs = self.lock();

        if let Some(current) = jobs.get(key) {
            if current.status.state == JobState::Running {
                return Err(SolverError::AlreadyRunning {
                    key: key.to_string(),
                    job_id: current.status.job_id.unwrap_or_default(),
                });
            }
        }

        let job_id = JobId::new();
        jobs.insert(
            key.clone(),
            Slot {
                status: JobStatus {
                    state: JobState::Running,
                    job_id: Some(job_id),
                    script: Some(script.to_string()),
                    started_at: Some(Utc::now()),
                    finished_at: None,
                    result: None,
                    error: None,
                },
                forgotten: false,
            },
        );

        Ok(RunningJob {
            table: Arc::clone(self),
            key: key.clone(),
            job_id,
            finished: false,
        })
    }

    /// Drop the record for `key`. A running job keeps its slot until it
    /// completes, then the record is dropped instead of updated.
    pub fn forget(&self, key: &ArtifactKey) {
        let mut jobs = self.lock();
        match jobs.get_mut(key) {
            Some(slot) if slot.status.state == JobState::Running => slot.forgotten = true,
            Some(_) => {
                jobs.remove(key);
            }
            None => {}
        }
    }

    fn complete(
        &self,
        key: &ArtifactKey,
        job_id: JobId,
        state: JobState,
        result: Option<SolverJobResult>,
        error: Option<String>,
    ) {
        let mut jobs = self.lock();
        let Some(slot) = jobs.get_mut(key) else {
            return;
        };
        if slot.status.job_id != Some(job_id) {
            return;
        }
        if slot.forgotten {
            jobs.remove(key);
            return;
        }

        let status = &mut slot.status;
        status.state = state;
        status.finished_at = Some(Utc::now());
        status.result = result;
        status.error = error;
    }
}

/// The running slot for one cluster. Dropping it without calling
/// [`RunningJob::finish`] marks the job failed, so a panicking task cannot
/// leave the cluster stuck in `Running`.
#[derive(Debug)]
pub struct RunningJob {
    table: Arc<JobTable>,
    key: ArtifactKey,
    job_id: JobId,
    finished: bool,
}

impl RunningJob {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    /// Record the outcome and release the slot.
    pub fn finish(mut self, outcome: &Result<SolverJobResult, SolverError>) {
        match outcome {
            Ok(result) => {
                self.table.complete(
                    &self.key,
                    self.job_id,
                    JobState::Succeeded,
                    Some(result.clone()),
                    None,
                );
                self.finished = true;
            }
            Err(e) => self.fail(e),
        }
    }

    /// Record a failure and release the slot.
    pub fn fail(mut self, error: &SolverError) {
        self.table.complete(
            &self.key,
            self.job_id,
            JobState::Failed,
            None,
            Some(error.to_string()),
        );
        self.finished = true;
    }
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        if !self.finished {
            warn!(key = %self.key, job_id = %self.job_id, "Solver job dropped before finishing");
            self.table.complete(
                &self.key,
                self.job_id,
                JobState::Failed,
                None,
                Some(SolverError::Aborted.to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ArtifactKey {
        ArtifactKey::new("t@x.com", "maths").unwrap()
    }

    #[test]
    fn test_second_claim_rejected_while_running() {
        let table = Arc::new(JobTable::new());
        let first = table.claim(&key(), "solve").unwrap();

        let err = table.claim(&key(), "solve").unwrap_err();
        match err {
            SolverError::AlreadyRunning { job_id, .. } => assert_eq!(job_id, first.job_id()),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(table.status(&key()).state, JobState::Running);
    }

    #[test]
    fn test_finish_releases_slot() {
        let table = Arc::new(JobTable::new());
        let job = table.claim(&key(), "solve").unwrap();
        job.finish(&Err(SolverError::Timeout {
            after: std::time::Duration::from_secs(1),
        }));

        let status = table.status(&key());
        assert_eq!(status.state, JobState::Failed);
        assert!(status.error.unwrap().contains("timed out"));
        assert!(table.claim(&key(), "solve").is_ok());
    }

    #[test]
    fn test_dropped_guard_marks_failed() {
        let table = Arc::new(JobTable::new());
        drop(table.claim(&key(), "solve").unwrap());

        let status = table.status(&key());
        assert_eq!(status.state, JobState::Failed);
        assert!(table.claim(&key(), "solve").is_ok());
    }

    #[test]
    fn test_unknown_key_is_idle() {
        let table = JobTable::new();
        assert_eq!(table.status(&key()), JobStatus::idle());
    }

    #[test]
    fn test_forget_keeps_running_jobs() {
        let table = Arc::new(JobTable::new());
        let job = table.claim(&key(), "solve").unwrap();
        table.forget(&key());
        assert_eq!(table.status(&key()).state, JobState::Running);
        assert!(table.claim(&key(), "solve").is_err());

        drop(job);
        assert_eq!(table.status(&key()), JobStatus::idle());
    }

    #[test]
    fn test_forget_finished_job() {
        let table = Arc::new(JobTable::new());
        let job = table.claim(&key(), "solve").unwrap();
        job.finish(&Err(SolverError::Aborted));
        assert_eq!(table.status(&key()).state, JobState::Failed);

        table.forget(&key());
        assert_eq!(table.status(&key()), JobStatus::idle());
    }

    #[test]
    fn test_forgotten_job_does_not_resurface_after_finish() {
        let table = Arc::new(JobTable::new());
        let job = table.claim(&key(), "solve").unwrap();
        table.forget(&key());

        job.finish(&Err(SolverError::Timeout {
            after: std::time::Duration::from_secs(1),
        }));

        assert_eq!(table.status(&key()), JobStatus::idle());
        assert!(table.claim(&key(), "solve").is_ok());
    }
}
