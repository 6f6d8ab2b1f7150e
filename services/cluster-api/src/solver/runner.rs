//! Solver subprocess runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use clustree_affinity::{ArtifactKey, ArtifactStore, SafeSegment};
use clustree_id::JobId;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{error, info, info_span, warn, Instrument};

use super::{JobState, JobStatus, JobTable, JobWarning, SolverError, SolverJobResult};

/// Default bound on one solver run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory whose executables are the available solvers.
    pub scripts_dir: PathBuf,
    /// Solver processes still alive after this are killed.
    pub timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("./solvers"),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Completion handle for a started job.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: JobId,
    pub key: ArtifactKey,
    rx: oneshot::Receiver<Result<SolverJobResult, SolverError>>,
}

impl JobHandle {
    /// Wait for the job to finish. The job keeps running if this future is
    /// dropped.
    pub async fn wait(self) -> Result<SolverJobResult, SolverError> {
        self.rx.await.unwrap_or(Err(SolverError::Aborted))
    }
}

/// Launches solver executables against cluster artifacts, one job per cluster.
pub struct SolverJobRunner {
    config: RunnerConfig,
    store: Arc<ArtifactStore>,
    jobs: Arc<JobTable>,
}

impl SolverJobRunner {
    pub fn new(config: RunnerConfig, store: Arc<ArtifactStore>) -> Self {
        Self {
            config,
            store,
            jobs: Arc::new(JobTable::new()),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Executable regular files in the scripts directory, sorted by name.
    /// A missing directory means no solvers are installed.
    pub async fn list_scripts(&self) -> Result<Vec<String>, SolverError> {
        let dir = &self.config.scripts_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(scripts_dir = %dir.display(), "Solver scripts directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(SolverError::Io {
                    path: dir.clone(),
                    source: e,
                })
            }
        };

        let mut scripts = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(SolverError::Io {
                        path: dir.clone(),
                        source: e,
                    })
                }
            };

            // Follows symlinks so linked solvers are listed.
            let Ok(metadata) = tokio::fs::metadata(entry.path()).await else {
                continue;
            };
            if !metadata.is_file() || !is_executable(&metadata) {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                if SafeSegment::new(name.as_str()).is_ok() {
                    scripts.push(name);
                }
            }
        }

        scripts.sort();
        Ok(scripts)
    }

    pub fn status(&self, key: &ArtifactKey) -> JobStatus {
        self.jobs.status(key)
    }

    /// Forget the cluster's job record, e.g. after the cluster was deleted. A
    /// running job's record goes away when it completes.
    pub fn forget(&self, key: &ArtifactKey) {
        self.jobs.forget(key);
    }

    /// Start `script` against the cluster's `graph.json`.
    ///
    /// The script name, its presence in the listing and the artifact are all
    /// checked before the running slot is claimed, so a doomed run never
    /// spawns and never blocks a later one.
    pub async fn run(&self, key: &ArtifactKey, script: &str) -> Result<JobHandle, SolverError> {
        let script = SafeSegment::new(script)?;
        if !self.list_scripts().await?.iter().any(|s| s == script.as_str()) {
            return Err(SolverError::ScriptNotFound(script.into()));
        }
        if !self.store.exists(key).await? {
            return Err(SolverError::InputArtifactMissing {
                key: key.to_string(),
            });
        }

        let running = self.jobs.claim(key, script.as_str())?;
        let job_id = running.job_id();

        // Whatever result.json exists belongs to an earlier run.
        if let Err(e) = self.store.clear_result(key).await {
            let e = SolverError::from(e);
            error!(key = %key, job_id = %job_id, error = %e, "Failed to clear previous solver result");
            running.fail(&e);
            return Err(e);
        }

        let program = self.config.scripts_dir.join(&script);
        let child = match spawn(&program, &self.store.path(key), &self.store.cluster_dir(key)) {
            Ok(child) => child,
            Err(e) => {
                error!(key = %key, job_id = %job_id, error = %e, "Failed to spawn solver");
                running.fail(&e);
                return Err(e);
            }
        };

        info!(key = %key, job_id = %job_id, script = %script, "Solver started");

        let (tx, rx) = oneshot::channel();
        let timeout = self.config.timeout;
        let result_path = self.store.result_path(key);
        let span = info_span!("solver_job", key = %key, job_id = %job_id);

        tokio::spawn(
            async move {
                let outcome = supervise(child, job_id, timeout, &result_path).await;
                match &outcome {
                    Ok(result) => info!(
                        warnings = result.warnings.len(),
                        "Solver succeeded"
                    ),
                    Err(e) => warn!(error = %e, "Solver failed"),
                }
                running.finish(&outcome);
                // The caller may have stopped waiting.
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );

        Ok(JobHandle {
            job_id,
            key: key.clone(),
            rx,
        })
    }
}

fn spawn(program: &Path, graph: &Path, workdir: &Path) -> Result<Child, SolverError> {
    Command::new(program)
        .arg(graph)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SolverError::Spawn {
            path: program.to_path_buf(),
            source,
        })
}

/// Wait for the solver and classify its exit. On timeout the child is dropped,
/// which kills it.
async fn supervise(
    child: Child,
    job_id: JobId,
    timeout: Duration,
    result_path: &Path,
) -> Result<SolverJobResult, SolverError> {
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(SolverError::Io {
                path: result_path.to_path_buf(),
                source,
            })
        }
        Err(_) => return Err(SolverError::Timeout { after: timeout }),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code();

    if !output.status.success() || !stderr.is_empty() {
        return Err(SolverError::Failed {
            exit_code,
            stdout,
            stderr,
        });
    }

    let mut warnings = Vec::new();
    let result_file = match tokio::fs::try_exists(result_path).await {
        Ok(true) => Some(result_path.to_path_buf()),
        _ => {
            warnings.push(JobWarning::MissingResult {
                path: result_path.to_path_buf(),
            });
            None
        }
    };

    Ok(SolverJobResult {
        job_id,
        status: JobState::Succeeded,
        exit_code,
        stdout,
        stderr,
        result_file,
        warnings,
    })
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
