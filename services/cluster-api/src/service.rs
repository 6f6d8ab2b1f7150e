//! Cluster operations: the creation pipeline, reads, deletion, audit and
//! solver runs.
//!
//! Handlers stay thin and call into [`ClusterService`]; everything here is
//! independent of HTTP.

use std::collections::BTreeSet;
use std::sync::Arc;

use clustree_affinity::{
    build, parse, ArtifactKey, ArtifactStore, GraphArtifact, GraphError, KeyError, RosterError,
    SafeSegment, SolverConfig, StoreError,
};
use clustree_id::{ClusterId, UserId};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::authorization::AuthorizationSync;
use crate::registry::{
    Cluster, ClusterFields, ClusterRegistry, IdentityDirectory, NewCluster, RegistryError,
    ValidationError,
};
use crate::solver::{JobStatus, SolverError, SolverJobResult, SolverJobRunner};

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub email: String,
}

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid artifact key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error("cluster {0} not found")]
    ClusterNotFound(ClusterId),

    #[error("cluster {0} has no graph.json")]
    ArtifactMissing(ClusterId),

    #[error("cluster {0} has no solver result yet")]
    ResultMissing(ClusterId),

    #[error("not allowed to access cluster {0}")]
    Forbidden(ClusterId),

    #[error("owner {0} of the cluster has no account")]
    OwnerMissing(UserId),
}

/// Response of a successful creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedCluster {
    pub cluster: Cluster,
    /// `created`, or `replaced` when a stale artifact was overwritten.
    pub artifact: &'static str,
    pub authorized: Vec<UserId>,
    pub unresolved: Vec<String>,
}

/// Agreement between the registry row and the artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Consistent,
    /// Row without `graph.json`.
    ArtifactMissing,
    /// Directory without row.
    MetadataMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub name: String,
    pub cluster_id: Option<ClusterId>,
    pub state: Consistency,
}

/// Raw artifact for downloads.
#[derive(Debug, Clone)]
pub struct GraphFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub struct ClusterService {
    registry: Arc<dyn ClusterRegistry>,
    identities: Arc<dyn IdentityDirectory>,
    store: Arc<ArtifactStore>,
    authorization: AuthorizationSync,
    runner: Arc<SolverJobRunner>,
}

impl ClusterService {
    pub fn new(
        registry: Arc<dyn ClusterRegistry>,
        identities: Arc<dyn IdentityDirectory>,
        store: Arc<ArtifactStore>,
        runner: Arc<SolverJobRunner>,
    ) -> Self {
        let authorization = AuthorizationSync::new(registry.clone(), identities.clone());
        Self {
            registry,
            identities,
            store,
            authorization,
            runner,
        }
    }

    pub fn registry(&self) -> &Arc<dyn ClusterRegistry> {
        &self.registry
    }

    pub fn identities(&self) -> &Arc<dyn IdentityDirectory> {
        &self.identities
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn runner(&self) -> &Arc<SolverJobRunner> {
        &self.runner
    }

    /// Parse the roster, validate, build the artifact, insert the row, then
    /// write the artifact and grant access concurrently.
    ///
    /// The row and the artifact are not written atomically. If the artifact
    /// write fails the row stays and the audit reports `artifact_missing`.
    #[instrument(skip(self, form, upload), fields(owner = %actor.email, cluster = %form.name))]
    pub async fn create_cluster(
        &self,
        actor: &Actor,
        form: ClusterFields,
        upload: &[u8],
    ) -> Result<CreatedCluster, ServiceError> {
        let roster = parse(upload)?;
        let new_cluster = NewCluster::validate(actor.user_id, form)?;
        let key = ArtifactKey {
            owner: SafeSegment::new(actor.email.as_str())?,
            cluster: new_cluster.name.clone(),
        };

        let artifact = build(
            &roster,
            SolverConfig {
                group_size: new_cluster.group_size.unsigned_abs(),
                output_folder: self.store.cluster_dir(&key).display().to_string(),
            },
        )?;

        let cluster = self.registry.create_cluster(new_cluster).await?;

        let (written, report) = tokio::join!(
            self.store.write(&key, &artifact),
            self.authorization.authorize(cluster.id, &roster),
        );

        let outcome = written.inspect_err(|e| {
            error!(cluster_id = %cluster.id, error = %e, "Artifact write failed; cluster row kept");
        })?;
        let report = report.inspect_err(|e| {
            error!(cluster_id = %cluster.id, error = %e, "Authorization sync failed");
        })?;

        info!(
            cluster_id = %cluster.id,
            students = roster.len(),
            artifact = outcome.as_str(),
            "Cluster created"
        );

        Ok(CreatedCluster {
            cluster,
            artifact: outcome.as_str(),
            authorized: report.authorized,
            unresolved: report.unresolved,
        })
    }

    /// Delete an owned cluster. Authorizations go with the row; the artifact
    /// directory is removed best-effort.
    #[instrument(skip(self), fields(owner = %actor.email))]
    pub async fn delete_cluster(&self, actor: &Actor, id: ClusterId) -> Result<(), ServiceError> {
        let (cluster, key) = self.owned_cluster(actor, id).await?;

        if !self.registry.delete_cluster(cluster.id, actor.user_id).await? {
            return Err(ServiceError::ClusterNotFound(id));
        }

        match self.store.remove(&key).await {
            Ok(existed) => info!(cluster_id = %id, artifact_removed = existed, "Cluster deleted"),
            Err(e) => warn!(
                cluster_id = %id,
                error = %e,
                "Cluster deleted but artifact cleanup failed"
            ),
        }
        self.runner.forget(&key);

        Ok(())
    }

    pub async fn teacher_clusters(&self, actor: &Actor) -> Result<Vec<Cluster>, ServiceError> {
        Ok(self.registry.get_clusters_by_owner(actor.user_id).await?)
    }

    pub async fn student_clusters(&self, actor: &Actor) -> Result<Vec<Cluster>, ServiceError> {
        Ok(self.registry.get_clusters_for_user(actor.user_id).await?)
    }

    pub async fn graph(&self, actor: &Actor, id: ClusterId) -> Result<GraphArtifact, ServiceError> {
        let (_, key) = self.readable_cluster(actor, id).await?;
        self.store
            .read(&key)
            .await
            .map_err(|e| missing_as(e, ServiceError::ArtifactMissing(id)))
    }

    pub async fn graph_file(&self, actor: &Actor, id: ClusterId) -> Result<GraphFile, ServiceError> {
        let (cluster, key) = self.readable_cluster(actor, id).await?;
        let bytes = self
            .store
            .read_raw(&key)
            .await
            .map_err(|e| missing_as(e, ServiceError::ArtifactMissing(id)))?;

        Ok(GraphFile {
            file_name: format!("{}-graph.json", cluster.name),
            bytes,
        })
    }

    pub async fn result(
        &self,
        actor: &Actor,
        id: ClusterId,
    ) -> Result<serde_json::Value, ServiceError> {
        let (_, key) = self.readable_cluster(actor, id).await?;
        self.store
            .read_result(&key)
            .await
            .map_err(|e| missing_as(e, ServiceError::ResultMissing(id)))
    }

    /// Compare the owner's rows with the owner's artifact directories.
    pub async fn audit(&self, actor: &Actor) -> Result<Vec<AuditEntry>, ServiceError> {
        let owner = SafeSegment::new(actor.email.as_str())?;
        let clusters = self.registry.get_clusters_by_owner(actor.user_id).await?;
        let directories = self.store.list(&owner).await?;

        let mut entries = Vec::with_capacity(clusters.len());
        let mut known = BTreeSet::new();

        for cluster in clusters {
            let state = match SafeSegment::new(cluster.name.as_str()) {
                Ok(name) => {
                    let key = ArtifactKey {
                        owner: owner.clone(),
                        cluster: name,
                    };
                    if self.store.exists(&key).await? {
                        Consistency::Consistent
                    } else {
                        Consistency::ArtifactMissing
                    }
                }
                Err(_) => Consistency::ArtifactMissing,
            };
            known.insert(cluster.name.clone());
            entries.push(AuditEntry {
                name: cluster.name,
                cluster_id: Some(cluster.id),
                state,
            });
        }

        for directory in directories {
            if !known.contains(directory.as_str()) {
                entries.push(AuditEntry {
                    name: directory.into(),
                    cluster_id: None,
                    state: Consistency::MetadataMissing,
                });
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let inconsistent = entries
            .iter()
            .filter(|e| e.state != Consistency::Consistent)
            .count();
        if inconsistent > 0 {
            warn!(owner = %actor.email, inconsistent, "Cluster audit found inconsistencies");
        }

        Ok(entries)
    }

    pub async fn list_scripts(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.runner.list_scripts().await?)
    }

    /// Run `script` on an owned cluster and wait for it to finish.
    pub async fn run_solver(
        &self,
        actor: &Actor,
        id: ClusterId,
        script: &str,
    ) -> Result<SolverJobResult, ServiceError> {
        let (_, key) = self.owned_cluster(actor, id).await?;
        let handle = self.runner.run(&key, script).await?;
        Ok(handle.wait().await?)
    }

    pub async fn job_status(&self, actor: &Actor, id: ClusterId) -> Result<JobStatus, ServiceError> {
        let (_, key) = self.owned_cluster(actor, id).await?;
        Ok(self.runner.status(&key))
    }

    async fn find_cluster(&self, id: ClusterId) -> Result<Cluster, ServiceError> {
        self.registry
            .get_cluster_by_id(id)
            .await?
            .ok_or(ServiceError::ClusterNotFound(id))
    }

    async fn owned_cluster(
        &self,
        actor: &Actor,
        id: ClusterId,
    ) -> Result<(Cluster, ArtifactKey), ServiceError> {
        let cluster = self.find_cluster(id).await?;
        if cluster.owner_id != actor.user_id {
            return Err(ServiceError::Forbidden(id));
        }
        let key = ArtifactKey::new(&actor.email, &cluster.name)?;
        Ok((cluster, key))
    }

    /// Owner, or a user authorized on the cluster.
    async fn readable_cluster(
        &self,
        actor: &Actor,
        id: ClusterId,
    ) -> Result<(Cluster, ArtifactKey), ServiceError> {
        let cluster = self.find_cluster(id).await?;

        let owner_email = if cluster.owner_id == actor.user_id {
            actor.email.clone()
        } else {
            let authorized = self.registry.authorized_users(id).await?;
            if !authorized.contains(&actor.user_id) {
                return Err(ServiceError::Forbidden(id));
            }
            self.identities
                .email_for_user(cluster.owner_id)
                .await?
                .ok_or(ServiceError::OwnerMissing(cluster.owner_id))?
        };

        let key = ArtifactKey::new(&owner_email, &cluster.name)?;
        Ok((cluster, key))
    }
}

fn missing_as(error: StoreError, missing: ServiceError) -> ServiceError {
    if error.is_not_found() {
        missing
    } else {
        ServiceError::Store(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::solver::RunnerConfig;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        registry: Arc<MemoryRegistry>,
        service: ClusterService,
        teacher: Actor,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(ArtifactStore::new(tmp.path().join("uploads")));
        let runner = Arc::new(SolverJobRunner::new(
            RunnerConfig {
                scripts_dir: tmp.path().join("solvers"),
                ..Default::default()
            },
            store.clone(),
        ));
        let service = ClusterService::new(registry.clone(), registry.clone(), store, runner);
        let teacher = actor(&registry, "teacher@school.edu").await;

        Fixture {
            _tmp: tmp,
            registry,
            service,
            teacher,
        }
    }

    async fn actor(registry: &MemoryRegistry, email: &str) -> Actor {
        Actor {
            user_id: registry.add_user(email).await,
            email: email.to_string(),
        }
    }

    fn fields(name: &str) -> ClusterFields {
        ClusterFields {
            name: name.to_string(),
            group_size: Some(2),
            ..Default::default()
        }
    }

    const ROSTER: &[u8] = b"email\nalice@school.edu\nbob@school.edu\n";

    #[tokio::test]
    async fn test_create_writes_artifact_and_grants_access() {
        let f = fixture().await;
        let alice = actor(&f.registry, "alice@school.edu").await;

        let created = f
            .service
            .create_cluster(&f.teacher, fields("maths"), ROSTER)
            .await
            .unwrap();

        assert_eq!(created.artifact, "created");
        assert_eq!(created.authorized, vec![alice.user_id]);
        assert_eq!(created.unresolved, vec!["bob@school.edu".to_string()]);

        let graph = f.service.graph(&alice, created.cluster.id).await.unwrap();
        assert_eq!(graph.cli.group_size, 2);
        assert_eq!(graph.graph.node_count(), 2);
        assert!(graph.cli.output_folder.ends_with("teacher@school.edu/maths"));

        let visible = f.service.student_clusters(&alice).await.unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn test_format_error_creates_nothing() {
        let f = fixture().await;
        let err = f
            .service
            .create_cluster(&f.teacher, fields("maths"), b"{\"not\":\"an array\"}")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Roster(_)));
        assert!(f.service.teacher_clusters(&f.teacher).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_roster_rejected_before_insert() {
        let f = fixture().await;
        let err = f
            .service
            .create_cluster(&f.teacher, fields("maths"), b"[]")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Graph(GraphError::EmptyRoster)));
        assert!(f.service.teacher_clusters(&f.teacher).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stranger_cannot_read_graph() {
        let f = fixture().await;
        let stranger = actor(&f.registry, "eve@school.edu").await;
        let created = f
            .service
            .create_cluster(&f.teacher, fields("maths"), ROSTER)
            .await
            .unwrap();

        let err = f.service.graph(&stranger, created.cluster.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_row_access_and_artifact() {
        let f = fixture().await;
        let alice = actor(&f.registry, "alice@school.edu").await;
        let created = f
            .service
            .create_cluster(&f.teacher, fields("maths"), ROSTER)
            .await
            .unwrap();
        let id = created.cluster.id;

        let err = f.service.delete_cluster(&alice, id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        f.service.delete_cluster(&f.teacher, id).await.unwrap();
        assert!(f.registry.authorized_users(id).await.unwrap().is_empty());
        assert!(f.service.student_clusters(&alice).await.unwrap().is_empty());
        let key = ArtifactKey::new("teacher@school.edu", "maths").unwrap();
        assert!(!f.service.store().exists(&key).await.unwrap());

        let err = f.service.delete_cluster(&f.teacher, id).await.unwrap_err();
        assert!(matches!(err, ServiceError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn test_audit_reports_both_inconsistencies() {
        let f = fixture().await;
        let kept = f
            .service
            .create_cluster(&f.teacher, fields("maths"), ROSTER)
            .await
            .unwrap();
        let broken = f
            .service
            .create_cluster(&f.teacher, fields("physics"), ROSTER)
            .await
            .unwrap();

        let store = f.service.store();
        store
            .remove(&ArtifactKey::new("teacher@school.edu", "physics").unwrap())
            .await
            .unwrap();
        std::fs::create_dir_all(store.root().join("teacher@school.edu").join("orphan")).unwrap();

        let audit = f.service.audit(&f.teacher).await.unwrap();
        assert_eq!(
            audit,
            vec![
                AuditEntry {
                    name: "maths".into(),
                    cluster_id: Some(kept.cluster.id),
                    state: Consistency::Consistent,
                },
                AuditEntry {
                    name: "orphan".into(),
                    cluster_id: None,
                    state: Consistency::MetadataMissing,
                },
                AuditEntry {
                    name: "physics".into(),
                    cluster_id: Some(broken.cluster.id),
                    state: Consistency::ArtifactMissing,
                },
            ]
        );

        let err = f.service.graph(&f.teacher, broken.cluster.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::ArtifactMissing(_)));
    }

    #[tokio::test]
    async fn test_recreate_after_stale_artifact_reports_replaced() {
        let f = fixture().await;
        let first = f
            .service
            .create_cluster(&f.teacher, fields("maths"), ROSTER)
            .await
            .unwrap();
        // Row deleted behind the service's back; artifact left over.
        f.registry
            .delete_cluster(first.cluster.id, f.teacher.user_id)
            .await
            .unwrap();

        let second = f
            .service
            .create_cluster(&f.teacher, fields("maths"), br#"["carol@school.edu"]"#)
            .await
            .unwrap();
        assert_eq!(second.artifact, "replaced");

        let graph = f.service.graph(&f.teacher, second.cluster.id).await.unwrap();
        assert_eq!(graph.graph.nodes().collect::<Vec<_>>(), ["carol@school.edu"]);
    }

    #[tokio::test]
    async fn test_run_solver_preflight() {
        let f = fixture().await;
        let created = f
            .service
            .create_cluster(&f.teacher, fields("maths"), ROSTER)
            .await
            .unwrap();

        let err = f
            .service
            .run_solver(&f.teacher, created.cluster.id, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Solver(SolverError::ScriptNotFound(_))));

        let status = f.service.job_status(&f.teacher, created.cluster.id).await.unwrap();
        assert_eq!(status, JobStatus::idle());
    }
}
