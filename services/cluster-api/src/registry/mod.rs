//! Cluster metadata and identity collaborators.
//!
//! The core only talks to these traits. Two backends implement them:
//! [`PgRegistry`] for deployments and [`MemoryRegistry`] for tests and
//! database-less development.

mod memory;
mod postgres;

pub use memory::MemoryRegistry;
pub use postgres::PgRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clustree_affinity::{KeyError, SafeSegment};
use clustree_id::{ClusterId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;

/// Defaults applied when the creation form leaves a field out.
pub const DEFAULT_CLUSTER_TYPE: &str = "default";
pub const DEFAULT_GROUP_SIZE: i32 = 2;
pub const DEFAULT_MIN_AFFINITY: i32 = 0;
pub const DEFAULT_MAX_AFFINITY: i32 = 3;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The owner already has a cluster with this name.
    #[error("cluster '{name}' already exists for this owner")]
    Conflict { name: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Backend failure.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Cluster fields rejected before reaching the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid cluster name: {0}")]
    Name(#[from] KeyError),

    #[error("groupSize must be at least 1, got {0}")]
    GroupSize(i32),

    #[error("minAffinity ({min}) must not exceed maxAffinity ({max})")]
    AffinityBounds { min: i32, max: i32 },

    #[error("clusterType cannot be empty")]
    ClusterType,
}

/// A stored cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub owner_id: UserId,
    pub cluster_type: String,
    pub group_size: i32,
    pub min_affinity: i32,
    pub max_affinity: i32,
    pub created_at: DateTime<Utc>,
}

/// Cluster fields as submitted by a teacher. Everything but the name is
/// optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFields {
    pub name: String,
    pub cluster_type: Option<String>,
    pub group_size: Option<i32>,
    pub min_affinity: Option<i32>,
    pub max_affinity: Option<i32>,
}

/// Validated input for [`ClusterRegistry::create_cluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCluster {
    /// Doubles as the artifact directory name, hence a [`SafeSegment`].
    pub name: SafeSegment,
    pub owner_id: UserId,
    pub cluster_type: String,
    pub group_size: i32,
    pub min_affinity: i32,
    pub max_affinity: i32,
}

impl NewCluster {
    /// Apply defaults and check the cluster invariants.
    pub fn validate(owner_id: UserId, fields: ClusterFields) -> Result<Self, ValidationError> {
        let name = SafeSegment::new(fields.name.trim())?;

        let cluster_type = fields
            .cluster_type
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| DEFAULT_CLUSTER_TYPE.to_string());
        if cluster_type.is_empty() {
            return Err(ValidationError::ClusterType);
        }

        let group_size = fields.group_size.unwrap_or(DEFAULT_GROUP_SIZE);
        if group_size < 1 {
            return Err(ValidationError::GroupSize(group_size));
        }

        let min_affinity = fields.min_affinity.unwrap_or(DEFAULT_MIN_AFFINITY);
        let max_affinity = fields.max_affinity.unwrap_or(DEFAULT_MAX_AFFINITY);
        if min_affinity > max_affinity {
            return Err(ValidationError::AffinityBounds {
                min: min_affinity,
                max: max_affinity,
            });
        }

        Ok(Self {
            name,
            owner_id,
            cluster_type,
            group_size,
            min_affinity,
            max_affinity,
        })
    }
}

/// Cluster metadata store.
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn create_cluster(&self, cluster: NewCluster) -> Result<Cluster, RegistryError>;

    async fn get_cluster_by_id(&self, id: ClusterId) -> Result<Option<Cluster>, RegistryError>;

    async fn get_clusters_by_owner(&self, owner_id: UserId) -> Result<Vec<Cluster>, RegistryError>;

    /// Clusters the user has been authorized on.
    async fn get_clusters_for_user(&self, user_id: UserId) -> Result<Vec<Cluster>, RegistryError>;

    /// Delete a cluster owned by `owner_id` together with its authorizations.
    /// Returns false when no such cluster is owned by `owner_id`.
    async fn delete_cluster(&self, id: ClusterId, owner_id: UserId) -> Result<bool, RegistryError>;

    /// Grant access. Granting twice is a no-op, and so is granting on a
    /// cluster that does not exist.
    async fn authorize_user(&self, cluster_id: ClusterId, user_id: UserId) -> Result<(), RegistryError>;

    async fn authorized_users(&self, cluster_id: ClusterId) -> Result<Vec<UserId>, RegistryError>;

    async fn health_check(&self) -> Result<(), RegistryError>;
}

/// Account lookup by email.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn resolve_user_id_by_email(&self, email: &str) -> Result<Option<UserId>, RegistryError>;

    async fn email_for_user(&self, user_id: UserId) -> Result<Option<String>, RegistryError>;
}
