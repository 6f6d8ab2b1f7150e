//! In-memory registry.
//!
//! Same contract as [`super::PgRegistry`]. Used by tests and when the service
//! runs without `DATABASE_URL`.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use clustree_id::{ClusterId, UserId};
use tokio::sync::RwLock;

use super::{Cluster, ClusterRegistry, IdentityDirectory, NewCluster, RegistryError};

#[derive(Default)]
struct Inner {
    users_by_email: HashMap<String, UserId>,
    emails_by_id: HashMap<UserId, String>,
    clusters: HashMap<ClusterId, Cluster>,
    authorized: HashMap<ClusterId, BTreeSet<UserId>>,
}

/// Registry and identity directory over `RwLock`-guarded maps.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: RwLock<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account. Returns the existing id if the email is known.
    pub async fn add_user(&self, email: &str) -> UserId {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.users_by_email.get(email) {
            return *id;
        }
        let id = UserId::new();
        inner.users_by_email.insert(email.to_string(), id);
        inner.emails_by_id.insert(id, email.to_string());
        id
    }
}

fn sorted(mut clusters: Vec<Cluster>) -> Vec<Cluster> {
    clusters.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    clusters
}

#[async_trait]
impl ClusterRegistry for MemoryRegistry {
    async fn create_cluster(&self, cluster: NewCluster) -> Result<Cluster, RegistryError> {
        let mut inner = self.inner.write().await;

        let duplicate = inner
            .clusters
            .values()
            .any(|c| c.owner_id == cluster.owner_id && c.name == cluster.name.as_str());
        if duplicate {
            return Err(RegistryError::Conflict {
                name: cluster.name.into(),
            });
        }

        let created = Cluster {
            id: ClusterId::new(),
            name: cluster.name.into(),
            owner_id: cluster.owner_id,
            cluster_type: cluster.cluster_type,
            group_size: cluster.group_size,
            min_affinity: cluster.min_affinity,
            max_affinity: cluster.max_affinity,
            created_at: Utc::now(),
        };
        inner.clusters.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_cluster_by_id(&self, id: ClusterId) -> Result<Option<Cluster>, RegistryError> {
        Ok(self.inner.read().await.clusters.get(&id).cloned())
    }

    async fn get_clusters_by_owner(&self, owner_id: UserId) -> Result<Vec<Cluster>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(sorted(
            inner
                .clusters
                .values()
                .filter(|c| c.owner_id == owner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_clusters_for_user(&self, user_id: UserId) -> Result<Vec<Cluster>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(sorted(
            inner
                .authorized
                .iter()
                .filter(|(_, users)| users.contains(&user_id))
                .filter_map(|(id, _)| inner.clusters.get(id).cloned())
                .collect(),
        ))
    }

    async fn delete_cluster(&self, id: ClusterId, owner_id: UserId) -> Result<bool, RegistryError> {
        let mut inner = self.inner.write().await;
        if !inner.clusters.get(&id).is_some_and(|c| c.owner_id == owner_id) {
            return Ok(false);
        }
        inner.clusters.remove(&id);
        inner.authorized.remove(&id);
        Ok(true)
    }

    async fn authorize_user(&self, cluster_id: ClusterId, user_id: UserId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        // Mirrors the foreign key: grants on a deleted cluster are dropped.
        if inner.clusters.contains_key(&cluster_id) {
            inner.authorized.entry(cluster_id).or_default().insert(user_id);
        }
        Ok(())
    }

    async fn authorized_users(&self, cluster_id: ClusterId) -> Result<Vec<UserId>, RegistryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .authorized
            .get(&cluster_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}

#[async_trait]
impl IdentityDirectory for MemoryRegistry {
    async fn resolve_user_id_by_email(&self, email: &str) -> Result<Option<UserId>, RegistryError> {
        Ok(self.inner.read().await.users_by_email.get(email).copied())
    }

    async fn email_for_user(&self, user_id: UserId) -> Result<Option<String>, RegistryError> {
        Ok(self.inner.read().await.emails_by_id.get(&user_id).cloned())
    }
}
