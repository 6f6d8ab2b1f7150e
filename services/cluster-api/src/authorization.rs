//! Roster to cluster access reconciliation.

use std::sync::Arc;

use clustree_affinity::Roster;
use clustree_id::{ClusterId, UserId};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::registry::{ClusterRegistry, IdentityDirectory, RegistryError};

/// Outcome of one authorization pass.
///
/// `unresolved` lists roster entries with no account yet. They are a warning,
/// not a failure: students may register after the cluster is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthorizationReport {
    pub authorized: Vec<UserId>,
    pub unresolved: Vec<String>,
}

/// Grants cluster access to every roster entry that resolves to an account.
#[derive(Clone)]
pub struct AuthorizationSync {
    registry: Arc<dyn ClusterRegistry>,
    identities: Arc<dyn IdentityDirectory>,
}

impl AuthorizationSync {
    pub fn new(registry: Arc<dyn ClusterRegistry>, identities: Arc<dyn IdentityDirectory>) -> Self {
        Self {
            registry,
            identities,
        }
    }

    /// Resolve and grant, in roster order. Backend errors abort the pass; an
    /// unknown email never does.
    #[instrument(skip(self, roster), fields(cluster_id = %cluster_id, roster_len = roster.len()))]
    pub async fn authorize(
        &self,
        cluster_id: ClusterId,
        roster: &Roster,
    ) -> Result<AuthorizationReport, RegistryError> {
        let mut report = AuthorizationReport::default();

        for email in roster.iter() {
            match self.identities.resolve_user_id_by_email(email).await? {
                Some(user_id) => {
                    self.registry.authorize_user(cluster_id, user_id).await?;
                    report.authorized.push(user_id);
                }
                None => report.unresolved.push(email.to_string()),
            }
        }

        if !report.unresolved.is_empty() {
            warn!(
                unresolved = report.unresolved.len(),
                emails = ?report.unresolved,
                "Roster entries without an account"
            );
        }
        info!(authorized = report.authorized.len(), "Cluster access granted");

        Ok(report)
    }
}
