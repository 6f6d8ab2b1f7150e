//! Postgres-backed registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clustree_id::{ClusterId, UserId};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tracing::debug;

use super::{Cluster, ClusterRegistry, IdentityDirectory, NewCluster, RegistryError};
use crate::db::DbError;

/// Postgres' default name for `authorized_users.cluster_id REFERENCES clusters`.
const CLUSTER_FK: &str = "authorized_users_cluster_id_fkey";

const CLUSTER_COLUMNS: &str = r#"
    id,
    name,
    owner_id,
    cluster_type,
    group_size,
    min_affinity,
    max_affinity,
    created_at
"#;

struct ClusterRow {
    id: String,
    name: String,
    owner_id: String,
    cluster_type: String,
    group_size: i32,
    min_affinity: i32,
    max_affinity: i32,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ClusterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner_id: row.try_get("owner_id")?,
            cluster_type: row.try_get("cluster_type")?,
            group_size: row.try_get("group_size")?,
            min_affinity: row.try_get("min_affinity")?,
            max_affinity: row.try_get("max_affinity")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<ClusterRow> for Cluster {
    type Error = DbError;

    fn try_from(row: ClusterRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: decode_id(&row.id, "id")?,
            name: row.name,
            owner_id: decode_id(&row.owner_id, "owner_id")?,
            cluster_type: row.cluster_type,
            group_size: row.group_size,
            min_affinity: row.min_affinity,
            max_affinity: row.max_affinity,
            created_at: row.created_at,
        })
    }
}

fn decode_id<T>(value: &str, column: &'static str) -> Result<T, DbError>
where
    T: std::str::FromStr<Err = clustree_id::IdError>,
{
    value.parse().map_err(|e: clustree_id::IdError| DbError::Decode {
        column,
        message: e.to_string(),
    })
}

fn into_clusters(rows: Vec<ClusterRow>) -> Result<Vec<Cluster>, RegistryError> {
    rows.into_iter()
        .map(|row| Cluster::try_from(row).map_err(RegistryError::from))
        .collect()
}

/// Registry and identity directory over the `users`, `clusters` and
/// `authorized_users` tables.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an account if the email is unknown. Returns the account id.
    pub async fn ensure_user(&self, email: &str) -> Result<UserId, RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email)
            VALUES ($1, $2)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(UserId::new().to_string())
        .bind(email)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let id: String = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;

        Ok(decode_id(&id, "id")?)
    }
}

#[async_trait]
impl ClusterRegistry for PgRegistry {
    async fn create_cluster(&self, cluster: NewCluster) -> Result<Cluster, RegistryError> {
        let query = format!(
            r#"
            INSERT INTO clusters (
                id,
                name,
                owner_id,
                cluster_type,
                group_size,
                min_affinity,
                max_affinity
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {CLUSTER_COLUMNS}
            "#
        );

        let result = sqlx::query_as::<_, ClusterRow>(&query)
            .bind(ClusterId::new().to_string())
            .bind(cluster.name.as_str())
            .bind(cluster.owner_id.to_string())
            .bind(&cluster.cluster_type)
            .bind(cluster.group_size)
            .bind(cluster.min_affinity)
            .bind(cluster.max_affinity)
            .fetch_one(&self.pool)
            .await;

        match result.map_err(DbError::Query) {
            Ok(row) => Ok(row.try_into()?),
            Err(e) if e.is_unique_violation() => Err(RegistryError::Conflict {
                name: cluster.name.into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_cluster_by_id(&self, id: ClusterId) -> Result<Option<Cluster>, RegistryError> {
        let query = format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1");
        let row = sqlx::query_as::<_, ClusterRow>(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;

        Ok(row.map(Cluster::try_from).transpose()?)
    }

    async fn get_clusters_by_owner(&self, owner_id: UserId) -> Result<Vec<Cluster>, RegistryError> {
        let query = format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE owner_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, ClusterRow>(&query)
            .bind(owner_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;

        into_clusters(rows)
    }

    async fn get_clusters_for_user(&self, user_id: UserId) -> Result<Vec<Cluster>, RegistryError> {
        let rows = sqlx::query_as::<_, ClusterRow>(
            r#"
            SELECT
                c.id,
                c.name,
                c.owner_id,
                c.cluster_type,
                c.group_size,
                c.min_affinity,
                c.max_affinity,
                c.created_at
            FROM clusters c
            JOIN authorized_users a ON a.cluster_id = c.id
            WHERE a.user_id = $1
            ORDER BY c.created_at, c.id
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        into_clusters(rows)
    }

    async fn delete_cluster(&self, id: ClusterId, owner_id: UserId) -> Result<bool, RegistryError> {
        // authorized_users rows go with the cluster through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM clusters WHERE id = $1 AND owner_id = $2")
            .bind(id.to_string())
            .bind(owner_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;

        debug!(cluster_id = %id, deleted = result.rows_affected(), "Cluster delete");
        Ok(result.rows_affected() > 0)
    }

    async fn authorize_user(&self, cluster_id: ClusterId, user_id: UserId) -> Result<(), RegistryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO authorized_users (cluster_id, user_id)
            SELECT $1, $2
            WHERE EXISTS (SELECT 1 FROM clusters WHERE id = $1)
            ON CONFLICT (cluster_id, user_id) DO NOTHING
            "#,
        )
        .bind(cluster_id.to_string())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                debug!(cluster_id = %cluster_id, granted = done.rows_affected(), "Authorize user");
                Ok(())
            }
            // The cluster was deleted between the check and the insert.
            Err(sqlx::Error::Database(e))
                if e.is_foreign_key_violation() && e.constraint() == Some(CLUSTER_FK) =>
            {
                Ok(())
            }
            Err(e) => Err(DbError::Query(e).into()),
        }
    }

    async fn authorized_users(&self, cluster_id: ClusterId) -> Result<Vec<UserId>, RegistryError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM authorized_users WHERE cluster_id = $1 ORDER BY user_id",
        )
        .bind(cluster_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        ids.iter()
            .map(|id| decode_id(id, "user_id").map_err(RegistryError::from))
            .collect()
    }

    async fn health_check(&self) -> Result<(), RegistryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }
}

#[async_trait]
impl IdentityDirectory for PgRegistry {
    async fn resolve_user_id_by_email(&self, email: &str) -> Result<Option<UserId>, RegistryError> {
        let id: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;

        Ok(id.map(|id| decode_id(&id, "id")).transpose()?)
    }

    async fn email_for_user(&self, user_id: UserId) -> Result<Option<String>, RegistryError> {
        let email = sqlx::query("SELECT email FROM users WHERE id = $1")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?
            .map(|row| row.try_get::<String, _>("email"))
            .transpose()
            .map_err(DbError::Query)?;

        Ok(email)
    }
}
