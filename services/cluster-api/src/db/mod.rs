//! Postgres pool and schema migrations for [`PgRegistry`].
//!
//! [`PgRegistry`]: crate::registry::PgRegistry

mod error;

pub use error::DbError;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

/// Pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// Overrides the migrations directory lookup.
    pub migrations_dir: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/clustree".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            migrations_dir: None,
        }
    }
}

impl DbConfig {
    /// `None` when `DATABASE_URL` is unset, which selects the in-memory
    /// registry.
    pub fn from_env() -> Option<Self> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let defaults = Self::default();

        Some(Self {
            database_url,
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections),
            acquire_timeout: Duration::from_secs(env_or(
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )),
            migrations_dir: std::env::var_os("CLUSTREE_MIGRATIONS_DIR").map(PathBuf::from),
        })
    }

    /// Directories tried, in order, when applying migrations.
    fn migration_dirs(&self) -> Vec<PathBuf> {
        match &self.migrations_dir {
            Some(dir) => vec![dir.clone()],
            None => vec![
                PathBuf::from("migrations"),
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
            ],
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// A connected pool plus the settings it came from.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    config: DbConfig,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from the first directory that loads.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let tried = self.config.migration_dirs();

        for dir in &tried {
            let migrator = match Migrator::new(dir.clone()).await {
                Ok(migrator) => migrator,
                Err(e) => {
                    debug!(migrations_dir = %dir.display(), error = %e, "Migrations not loadable here");
                    continue;
                }
            };

            info!(
                migrations_dir = %dir.display(),
                count = migrator.iter().count(),
                "Running database migrations"
            );
            migrator.run(&self.pool).await.map_err(DbError::Migration)?;
            return Ok(());
        }

        Err(DbError::NoMigrations { tried })
    }
}
