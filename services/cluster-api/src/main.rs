//! clustree cluster API
//!
//! Accepts rosters, writes solver artifacts, grants students access and runs
//! the external grouping solver on demand.

use std::sync::Arc;

use anyhow::Result;
use clustree_affinity::ArtifactStore;
use clustree_cluster_api::{
    api, config,
    db::Database,
    registry::{ClusterRegistry, IdentityDirectory, MemoryRegistry, PgRegistry},
    service::ClusterService,
    solver::SolverJobRunner,
    state::AppState,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to CLUSTREE_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting clustree cluster API");
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        scripts_dir = %config.runner.scripts_dir.display(),
        solver_timeout_secs = config.runner.timeout.as_secs(),
        "Configuration loaded"
    );

    let (registry, identities): (Arc<dyn ClusterRegistry>, Arc<dyn IdentityDirectory>) =
        match &config.database {
            Some(db_config) => {
                let db = match Database::connect(db_config).await {
                    Ok(db) => {
                        info!("Database connection established");
                        db
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to connect to database");
                        return Err(e.into());
                    }
                };

                if config.dev_mode {
                    info!("Running database migrations (dev mode)");
                    if let Err(e) = db.run_migrations().await {
                        error!(error = %e, "Failed to run migrations");
                        return Err(e.into());
                    }
                }

                let registry = Arc::new(PgRegistry::new(db.pool().clone()));
                for email in &config.seed_users {
                    registry.ensure_user(email).await?;
                }
                let identities: Arc<dyn IdentityDirectory> = registry.clone();
                (registry as Arc<dyn ClusterRegistry>, identities)
            }
            None => {
                warn!("DATABASE_URL not set; cluster metadata is kept in memory");
                let registry = Arc::new(MemoryRegistry::new());
                for email in &config.seed_users {
                    registry.add_user(email).await;
                }
                let identities: Arc<dyn IdentityDirectory> = registry.clone();
                (registry as Arc<dyn ClusterRegistry>, identities)
            }
        };
    if !config.seed_users.is_empty() {
        info!(count = config.seed_users.len(), "Seed users registered");
    }

    let store = Arc::new(ArtifactStore::new(&config.data_dir));
    if let Err(e) = store.check_writable().await {
        error!(error = %e, "Artifact directory is not writable");
        return Err(e.into());
    }

    let runner = Arc::new(SolverJobRunner::new(config.runner.clone(), store.clone()));
    match runner.list_scripts().await {
        Ok(scripts) => info!(scripts = ?scripts, "Solver scripts available"),
        Err(e) => warn!(error = %e, "Failed to list solver scripts"),
    }

    let service = ClusterService::new(registry, identities, store, runner);
    let state = AppState::new(service, config.max_upload_bytes);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    });

    if let Err(e) = server.await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Cluster API shutdown complete");
    Ok(())
}
