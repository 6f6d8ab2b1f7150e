use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::DbConfig;
use crate::solver::RunnerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub data_dir: PathBuf,
    pub runner: RunnerConfig,
    pub max_upload_bytes: usize,
    /// `None` runs on the in-memory registry.
    pub database: Option<DbConfig>,
    pub seed_users: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CLUSTREE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .context("CLUSTREE_LISTEN_ADDR is not a socket address")?;

        let log_level = std::env::var("CLUSTREE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("CLUSTREE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let data_dir = std::env::var("CLUSTREE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./uploads"));

        let scripts_dir = std::env::var("CLUSTREE_SCRIPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./solvers"));

        let timeout_secs: u64 = match std::env::var("CLUSTREE_SOLVER_TIMEOUT_SECS") {
            Ok(v) => v
                .parse()
                .context("CLUSTREE_SOLVER_TIMEOUT_SECS must be a number of seconds")?,
            Err(_) => 300,
        };

        let max_upload_bytes = match std::env::var("CLUSTREE_MAX_UPLOAD_BYTES") {
            Ok(v) => v
                .parse()
                .context("CLUSTREE_MAX_UPLOAD_BYTES must be a byte count")?,
            Err(_) => 1024 * 1024,
        };

        let seed_users = std::env::var("CLUSTREE_SEED_USERS")
            .map(|v| parse_list(&v))
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            data_dir,
            runner: RunnerConfig {
                scripts_dir,
                timeout: Duration::from_secs(timeout_secs),
            },
            max_upload_bytes,
            database: DbConfig::from_env(),
            seed_users,
        })
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_skips_blanks() {
        assert_eq!(
            parse_list(" a@x.com, ,b@x.com,"),
            vec!["a@x.com".to_string(), "b@x.com".to_string()]
        );
        assert!(parse_list("").is_empty());
    }
}
