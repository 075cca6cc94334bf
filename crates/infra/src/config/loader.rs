//! Configuration loading: TOML file with environment overrides.
//!
//! Resolution order: `TILLSYNC_CONFIG` names the file explicitly, otherwise
//! well-known paths are probed. Individual values can then be overridden
//! via `TILLSYNC_*` variables, which wins over the file.

use std::path::{Path, PathBuf};

use tillsync_domain::{Result as DomainResult, SyncConfig, TillSyncError};
use tracing::info;

const CONFIG_ENV: &str = "TILLSYNC_CONFIG";
const PROBE_PATHS: &[&str] = &["tillsync.toml", "config/tillsync.toml"];

/// Load, override, and validate the engine configuration.
pub fn load_config() -> DomainResult<SyncConfig> {
    // A missing .env file is not an error; it is simply absent in prod.
    dotenvy::dotenv().ok();

    let path = std::env::var(CONFIG_ENV)
        .ok()
        .map(PathBuf::from)
        .or_else(probe_default_paths)
        .ok_or_else(|| {
            TillSyncError::Config(format!(
                "no configuration file found; set {CONFIG_ENV} or create one of: {}",
                PROBE_PATHS.join(", ")
            ))
        })?;

    let mut config = load_from_path(&path)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    info!(target: "tillsync::config", config_path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Parse a config file without environment overrides. Used directly by
/// tests and by `load_config`.
pub fn load_from_path(path: &Path) -> DomainResult<SyncConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        TillSyncError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    toml::from_str(&raw)
        .map_err(|e| TillSyncError::Config(format!("invalid config {}: {e}", path.display())))
}

fn probe_default_paths() -> Option<PathBuf> {
    PROBE_PATHS.iter().map(PathBuf::from).find(|p| p.is_file())
}

fn apply_env_overrides(config: &mut SyncConfig) {
    if let Ok(store_id) = std::env::var("TILLSYNC_STORE_ID") {
        config.store_id = store_id;
    }
    if let Ok(remote_url) = std::env::var("TILLSYNC_REMOTE_URL") {
        config.remote_url = remote_url;
    }
    if let Ok(db_path) = std::env::var("TILLSYNC_DB_PATH") {
        config.database.path = PathBuf::from(db_path);
    }
}
