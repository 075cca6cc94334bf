//! Database connection manager backed by an r2d2 SQLite pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tillsync_domain::{Result, TillSyncError};
use tracing::info;

use crate::errors::{map_sql_error, InfraError};

const SCHEMA_VERSION: i32 = 1;
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Pooled connection type handed to repositories.
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Database manager that wraps an r2d2 SQLite pool.
///
/// Connections are opened in WAL mode with a busy timeout so the dispatch
/// loop, metrics collection, and caller enqueues can overlap.
pub struct DbManager {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl DbManager {
    /// Create a new manager with the given pool size.
    pub fn new<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| TillSyncError::from(InfraError::from(e)))?;

        info!(
            db_path = %path.display(),
            max_connections = pool.max_size(),
            "sqlite pool initialised"
        );

        Ok(Self { pool, path })
    }

    /// Acquire a connection from the pool.
    pub fn get_connection(&self) -> Result<DbConnection> {
        self.pool.get().map_err(|e| TillSyncError::from(InfraError::from(e)))
    }

    /// Ensure the full schema exists on the current database.
    pub fn run_migrations(&self) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute_batch(SCHEMA_SQL).map_err(map_sql_error)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at)
             VALUES (?1, CAST(strftime('%s','now') AS INTEGER) * 1000)",
            params![SCHEMA_VERSION],
        )
        .map_err(map_sql_error)?;
        Ok(())
    }

    /// Return the configured database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current schema version, if migrations have run.
    pub fn schema_version(&self) -> Result<Option<i32>> {
        let conn = self.get_connection()?;
        let version = conn
            .query_row("SELECT MAX(version) FROM schema_version", params![], |row| {
                row.get::<_, Option<i32>>(0)
            })
            .map_err(map_sql_error)?;
        Ok(version)
    }

    /// Verify database connectivity with a trivial query.
    pub fn health_check(&self) -> Result<()> {
        let conn = self.get_connection()?;
        conn.query_row("SELECT 1", params![], |row| row.get::<_, i32>(0))
            .map_err(map_sql_error)?;
        Ok(())
    }
}

/// Convenience constructor used across tests and the engine.
pub fn open_database<P: AsRef<Path>>(db_path: P, pool_size: u32) -> Result<Arc<DbManager>> {
    let manager = DbManager::new(db_path, pool_size)?;
    manager.run_migrations()?;
    Ok(Arc::new(manager))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn migrations_create_schema_version() {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db_path = temp_dir.path().join("test.db");

        let manager = DbManager::new(&db_path, 4).expect("manager created");
        manager.run_migrations().expect("migrations run");

        assert_eq!(manager.schema_version().expect("version query"), Some(SCHEMA_VERSION));
        manager.health_check().expect("health check");
    }

    #[test]
    fn migrations_are_idempotent() {
        let temp_dir = TempDir::new().expect("temp dir created");
        let db_path = temp_dir.path().join("test.db");

        let manager = DbManager::new(&db_path, 2).expect("manager created");
        manager.run_migrations().expect("first run");
        manager.run_migrations().expect("second run");
        assert_eq!(manager.schema_version().expect("version query"), Some(SCHEMA_VERSION));
    }
}
