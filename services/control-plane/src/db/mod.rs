//! Postgres persistence for capacity accounting.
//!
//! Node, storage, binding and VM rows mirror the core types. Derived columns
//! are written only from a [`NodeEntry`](capsched_capacity::NodeEntry) that
//! was recomputed in memory while the node's advisory lock was held.

mod error;
mod fleet_store;
pub mod rows;

pub use error::DbError;
pub use fleet_store::{node_lock_key, FleetStore};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use capsched_capacity::Settings;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/capsched".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Reads `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`.
    /// Unset or unparsable values keep their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections),
            ..defaults
        }
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(Some(self.idle_timeout))
            .max_lifetime(Some(self.max_lifetime))
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Where the runtime migrator looks, in order: the working directory, the
/// repo root, and the crate's own directory at build time.
fn migration_dirs() -> [PathBuf; 3] {
    [
        PathBuf::from("./migrations"),
        PathBuf::from("services/control-plane/migrations"),
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    ]
}

async fn locate_migrator() -> Result<(PathBuf, Migrator), DbError> {
    let dirs = migration_dirs();
    let mut last_error = None;
    for dir in &dirs {
        match Migrator::new(dir.clone()).await {
            Ok(migrator) => return Ok((dir.clone(), migrator)),
            Err(e) => last_error = Some(e),
        }
    }

    Err(DbError::MigrationDirNotFound {
        tried: dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
        last_error: last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string()),
    })
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );
        let pool = config
            .pool_options()
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let (dir, migrator) = locate_migrator().await?;
        info!(migrations_dir = %dir.display(), "Running database migrations");
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!("Database migrations complete");
        Ok(())
    }

    pub fn fleet_store(&self, settings: Settings) -> FleetStore {
        FleetStore::new(self.pool.clone(), settings)
    }
}
