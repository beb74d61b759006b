//! Postgres pool and schema migrations.
//!
//! Connection settings come from [`crate::config::Config`]; nothing here
//! reads the environment.

mod error;

pub use error::DbError;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::store::PgResourceStore;

/// Pool sizing and the connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a query waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/respool".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns the pool shared by every store handle.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Opening pool connections"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
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

    /// Apply the pool schema from the crate's `migrations/` directory.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let dir = locate_migrations(&migration_candidates())?;
        let migrator = Migrator::new(dir.clone())
            .await
            .map_err(DbError::Migration)?;

        info!(migrations_dir = %dir.display(), migrations = migrator.iter().count(), "Applying pool schema");
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        Ok(())
    }

    pub fn resource_store(&self) -> PgResourceStore {
        PgResourceStore::new(self.pool.clone())
    }
}

/// Where the schema may live: next to the manifest at build time, or
/// relative to the working directory of an installed binary.
fn migration_candidates() -> Vec<PathBuf> {
    vec![
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        PathBuf::from("migrations"),
        PathBuf::from("services/pool-manager/migrations"),
    ]
}

fn locate_migrations(candidates: &[PathBuf]) -> Result<PathBuf, DbError> {
    for dir in candidates {
        if dir.is_dir() {
            return Ok(dir.clone());
        }
        debug!(dir = %dir.display(), "No migrations here");
    }
    Err(DbError::MigrationDirNotFound {
        tried: candidates.to_vec(),
    })
}
