//! Database error types.

use std::path::PathBuf;

use thiserror::Error;

/// Pool and schema failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("no migrations directory found; tried {}", join_paths(.tried))]
    MigrationDirNotFound { tried: Vec<PathBuf> },
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
