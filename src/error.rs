//! Error types for qtask-rs.

use thiserror::Error;

use crate::model::Status;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported storage uri scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid queue transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("invalid handler registration: {0}")]
    Registration(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Storage connectivity or storage-side failure. Fatal to the loop that
    /// hit it; never retried internally.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::Redis(_) | Error::Database(_) | Error::Migration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
