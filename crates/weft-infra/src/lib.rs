pub mod database;
pub mod resilience;
pub mod retrying;

pub use database::{create_pool, run_migrations, Migration, PgPoolConfig, PgStateStore};
pub use resilience::{retry_with, RetryConfig, RetryPolicy};
pub use retrying::RetryingStateStore;

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InfraError>;
