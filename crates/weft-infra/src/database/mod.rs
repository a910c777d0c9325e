//! PostgreSQL persistence for workflow and task execution states

pub mod migrations;
pub mod pool;
pub mod rows;
pub mod state_store;

pub use migrations::{run_migrations, Migration, MIGRATIONS};
pub use pool::{create_pool, PgPoolConfig};
pub use state_store::PgStateStore;
