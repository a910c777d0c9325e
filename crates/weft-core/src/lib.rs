pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use self::config::*;
pub use self::error::*;
pub use self::store::{
    apply_task_mutation, apply_workflow_mutation, task_mutation, workflow_mutation,
    InMemoryStateStore, StateStore, StoreResult, TaskMutation, WorkflowFilter, WorkflowMutation,
};
pub use self::types::*;
