//! Database models for the NoETL Workflow Engine.

mod definition;
mod execution;
mod lock;

pub use definition::{ActionDefinition, WorkflowDefinition, SCOPE_PRIVATE, SCOPE_PUBLIC};
pub use execution::{ActionExecution, TaskExecution, TaskType, WorkflowExecution, BACKLOG_COMMANDS};
pub(crate) use execution::{json_get, json_set};
pub use lock::NamedLock;
