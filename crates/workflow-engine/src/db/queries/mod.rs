//! Database queries for the NoETL Workflow Engine.

pub mod action_execution;
pub mod definition;
pub mod lock;
pub mod task_execution;
pub mod workflow_execution;
