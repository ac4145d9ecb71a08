//! Workflow, task and action specifications.
//!
//! Specs arrive as YAML or JSON, are normalized once (task names, inline
//! command parameters) and validated before they are stored. The stored JSON
//! form parses back to an identical spec.

pub mod action;
pub mod command;
pub mod task;
pub mod workflow;

pub use action::ActionSpec;
pub use command::{parse_command, parse_input_declaration, InputDeclaration, ParsedCommand};
pub use task::{
    is_engine_command, parse_with_items, EngineCommand, ItemsSource, RetrySpec, TaskSpec,
    Transition, WithItemsClause,
};
pub use workflow::{InputParam, TaskDefaults, WorkflowSpec};
