//! NoETL Workflow Engine Library
//!
//! A persistent, completion-driven workflow engine. Workflows are graphs of
//! tasks connected by `on-success`, `on-error` and `on-complete`
//! transitions; every task runs an action and every action result is fed
//! back into the engine to move the graph forward.
//!
//! - **Definitions**: YAML/JSON workflow and ad-hoc action specs
//! - **Executions**: workflow, task and action execution records in a [`store::Store`]
//! - **Flow control**: guards, joins, with-items fan-out, retries
//! - **Workflow control**: pause/resume with backlog, stop, cascading cancel
//! - **Actions**: in-process plugins or NATS JetStream workers
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Database connectivity, models and queries
//! - [`engine`]: Task and workflow state machines
//! - [`error`]: Custom error types with Axum integration
//! - [`executor`]: Action executors
//! - [`expression`]: Jinja expression evaluation
//! - [`handlers`]: HTTP route handlers
//! - [`spec`]: Workflow and action specifications
//! - [`store`]: Persistence backends
//! - [`state`]: Shared application state
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use noetl_workflow_engine::{
//!     config::EngineConfig, engine::{Engine, StartWorkflowRequest},
//!     executor::LocalExecutor, expression::JinjaEvaluator, store::MemoryStore,
//!     context::ExecContext,
//! };
//!
//! let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//! let engine = Engine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(JinjaEvaluator::new()),
//!     Arc::new(LocalExecutor::new(tx)),
//!     EngineConfig::default(),
//! );
//! tokio::spawn(engine.clone().run_completion_loop(rx));
//!
//! let ctx = ExecContext::default();
//! engine.register_workflow(&ctx, source, "").await?;
//! let wf_ex = engine
//!     .start_workflow(&ctx, StartWorkflowRequest { name: "hello".into(), ..Default::default() })
//!     .await?;
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expression;
pub mod handlers;
pub mod nats;
pub mod notify;
pub mod result_ext;
pub mod spec;
pub mod state;
pub mod store;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
