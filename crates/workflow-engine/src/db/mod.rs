//! Database module for the NoETL Workflow Engine.
//!
//! PostgreSQL connectivity, execution models and the queries behind
//! [`crate::store::PgStore`].

pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{create_pool, DbPool};
