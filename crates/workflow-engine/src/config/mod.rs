//! Configuration module for the NoETL Workflow Engine.
//!
//! This module provides configuration loading from environment variables
//! using the `envy` crate for type-safe environment variable parsing.

mod app;
mod database;
mod engine;

pub use app::{AppConfig, ExecutorKind, StoreKind};
pub use database::DatabaseConfig;
pub use engine::EngineConfig;
