//! Application state for the NoETL Workflow Engine server.
//!
//! Shared by every handler through Axum's state management.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::engine::Engine;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Workflow engine
    pub engine: Engine,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Database pool, absent when running on the in-memory store
    pub db: Option<DbPool>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Engine, config: AppConfig, db: Option<DbPool>) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            db,
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
