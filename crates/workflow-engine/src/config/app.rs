//! Application configuration for the NoETL Workflow Engine server.

use serde::Deserialize;

/// Which state store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Postgres,
    Memory,
}

/// Which action executor the engine hands actions to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// In-process plugins (`std.echo`, `std.noop`, ...).
    Local,
    /// Action requests published to NATS JetStream for remote workers.
    Nats,
}

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `NOETL_`:
/// - `NOETL_HOST`: Server bind address (default: "0.0.0.0")
/// - `NOETL_PORT`: Server port (default: 8083)
/// - `NOETL_DEBUG`: Enable debug mode (default: false)
/// - `NOETL_SERVER_NAME`: Server name for identification
/// - `NOETL_NATS_URL`: NATS URL (optional)
/// - `NOETL_STORE`: `postgres` or `memory` (default: postgres)
/// - `NOETL_EXECUTOR`: `local` or `nats` (default: local)
/// - `NOETL_LOG_JSON`: Emit JSON log lines (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// State store backend
    #[serde(default = "default_store")]
    pub store: StoreKind,

    /// Action executor backend
    #[serde(default = "default_executor")]
    pub executor: ExecutorKind,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8083
}

fn default_server_name() -> String {
    "noetl-workflow-engine".to_string()
}

fn default_store() -> StoreKind {
    StoreKind::Postgres
}

fn default_executor() -> ExecutorKind {
    ExecutorKind::Local
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `NOETL_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("NOETL_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            server_name: default_server_name(),
            nats_url: None,
            store: default_store(),
            executor: default_executor(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8083);
        assert_eq!(config.store, StoreKind::Postgres);
        assert_eq!(config.executor, ExecutorKind::Local);
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8083");
    }

    #[test]
    fn test_from_iter_overrides() {
        let vars = vec![
            ("STORE".to_string(), "memory".to_string()),
            ("EXECUTOR".to_string(), "nats".to_string()),
            ("PORT".to_string(), "9000".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.executor, ExecutorKind::Nats);
        assert_eq!(config.port, 9000);
    }
}
