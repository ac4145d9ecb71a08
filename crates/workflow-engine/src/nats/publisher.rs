//! JetStream publisher for engine messages.

use async_nats::jetstream::{self, Context};
use serde::Serialize;
use thiserror::Error;

use crate::error::AppError;

/// Errors that can occur during NATS operations.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),
}

impl From<NatsError> for AppError {
    fn from(err: NatsError) -> Self {
        AppError::Nats(err.to_string())
    }
}

/// Connect to a NATS server.
pub async fn connect(url: &str) -> Result<async_nats::Client, NatsError> {
    let client = async_nats::connect(url)
        .await
        .map_err(|e| NatsError::Connection(e.to_string()))?;
    tracing::info!(url = %url, "Connected to NATS");
    Ok(client)
}

/// Publishes JSON messages to a single JetStream subject.
#[derive(Clone)]
pub struct NatsPublisher {
    js: Context,
    subject: String,
}

impl NatsPublisher {
    /// Create a publisher, creating the backing stream when missing.
    pub async fn new(client: async_nats::Client, subject: &str, stream: &str) -> Result<Self, NatsError> {
        let js = jetstream::new(client);
        Self::ensure_stream(&js, stream, subject).await?;
        Ok(Self {
            js,
            subject: subject.to_string(),
        })
    }

    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    max_age: std::time::Duration::from_secs(24 * 3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Serialize `message` and wait for the JetStream acknowledgement.
    pub async fn publish<T: Serialize>(&self, message: &T) -> Result<(), NatsError> {
        let payload = encode(message)?;

        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(subject = %self.subject, "Published message");
        Ok(())
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, NatsError> {
    serde_json::to_vec(message).map_err(|e| NatsError::Publish(format!("Serialization error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_json_payload() {
        let payload = encode(&serde_json::json!({"action_execution_id": "a-1"})).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded["action_execution_id"], "a-1");
    }

    #[test]
    fn test_nats_error_maps_to_app_error() {
        let err: AppError = NatsError::Publish("no responders".to_string()).into();
        assert!(matches!(err, AppError::Nats(msg) if msg.contains("no responders")));
    }
}
