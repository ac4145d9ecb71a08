//! Executor that hands actions to remote workers over JetStream.
//!
//! Workers report back through `POST /api/actions/{id}/complete`.

use async_trait::async_trait;

use super::{ActionExecutor, ActionRequest};
use crate::error::AppResult;
use crate::nats::NatsPublisher;

pub struct NatsExecutor {
    publisher: NatsPublisher,
}

impl NatsExecutor {
    pub fn new(publisher: NatsPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl ActionExecutor for NatsExecutor {
    async fn run_action(&self, request: ActionRequest) -> AppResult<()> {
        self.publisher.publish(&request).await?;
        tracing::debug!(
            action = %request.action_name,
            action_execution_id = %request.action_execution_id,
            subject = %self.publisher.subject(),
            "Published action request"
        );
        Ok(())
    }

    /// Remote workers own the plugin catalogue; every name is forwarded.
    fn supports(&self, _action_name: &str) -> bool {
        true
    }
}
