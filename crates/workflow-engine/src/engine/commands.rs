//! Engine pseudo-tasks: `noop`, `fail`, `succeed` and `pause`.

use super::states::State;
use super::task::TaskCore;
use crate::error::AppResult;
use crate::spec::EngineCommand;

impl TaskCore {
    /// Name of the task whose transition reached this command.
    async fn triggering_task_name(&self) -> AppResult<String> {
        let Some(trigger) = self.triggered_by.first() else {
            return Ok(String::new());
        };
        Ok(self
            .engine
            .store
            .get_task_execution(&trigger.task_id)
            .await?
            .map(|ex| ex.name)
            .unwrap_or_default())
    }

    pub(super) async fn run_engine_command(&mut self, command: EngineCommand) -> AppResult<()> {
        let wf_ex_id = self.wf_ex.id.clone();
        tracing::info!(
            command = command.name(),
            workflow = %self.wf_ex.name,
            workflow_execution_id = %wf_ex_id,
            "Running engine command"
        );

        match command {
            EngineCommand::Noop => {
                if self.task_ex.is_none() && !self.create_execution(State::Running, None).await? {
                    return Ok(());
                }
                self.complete(State::Success, None).await
            }
            EngineCommand::Fail => {
                let message = format!(
                    "Workflow failed by 'fail' command from task '{}'",
                    self.triggering_task_name().await?
                );
                self.engine
                    .stop_workflow(self.ctx.clone(), wf_ex_id, State::Error, Some(message))
                    .await
            }
            EngineCommand::Succeed => {
                let message = format!(
                    "Workflow succeeded by 'succeed' command from task '{}'",
                    self.triggering_task_name().await?
                );
                self.engine
                    .stop_workflow(self.ctx.clone(), wf_ex_id, State::Success, Some(message))
                    .await
            }
            EngineCommand::Pause => self.engine.pause_workflow(&self.ctx, &wf_ex_id).await.map(|_| ()),
        }
    }
}
