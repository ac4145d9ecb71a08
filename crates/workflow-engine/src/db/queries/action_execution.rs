//! Action execution queries.

use chrono::Utc;

use crate::db::models::ActionExecution;
use crate::db::DbPool;
use crate::error::AppResult;

const ACTION_EXECUTION_COLUMNS: &str = r#"
    id, name, spec, task_execution_id, workflow_execution_id, workflow_name, project_id,
    inputs, outputs, state, state_info, runtime_context, last_heartbeat,
    created_at, updated_at, finished_at
"#;

/// Insert a new action execution.
pub async fn insert_action_execution(pool: &DbPool, ex: &ActionExecution) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.action_execution (
            id, name, spec, task_execution_id, workflow_execution_id, workflow_name, project_id,
            inputs, outputs, state, state_info, runtime_context, last_heartbeat, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(&ex.id)
    .bind(&ex.name)
    .bind(&ex.spec)
    .bind(&ex.task_execution_id)
    .bind(&ex.workflow_execution_id)
    .bind(&ex.workflow_name)
    .bind(&ex.project_id)
    .bind(&ex.inputs)
    .bind(&ex.outputs)
    .bind(ex.state.as_str())
    .bind(&ex.state_info)
    .bind(&ex.runtime_context)
    .bind(ex.last_heartbeat)
    .bind(ex.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get an action execution by id.
pub async fn get_action_execution(pool: &DbPool, id: &str) -> AppResult<Option<ActionExecution>> {
    let ex = sqlx::query_as::<_, ActionExecution>(&format!(
        "SELECT {} FROM noetl.action_execution WHERE id = $1",
        ACTION_EXECUTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(ex)
}

/// Overwrite the mutable columns of an action execution.
pub async fn update_action_execution(pool: &DbPool, ex: &ActionExecution) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.action_execution
        SET inputs = $2,
            outputs = $3,
            state = $4,
            state_info = $5,
            runtime_context = $6,
            last_heartbeat = $7,
            finished_at = $8,
            updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(&ex.id)
    .bind(&ex.inputs)
    .bind(&ex.outputs)
    .bind(ex.state.as_str())
    .bind(&ex.state_info)
    .bind(&ex.runtime_context)
    .bind(ex.last_heartbeat)
    .bind(ex.finished_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Action executions of a task execution, oldest first.
pub async fn get_action_executions_by_task(
    pool: &DbPool,
    task_execution_id: &str,
) -> AppResult<Vec<ActionExecution>> {
    let executions = sqlx::query_as::<_, ActionExecution>(&format!(
        "SELECT {} FROM noetl.action_execution WHERE task_execution_id = $1 ORDER BY created_at ASC",
        ACTION_EXECUTION_COLUMNS
    ))
    .bind(task_execution_id)
    .fetch_all(pool)
    .await?;

    Ok(executions)
}
