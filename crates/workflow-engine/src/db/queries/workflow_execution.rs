//! Workflow execution queries.

use chrono::Utc;

use crate::db::models::WorkflowExecution;
use crate::db::DbPool;
use crate::engine::states::State;
use crate::error::AppResult;

const WORKFLOW_EXECUTION_COLUMNS: &str = r#"
    id, name, workflow_id, namespace, description, state, state_info,
    input, output, params, runtime_context, context, spec, tags,
    task_execution_id, root_execution_id, project_id,
    created_at, updated_at, finished_at
"#;

/// Insert a new workflow execution.
pub async fn insert_workflow_execution(pool: &DbPool, ex: &WorkflowExecution) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.workflow_execution (
            id, name, workflow_id, namespace, description, state, state_info,
            input, output, params, runtime_context, context, spec, tags,
            task_execution_id, root_execution_id, project_id, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(&ex.id)
    .bind(&ex.name)
    .bind(&ex.workflow_id)
    .bind(&ex.namespace)
    .bind(&ex.description)
    .bind(ex.state.as_str())
    .bind(&ex.state_info)
    .bind(&ex.input)
    .bind(&ex.output)
    .bind(&ex.params)
    .bind(&ex.runtime_context)
    .bind(&ex.context)
    .bind(&ex.spec)
    .bind(&ex.tags)
    .bind(&ex.task_execution_id)
    .bind(&ex.root_execution_id)
    .bind(&ex.project_id)
    .bind(ex.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a workflow execution by id.
pub async fn get_workflow_execution(pool: &DbPool, id: &str) -> AppResult<Option<WorkflowExecution>> {
    let ex = sqlx::query_as::<_, WorkflowExecution>(&format!(
        "SELECT {} FROM noetl.workflow_execution WHERE id = $1",
        WORKFLOW_EXECUTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(ex)
}

/// Update JSON columns; `None` keeps the stored value.
pub async fn update_workflow_execution(
    pool: &DbPool,
    id: &str,
    output: Option<&serde_json::Value>,
    runtime_context: Option<&serde_json::Value>,
    context: Option<&serde_json::Value>,
) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.workflow_execution
        SET output = COALESCE($2, output),
            runtime_context = COALESCE($3, runtime_context),
            context = COALESCE($4, context),
            updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(output)
    .bind(runtime_context)
    .bind(context)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Compare-and-set the workflow state. Returns `true` when the row changed.
pub async fn transition_workflow_state(
    pool: &DbPool,
    id: &str,
    expected: State,
    state: State,
    state_info: Option<&str>,
) -> AppResult<bool> {
    let now = Utc::now();
    let finished_at = state.is_completed().then_some(now);

    let result = sqlx::query(
        r#"
        UPDATE noetl.workflow_execution
        SET state = $3,
            state_info = $4,
            updated_at = $5,
            finished_at = COALESCE($6, finished_at)
        WHERE id = $1 AND state = $2
        "#,
    )
    .bind(id)
    .bind(expected.as_str())
    .bind(state.as_str())
    .bind(state_info)
    .bind(now)
    .bind(finished_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Sub-workflow executions started by a task execution.
pub async fn get_workflow_executions_by_task(
    pool: &DbPool,
    task_execution_id: &str,
) -> AppResult<Vec<WorkflowExecution>> {
    let executions = sqlx::query_as::<_, WorkflowExecution>(&format!(
        "SELECT {} FROM noetl.workflow_execution WHERE task_execution_id = $1 ORDER BY created_at ASC",
        WORKFLOW_EXECUTION_COLUMNS
    ))
    .bind(task_execution_id)
    .fetch_all(pool)
    .await?;

    Ok(executions)
}
