//! Task execution queries.

use chrono::Utc;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};

use crate::db::models::TaskExecution;
use crate::db::DbPool;
use crate::engine::states::State;
use crate::error::AppResult;
use crate::store::TaskExecutionFilter;

const TASK_EXECUTION_COLUMNS: &str = r#"
    id, name, task_type, workflow_execution_id, workflow_name, workflow_id, project_id,
    spec, state, state_info, published, processed, next_tasks, has_next_tasks,
    error_handled, unique_key, runtime_context, in_context,
    created_at, started_at, updated_at, finished_at
"#;

/// Insert a task execution. Returns `false` when the unique key is taken.
pub async fn insert_task_execution(pool: &DbPool, ex: &TaskExecution) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO noetl.task_execution (
            id, name, task_type, workflow_execution_id, workflow_name, workflow_id, project_id,
            spec, state, state_info, published, processed, next_tasks, has_next_tasks,
            error_handled, unique_key, runtime_context, in_context, created_at, started_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&ex.id)
    .bind(&ex.name)
    .bind(ex.task_type.to_string())
    .bind(&ex.workflow_execution_id)
    .bind(&ex.workflow_name)
    .bind(&ex.workflow_id)
    .bind(&ex.project_id)
    .bind(&ex.spec)
    .bind(ex.state.as_str())
    .bind(&ex.state_info)
    .bind(&ex.published)
    .bind(ex.processed)
    .bind(Json(&ex.next_tasks))
    .bind(ex.has_next_tasks)
    .bind(ex.error_handled)
    .bind(&ex.unique_key)
    .bind(&ex.runtime_context)
    .bind(&ex.in_context)
    .bind(ex.created_at)
    .bind(ex.started_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Get a task execution by id.
pub async fn get_task_execution(pool: &DbPool, id: &str) -> AppResult<Option<TaskExecution>> {
    let ex = sqlx::query_as::<_, TaskExecution>(&format!(
        "SELECT {} FROM noetl.task_execution WHERE id = $1",
        TASK_EXECUTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(ex)
}

/// Find task executions matching a filter, oldest first.
pub async fn find_task_executions(
    pool: &DbPool,
    filter: &TaskExecutionFilter,
) -> AppResult<Vec<TaskExecution>> {
    let mut query = QueryBuilder::<Postgres>::new(format!(
        "SELECT {} FROM noetl.task_execution WHERE TRUE",
        TASK_EXECUTION_COLUMNS
    ));

    if let Some(id) = &filter.workflow_execution_id {
        query.push(" AND workflow_execution_id = ");
        query.push_bind(id.clone());
    }
    if let Some(names) = &filter.names {
        query.push(" AND name = ANY(");
        query.push_bind(names.clone());
        query.push(")");
    }
    if let Some(key) = &filter.unique_key {
        query.push(" AND unique_key = ");
        query.push_bind(key.clone());
    }
    if let Some(states) = &filter.states {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        query.push(" AND state = ANY(");
        query.push_bind(states);
        query.push(")");
    }
    if let Some(processed) = filter.processed {
        query.push(" AND processed = ");
        query.push_bind(processed);
    }
    if let Some(has_next_tasks) = filter.has_next_tasks {
        query.push(" AND has_next_tasks = ");
        query.push_bind(has_next_tasks);
    }
    if let Some(error_handled) = filter.error_handled {
        query.push(" AND error_handled = ");
        query.push_bind(error_handled);
    }
    if let Some(project_id) = &filter.project_id {
        query.push(" AND project_id = ");
        query.push_bind(project_id.clone());
    }
    query.push(" ORDER BY created_at ASC, id ASC");

    let executions = query
        .build_query_as::<TaskExecution>()
        .fetch_all(pool)
        .await?;

    Ok(executions)
}

/// Write the non-state columns of a task execution.
pub async fn update_task_execution(pool: &DbPool, ex: &TaskExecution) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE noetl.task_execution
        SET published = $2,
            next_tasks = $3,
            has_next_tasks = $4,
            error_handled = $5,
            runtime_context = $6,
            in_context = $7,
            updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(&ex.id)
    .bind(&ex.published)
    .bind(Json(&ex.next_tasks))
    .bind(ex.has_next_tasks)
    .bind(ex.error_handled)
    .bind(&ex.runtime_context)
    .bind(&ex.in_context)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Compare-and-set a task into its completed state together with its
/// published variables and routing columns.
pub async fn complete_task_execution(pool: &DbPool, ex: &TaskExecution, expected: State) -> AppResult<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE noetl.task_execution
        SET state = $3,
            state_info = $4,
            published = $5,
            next_tasks = $6,
            has_next_tasks = $7,
            error_handled = $8,
            runtime_context = $9,
            finished_at = $10,
            updated_at = $10
        WHERE id = $1 AND state = $2
        "#,
    )
    .bind(&ex.id)
    .bind(expected.as_str())
    .bind(ex.state.as_str())
    .bind(&ex.state_info)
    .bind(&ex.published)
    .bind(Json(&ex.next_tasks))
    .bind(ex.has_next_tasks)
    .bind(ex.error_handled)
    .bind(&ex.runtime_context)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Compare-and-set the task state. Returns `true` when the row changed.
pub async fn transition_task_state(
    pool: &DbPool,
    id: &str,
    expected: State,
    state: State,
    state_info: Option<&str>,
    processed: Option<bool>,
) -> AppResult<bool> {
    let now = Utc::now();
    let finished_at = state.is_completed().then_some(now);
    let started_at = (state == State::Running).then_some(now);

    let result = sqlx::query(
        r#"
        UPDATE noetl.task_execution
        SET state = $3,
            state_info = $4,
            processed = COALESCE($5, processed),
            started_at = COALESCE(started_at, $6),
            finished_at = COALESCE($7, finished_at),
            updated_at = $8
        WHERE id = $1 AND state = $2
        "#,
    )
    .bind(id)
    .bind(expected.as_str())
    .bind(state.as_str())
    .bind(state_info)
    .bind(processed)
    .bind(started_at)
    .bind(finished_at)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
