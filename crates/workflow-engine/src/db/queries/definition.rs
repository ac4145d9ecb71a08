//! Workflow and action definition queries.

use chrono::Utc;

use crate::db::models::{ActionDefinition, WorkflowDefinition};
use crate::db::DbPool;
use crate::error::AppResult;

/// Insert or replace a workflow definition keyed by name and namespace.
pub async fn upsert_workflow_definition(pool: &DbPool, def: &WorkflowDefinition) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.workflow_definition (
            id, name, namespace, spec, scope, project_id, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (name, namespace) DO UPDATE
        SET spec = EXCLUDED.spec,
            scope = EXCLUDED.scope,
            project_id = EXCLUDED.project_id,
            updated_at = $8
        "#,
    )
    .bind(&def.id)
    .bind(&def.name)
    .bind(&def.namespace)
    .bind(&def.spec)
    .bind(&def.scope)
    .bind(&def.project_id)
    .bind(def.created_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a workflow definition by name within a namespace.
pub async fn get_workflow_definition(
    pool: &DbPool,
    name: &str,
    namespace: &str,
) -> AppResult<Option<WorkflowDefinition>> {
    let def = sqlx::query_as::<_, WorkflowDefinition>(
        r#"
        SELECT id, name, namespace, spec, scope, project_id, created_at, updated_at
        FROM noetl.workflow_definition
        WHERE name = $1 AND namespace = $2
        "#,
    )
    .bind(name)
    .bind(namespace)
    .fetch_optional(pool)
    .await?;

    Ok(def)
}

/// Insert or replace an action definition keyed by name.
pub async fn upsert_action_definition(pool: &DbPool, def: &ActionDefinition) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.action_definition (
            id, name, description, action_class, attributes, input, spec,
            scope, project_id, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (name) DO UPDATE
        SET description = EXCLUDED.description,
            action_class = EXCLUDED.action_class,
            attributes = EXCLUDED.attributes,
            input = EXCLUDED.input,
            spec = EXCLUDED.spec,
            scope = EXCLUDED.scope,
            project_id = EXCLUDED.project_id,
            updated_at = $11
        "#,
    )
    .bind(&def.id)
    .bind(&def.name)
    .bind(&def.description)
    .bind(&def.action_class)
    .bind(&def.attributes)
    .bind(&def.input)
    .bind(&def.spec)
    .bind(&def.scope)
    .bind(&def.project_id)
    .bind(def.created_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Get an action definition by name.
pub async fn get_action_definition(pool: &DbPool, name: &str) -> AppResult<Option<ActionDefinition>> {
    let def = sqlx::query_as::<_, ActionDefinition>(
        r#"
        SELECT id, name, description, action_class, attributes, input, spec,
               scope, project_id, created_at, updated_at
        FROM noetl.action_definition
        WHERE name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(def)
}
