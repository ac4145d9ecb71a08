//! Named lock queries.

use chrono::{DateTime, Utc};

use crate::db::DbPool;
use crate::error::AppResult;

/// Insert the lock row, or take it over when the holder's lease expired.
/// Returns `true` when the caller now holds the lock.
pub async fn acquire_named_lock(pool: &DbPool, name: &str, expires_at: DateTime<Utc>) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO noetl.named_lock (name, expires_at, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (name) DO UPDATE
        SET expires_at = EXCLUDED.expires_at,
            created_at = EXCLUDED.created_at
        WHERE noetl.named_lock.expires_at <= $3
        "#,
    )
    .bind(name)
    .bind(expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delete the lock row.
pub async fn release_named_lock(pool: &DbPool, name: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM noetl.named_lock WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}
