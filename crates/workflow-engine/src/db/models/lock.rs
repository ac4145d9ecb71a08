//! Named lock rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A cooperative mutex: the row exists while the lock is held.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NamedLock {
    pub name: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl NamedLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
