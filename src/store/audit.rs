//! Append-only audit log.
//!
//! Every state-mutating API call is recorded as (id, user, action,
//! argument blob, success, timestamp). Ids are assigned monotonically by
//! the store. Entries are never mutated; the log doubles as the replay
//! tape for point-in-time recovery.

use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::store::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// One recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: i64,
    pub user: String,
    pub action: String,
    pub arguments: Vec<Value>,
    pub success: bool,
    pub timestamp: i64,
}

/// Handle to the audit_log table.
#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> AuditLog {
        AuditLog { pool }
    }

    /// Append an entry and return its assigned id.
    pub async fn record(
        &self,
        user: &str,
        action: &str,
        arguments: &[Value],
        success: bool,
    ) -> Result<i64> {
        let blob = serde_json::to_string(arguments).map_err(|e| StoreError::InvalidRow {
            table: "audit_log",
            reason: format!("unserializable argument blob: {}", e),
        })?;
        let result = sqlx::query(
            "INSERT INTO audit_log (user, action, arguments, success, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(user)
        .bind(action)
        .bind(blob)
        .bind(success)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Highest assigned audit id, 0 when the log is empty.
    pub async fn latest_id(&self) -> Result<i64> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM audit_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Fetch one entry by id.
    pub async fn fetch(&self, id: i64) -> Result<Option<AuditEntry>> {
        let row = sqlx::query(
            "SELECT id, user, action, arguments, success, timestamp \
             FROM audit_log WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode_row).transpose()
    }

    /// Entries with `after < id <= upto`, ordered by id.
    pub async fn fetch_range(&self, after: i64, upto: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, user, action, arguments, success, timestamp \
             FROM audit_log WHERE id > ?1 AND id <= ?2 ORDER BY id",
        )
        .bind(after)
        .bind(upto)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_row).collect()
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    let blob: String = row.try_get("arguments")?;
    let arguments: Vec<Value> =
        serde_json::from_str(&blob).map_err(|e| StoreError::InvalidRow {
            table: "audit_log",
            reason: format!("bad argument blob: {}", e),
        })?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        user: row.try_get("user")?,
        action: row.try_get("action")?,
        arguments,
        success: row.try_get("success")?,
        timestamp: row.try_get("timestamp")?,
    })
}
