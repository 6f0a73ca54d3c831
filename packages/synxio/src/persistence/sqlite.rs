//! SQLite log store.
//!
//! A file-based backend for single-process deployments. One table holds the
//! rows of every application instance, keyed by `(app_id, position)`.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;

use super::{LogRecord, LogStore, NewRecord, Position, RecordKind, StoreError};

const SELECT_COLUMNS: &str =
    "SELECT app_id, id, parent_id, position, kind, payload, created_at FROM log_records";

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.into())
}

/// SQLite-based log store.
#[derive(Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Open (and create if missing) the database at `database_url`.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - In-memory database (ephemeral)
    /// - `sqlite://./tmp/synxio.db` - File-based database
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    ///
    /// Limited to one connection: every SQLite connection to `:memory:` is
    /// its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::new("sqlite::memory:", 1).await
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_records (
                app_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                id TEXT NOT NULL,
                parent_id TEXT,
                kind TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (app_id, position)
            );

            CREATE INDEX IF NOT EXISTS idx_log_records_id ON log_records(app_id, id, position);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl std::fmt::Debug for SqliteLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLogStore")
            .field("connections", &self.pool.size())
            .finish()
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    app_id: String,
    id: String,
    parent_id: Option<String>,
    position: i64,
    kind: String,
    payload: Option<String>,
    created_at: String,
}

impl LogRow {
    fn into_record(self) -> Result<LogRecord, StoreError> {
        let kind = RecordKind::parse(&self.kind).ok_or_else(|| StoreError::Corrupt {
            id: self.id.clone(),
            reason: format!("unknown kind {}", self.kind),
        })?;

        let payload = self
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                id: self.id.clone(),
                reason: format!("invalid payload JSON: {}", e),
            })?;

        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StoreError::Corrupt {
                id: self.id.clone(),
                reason: format!("invalid date: {}", e),
            })?
            .with_timezone(&chrono::Utc);

        Ok(LogRecord {
            app_id: self.app_id,
            id: self.id,
            parent_id: self.parent_id,
            position: Position(self.position),
            kind,
            payload,
            created_at,
        })
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn append(&self, app_id: &str, record: NewRecord) -> Result<Position, StoreError> {
        let payload = record
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Backend(e.into()))?;

        let position: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO log_records (app_id, position, id, parent_id, kind, payload, created_at)
            SELECT ?, COALESCE(MAX(position), 0) + 1, ?, ?, ?, ?, ?
            FROM log_records WHERE app_id = ?
            RETURNING position
            "#,
        )
        .bind(app_id)
        .bind(&record.id)
        .bind(&record.parent_id)
        .bind(record.kind.as_str())
        .bind(&payload)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(app_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(Position(position))
    }

    async fn get(&self, app_id: &str, id: &str) -> Result<Option<LogRecord>, StoreError> {
        let row = sqlx::query_as::<_, LogRow>(&format!(
            "{} WHERE app_id = ? AND id = ? ORDER BY position DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(app_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(LogRow::into_record).transpose()
    }

    async fn next_after(
        &self,
        app_id: &str,
        position: Position,
    ) -> Result<Option<LogRecord>, StoreError> {
        let row = sqlx::query_as::<_, LogRow>(&format!(
            "{} WHERE app_id = ? AND position > ? ORDER BY position ASC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(app_id)
        .bind(position.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(LogRow::into_record).transpose()
    }
}
