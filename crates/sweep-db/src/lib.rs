//! Persistence layer for the storage deletion audit trail.
//!
//! Every row in `storage_deletion_log` describes one attempt to remove an
//! object from the bucket. Rows are inserted as `pending` by the upstream
//! trigger and moved to a terminal status exactly once by the reconciler.
//! The crate speaks to Postgres in production and SQLite for local runs and
//! tests; both backends share the same row shape.

use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    FromRow,
};
use thiserror::Error;
use tracing::debug;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Upper bound applied to listing queries.
pub const MAX_LIST_LIMIT: u32 = 500;

/// Errors returned by the audit log store.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("unsupported database url '{0}' (expected postgres:// or sqlite:)")]
    UnsupportedUrl(String),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: DeletionStatus,
        to: DeletionStatus,
    },
    #[error("error message is only recorded for failed deletions")]
    UnexpectedErrorMessage,
    #[error("corrupt audit row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Lifecycle status of a deletion attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    Pending,
    Success,
    Failed,
}

impl DeletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionStatus::Pending => "pending",
            DeletionStatus::Success => "success",
            DeletionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeletionStatus::Pending)
    }
}

impl fmt::Display for DeletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeletionStatus::Pending),
            "success" => Ok(DeletionStatus::Success),
            "failed" => Ok(DeletionStatus::Failed),
            other => Err(format!("unknown deletion status: {other}")),
        }
    }
}

/// Persisted record of one deletion attempt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub id: i64,
    /// Object reference exactly as stored in the deleted row.
    pub file_path: String,
    pub status: DeletionStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters accepted by [`Database::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogFilter<'a> {
    pub status: Option<DeletionStatus>,
    pub file_path: Option<&'a str>,
    pub limit: Option<u32>,
}

/// Conditional status update used by the reconciler.
///
/// Implementations must only touch the most recent row matching
/// `(file_path, status = from)` and return the number of rows changed, so
/// that concurrent or repeated deliveries resolve to a single winner.
#[async_trait]
pub trait AuditLogStore: Send + Sync {
    async fn update_status(
        &self,
        file_path: &str,
        from: DeletionStatus,
        to: DeletionStatus,
        error_message: Option<&str>,
    ) -> Result<u64, DbError>;
}

#[derive(Clone, Debug)]
enum Backend {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

/// Primary entry point to the persistence layer.
#[derive(Clone, Debug)]
pub struct Database {
    backend: Backend,
}

impl Database {
    /// Opens a pool for `postgres://…` or `sqlite:…` URLs.
    ///
    /// SQLite databases are created on demand and migrated immediately.
    /// Postgres schemas are owned by the upstream deployment, call
    /// [`Database::migrate`] explicitly when this service should create them.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect(database_url)
                .await?;
            return Ok(Self::from_pg_pool(pool));
        }

        if database_url.starts_with("sqlite:") {
            let options = SqliteConnectOptions::from_str(database_url)?
                .create_if_missing(true)
                .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));
            let mut pool_options = SqlitePoolOptions::new().min_connections(1);
            // An in-memory database lives exactly as long as its single connection.
            pool_options = if database_url.contains(":memory:") {
                pool_options
                    .max_connections(1)
                    .max_lifetime(None)
                    .idle_timeout(None)
            } else {
                pool_options.max_connections(8)
            };
            let pool = pool_options.connect_with(options).await?;
            let db = Self::from_sqlite_pool(pool);
            db.migrate().await?;
            return Ok(db);
        }

        Err(DbError::UnsupportedUrl(database_url.to_string()))
    }

    pub fn from_pg_pool(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    pub fn from_sqlite_pool(pool: SqlitePool) -> Self {
        Self {
            backend: Backend::Sqlite(pool),
        }
    }

    /// Runs the embedded migrations for the active backend.
    pub async fn migrate(&self) -> Result<(), DbError> {
        match &self.backend {
            Backend::Sqlite(pool) => sqlx::migrate!("./migrations").run(pool).await?,
            Backend::Postgres(pool) => sqlx::migrate!("./migrations_postgres").run(pool).await?,
        }
        Ok(())
    }

    /// Inserts a `pending` row, mirroring what the upstream delete trigger does.
    pub async fn schedule(&self, file_path: &str) -> Result<AuditLogEntry, DbError> {
        let now = Utc::now();
        let row: AuditLogRow = match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query_as(
                    r#"
                    INSERT INTO storage_deletion_log (file_path, status, created_at, updated_at)
                    VALUES (?, ?, ?, ?)
                    RETURNING id, file_path, status, error_message, created_at, updated_at
                    "#,
                )
                .bind(file_path)
                .bind(DeletionStatus::Pending.as_str())
                .bind(now)
                .bind(now)
                .fetch_one(pool)
                .await?
            }
            Backend::Postgres(pool) => {
                sqlx::query_as(
                    r#"
                    INSERT INTO storage_deletion_log (file_path, status, created_at, updated_at)
                    VALUES ($1, $2, $3, $4)
                    RETURNING id, file_path, status, error_message, created_at, updated_at
                    "#,
                )
                .bind(file_path)
                .bind(DeletionStatus::Pending.as_str())
                .bind(now)
                .bind(now)
                .fetch_one(pool)
                .await?
            }
        };
        row.try_into()
    }

    /// Retrieves a single entry by its identifier.
    pub async fn fetch(&self, id: i64) -> Result<Option<AuditLogEntry>, DbError> {
        let row: Option<AuditLogRow> = match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM storage_deletion_log WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }
            Backend::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM storage_deletion_log WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(AuditLogEntry::try_from).transpose()
    }

    /// Lists entries newest first. Used to find orphaned objects (rows stuck
    /// in `pending` or resolved as `failed`).
    pub async fn list(&self, filter: AuditLogFilter<'_>) -> Result<Vec<AuditLogEntry>, DbError> {
        let status = filter.status.map(|status| status.as_str());
        let limit = i64::from(filter.limit.unwrap_or(100).min(MAX_LIST_LIMIT));

        let mut out = Vec::new();
        match &self.backend {
            Backend::Sqlite(pool) => {
                let mut rows = sqlx::query_as::<_, AuditLogRow>(
                    r#"
                    SELECT * FROM storage_deletion_log
                    WHERE (? IS NULL OR status = ?)
                      AND (? IS NULL OR file_path = ?)
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                    "#,
                )
                .bind(status)
                .bind(status)
                .bind(filter.file_path)
                .bind(filter.file_path)
                .bind(limit)
                .fetch(pool);
                while let Some(row) = rows.try_next().await? {
                    out.push(row.try_into()?);
                }
            }
            Backend::Postgres(pool) => {
                let mut rows = sqlx::query_as::<_, AuditLogRow>(
                    r#"
                    SELECT * FROM storage_deletion_log
                    WHERE ($1::text IS NULL OR status = $1)
                      AND ($2::text IS NULL OR file_path = $2)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $3
                    "#,
                )
                .bind(status)
                .bind(filter.file_path)
                .bind(limit)
                .fetch(pool);
                while let Some(row) = rows.try_next().await? {
                    out.push(row.try_into()?);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl AuditLogStore for Database {
    async fn update_status(
        &self,
        file_path: &str,
        from: DeletionStatus,
        to: DeletionStatus,
        error_message: Option<&str>,
    ) -> Result<u64, DbError> {
        validate_transition(from, to, error_message)?;
        let now = Utc::now();

        // The inner select picks the newest matching row; the outer status
        // predicate is re-evaluated under the row lock so only one concurrent
        // caller can win.
        let result = match &self.backend {
            Backend::Sqlite(pool) => {
                sqlx::query(
                    r#"
                    UPDATE storage_deletion_log
                    SET status = ?, error_message = ?, updated_at = ?
                    WHERE id = (
                        SELECT id FROM storage_deletion_log
                        WHERE file_path = ? AND status = ?
                        ORDER BY created_at DESC, id DESC
                        LIMIT 1
                    )
                    AND status = ?
                    "#,
                )
                .bind(to.as_str())
                .bind(error_message)
                .bind(now)
                .bind(file_path)
                .bind(from.as_str())
                .bind(from.as_str())
                .execute(pool)
                .await?
                .rows_affected()
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    r#"
                    UPDATE storage_deletion_log
                    SET status = $1, error_message = $2, updated_at = $3
                    WHERE id = (
                        SELECT id FROM storage_deletion_log
                        WHERE file_path = $4 AND status = $5
                        ORDER BY created_at DESC, id DESC
                        LIMIT 1
                    )
                    AND status = $5
                    "#,
                )
                .bind(to.as_str())
                .bind(error_message)
                .bind(now)
                .bind(file_path)
                .bind(from.as_str())
                .execute(pool)
                .await?
                .rows_affected()
            }
        };

        debug!(file_path, %from, %to, rows = result, "audit status update applied");
        Ok(result)
    }
}

/// Only `pending -> success` and `pending -> failed` are legal, and an error
/// message accompanies failures only.
pub fn validate_transition(
    from: DeletionStatus,
    to: DeletionStatus,
    error_message: Option<&str>,
) -> Result<(), DbError> {
    if from.is_terminal() || !to.is_terminal() {
        return Err(DbError::InvalidTransition { from, to });
    }
    if error_message.is_some() && to != DeletionStatus::Failed {
        return Err(DbError::UnexpectedErrorMessage);
    }
    Ok(())
}

#[derive(Debug, FromRow)]
struct AuditLogRow {
    id: i64,
    file_path: String,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AuditLogRow> for AuditLogEntry {
    type Error = DbError;

    fn try_from(row: AuditLogRow) -> Result<Self, Self::Error> {
        let status = DeletionStatus::from_str(&row.status)
            .map_err(|reason| DbError::CorruptRow { id: row.id, reason })?;
        Ok(Self {
            id: row.id,
            file_path: row.file_path,
            status,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
