//! In-database progress store for statement-mode operations.
//!
//! One row per named migration in the `psc_migrations` table of the target
//! database, created lazily. The initial insert is an upsert keyed on `name`
//! that never overwrites a non-pending row apart from `updated_at`; all other
//! writes are plain `UPDATE ... WHERE name = $1` statements issued by the
//! coordinator.

use crate::error::{PscError, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;

use super::migration::Migration;

/// DDL for the progress table.
const CREATE_TABLE_SQL: &str = "\
CREATE TABLE IF NOT EXISTS psc_migrations (
    id SERIAL PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    filename TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    target_service TEXT,
    batch_column TEXT,
    chunk_size INT,
    parallelism INT,
    max_id BIGINT,
    last_completed_id BIGINT DEFAULT 0,
    total_affected_rows BIGINT DEFAULT 0,
    error_count INT DEFAULT 0,
    last_error TEXT,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ DEFAULT NOW(),
    updated_at TIMESTAMPTZ DEFAULT NOW()
)";

const RECORD_COLUMNS: &str = "\
id, name, filename, status, target_service, batch_column, chunk_size, parallelism, \
max_id, last_completed_id, total_affected_rows, error_count, last_error, \
started_at, completed_at, created_at, updated_at";

/// Lifecycle status of a migration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PscError::State(format!("unknown migration status '{}'", other))),
        }
    }

    const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Whether a `from → to` status transition is legal. Concurrent runs
    /// (`running → running`) are rejected, `completed` is terminal, and
    /// `failed`/`cancelled` can be re-armed.
    ///
    /// This table is the single encoding of the status machine: the
    /// coordinator's admission checks and [`RecordStore::try_mark_running`]'s
    /// SQL guard are both derived from it.
    pub fn transition_allowed(from: Self, to: Self) -> bool {
        use MigrationStatus::*;
        matches!(
            (from, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (Failed, Running)
                | (Cancelled, Pending)
                | (Cancelled, Running)
        )
    }

    /// Statuses from which a transition to `to` is legal.
    pub fn sources_for(to: Self) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|from| Self::transition_allowed(*from, to))
            .collect()
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of `psc_migrations`.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub id: i32,
    pub name: String,
    pub filename: String,
    pub status: MigrationStatus,
    pub target_service: Option<String>,
    pub batch_column: Option<String>,
    pub chunk_size: Option<i32>,
    pub parallelism: Option<i32>,
    pub max_key: Option<i64>,
    pub last_completed_key: i64,
    pub total_affected: i64,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get(0),
            name: row.get(1),
            filename: row.get(2),
            status: MigrationStatus::parse(row.get(3))?,
            target_service: row.get(4),
            batch_column: row.get(5),
            chunk_size: row.get(6),
            parallelism: row.get(7),
            max_key: row.get(8),
            last_completed_key: row.get::<_, Option<i64>>(9).unwrap_or(0),
            total_affected: row.get::<_, Option<i64>>(10).unwrap_or(0),
            error_count: row.get::<_, Option<i32>>(11).unwrap_or(0),
            last_error: row.get(12),
            started_at: row.get(13),
            completed_at: row.get(14),
            created_at: row.get(15),
            updated_at: row.get(16),
        })
    }
}

/// Store handle bound to one target database.
pub struct RecordStore {
    pool: Pool,
}

impl RecordStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// The underlying pool (shared with chunk execution against the same DB).
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Create the `psc_migrations` table if it does not exist.
    pub async fn ensure_table(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "creating psc_migrations table"))?;
        client.batch_execute(CREATE_TABLE_SQL).await?;
        Ok(())
    }

    /// Insert or refresh a record from a parsed migration file. Non-pending
    /// rows keep every field except `updated_at`.
    pub async fn upsert(&self, migration: &Migration) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "upserting migration record"))?;

        let filename = migration.filename.display().to_string();
        let chunk_size = i32::try_from(migration.chunk_size).ok();
        let parallelism = i32::try_from(migration.parallelism).ok();

        client
            .execute(
                "INSERT INTO psc_migrations \
                     (name, filename, target_service, batch_column, chunk_size, parallelism) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (name) DO UPDATE SET \
                     filename = CASE WHEN psc_migrations.status = 'pending' \
                         THEN EXCLUDED.filename ELSE psc_migrations.filename END, \
                     target_service = CASE WHEN psc_migrations.status = 'pending' \
                         THEN EXCLUDED.target_service ELSE psc_migrations.target_service END, \
                     batch_column = CASE WHEN psc_migrations.status = 'pending' \
                         THEN EXCLUDED.batch_column ELSE psc_migrations.batch_column END, \
                     chunk_size = CASE WHEN psc_migrations.status = 'pending' \
                         THEN EXCLUDED.chunk_size ELSE psc_migrations.chunk_size END, \
                     parallelism = CASE WHEN psc_migrations.status = 'pending' \
                         THEN EXCLUDED.parallelism ELSE psc_migrations.parallelism END, \
                     updated_at = NOW()",
                &[
                    &migration.name,
                    &filename,
                    &migration.service,
                    &migration.batch_column,
                    &chunk_size,
                    &parallelism,
                ],
            )
            .await?;
        Ok(())
    }

    /// Load all records in creation order.
    pub async fn list(&self) -> Result<Vec<MigrationRecord>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "listing migration records"))?;

        let rows = client
            .query(
                &format!("SELECT {} FROM psc_migrations ORDER BY id", RECORD_COLUMNS),
                &[],
            )
            .await?;
        rows.iter().map(MigrationRecord::from_row).collect()
    }

    /// Load one record by name.
    pub async fn get(&self, name: &str) -> Result<Option<MigrationRecord>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "loading migration record"))?;

        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM psc_migrations WHERE name = $1",
                    RECORD_COLUMNS
                ),
                &[&name],
            )
            .await?;
        row.as_ref().map(MigrationRecord::from_row).transpose()
    }

    /// Atomically claim the record for execution. Returns false when no
    /// transition to `running` is legal from the row's current status,
    /// rejecting a concurrent run of the same name.
    pub async fn try_mark_running(&self, name: &str) -> Result<bool> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "marking migration running"))?;

        let runnable_from: Vec<&str> = MigrationStatus::sources_for(MigrationStatus::Running)
            .into_iter()
            .map(|s| s.as_str())
            .collect();
        let updated = client
            .execute(
                "UPDATE psc_migrations \
                 SET status = 'running', started_at = NOW(), updated_at = NOW() \
                 WHERE name = $1 AND status = ANY($2)",
                &[&name, &runnable_from],
            )
            .await?;
        Ok(updated == 1)
    }

    /// Set a terminal or reset status.
    pub async fn set_status(&self, name: &str, status: MigrationStatus) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "updating migration status"))?;

        let sql = match status {
            MigrationStatus::Completed => {
                "UPDATE psc_migrations \
                 SET status = $1, completed_at = NOW(), updated_at = NOW() WHERE name = $2"
            }
            _ => "UPDATE psc_migrations SET status = $1, updated_at = NOW() WHERE name = $2",
        };
        client.execute(sql, &[&status.as_str(), &name]).await?;
        Ok(())
    }

    /// Record chunk progress: highest completed key and total affected rows.
    pub async fn update_progress(&self, name: &str, last_key: i64, total_affected: i64) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "updating migration progress"))?;

        client
            .execute(
                "UPDATE psc_migrations \
                 SET last_completed_id = $1, total_affected_rows = $2, updated_at = NOW() \
                 WHERE name = $3",
                &[&last_key, &total_affected, &name],
            )
            .await?;
        Ok(())
    }

    /// Persist the probed key-space maximum.
    pub async fn update_max_key(&self, name: &str, max_key: i64) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "updating migration max key"))?;

        client
            .execute(
                "UPDATE psc_migrations SET max_id = $1, updated_at = NOW() WHERE name = $2",
                &[&max_key, &name],
            )
            .await?;
        Ok(())
    }

    /// Increment the error count and remember the most recent error.
    pub async fn record_error(&self, name: &str, message: &str) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| PscError::pool(e, "recording migration error"))?;

        client
            .execute(
                "UPDATE psc_migrations \
                 SET error_count = error_count + 1, last_error = $1, updated_at = NOW() \
                 WHERE name = $2",
                &[&message, &name],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MigrationStatus::*;

    #[test]
    fn test_status_round_trip() {
        for status in [Pending, Running, Completed, Failed, Cancelled] {
            assert_eq!(MigrationStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(MigrationStatus::parse("paused").is_err());
    }

    #[test]
    fn test_transitions() {
        assert!(MigrationStatus::transition_allowed(Pending, Running));
        assert!(MigrationStatus::transition_allowed(Running, Completed));
        assert!(MigrationStatus::transition_allowed(Running, Failed));
        assert!(MigrationStatus::transition_allowed(Running, Cancelled));
        assert!(MigrationStatus::transition_allowed(Failed, Running));
        assert!(MigrationStatus::transition_allowed(Cancelled, Running));
        assert!(MigrationStatus::transition_allowed(Failed, Pending));

        // Concurrent runs of the same name are rejected.
        assert!(!MigrationStatus::transition_allowed(Running, Running));
        // Completed is terminal.
        assert!(!MigrationStatus::transition_allowed(Completed, Running));
        assert!(!MigrationStatus::transition_allowed(Completed, Pending));
        assert!(!MigrationStatus::transition_allowed(Pending, Completed));
    }

    #[test]
    fn test_sources_derived_from_transition_table() {
        // The SQL guard in try_mark_running uses exactly this set.
        assert_eq!(
            MigrationStatus::sources_for(Running),
            vec![Pending, Failed, Cancelled]
        );
        assert_eq!(MigrationStatus::sources_for(Cancelled), vec![Running]);
        assert_eq!(MigrationStatus::sources_for(Completed), vec![Running]);
    }
}
