//! Statement-mode coordinator.
//!
//! Runs a named data-fix migration against a single database. Batched
//! migrations are chunked across the key range `[lastCompleted, MAX(column)]`
//! and executed by the shared worker pool; the coordinator is the single
//! writer of the `psc_migrations` record, applying progress in completion
//! order. Non-batched migrations run as one statement.

pub mod migration;
pub mod record;
pub mod repo;

use crate::db::{connect_service, max_key};
use crate::error::{PscError, Result};
use crate::partition::{statement_target_table, BoundedClaimer, ChunkClaim};
use crate::progress::{emit, ProgressEvent};
use crate::service::{default_service_file, parse_service_file, resolve_service, ServiceMap};
use crate::worker::{spawn_workers, ChunkResult, PoolPolicy};
use deadpool_postgres::Pool;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use migration::{parse_migration_file, substitute_bounds, Migration, OnError};
pub use record::{MigrationRecord, MigrationStatus, RecordStore};
pub use repo::{scan_repo, sync_records, RepoScan};

/// Result of one statement-mode run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub name: String,
    pub status: String,
    pub total_affected: i64,
    pub error_count: i64,
    pub last_key: i64,
    pub max_key: Option<i64>,
    pub duration_seconds: f64,
}

/// Executor for statement-mode migrations against one state database.
pub struct StatementRunner {
    store: RecordStore,
    service: String,
    services: ServiceMap,
}

impl StatementRunner {
    /// Connect to the state database (the `--service` default) and make sure
    /// the progress table exists.
    pub async fn connect(service: &str, service_file: Option<&Path>) -> Result<Self> {
        let path = match service_file {
            Some(p) => p.to_path_buf(),
            None => default_service_file()?,
        };
        let services = parse_service_file(&path)?;
        let config = resolve_service(&services, service)?;
        let pool = connect_service(service, &config, 4).await?;

        let store = RecordStore::new(pool);
        store.ensure_table().await?;

        Ok(Self {
            store,
            service: service.to_string(),
            services,
        })
    }

    /// The record store (for status listings).
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Scan a repository directory and register its migrations.
    pub async fn sync_repo(&self, repo: impl AsRef<Path>) -> Result<RepoScan> {
        let scan = scan_repo(repo)?;
        sync_records(&self.store, &scan.migrations).await?;
        Ok(scan)
    }

    /// Mark a running record as cancelled (cooperative cross-process cancel,
    /// and the reset path for a stale record left behind by a crash).
    pub async fn cancel(&self, name: &str) -> Result<()> {
        let record = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| PscError::Config(format!("migration '{}' not found", name)))?;
        if !MigrationStatus::transition_allowed(record.status, MigrationStatus::Cancelled) {
            return Err(PscError::Config(format!(
                "migration '{}' is not running (status: {})",
                name, record.status
            )));
        }
        self.store
            .set_status(name, MigrationStatus::Cancelled)
            .await?;
        info!("migration '{}' marked cancelled", name);
        Ok(())
    }

    /// Run a migration to completion, cancellation, or failure.
    pub async fn run(
        &self,
        migration: &Migration,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<RunOutcome> {
        let name = &migration.name;
        let record = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| PscError::Config(format!("migration '{}' is not registered", name)))?;

        if !MigrationStatus::transition_allowed(record.status, MigrationStatus::Running) {
            return Err(PscError::Config(format!(
                "migration '{}' cannot start: it is already {}",
                name, record.status
            )));
        }
        // The SQL guard re-checks the same transition atomically, closing the
        // race with another process between the read above and this write.
        if !self.store.try_mark_running(name).await? {
            return Err(PscError::Config(format!(
                "migration '{}' is already running",
                name
            )));
        }

        let target_service = migration.service.as_deref().unwrap_or(&self.service);
        let target_pool = if target_service == self.service {
            self.store.pool().clone()
        } else {
            let config = resolve_service(&self.services, target_service)?;
            connect_service(target_service, &config, migration.parallelism + 1).await?
        };

        let started = Instant::now();
        let result = if migration.is_batched() {
            self.run_batched(migration, &record, target_pool, cancel, progress)
                .await
        } else {
            self.run_single(migration, target_pool, cancel).await
        };

        match result {
            Ok(mut outcome) => {
                outcome.duration_seconds = started.elapsed().as_secs_f64();
                Ok(outcome)
            }
            Err(e) => Err(e),
        }
    }

    /// Execute a non-batched migration as one statement.
    async fn run_single(
        &self,
        migration: &Migration,
        target_pool: Pool,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let name = &migration.name;
        info!("running '{}' as a single statement", name);

        let affected = match execute_statement(
            &target_pool,
            migration.sql.clone(),
            migration.timeout,
            &cancel,
            0,
            0,
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                let status = if matches!(e, PscError::Cancelled) {
                    MigrationStatus::Cancelled
                } else {
                    self.best_effort_record_error(name, &e.to_string()).await;
                    MigrationStatus::Failed
                };
                self.best_effort_status(name, status).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.update_progress(name, 0, affected).await {
            warn!("failed to record progress for '{}': {}", name, e);
        }
        self.store
            .set_status(name, MigrationStatus::Completed)
            .await?;

        Ok(RunOutcome {
            name: name.clone(),
            status: MigrationStatus::Completed.as_str().to_string(),
            total_affected: affected,
            error_count: 0,
            last_key: 0,
            max_key: None,
            duration_seconds: 0.0,
        })
    }

    /// Execute a batched migration through the chunk engine.
    async fn run_batched(
        &self,
        migration: &Migration,
        record: &MigrationRecord,
        target_pool: Pool,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<RunOutcome> {
        let name = &migration.name;
        let Some(batch_column) = migration.batch_column.as_deref() else {
            return Err(PscError::Config(format!(
                "migration '{}' has no batch column",
                name
            )));
        };

        // Probe the key-space maximum once, against the table extracted from
        // the statement itself.
        let table = match statement_target_table(&migration.sql) {
            Ok(t) => t,
            Err(e) => {
                self.best_effort_record_error(name, &e.to_string()).await;
                self.best_effort_status(name, MigrationStatus::Failed).await;
                return Err(e);
            }
        };
        let max = match max_key(&target_pool, &table, batch_column).await {
            Ok(m) => m,
            Err(e) => {
                self.best_effort_record_error(name, &format!("max key probe failed: {}", e))
                    .await;
                self.best_effort_status(name, MigrationStatus::Failed).await;
                return Err(e);
            }
        };
        self.store.update_max_key(name, max).await?;

        let start_key = record.last_completed_key.max(0);
        info!(
            "running '{}' batched on {}.{}: keys {}..={}, chunk {}, {} workers",
            name, table, batch_column, start_key, max, migration.chunk_size, migration.parallelism
        );

        let claimer = Arc::new(BoundedClaimer::new(start_key, migration.chunk_size, max));
        let sql = Arc::new(migration.sql.clone());
        let timeout = migration.timeout;
        let chunk_cancel = cancel.clone();
        let pool = target_pool.clone();
        let exec = move |claim: ChunkClaim| {
            let pool = pool.clone();
            let sql = Arc::clone(&sql);
            let cancel = chunk_cancel.clone();
            async move {
                let chunk_sql = substitute_bounds(&sql, claim.start, claim.end);
                match execute_statement(&pool, chunk_sql, timeout, &cancel, claim.start, claim.end)
                    .await
                {
                    Ok(rows) => ChunkResult::ok(claim.start, claim.end, rows),
                    Err(e) => ChunkResult::err(claim.start, claim.end, e),
                }
            }
        };

        let policy = PoolPolicy {
            parallelism: migration.parallelism,
            exit_on_error: migration.on_error == OnError::Abort,
            exit_on_empty: false,
        };
        let mut results = spawn_workers(policy, cancel.clone(), claimer, exec);

        let mut total_affected = record.total_affected;
        let mut last_key = start_key;
        let mut error_count: i64 = 0;
        let mut first_error: Option<PscError> = None;

        while let Some(result) = results.recv().await {
            if let Some(err) = result.error {
                if matches!(err, PscError::Cancelled) {
                    continue;
                }
                error_count += 1;
                let message = format!("chunk {}-{}: {}", result.start_key, result.end_key, err);
                error!("{}: {}", name, message);
                self.best_effort_record_error(name, &message).await;
                if migration.on_error == OnError::Abort {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    cancel.cancel();
                }
                continue;
            }

            total_affected += result.rows_affected;
            if result.end_key > last_key {
                last_key = result.end_key;
            }
            if let Err(e) = self.store.update_progress(name, last_key, total_affected).await {
                warn!("failed to record progress for '{}': {}", name, e);
            }

            debug!(
                "{}: chunk {}-{} affected {} rows in {:?}",
                name, result.start_key, result.end_key, result.rows_affected, result.elapsed
            );
            emit(
                &progress,
                ProgressEvent {
                    table: table.clone(),
                    end_key: last_key,
                    max_key: Some(max),
                    rows_affected: result.rows_affected,
                    total_affected,
                    estimated_total: None,
                },
            );
        }

        // Workers have drained; decide the terminal state. Cancellation never
        // masks a chunk error.
        if let Some(err) = first_error {
            self.best_effort_status(name, MigrationStatus::Failed).await;
            return Err(err);
        }
        if cancel.is_cancelled() {
            self.best_effort_status(name, MigrationStatus::Cancelled)
                .await;
            return Err(PscError::Cancelled);
        }

        self.store
            .set_status(name, MigrationStatus::Completed)
            .await?;

        Ok(RunOutcome {
            name: name.clone(),
            status: MigrationStatus::Completed.as_str().to_string(),
            total_affected,
            error_count,
            last_key,
            max_key: Some(max),
            duration_seconds: 0.0,
        })
    }

    async fn best_effort_status(&self, name: &str, status: MigrationStatus) {
        if let Err(e) = self.store.set_status(name, status).await {
            warn!("failed to set '{}' to {}: {}", name, status, e);
        }
    }

    async fn best_effort_record_error(&self, name: &str, message: &str) {
        if let Err(e) = self.store.record_error(name, message).await {
            warn!("failed to record error for '{}': {}", name, e);
        }
    }
}

/// Execute one statement with an optional per-chunk timeout, honoring the
/// operation's cancellation token.
async fn execute_statement(
    pool: &Pool,
    sql: String,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    start: i64,
    end: i64,
) -> Result<i64> {
    let client = pool
        .get()
        .await
        .map_err(|e| PscError::pool(e, "getting target connection"))?;

    let exec = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, client.execute(&sql, &[])).await {
                Ok(result) => result.map_err(|e| PscError::chunk(start, end, e)),
                Err(_) => Err(PscError::chunk(
                    start,
                    end,
                    format!("timed out after {:?}", limit),
                )),
            },
            None => client
                .execute(&sql, &[])
                .await
                .map_err(|e| PscError::chunk(start, end, e)),
        }
    };

    let rows = tokio::select! {
        _ = cancel.cancelled() => return Err(PscError::Cancelled),
        result = exec => result?,
    };
    Ok(rows as i64)
}
