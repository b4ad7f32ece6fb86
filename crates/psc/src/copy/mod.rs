//! Copy-mode coordinator.
//!
//! Owns the operation lifecycle: service resolution, connection pools, the
//! per-table worker pools, and the on-disk progress store. Workers report
//! chunk outcomes over a channel; this module is the single writer of the
//! state file, applying updates in completion order. On any chunk failure the
//! shared cancellation token fires and the pool is drained before the error
//! surfaces; on external cancellation partial progress stays durable so a
//! re-run resumes at the persisted key.

mod chunk;
pub mod state;

use crate::db::{connect_service, estimated_row_count, run_setup_sql, table_exists};
use crate::error::{PscError, Result};
use crate::partition::{ChunkClaim, StrideClaimer};
use crate::progress::{emit, ProgressEvent};
use crate::service::{default_service_file, parse_service_file, resolve_service};
use crate::worker::{spawn_workers, PoolPolicy};
use chunk::{copy_chunk, ChunkTable};
use deadpool_postgres::Pool;
use serde::Serialize;
use state::{CopyState, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Global options for a copy operation.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Source service name.
    pub source: String,

    /// Target service name.
    pub target: String,

    /// Rows per chunk (default: 1000).
    pub chunk_size: i64,

    /// Worker count (default: 1).
    pub parallelism: usize,

    /// Semicolon-separated SQL run on the target before the first chunk.
    pub target_setup: Option<String>,

    /// Directory holding `in_progress/` and `completed/` state files.
    pub state_dir: PathBuf,

    /// Service file path; defaults to `$PGSERVICEFILE` / `~/.pg_service.conf`.
    pub service_file: Option<PathBuf>,
}

impl CopyOptions {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            chunk_size: 1000,
            parallelism: 1,
            target_setup: None,
            state_dir: PathBuf::from("."),
            service_file: None,
        }
    }
}

/// One table to copy.
#[derive(Debug, Clone)]
pub struct TableSpec {
    /// Table name, optionally schema-qualified.
    pub name: String,

    /// Numeric key column used for chunking (default: `id`).
    pub key_column: String,

    /// Optional filter ANDed with the range predicate. The string is trusted;
    /// it originates from the operator, not external input.
    pub where_filter: Option<String>,

    /// Configured start key; the effective start is the max of this and the
    /// persisted resume point.
    pub start_key: i64,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_column: key_column.into(),
            where_filter: None,
            start_key: 0,
        }
    }
}

/// Per-table outcome in a [`CopySummary`].
#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table_name: String,
    pub rows_copied: i64,
    pub last_id: i64,
}

/// Result of a completed copy operation.
#[derive(Debug, Clone, Serialize)]
pub struct CopySummary {
    pub source_service: String,
    pub target_service: String,
    pub tables: Vec<TableOutcome>,
    pub rows_copied: i64,
    pub duration_seconds: f64,
}

impl CopySummary {
    /// Convert to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A prepared copy operation: pools connected, target verified, state loaded.
pub struct CopyOperation {
    options: CopyOptions,
    tables: Vec<TableSpec>,
    source_pool: Pool,
    target_pool: Pool,
    store: StateStore,
    state: CopyState,
}

impl CopyOperation {
    /// Resolve services, connect both databases, run target setup SQL, verify
    /// the target tables exist, and load (or create) the progress state.
    pub async fn new(options: CopyOptions, tables: Vec<TableSpec>) -> Result<Self> {
        if tables.is_empty() {
            return Err(PscError::Config("no tables to copy".to_string()));
        }
        if options.chunk_size < 1 {
            return Err(PscError::Config("chunk size must be at least 1".to_string()));
        }
        if options.parallelism < 1 {
            return Err(PscError::Config("parallelism must be at least 1".to_string()));
        }

        let service_path = match &options.service_file {
            Some(path) => path.clone(),
            None => default_service_file()?,
        };
        let services = parse_service_file(&service_path)?;
        let source_cfg = resolve_service(&services, &options.source)?;
        let target_cfg = resolve_service(&services, &options.target)?;

        // One pool per database; sized so workers never wait on a connection.
        let pool_size = options.parallelism + 1;
        let source_pool = connect_service(&options.source, &source_cfg, pool_size).await?;
        let target_pool = connect_service(&options.target, &target_cfg, pool_size).await?;

        if let Some(setup) = &options.target_setup {
            info!("running target setup SQL");
            run_setup_sql(&target_pool, setup).await?;
        }

        for table in &tables {
            if !table_exists(&target_pool, &table.name).await? {
                return Err(PscError::Config(format!(
                    "table '{}' does not exist on target database",
                    table.name
                )));
            }
        }

        let store = StateStore::new(&options.state_dir);
        let first_table = tables.first().map(|t| t.name.as_str());
        let mut state =
            match store.load_existing(&options.source, &options.target, first_table)? {
                Some(existing) => {
                    info!(
                        "found existing state for {} -> {}, resuming",
                        options.source, options.target
                    );
                    existing
                }
                None => CopyState::new(
                    &options.source,
                    &options.target,
                    options.chunk_size,
                    options.parallelism,
                ),
            };
        state.chunk_size = options.chunk_size;
        state.parallelism = options.parallelism;
        for table in &tables {
            state.table_entry(
                &table.name,
                &table.key_column,
                table.where_filter.as_deref().unwrap_or(""),
            );
        }
        store.save(&state)?;

        Ok(Self {
            options,
            tables,
            source_pool,
            target_pool,
            store,
            state,
        })
    }

    /// The loaded progress state (resume points per table).
    pub fn state(&self) -> &CopyState {
        &self.state
    }

    /// Run the operation to completion, cancellation, or failure.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<CopySummary> {
        let started = Instant::now();
        let mut outcomes: Vec<TableOutcome> = Vec::new();
        let mut total_rows = 0i64;
        let mut first_error: Option<PscError> = None;

        let tables = self.tables.clone();
        for spec in &tables {
            let persisted = self.state.last_id_for(&spec.name).unwrap_or(0);
            let start_key = spec.start_key.max(persisted);

            let estimated = estimated_row_count(&self.source_pool, &spec.name).await?;
            info!(
                "copying {} starting at {} ({} workers, chunk {}, ~{} rows)",
                spec.name, start_key, self.options.parallelism, self.options.chunk_size, estimated
            );

            let chunk_spec = Arc::new(ChunkTable {
                table: spec.name.clone(),
                key_column: spec.key_column.clone(),
                where_filter: spec.where_filter.clone(),
                chunk_size: self.options.chunk_size,
            });
            let claimer = Arc::new(StrideClaimer::new(start_key, self.options.chunk_size));

            let source = self.source_pool.clone();
            let target = self.target_pool.clone();
            let chunk_cancel = cancel.clone();
            let exec = move |claim: ChunkClaim| {
                let source = source.clone();
                let target = target.clone();
                let chunk_spec = Arc::clone(&chunk_spec);
                let cancel = chunk_cancel.clone();
                async move { copy_chunk(&source, &target, &chunk_spec, claim, &cancel).await }
            };

            let policy = PoolPolicy {
                parallelism: self.options.parallelism,
                exit_on_error: true,
                exit_on_empty: true,
            };
            let mut results = spawn_workers(policy, cancel.clone(), claimer, exec);

            let mut table_rows = 0i64;
            while let Some(result) = results.recv().await {
                if let Some(err) = result.error {
                    if matches!(err, PscError::Cancelled) {
                        // Surfaced after the drain; never masks a chunk error.
                        continue;
                    }
                    let message =
                        format!("chunk starting at {}: {}", result.start_key, err);
                    error!("{}: {}", spec.name, message);
                    self.state.record_error(&spec.name, message);
                    self.persist_state();
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    cancel.cancel();
                    continue;
                }

                if result.rows_affected == 0 {
                    continue;
                }

                table_rows += result.rows_affected;
                total_rows += result.rows_affected;
                self.state.record_success(&spec.name, result.end_key);
                self.persist_state();

                debug!(
                    "{}: copied chunk {}-{} ({} rows in {:?})",
                    spec.name, result.start_key, result.end_key, result.rows_affected, result.elapsed
                );
                emit(
                    &progress,
                    ProgressEvent {
                        table: spec.name.clone(),
                        end_key: self.state.last_id_for(&spec.name).unwrap_or(result.end_key),
                        max_key: None,
                        rows_affected: result.rows_affected,
                        total_affected: total_rows,
                        estimated_total: Some(estimated),
                    },
                );
            }

            outcomes.push(TableOutcome {
                table_name: spec.name.clone(),
                rows_copied: table_rows,
                last_id: self.state.last_id_for(&spec.name).unwrap_or(0),
            });

            if first_error.is_some() || cancel.is_cancelled() {
                break;
            }
            info!("{}: copy complete ({} rows)", spec.name, table_rows);
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if cancel.is_cancelled() {
            info!(
                "copy cancelled; state preserved at {}",
                self.store.path_for(&self.options.source, &self.options.target).display()
            );
            return Err(PscError::Cancelled);
        }

        self.store.mark_completed(&self.state)?;

        Ok(CopySummary {
            source_service: self.options.source.clone(),
            target_service: self.options.target.clone(),
            tables: outcomes,
            rows_copied: total_rows,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Best-effort state write; a failed write must not abandon the drain.
    fn persist_state(&mut self) {
        if let Err(e) = self.store.save(&self.state) {
            warn!("failed to write state file: {}", e);
        }
    }
}
