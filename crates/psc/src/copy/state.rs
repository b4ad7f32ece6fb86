//! On-disk progress store for copy operations.
//!
//! One JSON file per operation under `<state_dir>/in_progress/`, moved to
//! `<state_dir>/completed/` when every table finishes. Writes are whole-file
//! replacements through a temp file and rename, crash-atomic on POSIX
//! filesystems.
//!
//! Two layouts are accepted on read: the current multi-table layout (a
//! `tables` array) and the legacy single-table layout with the table fields
//! at the root, which is migrated to a one-entry `tables` array.

use crate::error::{PscError, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Most recent errors kept per table; older entries are dropped.
const MAX_ERRORS: usize = 100;

/// State file extension.
pub const STATE_EXT: &str = "pscstate";

/// Per-table progress inside a copy state file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableProgress {
    /// Table being copied.
    pub table_name: String,

    /// Optional row filter ANDed with the range predicate.
    #[serde(default)]
    pub where_clause: String,

    /// Numeric key column used for chunking.
    pub primary_key: String,

    /// Highest key value below which every chunk has committed.
    pub last_id: i64,

    /// Errors encountered for this table, most recent last.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl TableProgress {
    /// Append an error, keeping only the most recent [`MAX_ERRORS`].
    pub fn push_error(&mut self, message: String) {
        self.errors.push(message);
        if self.errors.len() > MAX_ERRORS {
            let excess = self.errors.len() - MAX_ERRORS;
            self.errors.drain(..excess);
        }
    }
}

/// The durable state of one copy operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyState {
    /// Source service name.
    pub source_service: String,

    /// Target service name.
    pub target_service: String,

    /// Rows per chunk.
    pub chunk_size: i64,

    /// Worker count.
    pub parallelism: usize,

    /// RFC 3339 timestamp of operation creation.
    pub start_time: String,

    /// RFC 3339 timestamp of the most recent progress write.
    pub last_update: String,

    /// Per-table progress, in copy order.
    #[serde(default)]
    pub tables: Vec<TableProgress>,

    // Legacy single-table layout, accepted on read only.
    #[serde(default, skip_serializing)]
    table_name: Option<String>,
    #[serde(default, skip_serializing)]
    where_clause: Option<String>,
    #[serde(default, skip_serializing)]
    primary_key: Option<String>,
    #[serde(default, skip_serializing)]
    last_id: Option<i64>,
}

impl CopyState {
    /// Create a fresh state for a new operation.
    pub fn new(
        source_service: &str,
        target_service: &str,
        chunk_size: i64,
        parallelism: usize,
    ) -> Self {
        let now = now_rfc3339();
        Self {
            source_service: source_service.to_string(),
            target_service: target_service.to_string(),
            chunk_size,
            parallelism,
            start_time: now.clone(),
            last_update: now,
            tables: Vec::new(),
            table_name: None,
            where_clause: None,
            primary_key: None,
            last_id: None,
        }
    }

    /// Get or create the entry for a table.
    pub fn table_entry(&mut self, table_name: &str, primary_key: &str, where_clause: &str) -> &mut TableProgress {
        if let Some(idx) = self.tables.iter().position(|t| t.table_name == table_name) {
            return &mut self.tables[idx];
        }
        self.tables.push(TableProgress {
            table_name: table_name.to_string(),
            where_clause: where_clause.to_string(),
            primary_key: primary_key.to_string(),
            last_id: 0,
            errors: Vec::new(),
        });
        self.tables.last_mut().unwrap()
    }

    /// Persisted resume point for a table, if any.
    pub fn last_id_for(&self, table_name: &str) -> Option<i64> {
        self.tables
            .iter()
            .find(|t| t.table_name == table_name)
            .map(|t| t.last_id)
    }

    /// Record a committed chunk: `last_id` only ever advances, regardless of
    /// the order chunks complete in.
    pub fn record_success(&mut self, table_name: &str, end_key: i64) {
        if let Some(entry) = self.tables.iter_mut().find(|t| t.table_name == table_name) {
            if end_key > entry.last_id {
                entry.last_id = end_key;
            }
        }
        self.last_update = now_rfc3339();
    }

    /// Record a chunk failure against a table's error list.
    pub fn record_error(&mut self, table_name: &str, message: String) {
        if let Some(entry) = self.tables.iter_mut().find(|t| t.table_name == table_name) {
            entry.push_error(message);
        }
        self.last_update = now_rfc3339();
    }

    /// Fold the legacy single-table layout into the `tables` array.
    fn normalize(mut self) -> Self {
        if self.tables.is_empty() {
            if let Some(table_name) = self.table_name.take() {
                self.tables.push(TableProgress {
                    table_name,
                    where_clause: self.where_clause.take().unwrap_or_default(),
                    primary_key: self.primary_key.take().unwrap_or_else(|| "id".to_string()),
                    last_id: self.last_id.take().unwrap_or(0),
                    errors: Vec::new(),
                });
            }
        }
        self.table_name = None;
        self.where_clause = None;
        self.primary_key = None;
        self.last_id = None;
        self
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Directory-backed store for copy state files.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Create a store rooted at `state_dir`. Directories are created lazily
    /// on first write.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
        }
    }

    /// Directory holding live and interrupted operations.
    pub fn in_progress_dir(&self) -> PathBuf {
        self.root.join("in_progress")
    }

    /// Directory holding finished operations.
    pub fn completed_dir(&self) -> PathBuf {
        self.root.join("completed")
    }

    /// Path of the state file for a source/target pair.
    pub fn path_for(&self, source: &str, target: &str) -> PathBuf {
        self.in_progress_dir()
            .join(format!("{}_{}.{}", source, target, STATE_EXT))
    }

    /// Path of the legacy single-table state file, read-only compatibility.
    pub fn legacy_path_for(&self, source: &str, target: &str, table: &str) -> PathBuf {
        self.in_progress_dir()
            .join(format!("{}_{}_{}.{}", source, target, table, STATE_EXT))
    }

    /// Load a state file, migrating the legacy layout when present.
    pub fn load(&self, path: &Path) -> Result<CopyState> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PscError::State(format!("failed to read {}: {}", path.display(), e)))?;
        let state: CopyState = serde_json::from_str(&content)
            .map_err(|e| PscError::State(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok(state.normalize())
    }

    /// Find prior state for a source/target pair: the multi-table file first,
    /// then a legacy single-table file for `table`.
    pub fn load_existing(
        &self,
        source: &str,
        target: &str,
        table: Option<&str>,
    ) -> Result<Option<CopyState>> {
        let path = self.path_for(source, target);
        if path.exists() {
            return self.load(&path).map(Some);
        }
        if let Some(table) = table {
            let legacy = self.legacy_path_for(source, target, table);
            if legacy.exists() {
                debug!("loading legacy state file {}", legacy.display());
                return self.load(&legacy).map(Some);
            }
        }
        Ok(None)
    }

    /// Persist a state file atomically (write temp, rename).
    pub fn save(&self, state: &CopyState) -> Result<()> {
        let path = self.path_for(&state.source_service, &state.target_service);
        std::fs::create_dir_all(self.in_progress_dir())?;

        let content = serde_json::to_string_pretty(state)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &path)
            .map_err(|e| PscError::State(format!("failed to replace {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Move a finished operation's file into `completed/`.
    pub fn mark_completed(&self, state: &CopyState) -> Result<()> {
        let from = self.path_for(&state.source_service, &state.target_service);
        std::fs::create_dir_all(self.completed_dir())?;
        let to = self.completed_dir().join(format!(
            "{}_{}.{}",
            state.source_service, state.target_service, STATE_EXT
        ));
        std::fs::rename(&from, &to)
            .map_err(|e| PscError::State(format!("failed to move {} to completed: {}", from.display(), e)))?;
        Ok(())
    }

    /// Enumerate resumable operations in `in_progress/`. Unparsable files are
    /// skipped with a warning; legacy files come back as one-entry operations.
    pub fn list_in_progress(&self) -> Result<Vec<(PathBuf, CopyState)>> {
        let dir = self.in_progress_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STATE_EXT) {
                continue;
            }
            match self.load(&path) {
                Ok(state) => found.push((path, state)),
                Err(e) => warn!("skipping unreadable state file {}: {}", path.display(), e),
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}
