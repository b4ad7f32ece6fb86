//! # psc
//!
//! Chunked, resumable, parallel data movement for PostgreSQL.
//!
//! This library drives long-running, parallelizable work over a numeric key
//! range in two flavors that share one partitioner and one worker pool:
//!
//! - **Copy mode**: stream rows of a table from a source database into a
//!   pre-existing, schema-compatible table in a target database using the
//!   binary COPY protocol, one key-range chunk at a time.
//! - **Statement mode**: execute a large data-fix statement against a single
//!   database, chunked across a key range via `:start`/`:end` placeholders.
//!
//! Progress is durably persisted after each successful chunk (a JSON state
//! file for copy mode, a `psc_migrations` row for statement mode) so an
//! interrupted operation resumes without losing progress.
//!
//! ## Example
//!
//! ```rust,no_run
//! use psc::copy::{CopyOperation, CopyOptions, TableSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> psc::Result<()> {
//!     let options = CopyOptions::new("prod", "staging");
//!     let tables = vec![TableSpec::new("events", "id")];
//!     let mut op = CopyOperation::new(options, tables).await?;
//!     let cancel = CancellationToken::new();
//!     let summary = op.run(cancel, None).await?;
//!     println!("copied {} rows", summary.rows_copied);
//!     Ok(())
//! }
//! ```

pub mod copy;
pub mod db;
pub mod error;
pub mod partition;
pub mod progress;
pub mod service;
pub mod statement;
pub mod worker;

// Re-exports for convenient access
pub use copy::{CopyOperation, CopyOptions, CopySummary, TableSpec};
pub use error::{PscError, Result};
pub use partition::{statement_target_table, BoundedClaimer, ChunkClaim, ClaimQueue, StrideClaimer};
pub use progress::ProgressEvent;
pub use service::{ServiceConfig, ServiceMap};
pub use statement::{Migration, MigrationRecord, RecordStore, RunOutcome, StatementRunner};
pub use worker::ChunkResult;
