//! Progress events emitted by the coordinators.
//!
//! Events are produced strictly in chunk completion order; consumers (the CLI
//! progress printer, a TUI) derive rates and ETAs downstream.

use tokio::sync::mpsc;

/// One progress update, emitted after a chunk commits.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Table the chunk ran against (statement mode: the probed target table).
    pub table: String,

    /// Highest completed key so far.
    pub end_key: i64,

    /// Upper bound of the key space, when known (statement mode).
    pub max_key: Option<i64>,

    /// Rows affected by this chunk.
    pub rows_affected: i64,

    /// Rows affected by the operation so far.
    pub total_affected: i64,

    /// Estimated total rows, when known (copy mode; for percentage display).
    pub estimated_total: Option<i64>,
}

/// Send a progress event without blocking the coordinator on a slow consumer.
pub(crate) fn emit(sink: &Option<mpsc::Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(tx) = sink {
        // A full or closed channel drops the event; progress display is
        // best-effort and must never stall chunk processing.
        let _ = tx.try_send(event);
    }
}
