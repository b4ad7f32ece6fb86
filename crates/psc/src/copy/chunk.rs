//! Copy-mode chunk executor.
//!
//! A chunk is executed as an in-process binary COPY pipe: the source
//! connection runs `COPY (...) TO STDOUT (FORMAT binary)` and its byte stream
//! is fed into `COPY <table> FROM STDIN (FORMAT binary)` on the target. The
//! target sink is opened before the source stream so the consumer is ready
//! when the producer starts; a producer failure drops the sink, aborting the
//! target COPY.
//!
//! The claimed stride is first re-anchored with a MIN probe: the chunk copies
//! `[min, min + chunk_size)` where `min` is the first existing source key at
//! or above the claim. When IDs have gaps larger than the chunk size this
//! skips empty ranges without emitting a no-op chunk. `rows_affected` is the
//! nominal chunk size, not a count parsed from the binary stream; callers
//! needing exact counts must query the target afterwards.

use crate::db::quote_ident;
use crate::error::{PscError, Result};
use crate::partition::ChunkClaim;
use crate::worker::ChunkResult;
use deadpool_postgres::Pool;
use futures::{SinkExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Everything the executor needs to know about one table.
#[derive(Debug, Clone)]
pub(crate) struct ChunkTable {
    pub table: String,
    pub key_column: String,
    pub where_filter: Option<String>,
    pub chunk_size: i64,
}

impl ChunkTable {
    fn filter_clause(&self) -> String {
        match self.where_filter.as_deref() {
            Some(f) if !f.trim().is_empty() => format!(" AND ({})", f.trim()),
            _ => String::new(),
        }
    }

    /// Probe for the first existing key at or above `start`. The cast keeps
    /// the result `int8` whatever the column's integer width.
    pub(crate) fn min_probe_sql(&self, start: i64) -> String {
        let key = quote_ident(&self.key_column);
        format!(
            "SELECT MIN({key})::bigint FROM (SELECT {key} FROM {table} WHERE {key} >= {start}{filter} ORDER BY {key} LIMIT {limit}) AS t",
            key = key,
            table = self.table,
            start = start,
            filter = self.filter_clause(),
            limit = self.chunk_size,
        )
    }

    /// Producer side of the pipe for the half-open range `[start, end)`.
    pub(crate) fn copy_out_sql(&self, start: i64, end: i64) -> String {
        let key = quote_ident(&self.key_column);
        format!(
            "COPY (SELECT * FROM {table} WHERE {key} >= {start} AND {key} < {end}{filter} ORDER BY {key}) TO STDOUT (FORMAT binary)",
            table = self.table,
            key = key,
            start = start,
            end = end,
            filter = self.filter_clause(),
        )
    }

    /// Consumer side of the pipe.
    pub(crate) fn copy_in_sql(&self) -> String {
        format!("COPY {} FROM STDIN (FORMAT binary)", self.table)
    }
}

/// Execute one copy chunk for the claimed stride.
///
/// Returns `rows_affected = 0` when no source key at or above the claim
/// exists, which is the worker's exit signal.
pub(crate) async fn copy_chunk(
    source: &Pool,
    target: &Pool,
    spec: &ChunkTable,
    claim: ChunkClaim,
    cancel: &CancellationToken,
) -> ChunkResult {
    let attempt = tokio::select! {
        _ = cancel.cancelled() => Err(PscError::Cancelled),
        result = run_chunk(source, target, spec, claim.start) => result,
    };

    match attempt {
        Ok(result) => result,
        Err(error) => ChunkResult::err(claim.start, claim.start + spec.chunk_size, error),
    }
}

async fn run_chunk(
    source: &Pool,
    target: &Pool,
    spec: &ChunkTable,
    claim_start: i64,
) -> Result<ChunkResult> {
    let source_client = source
        .get()
        .await
        .map_err(|e| PscError::pool(e, "getting source connection"))?;

    let probe_sql = spec.min_probe_sql(claim_start);
    debug!("SQL: {}", probe_sql);
    let row = source_client
        .query_one(&probe_sql, &[])
        .await
        .map_err(|e| PscError::chunk(claim_start, claim_start + spec.chunk_size, format!("min probe failed: {}", e)))?;

    let Some(min_key) = row.get::<_, Option<i64>>(0) else {
        // No source row at or above the claim: the key space is exhausted.
        return Ok(ChunkResult::ok(claim_start, claim_start, 0));
    };
    let end_key = min_key + spec.chunk_size;

    let target_client = target
        .get()
        .await
        .map_err(|e| PscError::pool(e, "getting target connection"))?;

    // Consumer before producer.
    let in_sql = spec.copy_in_sql();
    let sink: tokio_postgres::CopyInSink<bytes::Bytes> = target_client
        .copy_in(&in_sql)
        .await
        .map_err(|e| PscError::chunk(min_key, end_key, format!("target COPY failed to start: {}", e)))?;

    let out_sql = spec.copy_out_sql(min_key, end_key);
    debug!("SQL: {}", out_sql);
    let stream = source_client
        .copy_out(&out_sql)
        .await
        .map_err(|e| PscError::chunk(min_key, end_key, format!("source COPY failed to start: {}", e)))?;

    tokio::pin!(sink);
    tokio::pin!(stream);

    loop {
        match stream.try_next().await {
            Ok(Some(buf)) => {
                sink.send(buf).await.map_err(|e| {
                    PscError::chunk(min_key, end_key, format!("target COPY failed: {}", e))
                })?;
            }
            Ok(None) => break,
            // Dropping the sink on the error path aborts the target COPY.
            Err(e) => {
                return Err(PscError::chunk(
                    min_key,
                    end_key,
                    format!("source COPY failed: {}", e),
                ))
            }
        }
    }

    sink.finish()
        .await
        .map_err(|e| PscError::chunk(min_key, end_key, format!("target COPY failed to commit: {}", e)))?;

    // Nominal count: the claimed chunk size.
    Ok(ChunkResult::ok(min_key, end_key, spec.chunk_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(filter: Option<&str>) -> ChunkTable {
        ChunkTable {
            table: "events".into(),
            key_column: "id".into(),
            where_filter: filter.map(|s| s.to_string()),
            chunk_size: 1000,
        }
    }

    #[test]
    fn test_min_probe_sql() {
        assert_eq!(
            spec(None).min_probe_sql(5000),
            "SELECT MIN(\"id\")::bigint FROM (SELECT \"id\" FROM events WHERE \"id\" >= 5000 ORDER BY \"id\" LIMIT 1000) AS t"
        );
    }

    #[test]
    fn test_min_probe_sql_with_filter() {
        let sql = spec(Some("status = 'open'")).min_probe_sql(0);
        assert!(sql.contains("WHERE \"id\" >= 0 AND (status = 'open') ORDER BY"));
    }

    #[test]
    fn test_copy_out_sql() {
        assert_eq!(
            spec(None).copy_out_sql(5000, 6000),
            "COPY (SELECT * FROM events WHERE \"id\" >= 5000 AND \"id\" < 6000 ORDER BY \"id\") TO STDOUT (FORMAT binary)"
        );
    }

    #[test]
    fn test_copy_out_sql_parenthesizes_filter() {
        let sql = spec(Some("a = 1 OR b = 2")).copy_out_sql(0, 1000);
        assert!(sql.contains("AND (a = 1 OR b = 2) ORDER BY"));
    }

    #[test]
    fn test_copy_in_sql() {
        assert_eq!(
            spec(None).copy_in_sql(),
            "COPY events FROM STDIN (FORMAT binary)"
        );
    }

    #[test]
    fn test_blank_filter_ignored() {
        let sql = spec(Some("   ")).copy_out_sql(0, 10);
        assert!(!sql.contains("AND ()"));
        assert!(sql.contains("WHERE \"id\" >= 0 AND \"id\" < 10 ORDER BY"));
    }
}
