//! Range partitioning: dividing a key space into non-overlapping chunk claims.
//!
//! Both execution modes share one claiming primitive, an atomic fetch-and-add
//! counter. Copy mode strides through an open-ended key space (gap skipping is
//! the chunk executor's job, via its MIN probe); statement mode hands out
//! closed intervals clamped to a probed maximum key.

use crate::error::{PscError, Result};
use std::sync::atomic::{AtomicI64, Ordering};

/// A worker's exclusive reservation of one chunk of the key space.
///
/// In copy mode `end` is the nominal stride bound `start + chunk_size`; the
/// executor re-anchors the range at the first existing key. In statement mode
/// the claim is the closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkClaim {
    pub start: i64,
    pub end: i64,
}

/// Source of chunk claims for a worker pool.
///
/// `next` must hand any given claim to exactly one caller; implementations
/// use an atomic counter so no locking is required.
pub trait ClaimQueue: Send + Sync + 'static {
    /// Claim the next chunk, or `None` when the key space is exhausted.
    fn next(&self) -> Option<ChunkClaim>;
}

/// Copy-mode claimer: unbounded arithmetic striding.
///
/// Always returns a claim; workers stop when the chunk executor reports that
/// no source key at or above the claim exists.
pub struct StrideClaimer {
    next: AtomicI64,
    chunk_size: i64,
}

impl StrideClaimer {
    pub fn new(start_key: i64, chunk_size: i64) -> Self {
        Self {
            next: AtomicI64::new(start_key),
            chunk_size,
        }
    }
}

impl ClaimQueue for StrideClaimer {
    fn next(&self) -> Option<ChunkClaim> {
        let start = self.next.fetch_add(self.chunk_size, Ordering::SeqCst);
        Some(ChunkClaim {
            start,
            end: start + self.chunk_size,
        })
    }
}

/// Statement-mode claimer: closed intervals `[a, a + chunk − 1]` truncated at
/// `max_key`; exhausted once a claim would start past `max_key`.
pub struct BoundedClaimer {
    next: AtomicI64,
    chunk_size: i64,
    max_key: i64,
}

impl BoundedClaimer {
    pub fn new(start_key: i64, chunk_size: i64, max_key: i64) -> Self {
        Self {
            next: AtomicI64::new(start_key),
            chunk_size,
            max_key,
        }
    }
}

impl ClaimQueue for BoundedClaimer {
    fn next(&self) -> Option<ChunkClaim> {
        let start = self.next.fetch_add(self.chunk_size, Ordering::SeqCst);
        if start > self.max_key {
            return None;
        }
        let end = (start + self.chunk_size - 1).min(self.max_key);
        Some(ChunkClaim { start, end })
    }
}

/// Extract the table to probe for `MAX(key)` from a data-fix statement.
///
/// Recognizes the `UPDATE <table>` and `DELETE FROM <table>` prefixes. The
/// operation cannot start without it, so failure here is immediate.
pub fn statement_target_table(sql: &str) -> Result<String> {
    // ASCII-only uppercasing keeps byte offsets aligned with the original.
    let upper = sql.to_ascii_uppercase();

    if let Some(idx) = upper.find("UPDATE ") {
        if let Some(table) = first_word(&sql[idx + "UPDATE ".len()..]) {
            return Ok(table);
        }
    }
    if let Some(idx) = upper.find("FROM ") {
        if let Some(table) = first_word(&sql[idx + "FROM ".len()..]) {
            return Ok(table);
        }
    }

    Err(PscError::Extraction(format!(
        "statement has no UPDATE <table> or DELETE FROM <table> prefix: {}",
        sql.lines().next().unwrap_or("").trim()
    )))
}

fn first_word(s: &str) -> Option<String> {
    s.split_whitespace().next().map(|w| w.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_bounded_walk_truncates_last_chunk() {
        // start=0, max=9, chunk=4 -> [0,3], [4,7], [8,9]
        let claimer = BoundedClaimer::new(0, 4, 9);
        assert_eq!(claimer.next(), Some(ChunkClaim { start: 0, end: 3 }));
        assert_eq!(claimer.next(), Some(ChunkClaim { start: 4, end: 7 }));
        assert_eq!(claimer.next(), Some(ChunkClaim { start: 8, end: 9 }));
        assert_eq!(claimer.next(), None);
        assert_eq!(claimer.next(), None);
    }

    #[test]
    fn test_bounded_walk_exact_multiple() {
        let claimer = BoundedClaimer::new(0, 5, 9);
        assert_eq!(claimer.next(), Some(ChunkClaim { start: 0, end: 4 }));
        assert_eq!(claimer.next(), Some(ChunkClaim { start: 5, end: 9 }));
        assert_eq!(claimer.next(), None);
    }

    #[test]
    fn test_bounded_resume_start() {
        let claimer = BoundedClaimer::new(5000, 1000, 6500);
        assert_eq!(
            claimer.next(),
            Some(ChunkClaim {
                start: 5000,
                end: 5999
            })
        );
        assert_eq!(
            claimer.next(),
            Some(ChunkClaim {
                start: 6000,
                end: 6500
            })
        );
        assert_eq!(claimer.next(), None);
    }

    #[test]
    fn test_bounded_start_past_max() {
        let claimer = BoundedClaimer::new(100, 10, 50);
        assert_eq!(claimer.next(), None);
    }

    #[test]
    fn test_stride_claims_are_contiguous() {
        let claimer = StrideClaimer::new(5000, 1000);
        let first = claimer.next().unwrap();
        assert_eq!(first.start, 5000);
        assert_eq!(first.end, 6000);
        let second = claimer.next().unwrap();
        assert_eq!(second.start, 6000);
    }

    #[test]
    fn test_concurrent_claims_never_overlap() {
        // Hammer the claimer from several threads and verify every claim is
        // unique and the union covers the key space without gaps.
        let claimer = Arc::new(BoundedClaimer::new(0, 7, 9999));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let claimer = Arc::clone(&claimer);
            handles.push(std::thread::spawn(move || {
                let mut claims = Vec::new();
                while let Some(c) = claimer.next() {
                    claims.push(c);
                }
                claims
            }));
        }

        let mut all: Vec<ChunkClaim> = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }

        let starts: HashSet<i64> = all.iter().map(|c| c.start).collect();
        assert_eq!(starts.len(), all.len(), "duplicate claim issued");

        all.sort_by_key(|c| c.start);
        let mut expected_start = 0;
        for claim in &all {
            assert_eq!(claim.start, expected_start, "gap between claims");
            assert!(claim.end >= claim.start);
            assert!(claim.end <= 9999);
            expected_start = claim.end + 1;
        }
        assert_eq!(expected_start, 10000, "key space not fully covered");
    }

    #[test]
    fn test_extract_update_table() {
        let sql = "UPDATE orders SET status = 'done' WHERE id BETWEEN :start AND :end";
        assert_eq!(statement_target_table(sql).unwrap(), "orders");
    }

    #[test]
    fn test_extract_delete_table() {
        let sql = "DELETE FROM audit_log WHERE id BETWEEN :start AND :end";
        assert_eq!(statement_target_table(sql).unwrap(), "audit_log");
    }

    #[test]
    fn test_extract_case_insensitive() {
        assert_eq!(
            statement_target_table("update Foo set x = 1").unwrap(),
            "Foo"
        );
        assert_eq!(
            statement_target_table("delete from bar where id < :end").unwrap(),
            "bar"
        );
    }

    #[test]
    fn test_extract_failure() {
        let err = statement_target_table("SELECT 1").unwrap_err();
        assert!(matches!(err, PscError::Extraction(_)));
    }
}
