//! Worker pool shared by both execution modes.
//!
//! A pool of `parallelism` cooperative tasks, each looping claim → execute →
//! report. Workers never touch the progress store; every outcome flows to the
//! coordinator through one bounded result channel, and the channel closing is
//! the signal that every worker has exited.

use crate::error::PscError;
use crate::partition::{ChunkClaim, ClaimQueue};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of one chunk, reported to the coordinator. Never persisted.
#[derive(Debug)]
pub struct ChunkResult {
    /// First key of the executed range.
    pub start_key: i64,

    /// Last key bound of the executed range (exclusive in copy mode,
    /// inclusive in statement mode).
    pub end_key: i64,

    /// Rows affected by this chunk (nominal in copy mode).
    pub rows_affected: i64,

    /// Wall-clock time the chunk took.
    pub elapsed: Duration,

    /// Failure, if the chunk did not commit.
    pub error: Option<PscError>,
}

impl ChunkResult {
    /// A successful result for the given range.
    pub fn ok(start_key: i64, end_key: i64, rows_affected: i64) -> Self {
        Self {
            start_key,
            end_key,
            rows_affected,
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    /// A failed result for the given range.
    pub fn err(start_key: i64, end_key: i64, error: PscError) -> Self {
        Self {
            start_key,
            end_key,
            rows_affected: 0,
            elapsed: Duration::ZERO,
            error: Some(error),
        }
    }
}

/// Per-mode worker loop policy.
#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    /// Number of workers. 1 is a legal degenerate case.
    pub parallelism: usize,

    /// Stop the reporting worker after an errored chunk (abort semantics).
    /// With `false` the worker claims the next chunk (continue semantics).
    pub exit_on_error: bool,

    /// Stop the reporting worker after a chunk that affected zero rows
    /// (copy mode: the source has no rows at or past the claim).
    pub exit_on_empty: bool,
}

/// Spawn the worker pool and return the result channel.
///
/// The channel is bounded at `2 × parallelism` to absorb bursts; it closes
/// once every worker has exited, including workers that panicked (a panic is
/// converted into an errored [`ChunkResult`] so the coordinator always
/// drains).
pub fn spawn_workers<Q, E, Fut>(
    policy: PoolPolicy,
    cancel: CancellationToken,
    queue: Arc<Q>,
    exec: E,
) -> mpsc::Receiver<ChunkResult>
where
    Q: ClaimQueue,
    E: Fn(ChunkClaim) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ChunkResult> + Send + 'static,
{
    let parallelism = policy.parallelism.max(1);
    let (tx, rx) = mpsc::channel::<ChunkResult>(parallelism * 2);

    let mut workers = JoinSet::new();
    for worker_id in 0..parallelism {
        let queue = Arc::clone(&queue);
        let exec = exec.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();

        workers.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    debug!("worker {} exiting: cancelled", worker_id);
                    return;
                }
                let Some(claim) = queue.next() else {
                    debug!("worker {} exiting: claims exhausted", worker_id);
                    return;
                };

                let started = Instant::now();
                let mut result = exec(claim).await;
                result.elapsed = started.elapsed();

                let errored = result.error.is_some();
                let empty = !errored && result.rows_affected == 0;

                if tx.send(result).await.is_err() {
                    return;
                }
                if errored && policy.exit_on_error {
                    debug!("worker {} exiting: chunk error", worker_id);
                    return;
                }
                if empty && policy.exit_on_empty {
                    debug!("worker {} exiting: no more source rows", worker_id);
                    return;
                }
            }
        });
    }
    // Supervisor: convert worker panics into reportable chunk errors and hold
    // the JoinSet until every worker is done, which closes the channel.
    tokio::spawn(supervise(workers, tx));

    rx
}

async fn supervise(mut workers: JoinSet<()>, tx: mpsc::Sender<ChunkResult>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(join_err) = joined {
            tracing::error!("worker task failed: {}", join_err);
            let result = ChunkResult::err(
                0,
                0,
                PscError::chunk(0, 0, format!("worker task failed: {}", join_err)),
            );
            let _ = tx.send(result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{BoundedClaimer, StrideClaimer};
    use std::collections::HashSet;

    fn policy(parallelism: usize) -> PoolPolicy {
        PoolPolicy {
            parallelism,
            exit_on_error: true,
            exit_on_empty: false,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<ChunkResult>) -> Vec<ChunkResult> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(r);
        }
        out
    }

    #[tokio::test]
    async fn test_every_claim_processed_exactly_once() {
        let queue = Arc::new(BoundedClaimer::new(0, 10, 99));
        let rx = spawn_workers(policy(4), CancellationToken::new(), queue, |claim| async move {
            ChunkResult::ok(claim.start, claim.end, claim.end - claim.start + 1)
        });

        let results = drain(rx).await;
        assert_eq!(results.len(), 10);
        let starts: HashSet<i64> = results.iter().map(|r| r.start_key).collect();
        assert_eq!(starts.len(), 10);
    }

    #[tokio::test]
    async fn test_parallelism_one_behaves_identically() {
        let queue = Arc::new(BoundedClaimer::new(0, 10, 99));
        let rx = spawn_workers(policy(1), CancellationToken::new(), queue, |claim| async move {
            ChunkResult::ok(claim.start, claim.end, 1)
        });

        let results = drain(rx).await;
        assert_eq!(results.len(), 10);
        // Single worker processes claims sequentially, so completion order is
        // claim order.
        let starts: Vec<i64> = results.iter().map(|r| r.start_key).collect();
        assert_eq!(starts, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_unbounded_pool() {
        let queue = Arc::new(StrideClaimer::new(0, 100));
        let cancel = CancellationToken::new();
        let rx = spawn_workers(policy(4), cancel.clone(), queue, |claim| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ChunkResult::ok(claim.start, claim.end, 100)
        });

        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                cancel.cancel();
            }
        });

        // The claimer is infinite; only cancellation can close the channel.
        let results = tokio::time::timeout(Duration::from_secs(5), drain(rx))
            .await
            .expect("workers did not exit after cancellation");
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn test_exit_on_empty_terminates_copy_pool() {
        let queue = Arc::new(StrideClaimer::new(0, 10));
        let pool_policy = PoolPolicy {
            parallelism: 3,
            exit_on_error: true,
            exit_on_empty: true,
        };
        let rx = spawn_workers(
            pool_policy,
            CancellationToken::new(),
            queue,
            |claim| async move {
                if claim.start >= 50 {
                    ChunkResult::ok(claim.start, claim.start, 0)
                } else {
                    ChunkResult::ok(claim.start, claim.end, 10)
                }
            },
        );

        let results = drain(rx).await;
        let copied: i64 = results.iter().map(|r| r.rows_affected).sum();
        assert_eq!(copied, 50);
    }

    #[tokio::test]
    async fn test_exit_on_error_stops_worker() {
        let queue = Arc::new(BoundedClaimer::new(0, 10, 99));
        let rx = spawn_workers(policy(1), CancellationToken::new(), queue, |claim| async move {
            if claim.start == 20 {
                ChunkResult::err(claim.start, claim.end, PscError::chunk(claim.start, claim.end, "boom"))
            } else {
                ChunkResult::ok(claim.start, claim.end, 1)
            }
        });

        let results = drain(rx).await;
        // Worker stops right after reporting the failed chunk.
        assert_eq!(results.len(), 3);
        assert!(results.last().unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_continue_policy_runs_all_chunks() {
        let queue = Arc::new(BoundedClaimer::new(0, 10, 99));
        let pool_policy = PoolPolicy {
            parallelism: 2,
            exit_on_error: false,
            exit_on_empty: false,
        };
        let rx = spawn_workers(
            pool_policy,
            CancellationToken::new(),
            queue,
            |claim| async move {
                if claim.start == 30 {
                    ChunkResult::err(claim.start, claim.end, PscError::chunk(claim.start, claim.end, "constraint"))
                } else {
                    ChunkResult::ok(claim.start, claim.end, 1)
                }
            },
        );

        let results = drain(rx).await;
        assert_eq!(results.len(), 10);
        assert_eq!(results.iter().filter(|r| r.error.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_worker_panic_drains_pool() {
        let queue = Arc::new(BoundedClaimer::new(0, 10, 49));
        let rx = spawn_workers(policy(2), CancellationToken::new(), queue, |claim| async move {
            if claim.start == 20 {
                panic!("executor bug");
            }
            ChunkResult::ok(claim.start, claim.end, 1)
        });

        // The channel must still close even though one worker died, and the
        // panic surfaces as an errored result.
        let results = tokio::time::timeout(Duration::from_secs(5), drain(rx))
            .await
            .expect("pool did not drain after worker panic");
        assert!(results.iter().any(|r| {
            r.error
                .as_ref()
                .is_some_and(|e| e.to_string().contains("worker task failed"))
        }));
    }
}
