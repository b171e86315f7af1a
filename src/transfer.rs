// transfer module: bounded-concurrency single-file downloads
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::unbounded;
use indicatif::ProgressBar;
use serde::Serialize;

use crate::config::validate_concurrency;
use crate::error::{ErrorKind, FetchError};
use crate::pool::ConnectionPool;
use crate::runtime::CancelToken;

pub use worker::{local_path_for, move_into_place};

/// One file to download. Created by the coordinator, consumed exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchTask {
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Size reported by the listing, used for progress only.
    pub size_hint: Option<u64>,
}

/// Result of one [`FetchTask`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub success: bool,
    pub error_detail: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub bytes_transferred: Option<u64>,
}

impl FetchOutcome {
    pub fn succeeded(task: &FetchTask, bytes: u64) -> Self {
        Self {
            remote_path: task.remote_path.clone(),
            local_path: task.local_path.clone(),
            success: true,
            error_detail: None,
            error_kind: None,
            bytes_transferred: Some(bytes),
        }
    }

    pub fn failed(task: &FetchTask, err: &FetchError) -> Self {
        Self {
            remote_path: task.remote_path.clone(),
            local_path: task.local_path.clone(),
            success: false,
            error_detail: Some(err.to_string()),
            error_kind: Some(err.kind()),
            bytes_transferred: None,
        }
    }
}

#[derive(Clone, Default, Debug)]
pub(crate) struct WorkerMetrics {
    pub(crate) bytes: u64,
    pub(crate) files: u64,
    pub(crate) failures: u64,
    pub(crate) fresh_connections: u32,
}

/// Runs downloads on a fixed set of worker threads fed from a shared queue.
///
/// At most `max_concurrency` transfers are in flight; a worker picks the next
/// queued task as soon as its current transfer settles.
pub struct TransferWorkerPool {
    pool: Arc<ConnectionPool>,
    cancel: CancelToken,
    progress: Option<ProgressBar>,
}

impl TransferWorkerPool {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool, cancel: CancelToken::new(), progress: None }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Advance `pb` by every byte written to disk.
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.progress = Some(pb);
        self
    }

    /// Download every task and return one outcome per task, in completion
    /// order. Per-file failures are captured in the outcomes; the only error
    /// is an invalid concurrency bound, reported before any connection opens.
    pub fn submit(
        &self,
        tasks: Vec<FetchTask>,
        max_concurrency: usize,
    ) -> Result<Vec<FetchOutcome>, FetchError> {
        validate_concurrency(max_concurrency)?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let workers = max_concurrency.min(tasks.len());
        let start = Instant::now();
        tracing::debug!("[transfer] submit tasks={} workers={}", tasks.len(), workers);

        let (task_tx, task_rx) = unbounded::<(usize, FetchTask)>();
        let (outcome_tx, outcome_rx) = unbounded::<(usize, FetchOutcome)>();
        let (metrics_tx, metrics_rx) = unbounded::<WorkerMetrics>();
        for (idx, task) in tasks.iter().enumerate() {
            // receiver is alive until the workers are spawned below
            let _ = task_tx.send((idx, task.clone()));
        }
        drop(task_tx);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let ctx = worker::WorkerCtx {
                worker_id,
                pool: self.pool.clone(),
                cancel: self.cancel.clone(),
                progress: self.progress.clone(),
            };
            let task_rx = task_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let metrics_tx = metrics_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("fetch-worker-{}", worker_id))
                .spawn(move || worker::run(ctx, task_rx, outcome_tx, metrics_tx));
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => tracing::warn!("[transfer] spawning worker {} failed: {}", worker_id, e),
            }
        }
        drop(task_rx);
        drop(outcome_tx);
        drop(metrics_tx);

        // ends once every worker has exited (normally or by panicking)
        let mut settled = vec![false; tasks.len()];
        let mut outcomes = Vec::with_capacity(tasks.len());
        for (idx, outcome) in outcome_rx.iter() {
            if !settled[idx] {
                settled[idx] = true;
                outcomes.push(outcome);
            }
        }
        for h in handles {
            if h.join().is_err() {
                tracing::warn!("[transfer] a worker thread panicked");
            }
        }

        for (idx, done) in settled.iter().enumerate() {
            if !done {
                let err = FetchError::Io("worker stopped before the transfer settled".to_string());
                tracing::debug!("[transfer] unsettled task {}", tasks[idx].remote_path);
                outcomes.push(FetchOutcome::failed(&tasks[idx], &err));
            }
        }

        let mut agg = WorkerMetrics::default();
        for m in metrics_rx.into_iter() {
            agg.bytes += m.bytes;
            agg.files += m.files;
            agg.failures += m.failures;
            agg.fresh_connections += m.fresh_connections;
        }
        let elapsed = start.elapsed().as_secs_f64();
        tracing::info!(
            "[transfer] settled {} tasks ({} ok, {} failed) bytes={} new_connections={} in {:.2}s",
            outcomes.len(),
            agg.files,
            agg.failures,
            agg.bytes,
            agg.fresh_connections,
            elapsed
        );
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{Fault, MemoryEndpoint};

    fn pool_for(ep: &MemoryEndpoint) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(Arc::new(ep.clone()), 4))
    }

    fn task(remote: &str, root: &std::path::Path) -> FetchTask {
        FetchTask {
            remote_path: remote.to_string(),
            local_path: local_path_for(root, remote),
            size_hint: None,
        }
    }

    #[test]
    fn zero_concurrency_fails_before_connecting() {
        let ep = MemoryEndpoint::new();
        let path = ep.put_file("/", "a.txt", "a");
        let dir = tempfile::tempdir().expect("tmp");
        let wp = TransferWorkerPool::new(pool_for(&ep));
        let err = wp.submit(vec![task(&path, dir.path())], 0).unwrap_err();
        assert!(matches!(err, FetchError::Configuration(_)));
        assert_eq!(ep.sessions_opened(), 0);
    }

    #[test]
    fn empty_submission_yields_no_outcomes() {
        let ep = MemoryEndpoint::new();
        let wp = TransferWorkerPool::new(pool_for(&ep));
        assert!(wp.submit(Vec::new(), 3).expect("submit").is_empty());
        assert_eq!(ep.sessions_opened(), 0);
    }

    #[test]
    fn one_outcome_per_task_even_with_failures() {
        let ep = MemoryEndpoint::new();
        let ok = ep.put_file("/d", "ok.txt", "fine");
        let bad = ep.put_file("/d", "bad.txt", vec![1u8; 9000]);
        ep.inject_fault(&bad, Fault::DropAfter(4096));
        let dir = tempfile::tempdir().expect("tmp");
        let wp = TransferWorkerPool::new(pool_for(&ep));
        let outcomes =
            wp.submit(vec![task(&ok, dir.path()), task(&bad, dir.path())], 2).expect("submit");
        assert_eq!(outcomes.len(), 2);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].remote_path, bad);
        assert_eq!(failed[0].error_kind, Some(ErrorKind::Connection));
        assert!(!failed[0].local_path.exists());
        let good = outcomes.iter().find(|o| o.success).expect("success");
        assert_eq!(good.bytes_transferred, Some(4));
        assert_eq!(std::fs::read(&good.local_path).expect("read"), b"fine");
    }

    #[test]
    fn cancelled_before_start_settles_every_task() {
        let ep = MemoryEndpoint::new();
        let paths = ep.generate_files(6, 0, "/c");
        let dir = tempfile::tempdir().expect("tmp");
        let cancel = CancelToken::new();
        cancel.cancel();
        let wp = TransferWorkerPool::new(pool_for(&ep)).with_cancel(cancel);
        let tasks = paths.iter().map(|p| task(p, dir.path())).collect();
        let outcomes = wp.submit(tasks, 3).expect("submit");
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.error_kind == Some(ErrorKind::Cancelled)));
        assert_eq!(ep.transfers_started(), 0);
    }
}
