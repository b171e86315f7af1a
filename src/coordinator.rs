use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use indicatif::ProgressBar;
use serde::Serialize;

use crate::config::validate_concurrency;
use crate::error::FetchError;
use crate::pool::ConnectionPool;
use crate::remote::RemoteListing;
use crate::runtime::{CancelToken, FetchRuntime};
use crate::transfer::{FetchOutcome, FetchTask, TransferWorkerPool, local_path_for};

/// Aggregate of one fetch run, built after every task has settled.
#[derive(Clone, Debug, Serialize)]
pub struct FetchReport {
    /// In completion order.
    pub outcomes: Vec<FetchOutcome>,
    pub failed_count: usize,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl FetchReport {
    pub fn from_outcomes(outcomes: Vec<FetchOutcome>, elapsed: Duration, cancelled: bool) -> Self {
        let failed_count = outcomes.iter().filter(|o| !o.success).count();
        let total_bytes = outcomes.iter().filter_map(|o| o.bytes_transferred).sum();
        Self { outcomes, failed_count, total_bytes, elapsed, cancelled }
    }

    pub fn is_success(&self) -> bool {
        self.failed_count == 0
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.len() - self.failed_count
    }

    pub fn failures(&self) -> impl Iterator<Item = &FetchOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

/// Drives one run: list, keep files, download with a bounded window, collect.
pub struct FetchCoordinator {
    listing: RemoteListing,
    pool: Arc<ConnectionPool>,
    cancel: CancelToken,
    recursive: bool,
    timeout: Option<Duration>,
    progress: Option<ProgressBar>,
}

impl FetchCoordinator {
    pub fn new(runtime: &FetchRuntime) -> Self {
        Self {
            listing: RemoteListing::new(runtime.endpoint()),
            pool: runtime.pool().clone(),
            cancel: runtime.cancel_token(),
            recursive: false,
            timeout: None,
            progress: None,
        }
    }

    /// Descend into subdirectories of the base directory.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Cancel the run once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Byte progress bar; its length is set from listing sizes.
    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.progress = Some(pb);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fetch every file under `base_directory` into `local_root`.
    ///
    /// Fails only for an invalid bound or a failed listing, in which case
    /// nothing is dispatched. Per-file failures land in the report. The
    /// timeout covers the listing phase too; if it expires there, every
    /// listed file settles as cancelled without a transfer being started.
    pub fn fetch(
        &self,
        base_directory: &str,
        local_root: &Path,
        max_concurrency: usize,
    ) -> Result<FetchReport, FetchError> {
        validate_concurrency(max_concurrency)?;
        let start = Instant::now();

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let watchdog = self.timeout.map(|limit| {
            let cancel = self.cancel.clone();
            std::thread::spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(limit) {
                    tracing::warn!("[coordinator] timeout of {:?} reached, cancelling", limit);
                    cancel.cancel();
                }
            })
        });

        let outcomes = self.list_and_dispatch(base_directory, local_root, max_concurrency);
        drop(done_tx);
        if let Some(h) = watchdog {
            let _ = h.join();
        }
        let outcomes = outcomes?;

        let report =
            FetchReport::from_outcomes(outcomes, start.elapsed(), self.cancel.is_cancelled());
        tracing::info!(
            "[coordinator] {} fetched, {} failed, {} bytes in {:.2}s",
            report.succeeded_count(),
            report.failed_count,
            report.total_bytes,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    fn list_and_dispatch(
        &self,
        base_directory: &str,
        local_root: &Path,
        max_concurrency: usize,
    ) -> Result<Vec<FetchOutcome>, FetchError> {
        let entries = self.listing.walk(base_directory, self.recursive)?;
        let tasks: Vec<FetchTask> = entries
            .into_iter()
            .filter(|e| !e.is_directory)
            .map(|e| FetchTask {
                local_path: local_path_for(local_root, &e.path),
                remote_path: e.path,
                size_hint: e.size,
            })
            .collect();
        if self.cancel.is_cancelled() {
            tracing::warn!(
                "[coordinator] cancelled during listing, {} files will not be started",
                tasks.len()
            );
        } else {
            tracing::info!(
                "[coordinator] dispatching {} files from {} into {} (max_concurrency={})",
                tasks.len(),
                base_directory,
                local_root.display(),
                max_concurrency
            );
        }

        let mut workers = TransferWorkerPool::new(self.pool.clone()).with_cancel(self.cancel.clone());
        if let Some(pb) = self.progress.as_ref() {
            pb.set_length(tasks.iter().filter_map(|t| t.size_hint).sum());
            workers = workers.with_progress(pb.clone());
        }
        workers.submit(tasks, max_concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::remote::memory::MemoryEndpoint;

    fn runtime_for(ep: &MemoryEndpoint) -> FetchRuntime {
        FetchRuntime::new(Arc::new(ep.clone()), 4)
    }

    #[test]
    fn report_counts_failures_and_bytes() {
        let ok = FetchOutcome {
            remote_path: "/a".into(),
            local_path: "a".into(),
            success: true,
            error_detail: None,
            error_kind: None,
            bytes_transferred: Some(10),
        };
        let bad = FetchOutcome {
            remote_path: "/b".into(),
            local_path: "b".into(),
            success: false,
            error_detail: Some("connection error: reset".into()),
            error_kind: Some(ErrorKind::Connection),
            bytes_transferred: None,
        };
        let r = FetchReport::from_outcomes(vec![ok, bad], Duration::from_millis(5), false);
        assert_eq!(r.failed_count, 1);
        assert_eq!(r.total_bytes, 10);
        assert_eq!(r.succeeded_count(), 1);
        assert_eq!(r.failures().next().map(|o| o.remote_path.as_str()), Some("/b"));
        assert!(!r.is_success());
    }

    #[test]
    fn invalid_bound_lists_nothing() {
        let ep = MemoryEndpoint::new();
        ep.put_file("/", "a.txt", "a");
        let dir = tempfile::tempdir().expect("tmp");
        let rt = runtime_for(&ep);
        let err = FetchCoordinator::new(&rt).fetch("/", dir.path(), 0).unwrap_err();
        assert!(matches!(err, FetchError::Configuration(_)));
        assert_eq!(ep.sessions_opened(), 0);
    }

    #[test]
    fn non_recursive_fetch_skips_subdirectories() {
        let ep = MemoryEndpoint::new();
        ep.put_file("/pub", "top.txt", "top");
        ep.put_file("/pub/nested", "deep.txt", "deep");
        let dir = tempfile::tempdir().expect("tmp");
        let rt = runtime_for(&ep);
        let report = FetchCoordinator::new(&rt).fetch("/pub", dir.path(), 2).expect("fetch");
        assert_eq!(report.outcomes.len(), 1);
        assert!(dir.path().join("pub").join("top.txt").is_file());
        assert!(!dir.path().join("pub").join("nested").exists());
    }

    #[test]
    fn timeout_expiring_during_listing_starts_no_transfer() {
        let ep = MemoryEndpoint::new();
        ep.generate_files(3, 0, "/slow-list");
        ep.set_listing_delay(Duration::from_millis(400));
        let dir = tempfile::tempdir().expect("tmp");
        let rt = runtime_for(&ep);
        let report = FetchCoordinator::new(&rt)
            .with_timeout(Some(Duration::from_millis(100)))
            .fetch("/slow-list", dir.path(), 2)
            .expect("fetch");
        assert!(report.cancelled);
        assert_eq!(report.failed_count, 3);
        assert!(report.failures().all(|o| o.error_kind == Some(ErrorKind::Cancelled)));
        assert_eq!(ep.transfers_started(), 0);
        assert_eq!(rt.pool().opened(), 0);
    }
}
