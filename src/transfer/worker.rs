use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use indicatif::ProgressBar;

use super::{FetchOutcome, FetchTask, WorkerMetrics};
use crate::error::FetchError;
use crate::pool::ConnectionPool;
use crate::runtime::CancelToken;

pub(crate) struct WorkerCtx {
    pub(crate) worker_id: usize,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) cancel: CancelToken,
    pub(crate) progress: Option<ProgressBar>,
}

/// Worker loop: pull tasks until the queue is drained, report each outcome.
pub(crate) fn run(
    ctx: WorkerCtx,
    task_rx: Receiver<(usize, FetchTask)>,
    outcome_tx: Sender<(usize, FetchOutcome)>,
    metrics_tx: Sender<WorkerMetrics>,
) {
    let mut metrics = WorkerMetrics::default();
    let worker_start = Instant::now();
    while let Ok((idx, task)) = task_rx.recv() {
        tracing::debug!("[transfer][worker] worker_id={} received {}", ctx.worker_id, task.remote_path);
        let outcome = match fetch_one(&ctx, &task, &mut metrics) {
            Ok(bytes) => {
                metrics.bytes += bytes;
                metrics.files += 1;
                FetchOutcome::succeeded(&task, bytes)
            }
            Err(e) => {
                tracing::debug!("[transfer][worker] {} failed: {}", task.remote_path, e);
                metrics.failures += 1;
                FetchOutcome::failed(&task, &e)
            }
        };
        if outcome_tx.send((idx, outcome)).is_err() {
            break;
        }
    }
    let elapsed = worker_start.elapsed().as_secs_f64();
    if elapsed > 0.0 && metrics.bytes > 0 {
        let mb = metrics.bytes as f64 / 1024.0 / 1024.0;
        tracing::debug!("[transfer][worker] worker_id={} avg_MBps={:.2}", ctx.worker_id, mb / elapsed);
    }
    let _ = metrics_tx.send(metrics);
}

/// Download one file into place. On any failure the temporary file is
/// removed and the connection is discarded.
fn fetch_one(
    ctx: &WorkerCtx,
    task: &FetchTask,
    metrics: &mut WorkerMetrics,
) -> Result<u64, FetchError> {
    if ctx.cancel.is_cancelled() {
        return Err(FetchError::Cancelled(format!("{} was not started", task.remote_path)));
    }
    if let Some(parent) = task.local_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            FetchError::io(&format!("cannot create {}", parent.display()), e)
        })?;
    }

    let mut guard = ctx.pool.acquire()?;
    if guard.was_fresh() {
        metrics.fresh_connections += 1;
        tracing::debug!("[transfer][worker] worker_id={} opened connection", ctx.worker_id);
    }
    let tmp_path = part_path_for(&task.local_path);
    let mut written: u64 = 0;
    let mut aborted = false;
    let res = guard.session().and_then(|session| {
        let file = File::create(&tmp_path)
            .map_err(|e| FetchError::io(&format!("cannot create {}", tmp_path.display()), e))?;
        let mut sink = TransferSink {
            file,
            cancel: &ctx.cancel,
            progress: ctx.progress.as_ref(),
            written: &mut written,
            aborted: &mut aborted,
        };
        let bytes = session.retrieve(&task.remote_path, &mut sink)?;
        let file = sink.file;
        file.sync_all().map_err(|e| FetchError::io("local sync failed", e))?;
        drop(file);
        move_into_place(&tmp_path, &task.local_path, &ctx.cancel).map_err(|e| {
            if e.kind() == io::ErrorKind::Interrupted {
                FetchError::Cancelled(format!("{} was aborted before rename", task.remote_path))
            } else {
                FetchError::io("rename failed", e)
            }
        })?;
        Ok(bytes)
    });

    match res {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            guard.discard();
            if tmp_path.exists()
                && let Err(rm) = std::fs::remove_file(&tmp_path)
            {
                tracing::warn!("[transfer][worker] cannot remove {}: {}", tmp_path.display(), rm);
            }
            if let Some(pb) = ctx.progress.as_ref() {
                pb.dec(written);
            }
            if aborted {
                return Err(FetchError::Cancelled(format!("{} was aborted", task.remote_path)));
            }
            Err(e)
        }
    }
}

/// File sink that refuses further writes once the run is cancelled.
/// `aborted` is set only when a write was refused for that reason.
struct TransferSink<'a> {
    file: File,
    cancel: &'a CancelToken,
    progress: Option<&'a ProgressBar>,
    written: &'a mut u64,
    aborted: &'a mut bool,
}

impl Write for TransferSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            *self.aborted = true;
            return Err(io::Error::other("transfer cancelled"));
        }
        let n = self.file.write(buf)?;
        *self.written += n as u64;
        if let Some(pb) = self.progress {
            pb.inc(n as u64);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Mirror `remote_path` under `local_root`. Only normal path components are
/// kept, so `..` or a leading `/` cannot escape the root. Remote paths are
/// `/`-separated; any other character is part of a name.
pub fn local_path_for(local_root: &Path, remote_path: &str) -> PathBuf {
    let mut out = local_root.to_path_buf();
    for part in remote_path.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        out.push(part);
    }
    out
}

fn part_path_for(local_target: &Path) -> PathBuf {
    let parent = local_target.parent().unwrap_or_else(|| Path::new("."));
    let name = local_target.file_name().and_then(|n| n.to_str()).unwrap_or("download");
    parent.join(format!("{}.part.{}", name, std::process::id()))
}

const RENAME_ATTEMPTS: u32 = 3;
const RENAME_BACKOFF: Duration = Duration::from_millis(50);

/// Rename a finished `.part` file onto `target`.
///
/// A target that exists or is briefly locked (Windows) is removed and the
/// rename tried again, up to [`RENAME_ATTEMPTS`] times. Once `cancel` is set
/// no further attempt is made and `Interrupted` is returned.
pub fn move_into_place(part: &Path, target: &Path, cancel: &CancelToken) -> io::Result<()> {
    let mut attempt = 1;
    loop {
        let err = match std::fs::rename(part, target) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let retryable =
            matches!(err.kind(), io::ErrorKind::AlreadyExists | io::ErrorKind::PermissionDenied);
        if !retryable || attempt >= RENAME_ATTEMPTS {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled while renaming"));
        }
        tracing::debug!(
            "[transfer][worker] rename onto {} failed ({}), attempt {}",
            target.display(),
            err,
            attempt
        );
        let _ = std::fs::remove_file(target);
        std::thread::sleep(RENAME_BACKOFF);
        attempt += 1;
    }
}
