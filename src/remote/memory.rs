//! In-process endpoint backed by a mock file system.
//!
//! Used by the `demo` command in place of a real FTP server and by the test
//! suite. Files can be generated in bulk, faults injected per path, and the
//! endpoint tracks how many sessions and simultaneous transfers it served.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::{Endpoint, RemoteEntry, RemoteSession, STREAM_BUF_SIZE, copy_stream, join_remote};
use crate::error::FetchError;
use crate::runtime::Teardown;

/// Fault injected into the retrieval of one path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Send this many bytes, then drop the connection.
    DropAfter(usize),
    /// Reject the transfer before any data flows.
    Refuse,
}

#[derive(Default)]
struct MemoryFs {
    files: BTreeMap<String, Arc<Vec<u8>>>,
    dirs: BTreeSet<String>,
}

#[derive(Default)]
struct Stats {
    sessions_opened: AtomicUsize,
    active_transfers: AtomicUsize,
    peak_transfers: AtomicUsize,
    transfers_started: AtomicUsize,
}

struct Inner {
    fs: RwLock<MemoryFs>,
    faults: Mutex<HashMap<String, Fault>>,
    transfer_delay: Mutex<Duration>,
    listing_delay: Mutex<Duration>,
    reachable: AtomicBool,
    stats: Stats,
}

/// Cloneable handle to a shared in-memory server.
#[derive(Clone)]
pub struct MemoryEndpoint {
    inner: Arc<Inner>,
}

impl Default for MemoryEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        let mut fs = MemoryFs::default();
        fs.dirs.insert("/".to_string());
        Self {
            inner: Arc::new(Inner {
                fs: RwLock::new(fs),
                faults: Mutex::new(HashMap::new()),
                transfer_delay: Mutex::new(Duration::ZERO),
                listing_delay: Mutex::new(Duration::ZERO),
                reachable: AtomicBool::new(true),
                stats: Stats::default(),
            }),
        }
    }

    /// Create `path` and all of its ancestors.
    pub fn mkdir(&self, path: &str) {
        let mut fs = write_lock(&self.inner.fs);
        let mut cur = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = join_remote(&cur, part);
            fs.dirs.insert(cur.clone());
        }
    }

    /// Store `contents` at `dir/name`, creating `dir` as needed.
    pub fn put_file(&self, dir: &str, name: &str, contents: impl Into<Vec<u8>>) -> String {
        self.mkdir(dir);
        let path = join_remote(dir, name);
        write_lock(&self.inner.fs).files.insert(path.clone(), Arc::new(contents.into()));
        path
    }

    /// Generate `count` small text files spread round-robin over `dirs`
    /// subdirectories of `base` (files land directly in `base` when `dirs`
    /// is zero). Returns the generated paths.
    pub fn generate_files(&self, count: usize, dirs: usize, base: &str) -> Vec<String> {
        self.mkdir(base);
        let dir_names: Vec<String> =
            (0..dirs).map(|i| join_remote(base, &format!("dir-{:02}", i))).collect();
        for d in &dir_names {
            self.mkdir(d);
        }
        (0..count)
            .map(|i| {
                let dir = if dir_names.is_empty() {
                    base
                } else {
                    dir_names[i % dir_names.len()].as_str()
                };
                let body = format!("generated file {} in {}\n", i, dir).repeat(i % 7 + 1);
                self.put_file(dir, &format!("file-{:03}.txt", i), body)
            })
            .collect()
    }

    pub fn inject_fault(&self, path: &str, fault: Fault) {
        lock(&self.inner.faults).insert(path.to_string(), fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.inner.faults).clear();
    }

    /// Delay applied at the start of every transfer, to widen concurrency windows.
    pub fn set_transfer_delay(&self, delay: Duration) {
        *lock(&self.inner.transfer_delay) = delay;
    }

    /// Delay applied to every directory listing.
    pub fn set_listing_delay(&self, delay: Duration) {
        *lock(&self.inner.listing_delay) = delay;
    }

    /// While unreachable, every `open` fails with a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Stop serving; used as the harness teardown.
    pub fn stop(&self) {
        tracing::debug!("[memory] endpoint stopped");
        self.set_reachable(false);
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.stats.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn transfers_started(&self) -> usize {
        self.inner.stats.transfers_started.load(Ordering::SeqCst)
    }

    /// Highest number of transfers that were streaming at the same instant.
    pub fn peak_concurrent_transfers(&self) -> usize {
        self.inner.stats.peak_transfers.load(Ordering::SeqCst)
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        read_lock(&self.inner.fs).files.get(path).map(|b| b.as_ref().clone())
    }

    fn list_dir(&self, directory: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        let dir = normalize_dir(directory);
        let fs = read_lock(&self.inner.fs);
        if !fs.dirs.contains(&dir) {
            return Err(FetchError::Protocol(format!(
                "550 {}: no such file or directory",
                directory
            )));
        }
        let mut entries: Vec<RemoteEntry> = fs
            .dirs
            .iter()
            .filter(|d| parent_of(d) == Some(dir.as_str()))
            .map(|d| RemoteEntry::directory(d.clone()))
            .collect();
        entries.extend(
            fs.files
                .iter()
                .filter(|(p, _)| parent_of(p) == Some(dir.as_str()))
                .map(|(p, body)| RemoteEntry::file(p.clone(), Some(body.len() as u64))),
        );
        Ok(entries)
    }
}

impl Endpoint for MemoryEndpoint {
    fn describe(&self) -> String {
        "memory://local".to_string()
    }

    fn open(&self) -> Result<Box<dyn RemoteSession>, FetchError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(FetchError::Connection(format!(
                "{}: connection refused",
                self.describe()
            )));
        }
        self.inner.stats.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession { endpoint: self.clone() }))
    }
}

impl Teardown for MemoryEndpoint {
    fn name(&self) -> String {
        self.describe()
    }

    fn teardown(&mut self) -> anyhow::Result<()> {
        self.stop();
        Ok(())
    }
}

struct MemorySession {
    endpoint: MemoryEndpoint,
}

impl RemoteSession for MemorySession {
    fn list(&mut self, directory: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        let delay = *lock(&self.endpoint.inner.listing_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.endpoint.list_dir(directory)
    }

    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        let inner = &self.endpoint.inner;
        if !inner.reachable.load(Ordering::SeqCst) {
            return Err(FetchError::Connection("connection closed by server".to_string()));
        }
        let body = read_lock(&inner.fs)
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::Protocol(format!("550 {}: no such file", path)))?;
        let fault = lock(&inner.faults).get(path).copied();
        if fault == Some(Fault::Refuse) {
            return Err(FetchError::Protocol(format!("451 {}: transfer refused", path)));
        }

        let _active = ActiveTransfer::enter(&inner.stats);
        let delay = *lock(&inner.transfer_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let limit = match fault {
            Some(Fault::DropAfter(n)) => Some(n),
            _ => None,
        };
        let mut reader = DroppingReader::new(body, limit);
        copy_stream(&mut reader, sink, STREAM_BUF_SIZE)
    }

    fn close(self: Box<Self>) -> Result<(), FetchError> {
        Ok(())
    }
}

struct ActiveTransfer<'a> {
    stats: &'a Stats,
}

impl<'a> ActiveTransfer<'a> {
    fn enter(stats: &'a Stats) -> Self {
        stats.transfers_started.fetch_add(1, Ordering::SeqCst);
        let now = stats.active_transfers.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_transfers.fetch_max(now, Ordering::SeqCst);
        Self { stats }
    }
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.stats.active_transfers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Yields the file body in small chunks; with a limit, fails with a
/// connection reset once `limit` bytes have been served.
struct DroppingReader {
    data: Arc<Vec<u8>>,
    pos: usize,
    limit: Option<usize>,
}

impl DroppingReader {
    fn new(data: Arc<Vec<u8>>, limit: Option<usize>) -> Self {
        Self { data, pos: 0, limit }
    }
}

impl Read for DroppingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(limit) = self.limit
            && self.pos >= limit
        {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "simulated connection drop",
            ));
        }
        let end = match self.limit {
            Some(limit) => limit.min(self.data.len()),
            None => self.data.len(),
        };
        if self.pos >= end {
            return Ok(0);
        }
        let n = buf.len().min(end - self.pos).min(4096);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() { "/".to_string() } else { join_remote("", trimmed) }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
