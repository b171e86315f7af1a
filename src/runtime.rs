use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::pool::ConnectionPool;
use crate::remote::Endpoint;

/// Something the runtime must stop when the run ends (an embedded server,
/// a test harness).
pub trait Teardown: Send {
    fn name(&self) -> String;
    fn teardown(&mut self) -> anyhow::Result<()>;
}

/// Cooperative cancellation flag shared between the coordinator and workers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::info!("[runtime] cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Owns every resource a fetch run needs: the shared connection pool, the
/// cancellation token and any harnesses. Released exactly once, either via
/// [`FetchRuntime::shutdown`] or on drop.
pub struct FetchRuntime {
    pool: Arc<ConnectionPool>,
    cancel: CancelToken,
    harnesses: Vec<Box<dyn Teardown>>,
    released: bool,
}

impl FetchRuntime {
    /// Build a runtime whose pool keeps up to `max_idle` connections.
    pub fn new(endpoint: Arc<dyn Endpoint>, max_idle: usize) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(endpoint, max_idle)),
            cancel: CancelToken::new(),
            harnesses: Vec::new(),
            released: false,
        }
    }

    /// Hand a harness to the runtime; it is torn down after the pool.
    pub fn with_harness(mut self, harness: Box<dyn Teardown>) -> Self {
        self.harnesses.push(harness);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.pool.endpoint().clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the pool and every harness. Idempotent; failures are logged.
    /// Returns `true` when this call performed the release.
    pub fn shutdown(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let closed = self.pool.shutdown();
        tracing::debug!("[runtime] pool released ({} idle connections closed)", closed);
        for h in self.harnesses.iter_mut() {
            match h.teardown() {
                Ok(()) => tracing::debug!("[runtime] stopped {}", h.name()),
                Err(e) => tracing::warn!("[runtime] stopping {} failed: {:#}", h.name(), e),
            }
        }
        true
    }
}

impl Drop for FetchRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryEndpoint;
    use std::sync::atomic::AtomicUsize;

    struct CountingHarness {
        stops: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Teardown for CountingHarness {
        fn name(&self) -> String {
            "counting".to_string()
        }

        fn teardown(&mut self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail { anyhow::bail!("refused to stop") } else { Ok(()) }
        }
    }

    #[test]
    fn shutdown_is_idempotent_and_drop_does_not_repeat_it() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut rt = FetchRuntime::new(Arc::new(MemoryEndpoint::new()), 2)
            .with_harness(Box::new(CountingHarness { stops: stops.clone(), fail: false }));
        assert!(rt.shutdown());
        assert!(!rt.shutdown());
        drop(rt);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_when_never_shut_down() {
        let stops = Arc::new(AtomicUsize::new(0));
        let rt = FetchRuntime::new(Arc::new(MemoryEndpoint::new()), 2)
            .with_harness(Box::new(CountingHarness { stops: stops.clone(), fail: true }));
        let pool = rt.pool().clone();
        drop(rt);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(pool.is_shut_down());
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let t = CancelToken::new();
        let c = t.clone();
        assert!(!c.is_cancelled());
        t.cancel();
        assert!(c.is_cancelled());
    }
}
