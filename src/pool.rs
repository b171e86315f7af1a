use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::FetchError;
use crate::remote::{Endpoint, RemoteSession};

/// Control connections shared by all transfer workers.
///
/// Connections are opened lazily and kept idle between transfers. A checked
/// out connection belongs to exactly one worker until its guard is dropped,
/// at which point it goes back to the idle list (or is closed, if the pool
/// has been shut down or the guard was discarded).
pub struct ConnectionPool {
    endpoint: Arc<dyn Endpoint>,
    idle: Mutex<Vec<Box<dyn RemoteSession>>>,
    max_idle: usize,
    closed: AtomicBool,
    opened: AtomicUsize,
    discarded: AtomicUsize,
}

impl ConnectionPool {
    /// Create a pool keeping at most `max_idle` idle connections. A value of 0
    /// falls back to 1.
    pub fn new(endpoint: Arc<dyn Endpoint>, max_idle: usize) -> Self {
        Self {
            endpoint,
            idle: Mutex::new(Vec::new()),
            max_idle: max_idle.max(1),
            closed: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// Check out an idle connection or open a new one.
    pub fn acquire(&self) -> Result<PooledSession<'_>, FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::Connection("connection pool is shut down".to_string()));
        }
        if let Some(session) = self.lock_idle().pop() {
            return Ok(PooledSession::new(self, session, false));
        }
        let session = self.endpoint.open()?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(PooledSession::new(self, session, true))
    }

    /// Number of connections opened over the pool's lifetime.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of connections dropped after a failed transfer.
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every idle connection and refuse further checkouts. Returns the
    /// number of connections closed; only the first call does any work.
    /// Close failures are logged, not returned.
    pub fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let sessions: Vec<Box<dyn RemoteSession>> = self.lock_idle().drain(..).collect();
        let count = sessions.len();
        for s in sessions {
            if let Err(e) = s.close() {
                tracing::warn!("[pool] closing {} failed: {}", self.endpoint.describe(), e);
            }
        }
        tracing::debug!("[pool] shut down, closed {} idle connections", count);
        count
    }

    fn release(&self, session: Box<dyn RemoteSession>) {
        if self.closed.load(Ordering::SeqCst) {
            close_quietly(session);
            return;
        }
        let mut idle = self.lock_idle();
        if idle.len() < self.max_idle {
            idle.push(session);
        } else {
            drop(idle);
            close_quietly(session);
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<Box<dyn RemoteSession>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn close_quietly(session: Box<dyn RemoteSession>) {
    if let Err(e) = session.close() {
        tracing::debug!("[pool] close failed: {}", e);
    }
}

/// Guard returned by [`ConnectionPool::acquire`]. Dropping it returns the
/// connection to the pool.
pub struct PooledSession<'a> {
    pool: &'a ConnectionPool,
    session: Option<Box<dyn RemoteSession>>,
    fresh: bool,
}

impl<'a> PooledSession<'a> {
    fn new(pool: &'a ConnectionPool, session: Box<dyn RemoteSession>, fresh: bool) -> Self {
        Self { pool, session: Some(session), fresh }
    }

    pub fn session(&mut self) -> Result<&mut dyn RemoteSession, FetchError> {
        match self.session.as_mut() {
            Some(s) => Ok(s.as_mut()),
            None => Err(FetchError::Connection("connection already discarded".to_string())),
        }
    }

    /// Whether the guard had to open a new connection when acquired.
    pub fn was_fresh(&self) -> bool {
        self.fresh
    }

    /// Drop the connection instead of returning it; used after a failed
    /// transfer, when the control channel state is unknown.
    pub fn discard(mut self) {
        if let Some(s) = self.session.take() {
            self.pool.discarded.fetch_add(1, Ordering::SeqCst);
            close_quietly(s);
        }
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(s) = self.session.take() {
            self.pool.release(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryEndpoint;

    fn pool_with(ep: &MemoryEndpoint, max_idle: usize) -> ConnectionPool {
        ConnectionPool::new(Arc::new(ep.clone()), max_idle)
    }

    #[test]
    fn reuses_released_connections() {
        let ep = MemoryEndpoint::new();
        let pool = pool_with(&ep, 2);
        {
            let guard = pool.acquire().expect("acquire");
            assert!(guard.was_fresh());
        }
        assert_eq!(pool.idle_count(), 1);
        let guard = pool.acquire().expect("acquire");
        assert!(!guard.was_fresh());
        assert_eq!(ep.sessions_opened(), 1);
    }

    #[test]
    fn discarded_connections_are_not_reused() {
        let ep = MemoryEndpoint::new();
        let pool = pool_with(&ep, 2);
        pool.acquire().expect("acquire").discard();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.discarded(), 1);
        assert!(pool.acquire().expect("acquire").was_fresh());
    }

    #[test]
    fn shutdown_runs_once_and_refuses_checkouts() {
        let ep = MemoryEndpoint::new();
        let pool = pool_with(&ep, 4);
        let a = pool.acquire().expect("a");
        let b = pool.acquire().expect("b");
        drop(a);
        drop(b);
        assert_eq!(pool.shutdown(), 2);
        assert_eq!(pool.shutdown(), 0);
        assert!(matches!(pool.acquire(), Err(FetchError::Connection(_))));
    }

    #[test]
    fn unreachable_endpoint_surfaces_connection_error() {
        let ep = MemoryEndpoint::new();
        ep.set_reachable(false);
        let pool = pool_with(&ep, 1);
        assert!(matches!(pool.acquire(), Err(FetchError::Connection(_))));
        assert_eq!(pool.opened(), 0);
    }
}
