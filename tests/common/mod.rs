//! In-memory transport and dialer shared by the pool integration tests.

#![allow(dead_code)]

use connpool::{PoolOptions, Transport};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct MockConn {
    pub serial: usize,
    unread: usize,
    closes: Arc<AtomicUsize>,
}

impl MockConn {
    /// Pretend a reply arrived that nobody read.
    pub fn leave_unread(&mut self, bytes: usize) {
        self.unread = bytes;
    }
}

impl Transport for MockConn {
    fn buffered(&self) -> usize {
        self.unread
    }

    fn close(self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Dialer with switchable failure and call accounting.
#[derive(Debug, Default)]
pub struct MockDialer {
    dials: AtomicUsize,
    opened: AtomicUsize,
    closes: Arc<AtomicUsize>,
    failing: AtomicBool,
    delay_ms: AtomicUsize,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let dialer = Self::new();
        dialer.set_failing(true);
        dialer
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Dials that produced a connection.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    async fn dial(self: Arc<Self>, cancel: CancellationToken) -> io::Result<MockConn> {
        let serial = self.dials.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "dial cancelled"));
                }
                _ = tokio::time::sleep(Duration::from_millis(delay as u64)) => {}
            }
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConn {
            serial,
            unread: 0,
            closes: Arc::clone(&self.closes),
        })
    }
}

/// Options with background reaping and idle expiry disabled, so each test
/// opts into exactly the behavior it exercises.
pub fn options(dialer: &Arc<MockDialer>) -> PoolOptions<MockConn> {
    let dialer = Arc::clone(dialer);
    PoolOptions::with_dialer(move |cancel| Arc::clone(&dialer).dial(cancel))
        .pool_size(10)
        .pool_timeout(Duration::from_secs(5))
        .idle_timeout(None)
        .idle_check_frequency(None)
        .dial_retry_interval(Duration::from_millis(100))
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
