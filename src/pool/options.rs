use crate::pool::conn::{Conn, Transport};
use futures::future::BoxFuture;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Produces one raw transport. The token fires when the caller (or the pool,
/// for background dials) gives up on the attempt.
pub type Dialer<T> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, io::Result<T>> + Send + Sync>;

/// Invoked right before the pool closes a connection's transport.
pub type OnClose<T> = Arc<dyn Fn(&Conn<T>) + Send + Sync>;

/// Which end of the idle list `get` takes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PopOrder {
    /// Most recently returned first; keeps a small hot set warm.
    #[default]
    Lifo,
    /// Least recently returned first; spreads load across all idle conns.
    Fifo,
}

/// Pool configuration.
pub struct PoolOptions<T> {
    pub dialer: Dialer<T>,
    pub on_close: Option<OnClose<T>>,
    pub pop_order: PopOrder,
    /// Maximum number of pooled connections (admission capacity).
    pub pool_size: usize,
    /// Floor of idle connections kept dialed in the background.
    pub min_idle_conns: usize,
    pub max_conn_age: Option<Duration>,
    /// How long `get` waits for an admission slot.
    pub pool_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    /// Reaper period; `None` or zero disables reaping.
    pub idle_check_frequency: Option<Duration>,
    /// Period of the background probe once dialing is failing fast.
    pub dial_retry_interval: Duration,
}

impl<T: Transport> PoolOptions<T> {
    pub fn new(dialer: Dialer<T>) -> Self {
        Self {
            dialer,
            on_close: None,
            pop_order: PopOrder::default(),
            pool_size: 10,
            min_idle_conns: 0,
            max_conn_age: None,
            pool_timeout: Duration::from_secs(4),
            idle_timeout: Some(Duration::from_secs(300)),
            idle_check_frequency: Some(Duration::from_secs(60)),
            dial_retry_interval: Duration::from_secs(1),
        }
    }

    /// Build options from an async closure.
    pub fn with_dialer<F, Fut>(dial: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = io::Result<T>> + Send + 'static,
    {
        Self::new(Arc::new(move |cancel| Box::pin(dial(cancel))))
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Conn<T>) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn pop_order(mut self, order: PopOrder) -> Self {
        self.pop_order = order;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn min_idle_conns(mut self, n: usize) -> Self {
        self.min_idle_conns = n;
        self
    }

    pub fn max_conn_age(mut self, age: Option<Duration>) -> Self {
        self.max_conn_age = age;
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn idle_check_frequency(mut self, frequency: Option<Duration>) -> Self {
        self.idle_check_frequency = frequency;
        self
    }

    pub fn dial_retry_interval(mut self, interval: Duration) -> Self {
        self.dial_retry_interval = interval;
        self
    }

    pub(crate) fn reap_period(&self) -> Option<Duration> {
        self.idle_check_frequency.filter(|period| !period.is_zero())
    }

    pub(crate) fn checks_staleness(&self) -> bool {
        self.idle_timeout.is_some_and(|d| !d.is_zero())
            || self.max_conn_age.is_some_and(|d| !d.is_zero())
    }
}

impl<T> fmt::Debug for PoolOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("pop_order", &self.pop_order)
            .field("pool_size", &self.pool_size)
            .field("min_idle_conns", &self.min_idle_conns)
            .field("max_conn_age", &self.max_conn_age)
            .field("pool_timeout", &self.pool_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("idle_check_frequency", &self.idle_check_frequency)
            .field("dial_retry_interval", &self.dial_retry_interval)
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}
