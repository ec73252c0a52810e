//! Bounded pool of dialed transport connections.
//!
//! Admission is gated by [`Turns`]: a caller holds one turn from the moment
//! `get` starts until the connection comes back through `put` or `remove`.
//! The tracked set, the idle list and the size counters live behind a single
//! lock that is never held across an await; statistics are lock-free.
//! Background work (reaper, min-idle filler, dial probe) goes through the
//! same locked helpers as the foreground calls.
//!
//! Handing a connection back (`put`, `remove`, `close_conn`) is synchronous,
//! so it cannot be abandoned halfway through by a dropped future.

mod conn;
mod dial;
mod filler;
#[cfg(feature = "metrics")]
pub mod metrics;
mod options;
mod reaper;
mod stats;
mod turn;

pub use conn::{Conn, ConnInfo, Transport};
pub use options::{Dialer, OnClose, PoolOptions, PopOrder};
pub use stats::PoolStats;

use crate::utils::error::{PoolError, Result};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use stats::StatsCounters;
use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use turn::{HeldTurn, Turns};

/// Handle to a connection pool. Clones share the same pool.
pub struct ConnPool<T: Transport> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T: Transport> {
    opts: PoolOptions<T>,
    turns: Turns,
    conns: Mutex<ConnSet<T>>,
    stats: StatsCounters,
    /// Consecutive dial failures; at `pool_size` dialing fails fast.
    dial_errors: AtomicUsize,
    last_dial_error: ArcSwapOption<io::Error>,
    probing: AtomicBool,
    closed: AtomicBool,
    /// Fires on close; stops the reaper, the probe and in-flight filler dials.
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

/// Everything guarded by the pool lock.
struct ConnSet<T> {
    /// Every connection the pool knows about, idle or checked out.
    tracked: HashMap<u64, Arc<ConnInfo>>,
    idle: VecDeque<Conn<T>>,
    /// Pooled connections, including filler dials still in flight.
    pool_size: usize,
    /// Idle connections, including filler dials still in flight.
    idle_len: usize,
}

impl<T> Default for ConnSet<T> {
    fn default() -> Self {
        Self {
            tracked: HashMap::new(),
            idle: VecDeque::new(),
            pool_size: 0,
            idle_len: 0,
        }
    }
}

impl<T: Transport> ConnPool<T> {
    /// Create a pool and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime: the reaper and the initial
    /// min-idle dials are spawned immediately.
    pub fn new(opts: PoolOptions<T>) -> Self {
        debug!("Creating connection pool: {:?}", opts);

        let reap_period = opts.reap_period();
        let inner = Arc::new(PoolInner {
            turns: Turns::new(opts.pool_size),
            opts,
            conns: Mutex::new(ConnSet::default()),
            stats: StatsCounters::default(),
            dial_errors: AtomicUsize::new(0),
            last_dial_error: ArcSwapOption::empty(),
            probing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        });

        inner.check_min_idle_conns(&mut inner.conns.lock());

        if let Some(period) = reap_period {
            inner.spawn_reaper(period);
        }

        Self { inner }
    }

    /// Dial a connection that is tracked but does not count against the
    /// pool capacity. Release it with [`ConnPool::close_conn`].
    pub async fn new_conn(&self, cancel: &CancellationToken) -> Result<Conn<T>> {
        self.inner.new_conn(cancel, false).await
    }

    /// Stop tracking `conn` and close it. Does not give back a turn.
    pub fn close_conn(&self, conn: Conn<T>) -> Result<()> {
        self.inner.close_conn(conn)
    }

    /// Check out a connection, waiting up to `pool_timeout` for capacity.
    ///
    /// Dropping the returned future before it resolves gives back everything
    /// it had taken.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<Conn<T>> {
        self.inner.get(cancel).await
    }

    /// Return a connection to the idle list.
    pub fn put(&self, conn: Conn<T>) -> Result<()> {
        self.inner.put(conn)
    }

    /// Discard a checked-out connection, e.g. after a protocol error.
    pub fn remove(
        &self,
        conn: Conn<T>,
        reason: Option<&(dyn StdError + Send + Sync + 'static)>,
    ) -> Result<()> {
        self.inner.remove(conn, reason)
    }

    /// Number of tracked connections, checked out or idle.
    pub fn len(&self) -> usize {
        self.inner.conns.lock().tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_len(&self) -> usize {
        self.inner.conns.lock().idle_len
    }

    pub fn stats(&self) -> PoolStats {
        let set = self.inner.conns.lock();
        self.inner.stats.snapshot(set.tracked.len(), set.idle_len)
    }

    /// Run one reaper sweep now and return how many connections it evicted.
    pub async fn reap_stale_conns(&self) -> Result<usize> {
        self.inner.reap_stale_conns().await
    }

    /// Close idle connections matching `predicate` now, and checked-out
    /// matches when their holder hands them back.
    ///
    /// Returns the number closed immediately.
    pub fn filter<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&ConnInfo) -> bool,
    {
        self.inner.filter(predicate)
    }

    /// Shut the pool down. Idle connections are closed here; connections
    /// still checked out are closed when they are returned.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Most recent dialer error, if any dial has failed.
    pub fn last_dial_error(&self) -> Option<Arc<io::Error>> {
        self.inner.last_dial_error.load_full()
    }
}

impl<T: Transport> Clone for ConnPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for ConnPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("opts", &self.inner.opts)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl<T: Transport> PoolInner<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_stale(&self, conn: &Conn<T>, now: Instant) -> bool {
        if let Some(idle_timeout) = self.opts.idle_timeout.filter(|d| !d.is_zero()) {
            if now.saturating_duration_since(conn.used_at()) >= idle_timeout {
                return true;
            }
        }
        if let Some(max_age) = self.opts.max_conn_age.filter(|d| !d.is_zero()) {
            if now.saturating_duration_since(conn.created_at()) >= max_age {
                return true;
            }
        }
        false
    }

    async fn get(self: &Arc<Self>, cancel: &CancellationToken) -> Result<Conn<T>> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        if let Err(err) = self.turns.acquire(self.opts.pool_timeout, cancel).await {
            if matches!(err, PoolError::Timeout) {
                self.stats.record_timeout();
            }
            return Err(err);
        }
        let turn = HeldTurn::new(&self.turns);

        // No await between popping a connection and either returning or
        // closing it.
        loop {
            let popped = {
                let mut set = self.conns.lock();
                if self.is_closed() {
                    return Err(PoolError::Closed);
                }
                self.pop_idle(&mut set)
            };

            let Some(conn) = popped else {
                break;
            };

            if self.opts.checks_staleness() && self.is_stale(&conn, Instant::now()) {
                trace!("Discarding stale connection {}", conn.id());
                self.stats.record_stale(1);
                if let Err(err) = self.close_conn(conn) {
                    debug!("Failed to close stale connection: {}", err);
                }
                continue;
            }

            self.stats.record_hit();
            turn.keep();
            return Ok(conn);
        }

        self.stats.record_miss();
        let conn = self.new_conn(cancel, true).await?;
        turn.keep();
        Ok(conn)
    }

    fn pop_idle(self: &Arc<Self>, set: &mut ConnSet<T>) -> Option<Conn<T>> {
        let conn = match self.opts.pop_order {
            PopOrder::Lifo => set.idle.pop_back(),
            PopOrder::Fifo => set.idle.pop_front(),
        }?;
        set.idle_len -= 1;
        self.check_min_idle_conns(set);
        Some(conn)
    }

    async fn new_conn(self: &Arc<Self>, cancel: &CancellationToken, pooled: bool) -> Result<Conn<T>> {
        let transport = self.dial(cancel).await?;
        let created_at = Instant::now();

        let mut set = self.conns.lock();
        if self.is_closed() {
            drop(set);
            let _ = transport.close();
            return Err(PoolError::Closed);
        }

        // A full pool means a filler dial took the last slot; the caller still
        // gets this connection, and it is dropped on return.
        let pooled = pooled && set.pool_size < self.opts.pool_size;
        if pooled {
            set.pool_size += 1;
        }

        let info = Arc::new(ConnInfo::new(self.next_conn_id(), created_at, pooled));
        set.tracked.insert(info.id(), Arc::clone(&info));
        trace!("Dialed connection {} (pooled: {})", info.id(), pooled);

        Ok(Conn::new(info, transport))
    }

    fn put(self: &Arc<Self>, mut conn: Conn<T>) -> Result<()> {
        if conn.has_unread_data() {
            warn!("Connection {} has unread data, discarding", conn.id());
            return self.remove(conn, None);
        }

        if !conn.is_pooled() || conn.info().is_doomed() {
            return self.remove(conn, None);
        }

        let mut set = self.conns.lock();
        if self.is_closed() {
            drop(set);
            self.turns.release();
            let _ = self.close_transport(conn);
            return Err(PoolError::Closed);
        }

        conn.set_used_at(Instant::now());
        trace!("Returning connection {} to idle list", conn.id());
        set.idle.push_back(conn);
        set.idle_len += 1;
        drop(set);

        self.turns.release();
        Ok(())
    }

    fn remove(
        self: &Arc<Self>,
        conn: Conn<T>,
        reason: Option<&(dyn StdError + Send + Sync + 'static)>,
    ) -> Result<()> {
        match reason {
            Some(reason) => debug!("Removing connection {}: {}", conn.id(), reason),
            None => trace!("Removing connection {}", conn.id()),
        }

        self.untrack(&mut self.conns.lock(), conn.shared_info());
        self.turns.release();

        let closed = self.close_transport(conn);
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        closed.map_err(PoolError::from)
    }

    fn close_conn(self: &Arc<Self>, conn: Conn<T>) -> Result<()> {
        self.untrack(&mut self.conns.lock(), conn.shared_info());

        let closed = self.close_transport(conn);
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        closed.map_err(PoolError::from)
    }

    /// Drop a connection from the tracked set. Pooled connections free a
    /// capacity slot, which may kick off a replacement dial.
    fn untrack(self: &Arc<Self>, set: &mut ConnSet<T>, info: &ConnInfo) {
        if set.tracked.remove(&info.id()).is_some() && info.is_pooled() {
            set.pool_size -= 1;
            self.check_min_idle_conns(set);
        }
    }

    fn close_transport(&self, conn: Conn<T>) -> io::Result<()> {
        if let Some(on_close) = &self.opts.on_close {
            on_close(&conn);
        }
        conn.close()
    }

    fn filter<F>(self: &Arc<Self>, predicate: F) -> Result<usize>
    where
        F: Fn(&ConnInfo) -> bool,
    {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let victims = {
            let mut set = self.conns.lock();
            for info in set.tracked.values() {
                if predicate(info) {
                    info.doom();
                }
            }

            let (victims, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut set.idle)
                .into_iter()
                .partition(|conn| conn.info().is_doomed());
            set.idle = kept;

            for conn in &victims {
                set.idle_len -= 1;
                self.untrack(&mut set, conn.shared_info());
            }
            victims
        };

        let closed = victims.len();
        let mut first_err = None;
        for conn in victims {
            if let Err(err) = self.close_transport(conn) {
                first_err.get_or_insert(err);
            }
        }

        debug!("Filter closed {} idle connections", closed);
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(closed),
        }
    }

    fn close(self: &Arc<Self>) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PoolError::Closed);
        }

        self.shutdown.cancel();
        self.turns.close();

        let (idle, tracked) = {
            let mut set = self.conns.lock();
            set.pool_size = 0;
            set.idle_len = 0;
            (std::mem::take(&mut set.idle), std::mem::take(&mut set.tracked))
        };

        for info in tracked.values() {
            info.doom();
        }

        let checked_out = tracked.len() - idle.len();
        let mut first_err = None;
        for conn in idle {
            if let Err(err) = self.close_transport(conn) {
                first_err.get_or_insert(err);
            }
        }

        debug!(
            "Connection pool closed ({} connections still checked out)",
            checked_out
        );

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Loopback;

    impl Transport for Loopback {
        fn close(self) -> io::Result<()> {
            Ok(())
        }
    }

    fn options() -> PoolOptions<Loopback> {
        PoolOptions::with_dialer(|_cancel| async { Ok(Loopback) })
            .idle_check_frequency(None)
            .idle_timeout(None)
    }

    /// Dialer that takes `delay` per connection.
    fn slow_options(delay: Duration) -> PoolOptions<Loopback> {
        PoolOptions::with_dialer(move |_cancel| async move {
            tokio::time::sleep(delay).await;
            Ok(Loopback)
        })
        .idle_check_frequency(None)
        .idle_timeout(None)
    }

    fn assert_nothing_leaked(pool: &ConnPool<Loopback>, tracked: usize) {
        let set = pool.inner.conns.lock();
        assert_eq!(set.tracked.len(), tracked);
        assert_eq!(set.pool_size, tracked);
        assert_eq!(set.idle_len, set.idle.len());
        drop(set);
        assert_eq!(pool.inner.turns.available(), pool.inner.opts.pool_size);
    }

    #[tokio::test]
    async fn pool_creation_with_defaults() {
        let pool = ConnPool::new(options());
        let stats = pool.stats();

        assert_eq!(stats, PoolStats::default());
        assert!(pool.is_empty());
        assert!(!pool.is_closed());
    }

    #[tokio::test]
    async fn lifo_hands_back_most_recent_connection() {
        let pool = ConnPool::new(options().pool_size(2));
        let cancel = CancellationToken::new();

        let first = pool.get(&cancel).await.unwrap();
        let second = pool.get(&cancel).await.unwrap();
        let (first_id, second_id) = (first.id(), second.id());
        pool.put(first).unwrap();
        pool.put(second).unwrap();

        let conn = pool.get(&cancel).await.unwrap();
        assert_eq!(conn.id(), second_id);
        assert_ne!(conn.id(), first_id);
    }

    #[tokio::test]
    async fn fifo_hands_back_oldest_connection() {
        let pool = ConnPool::new(options().pool_size(2).pop_order(PopOrder::Fifo));
        let cancel = CancellationToken::new();

        let first = pool.get(&cancel).await.unwrap();
        let second = pool.get(&cancel).await.unwrap();
        let first_id = first.id();
        pool.put(first).unwrap();
        pool.put(second).unwrap();

        let conn = pool.get(&cancel).await.unwrap();
        assert_eq!(conn.id(), first_id);
    }

    #[tokio::test]
    async fn staleness_checks_idle_time_and_age() {
        let pool = ConnPool::new(
            options()
                .idle_timeout(Some(Duration::from_secs(10)))
                .max_conn_age(Some(Duration::from_secs(60))),
        );
        let inner = &pool.inner;
        let cancel = CancellationToken::new();

        let conn = pool.get(&cancel).await.unwrap();
        let now = Instant::now();
        assert!(!inner.is_stale(&conn, now));
        assert!(inner.is_stale(&conn, now + Duration::from_secs(10)));

        let mut conn = conn;
        conn.set_used_at(now + Duration::from_secs(55));
        assert!(!inner.is_stale(&conn, now + Duration::from_secs(58)));
        assert!(inner.is_stale(&conn, now + Duration::from_secs(61)));

        pool.remove(conn, None).unwrap();
    }

    #[tokio::test]
    async fn unpooled_conn_does_not_consume_capacity() {
        let pool = ConnPool::new(options().pool_size(1));
        let cancel = CancellationToken::new();

        let extra = pool.new_conn(&cancel).await.unwrap();
        assert!(!extra.is_pooled());

        let pooled = pool.get(&cancel).await.unwrap();
        assert!(pooled.is_pooled());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.inner.conns.lock().pool_size, 1);

        pool.close_conn(extra).unwrap();
        pool.put(pooled).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.idle_len(), 1);
        assert_eq!(pool.inner.turns.available(), 1);
    }

    #[tokio::test]
    async fn get_timed_out_mid_dial_leaves_no_trace() {
        let pool = ConnPool::new(slow_options(Duration::from_millis(200)).pool_size(1));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), pool.get(&CancellationToken::new()))
                .await;
        assert!(abandoned.is_err());
        assert_nothing_leaked(&pool, 0);
    }

    #[tokio::test]
    async fn aborted_get_past_a_stale_connection_leaves_no_trace() {
        let pool = ConnPool::new(
            slow_options(Duration::from_millis(200))
                .pool_size(1)
                .pool_timeout(Duration::ZERO)
                .idle_timeout(Some(Duration::from_millis(5))),
        );
        let cancel = CancellationToken::new();

        // Seed one idle connection, then let it go stale.
        let seeded = pool.get(&cancel).await.unwrap();
        pool.put(seeded).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The get discards the stale connection and starts a slow dial,
        // which is where it gets aborted.
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(pool.stats().stale_conns, 1);
        assert_nothing_leaked(&pool, 0);

        let conn = pool.get(&cancel).await.unwrap();
        assert!(conn.is_pooled());
        pool.put(conn).unwrap();
        assert_nothing_leaked(&pool, 1);
    }

    #[tokio::test]
    async fn release_paths_complete_while_other_tasks_use_the_pool() {
        let pool = ConnPool::new(options().pool_size(2).pool_timeout(Duration::ZERO));
        let cancel = CancellationToken::new();

        let a = pool.get(&cancel).await.unwrap();
        let b = pool.get(&cancel).await.unwrap();

        // A getter blocked on admission must not stall the returns.
        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::timeout(Duration::from_millis(20), pool.get(&CancellationToken::new()))
                    .await
            })
        };
        pool.put(a).unwrap();
        pool.remove(b, None).unwrap();

        if let Ok(Ok(conn)) = blocked.await.unwrap() {
            pool.put(conn).unwrap();
        }
        assert_nothing_leaked(&pool, 1);

        let conn = pool.get(&cancel).await.unwrap();
        assert!(conn.is_pooled());
        pool.put(conn).unwrap();
    }
}
