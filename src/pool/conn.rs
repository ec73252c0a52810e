use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::BufReader;
use tokio::net::TcpStream;

/// A raw transport the pool can hand out.
///
/// Closing consumes the transport, so a closed connection can never be
/// written to again.
pub trait Transport: Send + 'static {
    /// Number of bytes already read off the wire but not consumed by the
    /// protocol layer. A non-zero value on return means the stream is out of
    /// sync and must not be reused.
    fn buffered(&self) -> usize {
        0
    }

    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}

impl Transport for TcpStream {
    fn close(self) -> io::Result<()> {
        // Dropping the stream closes the socket; nothing left to flush here.
        drop(self);
        Ok(())
    }
}

impl<S> Transport for BufReader<S>
where
    S: Transport + tokio::io::AsyncRead,
{
    fn buffered(&self) -> usize {
        self.buffer().len() + self.get_ref().buffered()
    }

    fn close(self) -> io::Result<()> {
        self.into_inner().close()
    }
}

/// Bookkeeping shared between a connection and the pool's tracked set.
#[derive(Debug)]
pub struct ConnInfo {
    id: u64,
    created_at: Instant,
    pooled: bool,
    /// Set when the pool wants the connection gone on its next return.
    doomed: AtomicBool,
}

impl ConnInfo {
    pub(crate) fn new(id: u64, created_at: Instant, pooled: bool) -> Self {
        Self {
            id,
            created_at,
            pooled,
            doomed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether this connection counts against the pool capacity.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub(crate) fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    pub(crate) fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }
}

/// One dialed transport plus the metadata the pool needs to manage it.
///
/// A `Conn` is owned by exactly one party at a time: the pool while idle, or
/// the caller that checked it out. Hand it back with
/// [`ConnPool::put`](crate::pool::ConnPool::put) or
/// [`ConnPool::remove`](crate::pool::ConnPool::remove).
pub struct Conn<T> {
    info: Arc<ConnInfo>,
    transport: T,
    used_at: Instant,
}

impl<T: Transport> Conn<T> {
    pub(crate) fn new(info: Arc<ConnInfo>, transport: T) -> Self {
        let used_at = info.created_at();
        Self {
            info,
            transport,
            used_at,
        }
    }

    pub fn id(&self) -> u64 {
        self.info.id()
    }

    pub fn created_at(&self) -> Instant {
        self.info.created_at()
    }

    pub fn used_at(&self) -> Instant {
        self.used_at
    }

    pub fn is_pooled(&self) -> bool {
        self.info.is_pooled()
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub(crate) fn shared_info(&self) -> &Arc<ConnInfo> {
        &self.info
    }

    pub(crate) fn set_used_at(&mut self, at: Instant) {
        self.used_at = at;
    }

    pub(crate) fn has_unread_data(&self) -> bool {
        self.transport.buffered() > 0
    }

    pub(crate) fn close(self) -> io::Result<()> {
        self.transport.close()
    }
}

impl<T> Deref for Conn<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.transport
    }
}

impl<T> DerefMut for Conn<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T> fmt::Debug for Conn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.info.id)
            .field("pooled", &self.info.pooled)
            .field("created_at", &self.info.created_at)
            .field("used_at", &self.used_at)
            .finish()
    }
}
