use super::{Conn, ConnInfo, ConnSet, PoolInner, Transport};
use crate::utils::error::{PoolError, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

impl<T: Transport> PoolInner<T> {
    /// Reserve capacity for missing idle connections and dial each one in its
    /// own task. Called with the pool lock held.
    pub(super) fn check_min_idle_conns(self: &Arc<Self>, set: &mut ConnSet<T>) {
        if self.opts.min_idle_conns == 0 || self.is_closed() {
            return;
        }

        while set.pool_size < self.opts.pool_size && set.idle_len < self.opts.min_idle_conns {
            set.pool_size += 1;
            set.idle_len += 1;

            let pool = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = pool.add_idle_conn().await {
                    trace!("Min-idle dial abandoned: {}", err);
                }
            });
        }
    }

    /// Dial one connection into the idle list, filling a slot reserved by
    /// [`PoolInner::check_min_idle_conns`]. On failure the reservation is
    /// rolled back.
    async fn add_idle_conn(self: Arc<Self>) -> Result<()> {
        let cancel = self.shutdown.child_token();
        let dialed = self.dial(&cancel).await;

        let mut set = self.conns.lock();
        if self.is_closed() {
            // Counters were reset by close; nothing to roll back.
            drop(set);
            if let Ok(transport) = dialed {
                let _ = transport.close();
            }
            return Err(PoolError::Closed);
        }

        match dialed {
            Ok(transport) => {
                let info = Arc::new(ConnInfo::new(self.next_conn_id(), Instant::now(), true));
                set.tracked.insert(info.id(), Arc::clone(&info));
                trace!("Min-idle dial added connection {}", info.id());
                set.idle.push_back(Conn::new(info, transport));
                Ok(())
            }
            Err(err) => {
                set.pool_size -= 1;
                set.idle_len -= 1;
                debug!("Min-idle dial failed: {}", err);
                Err(err)
            }
        }
    }
}
