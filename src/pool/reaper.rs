use super::{Conn, ConnSet, PoolInner, Transport};
use crate::utils::error::{PoolError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::turn::HeldTurn;

impl<T: Transport> PoolInner<T> {
    /// Start the periodic stale sweep. The task holds only a weak reference,
    /// so it also ends once every pool handle is dropped.
    pub(super) fn spawn_reaper(self: &Arc<Self>, period: Duration) {
        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(inner) = pool.upgrade() else {
                    break;
                };

                match inner.reap_stale_conns().await {
                    Ok(0) => {}
                    Ok(reaped) => debug!("Reaper removed {} stale connections", reaped),
                    Err(PoolError::Closed) => break,
                    Err(err) => warn!("Reaper sweep failed: {}", err),
                }
            }

            trace!("Reaper stopped");
        });
    }

    /// Evict stale connections from the head of the idle list until the head
    /// is fresh. Each inspection runs under its own admission turn.
    pub(super) async fn reap_stale_conns(self: &Arc<Self>) -> Result<usize> {
        let mut reaped = 0;

        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }

            self.turns.acquire_until(&self.shutdown).await?;
            let turn = HeldTurn::new(&self.turns);

            let stale = {
                let mut set = self.conns.lock();
                self.reap_stale_conn(&mut set)
            };
            drop(turn);

            let Some(conn) = stale else {
                break;
            };

            trace!("Reaping stale connection {}", conn.id());
            self.stats.record_stale(1);
            reaped += 1;
            if let Err(err) = self.close_transport(conn) {
                debug!("Failed to close stale connection: {}", err);
            }
        }

        Ok(reaped)
    }

    fn reap_stale_conn(self: &Arc<Self>, set: &mut ConnSet<T>) -> Option<Conn<T>> {
        let head = set.idle.front()?;
        if !self.is_stale(head, Instant::now()) {
            return None;
        }

        let conn = set.idle.pop_front()?;
        set.idle_len -= 1;
        self.untrack(set, conn.shared_info());
        Some(conn)
    }
}
