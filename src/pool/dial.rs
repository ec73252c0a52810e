use super::{PoolInner, Transport};
use crate::utils::error::{PoolError, Result};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[cfg(feature = "metrics")]
use crate::pool::metrics::PoolMetrics;

impl<T: Transport> PoolInner<T> {
    /// Consecutive failures after which dialing fails fast.
    fn dial_error_threshold(&self) -> usize {
        self.opts.pool_size.max(1)
    }

    fn cached_dial_error(&self) -> PoolError {
        let err = self.last_dial_error.load_full().unwrap_or_else(|| {
            Arc::new(io::Error::other("dialing suspended after repeated failures"))
        });
        PoolError::Dial(err)
    }

    /// Run the dialer once, or return the cached error while the endpoint is
    /// known to be failing.
    pub(super) async fn dial(self: &Arc<Self>, cancel: &CancellationToken) -> Result<T> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        if self.dial_errors.load(Ordering::Acquire) >= self.dial_error_threshold() {
            trace!("Dialing suspended, returning cached error");
            #[cfg(feature = "metrics")]
            PoolMetrics::record_fast_fail();
            return Err(self.cached_dial_error());
        }

        let attempt = (self.opts.dialer)(cancel.clone());
        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            dialed = attempt => dialed,
        };

        match dialed {
            Ok(transport) => {
                self.dial_errors.store(0, Ordering::Release);
                #[cfg(feature = "metrics")]
                PoolMetrics::record_dial(true);
                Ok(transport)
            }
            Err(err) => {
                #[cfg(feature = "metrics")]
                PoolMetrics::record_dial(false);

                let err = Arc::new(err);
                self.last_dial_error.store(Some(Arc::clone(&err)));
                let failures = self.dial_errors.fetch_add(1, Ordering::AcqRel) + 1;
                debug!("Dial failed ({} in a row): {}", failures, err);

                if failures == self.dial_error_threshold() {
                    warn!(
                        "{} consecutive dial failures, failing fast until a probe succeeds: {}",
                        failures, err
                    );
                    self.spawn_dial_probe();
                }
                Err(PoolError::Dial(err))
            }
        }
    }

    /// Retry the dialer in the background until it works again, then reopen
    /// dialing. Only one probe runs at a time; `probing` is cleared on every
    /// way out of the probe.
    fn spawn_dial_probe(self: &Arc<Self>) {
        if self.probing.swap(true, Ordering::AcqRel) {
            return;
        }

        let pool = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.opts.dial_retry_interval;

        tokio::spawn(async move {
            let recovered = Self::probe_until_recovered(&pool, &shutdown, interval).await;
            if !recovered {
                if let Some(inner) = pool.upgrade() {
                    inner.probing.store(false, Ordering::Release);
                }
                trace!("Dial probe stopped");
            }
        });
    }

    /// Returns true once a probe dial succeeded; `probing` is already clear
    /// by then so a later trip can start a new probe.
    async fn probe_until_recovered(
        pool: &Weak<Self>,
        shutdown: &CancellationToken,
        interval: Duration,
    ) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = sleep(interval) => {}
            }

            let attempt = {
                let Some(inner) = pool.upgrade() else {
                    return false;
                };
                if inner.is_closed() {
                    return false;
                }
                (inner.opts.dialer)(shutdown.child_token())
            };

            let result = tokio::select! {
                _ = shutdown.cancelled() => return false,
                result = attempt => result,
            };

            let Some(inner) = pool.upgrade() else {
                return false;
            };

            match result {
                Ok(transport) => {
                    // Clear the flag before reopening dialing, so a trip right
                    // after the reset can spawn its own probe.
                    inner.probing.store(false, Ordering::Release);
                    inner.dial_errors.store(0, Ordering::Release);
                    debug!("Dial probe succeeded, dialing resumed");
                    if let Err(err) = transport.close() {
                        trace!("Failed to close probe connection: {}", err);
                    }
                    return true;
                }
                Err(err) => {
                    trace!("Dial probe failed: {}", err);
                    inner.last_dial_error.store(Some(Arc::new(err)));
                }
            }
        }
    }
}
