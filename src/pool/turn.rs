use crate::utils::error::{PoolError, Result};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Admission control: one turn per connection that is being dialed or is
/// checked out.
///
/// Turns are plain counts, not RAII permits. Every successful acquire must be
/// paired with exactly one [`Turns::release`], which usually happens in a
/// different call than the acquire (`get` takes, `put`/`remove` gives back).
#[derive(Debug)]
pub(crate) struct Turns {
    semaphore: Semaphore,
}

impl Turns {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Take a turn, waiting at most `wait`. A zero `wait` fails with
    /// [`PoolError::Timeout`] as soon as the pool is saturated.
    pub(crate) async fn acquire(&self, wait: Duration, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        if self.try_acquire() {
            return Ok(());
        }

        if wait.is_zero() {
            return Err(PoolError::Timeout);
        }

        trace!("No free turn, waiting up to {:?}", wait);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            acquired = timeout(wait, self.semaphore.acquire()) => match acquired {
                Ok(Ok(permit)) => {
                    permit.forget();
                    Ok(())
                }
                Ok(Err(_)) => Err(PoolError::Closed),
                Err(_) => Err(PoolError::Timeout),
            },
        }
    }

    /// Take a turn with no deadline. Used by background maintenance, which
    /// only gives up when `cancel` fires.
    pub(crate) async fn acquire_until(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Closed),
            acquired = self.semaphore.acquire() => match acquired {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(PoolError::Closed),
            },
        }
    }

    pub(crate) fn release(&self) {
        self.semaphore.add_permits(1);
    }

    /// Wake every waiter with [`PoolError::Closed`].
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A turn taken by the current call. Dropping it gives the turn back, so a
/// `get` that errors or is dropped mid-flight never leaks capacity.
#[derive(Debug)]
pub(crate) struct HeldTurn<'a> {
    turns: &'a Turns,
    armed: bool,
}

impl<'a> HeldTurn<'a> {
    pub(crate) fn new(turns: &'a Turns) -> Self {
        Self { turns, armed: true }
    }

    /// Hand the turn over to a checked-out connection; it comes back through
    /// `put` or `remove`.
    pub(crate) fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for HeldTurn<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.turns.release();
        }
    }
}
