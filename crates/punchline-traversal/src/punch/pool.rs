//! Bounded pool of punch slots.
//!
//! `tokio::sync::Semaphore` hands out permits in FIFO order, so sessions
//! beyond `max_punchers` queue in arrival order until a slot frees.

use crate::error::{Result, TraversalError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Default slot count: one per CPU.
#[must_use]
pub fn default_max_punchers() -> usize {
    num_cpus::get().max(1)
}

/// Shared pool of punch slots
#[derive(Debug, Clone)]
pub struct PunchPool {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    max: usize,
}

/// A held slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct PunchSlot {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for PunchSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PunchPool {
    /// Pool with `max` slots (at least one).
    #[must_use]
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Wait for a slot.
    ///
    /// # Errors
    ///
    /// `Protocol` once the pool has been closed.
    pub async fn acquire(&self) -> Result<PunchSlot> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| TraversalError::Protocol("punch pool closed".into()))?;
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Punch slot taken ({}/{})", active, self.max);
        Ok(PunchSlot {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Slots in use
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Slot count
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Fraction of slots in use, `0.0..=1.0`.
    #[must_use]
    pub fn saturation(&self) -> f64 {
        (self.active() as f64 / self.max as f64).min(1.0)
    }

    /// Refuse further acquisitions and wake queued waiters.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for PunchPool {
    fn default() -> Self {
        Self::new(default_max_punchers())
    }
}
