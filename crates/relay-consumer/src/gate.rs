//! Concurrency gate
//!
//! A fixed-capacity pool of admission slots bounding in-flight handler
//! invocations. Acquisition never blocks; a full gate is backpressure, not an
//! error. Slots are released when the [`GateSlot`] guard is dropped, so every
//! exit path of an invocation (success, error, timeout, panic) gives its slot
//! back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct Load {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    released: Notify,
}

/// Fixed-capacity admission gate
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    capacity: usize,
    permits: Arc<Semaphore>,
    load: Arc<Load>,
}

impl ConcurrencyGate {
    /// Create a gate; capacity is clamped to at least 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            load: Arc::new(Load {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                released: Notify::new(),
            }),
        }
    }

    /// Take a slot if one is free
    pub fn try_acquire(&self) -> Option<GateSlot> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        let now = self.load.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.load.peak.fetch_max(now, Ordering::AcqRel);
        Some(GateSlot {
            permit: Some(permit),
            load: Arc::clone(&self.load),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.load.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of slots held at once since creation
    pub fn peak_in_flight(&self) -> usize {
        self.load.peak.load(Ordering::Acquire)
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait until at least one slot is free
    pub async fn wait_available(&self) {
        loop {
            let released = self.load.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.available() > 0 {
                return;
            }
            released.await;
        }
    }

    /// Wait for the next slot release, whatever the occupancy
    pub async fn wait_release(&self) {
        self.load.released.notified().await
    }

    /// Wait until every slot is free, up to `timeout`
    ///
    /// Returns `false` when slots were still held at the deadline.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let capacity = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(timeout, self.permits.acquire_many(capacity)).await,
            Ok(Ok(_))
        )
    }
}

/// A held gate slot; released on drop
#[derive(Debug)]
pub struct GateSlot {
    permit: Option<OwnedSemaphorePermit>,
    load: Arc<Load>,
}

impl Drop for GateSlot {
    fn drop(&mut self) {
        // Count down before the permit returns so in_flight never exceeds capacity
        self.load.in_flight.fetch_sub(1, Ordering::AcqRel);
        drop(self.permit.take());
        self.load.released.notify_waiters();
    }
}
