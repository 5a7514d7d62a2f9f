//! Admission gate bounding the number of batches inside the sink.
//!
//! Permits are handed out in FIFO order by a tokio semaphore. Dropping a
//! [`Permit`] releases it, so a sink task that finishes, fails or is
//! aborted always gives its slot back.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::emit;
use crate::error::GateError;
use crate::metrics::events::InFlightBatches;

#[derive(Debug)]
struct GateState {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    state: Arc<GateState>,
    capacity: usize,
}

/// Proof of admission for one batch.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    state: Arc<GateState>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let count = self.state.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        emit!(InFlightBatches { count });
    }
}

impl AdmissionGate {
    pub fn new(max_in_flight: usize) -> Self {
        let capacity = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            state: Arc::new(GateState {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
            capacity,
        }
    }

    /// Wait for a free slot.
    ///
    /// Cancel-safe; a cancelled waiter simply loses its place in the queue.
    pub async fn acquire(&self) -> Result<Permit, GateError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::GateClosed)?;
        Ok(self.admit(permit))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.admit(permit))
    }

    /// Give a permit back explicitly. Equivalent to dropping it.
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    /// Refuse all current and future waiters.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of permits held at once since creation.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> Permit {
        let count = self.state.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.peak.fetch_max(count, Ordering::AcqRel);
        emit!(InFlightBatches { count });
        Permit {
            _permit: permit,
            state: self.state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let gate = AdmissionGate::new(2);
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();

        assert_eq!(gate.in_flight(), 2);
        assert!(gate.try_acquire().is_none());

        let waiter = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(waiter.is_err());

        gate.release(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_closed_gate_rejects_waiters() {
        let gate = AdmissionGate::new(1);
        let _held = gate.acquire().await.unwrap();
        gate.close();

        assert!(matches!(gate.acquire().await, Err(GateError::GateClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_peak_never_exceeds_capacity_under_contention() {
        let gate = AdmissionGate::new(3);
        let mut tasks = Vec::new();

        for i in 0..64u64 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                assert!(gate.in_flight() <= gate.capacity());
                tokio::time::sleep(Duration::from_millis(i % 3)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(gate.in_flight(), 0);
        assert!(gate.peak() <= 3);
        assert!(gate.peak() >= 1);
    }
}
