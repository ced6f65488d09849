use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{FetchError, InvalidCapacity};

/// Bounds the number of fetches running at the same time.
///
/// Slots are handed out in FIFO order, so no key waits indefinitely under sustained load.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A slot in the [`AdmissionGate`]. The slot is released when this is dropped.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Result<Self, InvalidCapacity> {
        if capacity == 0 {
            return Err(InvalidCapacity);
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<GatePermit, FetchError> {
        let start = Instant::now();
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            // the semaphore is never closed
            .map_err(|_| FetchError::InternalError)?;
        metric!(timer("loader.gate.wait") = start.elapsed());

        Ok(GatePermit { _permit: permit })
    }

    /// The total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of slots that are currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// The number of slots that are currently taken.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }
}
