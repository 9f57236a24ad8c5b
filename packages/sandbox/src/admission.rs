// ABOUTME: Admission control bounding how many container lifecycles run at once
// ABOUTME: FIFO permit queue with a length cap and a wait timeout; slots release on drop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::error::SandboxError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Admission queue is full ({limit} requests already waiting)")]
    QueueFull { limit: usize },

    #[error("Timed out waiting for an execution slot after {0:?}")]
    QueueTimeout(Duration),

    #[error("Admission controller is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStats {
    pub max_concurrency: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub available: usize,
}

/// Counting permit set of size `max_concurrency`.
///
/// Waiters are served in arrival order. A waiter that gives up (timeout or
/// its future being dropped) leaves the queue without disturbing others.
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    max_queue: usize,
    queue_timeout: Duration,
    waiting: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(
        max_concurrency: usize,
        max_queue: usize,
        queue_timeout: Duration,
    ) -> Result<Self, SandboxError> {
        if max_concurrency == 0 {
            return Err(SandboxError::Configuration(
                "maxConcurrency must be at least 1".to_string(),
            ));
        }
        if max_concurrency > Semaphore::MAX_PERMITS {
            return Err(SandboxError::Configuration(format!(
                "maxConcurrency {} exceeds {}",
                max_concurrency,
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            max_queue,
            queue_timeout,
            waiting: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Take a slot, queueing if none is free
    pub async fn acquire(&self) -> Result<AdmissionSlot, AdmissionError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => return Ok(self.grant(permit, Duration::ZERO)),
            Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        let already_waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(self.waiting.clone());
        if already_waiting >= self.max_queue {
            warn!(
                "Rejecting request: {} already waiting for {} slots",
                already_waiting, self.max_concurrency
            );
            return Err(AdmissionError::QueueFull {
                limit: self.max_queue,
            });
        }

        let started = Instant::now();
        match tokio::time::timeout(self.queue_timeout, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(self.grant(permit, started.elapsed())),
            Ok(Err(_)) => Err(AdmissionError::Closed),
            Err(_) => {
                debug!("Queue wait timed out after {:?}", self.queue_timeout);
                Err(AdmissionError::QueueTimeout(self.queue_timeout))
            }
        }
    }

    /// Return a slot. Dropping the slot has the same effect.
    pub fn release(&self, slot: AdmissionSlot) {
        slot.release();
    }

    /// Refuse all current and future waiters
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            max_concurrency: self.max_concurrency,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            available: self.semaphore.available_permits(),
        }
    }

    fn grant(&self, permit: OwnedSemaphorePermit, waited: Duration) -> AdmissionSlot {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Granted execution slot after {:?} ({}/{} in flight)",
            waited, in_flight, self.max_concurrency
        );
        AdmissionSlot {
            permit: Some(permit),
            in_flight: self.in_flight.clone(),
            waited,
        }
    }
}

struct WaitingGuard(Arc<AtomicUsize>);

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proof of admission. The permit returns to the pool exactly once, on
/// [`AdmissionSlot::release`] or drop, whichever comes first.
#[derive(Debug)]
pub struct AdmissionSlot {
    permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
    waited: Duration,
}

impl AdmissionSlot {
    /// Time spent queued before the grant
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.give_back();
    }
}
