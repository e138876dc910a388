//! Bounded concurrency pool
//!
//! A fixed number of permits gate how many dispatches may be in flight at
//! once. Waiters queue in FIFO order behind a semaphore; the queue itself is
//! capped so a burst of callers is shed instead of piling up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::{DispatchError, PoolRejection, Result};

/// Fixed-size permit pool with a bounded wait queue and acquisition timeout
#[derive(Debug)]
pub struct ConcurrencyPool {
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
    waiting: AtomicUsize,
}

impl ConcurrencyPool {
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig {
            max_concurrency: config.max_concurrency.max(1),
            ..config
        };
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Wait for a permit.
    ///
    /// Fails with [`PoolRejection::QueueFull`] when the wait queue is already
    /// at its depth limit and with [`PoolRejection::AcquireTimeout`] when no
    /// permit frees up in time.
    pub async fn acquire(&self) -> Result<PoolPermit> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(PoolPermit::new(permit));
        }

        let _waiter = WaitSlot::claim(&self.waiting, self.config.max_waiting).ok_or_else(|| {
            warn!(
                max_waiting = self.config.max_waiting,
                "Concurrency pool wait queue is full"
            );
            DispatchError::PoolExhausted(PoolRejection::QueueFull)
        })?;

        debug!(waiting = self.waiting(), "Waiting for a concurrency permit");

        match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(PoolPermit::new(permit)),
            // The semaphore is never closed while the pool is alive.
            Ok(Err(_)) => Err(DispatchError::PoolExhausted(PoolRejection::AcquireTimeout)),
            Err(_) => {
                warn!(
                    timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                    "Timed out waiting for a concurrency permit"
                );
                Err(DispatchError::PoolExhausted(PoolRejection::AcquireTimeout))
            }
        }
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.config.max_concurrency - self.semaphore.available_permits()
    }

    /// Callers currently queued for a permit
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.config.max_concurrency
    }
}

/// Position in the wait queue, given back on drop
struct WaitSlot<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> WaitSlot<'a> {
    fn claim(waiting: &'a AtomicUsize, max_waiting: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max_waiting).then_some(current + 1)
            })
            .ok()
            .map(|_| Self { waiting })
    }
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A held concurrency permit. Released exactly once, explicitly or on drop.
#[derive(Debug)]
pub struct PoolPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl PoolPermit {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
        }
    }

    /// Return the permit to the pool. Safe to call more than once.
    pub fn release(&mut self) {
        if self.permit.take().is_some() {
            debug!("Concurrency permit released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(max_concurrency: usize, max_waiting: usize, timeout_ms: u64) -> Arc<ConcurrencyPool> {
        Arc::new(ConcurrencyPool::new(PoolConfig {
            max_concurrency,
            max_waiting,
            acquire_timeout: Duration::from_millis(timeout_ms),
        }))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = pool(2, 4, 100);

        let mut first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);

        first.release();
        assert!(!first.is_held());
        assert_eq!(pool.in_use(), 1);

        // Releasing twice must not hand back a second permit.
        first.release();
        drop(first);
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = pool(1, 4, 50);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::PoolExhausted(PoolRejection::AcquireTimeout)
        ));
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_wait_queue_rejects_immediately() {
        let pool = pool(1, 1, 10_000);
        let held = pool.acquire().await.unwrap();

        let queued = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.waiting(), 1);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::PoolExhausted(PoolRejection::QueueFull)
        ));

        drop(held);
        let permit = queued.await.unwrap().unwrap();
        assert!(permit.is_held());
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_permit() {
        let pool = pool(1, 4, 1_000);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        drop(held);

        tokio_test::assert_ok!(waiter.await.unwrap());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_holders_never_exceed_capacity() {
        let pool = pool(8, 128, 5_000);
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let peak = Arc::clone(&peak);
                let active = Arc::clone(&active);
                tokio::spawn(async move {
                    let _permit = pool.acquire().await.unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 8);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.waiting(), 0);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let pool = ConcurrencyPool::new(PoolConfig {
            max_concurrency: 0,
            max_waiting: 0,
            acquire_timeout: Duration::from_millis(1),
        });
        assert_eq!(pool.capacity(), 1);
    }
}
