//! Ready queue: job ids in the order they became runnable.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use recordchain_core::JobId;

use super::store::JobStoreError;

/// FIFO of ready job ids.
///
/// Entries are references only; a popped id whose job is no longer
/// `queued` is stale and skipped by the consumer.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append to the back of the ready order.
    async fn push(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Pop the next ready id, waiting up to `wait` for one.
    async fn pop(&self, wait: Duration) -> Result<Option<JobId>, JobStoreError>;

    async fn len(&self) -> Result<usize, JobStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    ready: Mutex<VecDeque<JobId>>,
    available: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn ready(&self) -> MutexGuard<'_, VecDeque<JobId>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, id: JobId) -> Result<(), JobStoreError> {
        self.ready().push_back(id);
        self.available.notify_one();
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<JobId>, JobStoreError> {
        let deadline = Instant::now() + wait;
        loop {
            let next = self.ready().pop_front();
            if next.is_some() {
                return Ok(next);
            }
            // A push between the check and here leaves a permit behind.
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(self.ready().pop_front());
            }
        }
    }

    async fn len(&self) -> Result<usize, JobStoreError> {
        Ok(self.ready().len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn pops_in_push_order() {
        let queue = InMemoryJobQueue::new();
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for id in &ids {
            queue.push(*id).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 3);

        for id in &ids {
            assert_eq!(queue.pop(Duration::ZERO).await.unwrap(), Some(*id));
        }
        assert_eq!(queue.pop(Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pop_waits_out_the_timeout() {
        let queue = InMemoryJobQueue::new();
        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(200)).await.unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_pop_wakes_on_push() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let id = JobId::new();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(30)).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(id).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(id));
    }
}
