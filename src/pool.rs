//! Admission control for engine invocations
//!
//! Each operation class gets its own pool. A [`PoolPermit`] is the only way to
//! hold a slot and it gives the slot back when dropped, so every exit path
//! (success, error, early return, cancellation) releases exactly once.

use crate::config::PoolLimits;
use crate::error::{EncoderError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Probe,
    AudioImage,
    VideoImage,
    IntervalImage,
}

impl PoolKind {
    pub fn as_str(&self) -> &str {
        match self {
            PoolKind::Probe => "probe",
            PoolKind::AudioImage => "audio_image",
            PoolKind::VideoImage => "video_image",
            PoolKind::IntervalImage => "interval_image",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ResourcePool {
    kind: PoolKind,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl ResourcePool {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held by callers
    pub fn outstanding(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Wait for a free slot. A fired token wins over a free slot, so a
    /// cancelled caller never walks away holding a permit.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PoolPermit> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EncoderError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
        };

        let permit = permit.map_err(|_| EncoderError::PoolClosed(self.kind))?;
        debug!(pool = %self.kind, outstanding = self.outstanding(), "Pool permit acquired");

        Ok(PoolPermit {
            kind: self.kind,
            _permit: permit,
        })
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// A held slot in a [`ResourcePool`]; dropping it frees the slot
pub struct PoolPermit {
    kind: PoolKind,
    _permit: OwnedSemaphorePermit,
}

impl PoolPermit {
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolPermit").field("kind", &self.kind).finish()
    }
}

/// The four pools the encoder gates its engine invocations with
pub struct ResourcePools {
    probe: ResourcePool,
    audio_image: ResourcePool,
    video_image: ResourcePool,
    interval_image: ResourcePool,
}

impl ResourcePools {
    pub fn new(limits: &PoolLimits) -> Self {
        Self {
            probe: ResourcePool::new(PoolKind::Probe, limits.probe),
            audio_image: ResourcePool::new(PoolKind::AudioImage, limits.audio_image),
            video_image: ResourcePool::new(PoolKind::VideoImage, limits.video_image),
            interval_image: ResourcePool::new(PoolKind::IntervalImage, limits.interval_image),
        }
    }

    pub fn get(&self, kind: PoolKind) -> &ResourcePool {
        match kind {
            PoolKind::Probe => &self.probe,
            PoolKind::AudioImage => &self.audio_image,
            PoolKind::VideoImage => &self.video_image,
            PoolKind::IntervalImage => &self.interval_image,
        }
    }

    pub async fn acquire(&self, kind: PoolKind, cancel: &CancellationToken) -> Result<PoolPermit> {
        self.get(kind).acquire(cancel).await
    }

    pub fn close_all(&self) {
        for pool in [&self.probe, &self.audio_image, &self.video_image, &self.interval_image] {
            pool.close();
        }
    }
}

impl Default for ResourcePools {
    fn default() -> Self {
        Self::new(&PoolLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_capacity_floor() {
        let pool = ResourcePool::new(PoolKind::Probe, 0);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_default_capacities() {
        let pools = ResourcePools::default();
        assert_eq!(pools.get(PoolKind::Probe).capacity(), 2);
        assert_eq!(pools.get(PoolKind::AudioImage).capacity(), 2);
        assert_eq!(pools.get(PoolKind::VideoImage).capacity(), 1);
        assert_eq!(pools.get(PoolKind::IntervalImage).capacity(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_capacity() {
        let pool = Arc::new(ResourcePool::new(PoolKind::Probe, 2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let _permit = pool.acquire(&cancel).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait_without_permit() {
        let pool = ResourcePool::new(PoolKind::VideoImage, 1);
        let held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), pool.acquire(&cancel))
            .await
            .expect("cancelled wait should return promptly");
        assert!(matches!(result, Err(EncoderError::Cancelled)));
        assert_eq!(pool.outstanding(), 1);

        held.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_beats_free_slot() {
        let pool = ResourcePool::new(PoolKind::AudioImage, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(pool.acquire(&cancel).await.unwrap_err().is_cancelled());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pools = ResourcePools::default();
        pools.close_all();

        let err = pools
            .acquire(PoolKind::IntervalImage, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EncoderError::PoolClosed(PoolKind::IntervalImage)));
    }
}
