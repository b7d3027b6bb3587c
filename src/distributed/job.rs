use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::fabric::Fabric;
use super::{BroadcastMessage, JobError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Proof of holding a cluster lock. Pass it back to `clear_lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    pub name: String,
    pub holder_id: String,
    pub token: i64,
    pub expires_at: DateTime<Utc>,
}

/// Broadcasts and cluster locks for one instance.
#[derive(Clone)]
pub struct JobService {
    fabric: Arc<dyn Fabric>,
    instance_id: String,
}

impl JobService {
    pub fn new(fabric: Arc<dyn Fabric>, instance_id: impl Into<String>) -> Self {
        Self {
            fabric,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn fabric(&self) -> Arc<dyn Fabric> {
        self.fabric.clone()
    }

    /// Retries with jittered backoff until the lock is ours or `timeout` elapses.
    #[tracing::instrument(skip(self), fields(instance = %self.instance_id))]
    pub async fn acquire_lock(&self, name: &str, ttl: Duration, timeout: Duration) -> Result<LockHandle, JobError> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if let Some(grant) = self.fabric.try_acquire(name, &self.instance_id, ttl).await? {
                debug!(token = grant.token, "lock acquired");
                return Ok(LockHandle {
                    name: name.to_string(),
                    holder_id: self.instance_id.clone(),
                    token: grant.token,
                    expires_at: grant.expires_at,
                });
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(JobError::LockTimeout {
                        name: name.to_string(),
                        waited: started.elapsed(),
                    });
                }
                Some(deadline) => jitter(backoff).min(deadline - now),
                None => jitter(backoff),
            };
            tokio::time::sleep(pause).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Releases early. `false` when the fabric no longer recognises the
    /// handle, e.g. its TTL lapsed and someone else took the lock.
    pub async fn clear_lock(&self, handle: &LockHandle) -> Result<bool, JobError> {
        let released = self.fabric.release(&handle.name, handle.token).await?;
        if !released {
            warn!(lock = %handle.name, token = handle.token, "stale lock handle");
        }
        Ok(released)
    }

    /// Runs `task` while holding `name`; the lock is cleared whatever `task` returns.
    /// Once `task` has run its result is returned even if clearing fails; the
    /// lock then lapses with its TTL.
    pub async fn with_lock<F, T>(&self, name: &str, ttl: Duration, timeout: Duration, task: F) -> Result<T, JobError>
    where
        F: Future<Output = T>,
    {
        let handle = self.acquire_lock(name, ttl, timeout).await?;
        let result = task.await;
        if let Err(err) = self.clear_lock(&handle).await {
            warn!(lock = %handle.name, token = handle.token, error = %err, "could not clear lock, leaving it to expire");
        }
        Ok(result)
    }

    /// Best-effort fan-out, including to this instance's own subscribers.
    pub async fn broadcast(&self, topic: &str, payload: Value) -> Result<(), JobError> {
        self.fabric
            .publish(BroadcastMessage {
                topic: topic.to_string(),
                payload,
                origin: self.instance_id.clone(),
            })
            .await
    }

    /// Messages published after this call. Lagging subscribers skip what they missed.
    pub fn subscribe(&self) -> BoxStream<'static, BroadcastMessage> {
        let receiver = self.fabric.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "broadcast subscriber lagged"),
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..1.5);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalFabric, LockGrant};
    use serde_json::json;

    fn pair() -> (JobService, JobService) {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        (JobService::new(fabric.clone(), "a"), JobService::new(fabric, "b"))
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let (a, b) = pair();
        let held = a
            .acquire_lock("reindex", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(held.holder_id, "a");

        let err = b
            .acquire_lock("reindex", Duration::from_secs(5), Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::LockTimeout { ref name, .. } if name == "reindex"));
        assert!(a.clear_lock(&held).await.unwrap());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_clear() {
        let (a, b) = pair();
        let held = a
            .acquire_lock("reindex", Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();

        let waiter = tokio::spawn(async move {
            b.acquire_lock("reindex", Duration::from_secs(5), Duration::from_secs(2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(a.clear_lock(&held).await.unwrap());

        let next = waiter.await.unwrap().unwrap();
        assert_eq!(next.holder_id, "b");
        assert!(next.token > held.token);
    }

    #[tokio::test]
    async fn test_with_lock_always_clears() {
        let (a, b) = pair();
        let out = a
            .with_lock("job", Duration::from_secs(5), Duration::from_millis(50), async { 41 + 1 })
            .await
            .unwrap();
        assert_eq!(out, 42);
        // immediately free for the other instance
        b.acquire_lock("job", Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unbounded_wait_takes_over_expired_lock() {
        let (a, b) = pair();
        a.acquire_lock("reindex", Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
        let next = tokio::time::timeout(
            Duration::from_secs(2),
            b.acquire_lock("reindex", Duration::from_secs(1), Duration::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(next.holder_id, "b");
    }

    /// Grants locks locally but cannot release them.
    struct StuckRelease(LocalFabric);

    #[async_trait::async_trait]
    impl Fabric for StuckRelease {
        async fn try_acquire(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<Option<LockGrant>, JobError> {
            self.0.try_acquire(name, holder_id, ttl).await
        }

        async fn release(&self, _name: &str, _token: i64) -> Result<bool, JobError> {
            Err(JobError::Fabric("connection reset".into()))
        }

        async fn publish(&self, message: BroadcastMessage) -> Result<(), JobError> {
            self.0.publish(message).await
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BroadcastMessage> {
            self.0.subscribe()
        }
    }

    #[tokio::test]
    async fn test_with_lock_keeps_result_when_clear_fails() {
        let jobs = JobService::new(Arc::new(StuckRelease(LocalFabric::new())), "a");
        let out = jobs
            .with_lock("job", Duration::from_millis(50), Duration::from_millis(10), async { "done" })
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert!(
            jobs.fabric()
                .try_acquire("job", "b", Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );
        // the uncleared lock still lapses with its TTL
        jobs.acquire_lock("job", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_sender_and_peers() {
        let (a, b) = pair();
        let mut own = a.subscribe();
        let mut peer = b.subscribe();
        a.broadcast("cache.flush", json!({"key": "x"})).await.unwrap();

        for stream in [&mut own, &mut peer] {
            let message = stream.next().await.unwrap();
            assert_eq!(message.topic, "cache.flush");
            assert_eq!(message.origin, "a");
            assert_eq!(message.payload, json!({"key": "x"}));
        }
    }
}
