use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::trace;

use super::{BroadcastMessage, JobError};

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    /// Fencing token, strictly increasing per fabric.
    pub token: i64,
    pub expires_at: DateTime<Utc>,
}

/// Cluster primitives every instance shares.
#[async_trait]
pub trait Fabric: Send + Sync {
    /// Takes `name` if it is free or its holder's TTL lapsed. `None` when
    /// another holder is still live. Not re-entrant.
    async fn try_acquire(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<Option<LockGrant>, JobError>;
    /// Releases `name` if `token` is still the current grant.
    async fn release(&self, name: &str, token: i64) -> Result<bool, JobError>;
    async fn publish(&self, message: BroadcastMessage) -> Result<(), JobError>;
    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage>;
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
struct LockRecord {
    holder_id: String,
    token: i64,
    expires_at: DateTime<Utc>,
}

/// Single process fabric. Several `JobService`s sharing one `LocalFabric`
/// behave like separate instances of a cluster.
#[derive(Debug)]
pub struct LocalFabric {
    locks: DashMap<String, LockRecord>,
    next_token: AtomicI64,
    bus: broadcast::Sender<BroadcastMessage>,
}

impl LocalFabric {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            locks: DashMap::new(),
            next_token: AtomicI64::new(1),
            bus,
        }
    }

    /// Current holder of `name`, ignoring expired grants.
    pub fn holder(&self, name: &str) -> Option<String> {
        self.locks
            .get(name)
            .filter(|record| record.expires_at > Utc::now())
            .map(|record| record.holder_id.clone())
    }

    fn grant(&self, holder_id: &str, ttl: Duration) -> LockRecord {
        LockRecord {
            holder_id: holder_id.to_string(),
            token: self.next_token.fetch_add(1, Ordering::SeqCst),
            expires_at: expiry(ttl),
        }
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fabric for LocalFabric {
    async fn try_acquire(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<Option<LockGrant>, JobError> {
        let record = match self.locks.entry(name.to_string()) {
            Entry::Occupied(slot) if slot.get().expires_at > Utc::now() => return Ok(None),
            Entry::Occupied(mut slot) => {
                trace!(lock = name, stale_holder = %slot.get().holder_id, "taking over expired lock");
                let record = self.grant(holder_id, ttl);
                slot.insert(record.clone());
                record
            }
            Entry::Vacant(slot) => {
                let record = self.grant(holder_id, ttl);
                slot.insert(record.clone());
                record
            }
        };
        Ok(Some(LockGrant {
            token: record.token,
            expires_at: record.expires_at,
        }))
    }

    async fn release(&self, name: &str, token: i64) -> Result<bool, JobError> {
        Ok(self
            .locks
            .remove_if(name, |_, record| record.token == token)
            .is_some())
    }

    async fn publish(&self, message: BroadcastMessage) -> Result<(), JobError> {
        // no subscribers is not an error
        let _ = self.bus.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.bus.subscribe()
    }
}
