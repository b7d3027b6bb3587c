use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::fabric::{Fabric, LockGrant};
use super::{BroadcastMessage, JobError};

const NOTIFY_CHANNEL: &str = "converse_broadcast";
const BROADCAST_CAPACITY: usize = 256;

/// Cluster fabric on a shared Postgres database.
///
/// Locks live in `converse_locks`; a row is taken over only once its
/// `expires_at` has passed. Broadcasts ride on `NOTIFY`, so they are lost for
/// instances that are not listening at that moment.
pub struct PgFabric {
    pool: PgPool,
    bus: broadcast::Sender<BroadcastMessage>,
    cancel: CancellationToken,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PgFabric {
    pub async fn connect(database_url: &str) -> Result<Self, JobError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: PgPool) -> Result<Self, JobError> {
        migrate(&pool).await?;

        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let (bus, _) = broadcast::channel(BROADCAST_CAPACITY);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen(listener, bus.clone(), cancel.clone()));
        info!("postgres fabric ready");

        Ok(Self {
            pool,
            bus,
            cancel,
            listener: std::sync::Mutex::new(Some(handle)),
        })
    }
}

async fn migrate(pool: &PgPool) -> Result<(), JobError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS converse_locks (
            name        TEXT PRIMARY KEY,
            holder_id   TEXT NOT NULL,
            token       BIGINT NOT NULL,
            expires_at  TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE SEQUENCE IF NOT EXISTS converse_lock_tokens")
        .execute(pool)
        .await?;
    Ok(())
}

async fn listen(mut listener: PgListener, bus: broadcast::Sender<BroadcastMessage>, cancel: CancellationToken) {
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => return,
            received = listener.recv() => received,
        };
        match notification {
            Ok(notification) => match serde_json::from_str::<BroadcastMessage>(notification.payload()) {
                Ok(message) => {
                    let _ = bus.send(message);
                }
                Err(err) => warn!(error = %err, "ignoring malformed broadcast"),
            },
            Err(err) => {
                // PgListener reconnects on the next recv
                warn!(error = %err, "broadcast listener lost its connection");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl Fabric for PgFabric {
    async fn try_acquire(&self, name: &str, holder_id: &str, ttl: Duration) -> Result<Option<LockGrant>, JobError> {
        let row = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            r#"
            INSERT INTO converse_locks (name, holder_id, token, expires_at)
            VALUES ($1, $2, nextval('converse_lock_tokens'), now() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
                SET holder_id = EXCLUDED.holder_id,
                    token = EXCLUDED.token,
                    expires_at = EXCLUDED.expires_at
                WHERE converse_locks.expires_at < now()
            RETURNING token, expires_at
            "#,
        )
        .bind(name)
        .bind(holder_id)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(token, expires_at)| LockGrant { token, expires_at }))
    }

    async fn release(&self, name: &str, token: i64) -> Result<bool, JobError> {
        let result = sqlx::query("DELETE FROM converse_locks WHERE name = $1 AND token = $2")
            .bind(name)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn publish(&self, message: BroadcastMessage) -> Result<(), JobError> {
        let payload = serde_json::to_string(&message).map_err(|e| JobError::Fabric(e.to_string()))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.bus.subscribe()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.pool.close().await;
    }
}
