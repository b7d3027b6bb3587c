use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use super::DialogError;

/// Where a conversation stands. Owned by the dialog engine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DialogSession {
    pub session_id: String,
    pub bot_id: String,
    /// Both `None` for a fresh or ended conversation.
    pub current_flow: Option<String>,
    pub current_node: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub last_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DialogSession {
    pub fn new(session_id: impl Into<String>, bot_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            bot_id: bot_id.into(),
            current_flow: None,
            current_node: None,
            context: Map::new(),
            last_event_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn position(&self) -> Option<(&str, &str)> {
        match (&self.current_flow, &self.current_node) {
            (Some(flow), Some(node)) => Some((flow, node)),
            _ => None,
        }
    }

    pub fn move_to(&mut self, flow: impl Into<String>, node: impl Into<String>) {
        self.current_flow = Some(flow.into());
        self.current_node = Some(node.into());
    }

    /// Ends the conversation: no position, empty context.
    pub fn end(&mut self) {
        self.current_flow = None;
        self.current_node = None;
        self.context.clear();
    }
}

/// Persistence of dialog sessions, keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    async fn get(&self, session_id: &str) -> Result<Option<DialogSession>, DialogError>;
    async fn put(&self, session: DialogSession) -> Result<(), DialogError>;
    async fn remove(&self, session_id: &str) -> Result<(), DialogError>;
    fn clear(&self);
}

/// Sessions idle longer than the TTL are evicted.
#[derive(Clone, Debug)]
pub struct InMemorySessionStore {
    cache: Cache<String, DialogSession>,
}

impl InMemorySessionStore {
    pub fn new(ttl_secs: u64) -> Arc<Self> {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(ttl_secs))
            .eviction_listener(|key: Arc<String>, _value: DialogSession, cause| {
                info!(session_id = %key, ?cause, "dialog session evicted");
            })
            .build();
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<DialogSession>, DialogError> {
        Ok(self.cache.get(session_id).await)
    }

    async fn put(&self, session: DialogSession) -> Result<(), DialogError> {
        self.cache.insert(session.session_id.clone(), session).await;
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), DialogError> {
        self.cache.invalidate(session_id).await;
        Ok(())
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}
