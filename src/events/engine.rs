use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use converse_sdk::{Event, EventDestination, EventDirection, EventPayload, WellKnownFlag};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::middleware::{MiddlewareChain, MiddlewareOutcome, MiddlewareRegistration};
use super::store::{EventChanges, EventStatus, EventStore, Feedback, SearchParams, StoredEvent};
use super::EventError;
use crate::logger::PipelineMetrics;

/// Transport side of the pipeline: receives outgoing events that made it
/// through the whole outgoing chain.
#[async_trait]
pub trait OutgoingHandler: Send + Sync {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl OutgoingHandler for mpsc::UnboundedSender<Event> {
    async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        self.send(event.clone())
            .map_err(|_| anyhow::anyhow!("outgoing receiver dropped"))
    }
}

#[derive(Default)]
struct ConversationQueue {
    queued: VecDeque<Event>,
    /// Event currently inside the chain.
    current: Option<String>,
}

struct Inner {
    chain: RwLock<MiddlewareChain>,
    store: Arc<dyn EventStore>,
    queues: DashMap<String, ConversationQueue>,
    outgoing: RwLock<Vec<Arc<dyn OutgoingHandler>>>,
    default_timeout: Duration,
    metrics: PipelineMetrics,
    shutdown: CancellationToken,
}

/// Runs events through the middleware chain, one ordered queue per
/// conversation and direction.
#[derive(Clone)]
pub struct EventEngine {
    inner: Arc<Inner>,
}

impl EventEngine {
    pub fn new(store: Arc<dyn EventStore>, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                chain: RwLock::new(MiddlewareChain::new()),
                store,
                queues: DashMap::new(),
                outgoing: RwLock::new(vec![]),
                default_timeout,
                metrics: PipelineMetrics::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.inner.store.clone()
    }

    #[tracing::instrument(skip(self, registration), fields(middleware = %registration.name, direction = %registration.direction))]
    pub fn register(&self, registration: MiddlewareRegistration) -> Result<(), EventError> {
        let mut chain = self
            .inner
            .chain
            .write()
            .map_err(|_| EventError::Store("middleware chain lock poisoned".into()))?;
        chain.register(registration)?;
        info!("middleware registered");
        Ok(())
    }

    /// Removes a middleware from both directions. Unknown names are ignored.
    pub fn remove_middleware(&self, name: &str) {
        if let Ok(mut chain) = self.inner.chain.write() {
            if chain.remove(name) {
                info!(middleware = name, "middleware removed");
            }
        }
    }

    pub fn middleware_names(&self, direction: EventDirection) -> Vec<String> {
        self.inner
            .chain
            .read()
            .map(|chain| chain.names(direction))
            .unwrap_or_default()
    }

    pub fn subscribe_outgoing(&self, handler: Arc<dyn OutgoingHandler>) {
        if let Ok(mut handlers) = self.inner.outgoing.write() {
            handlers.push(handler);
        }
    }

    /// Persists the event as pending and queues it behind earlier events of
    /// the same conversation. Returns before any middleware runs.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.id, direction = %event.direction))]
    pub async fn send_event(&self, event: Event) -> Result<(), EventError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EventError::ShuttingDown);
        }
        if !event.flags.has(WellKnownFlag::SkipStore) {
            self.inner.store.insert(&event).await?;
        }

        let key = queue_key(event.direction, &event.conversation_key());
        let start_worker = {
            let mut queue = self.inner.queues.entry(key.clone()).or_default();
            let idle = queue.queued.is_empty() && queue.current.is_none();
            queue.queued.push_back(event);
            idle
        };
        if start_worker {
            debug!(queue = %key, "starting conversation worker");
            tokio::spawn(run_queue(self.inner.clone(), key));
        }
        Ok(())
    }

    /// Builds one outgoing event per payload and submits each. Returns the new ids.
    pub async fn reply_to_event(
        &self,
        destination: EventDestination,
        payloads: Vec<EventPayload>,
        in_response_to: &Event,
    ) -> Result<Vec<String>, EventError> {
        let thread_id = in_response_to
            .thread_id
            .clone()
            .unwrap_or_else(|| in_response_to.id.clone());
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let reply = Event::outgoing(destination.clone(), payload)
                .in_reply_to(in_response_to.id.clone())
                .with_thread_id(thread_id.clone());
            ids.push(reply.id.clone());
            self.send_event(reply).await?;
        }
        Ok(ids)
    }

    /// Hint only: `true` when no other incoming event of this conversation is
    /// queued or inside the chain.
    pub fn is_incoming_queue_empty(&self, event: &Event) -> bool {
        let key = queue_key(EventDirection::Incoming, &event.conversation_key());
        match self.inner.queues.get(&key) {
            None => true,
            Some(queue) => {
                queue.queued.iter().all(|queued| queued.id == event.id)
                    && queue.current.as_ref().is_none_or(|current| *current == event.id)
            }
        }
    }

    pub async fn find_events(
        &self,
        fields: &Map<String, Value>,
        params: &SearchParams,
    ) -> Result<Vec<StoredEvent>, EventError> {
        self.inner.store.find(fields, params).await
    }

    pub async fn update_event(&self, id: &str, fields: &Map<String, Value>) -> Result<StoredEvent, EventError> {
        self.inner.store.update(id, fields).await
    }

    pub async fn save_user_feedback(
        &self,
        event_id: &str,
        target: &str,
        score: i32,
        kind: &str,
    ) -> Result<(), EventError> {
        let feedback = Feedback {
            target: target.to_string(),
            score,
            kind: kind.to_string(),
            created_at: Utc::now(),
        };
        self.inner.store.add_feedback(event_id, feedback).await
    }

    /// `true` once every conversation queue has drained.
    pub fn is_idle(&self) -> bool {
        self.inner.queues.is_empty()
    }

    /// Waits for the queues to drain. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        while !self.is_idle() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Stops accepting events, drops queued ones and releases every handler.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let dropped: usize = self.inner.queues.iter().map(|q| q.queued.len()).sum();
        if dropped > 0 {
            warn!(dropped, "event engine stopping with queued events");
        }
        if let Ok(mut chain) = self.inner.chain.write() {
            chain.clear();
        }
        if let Ok(mut handlers) = self.inner.outgoing.write() {
            handlers.clear();
        }
        info!("event engine stopped");
    }
}

fn queue_key(direction: EventDirection, conversation: &str) -> String {
    format!("{direction}:{conversation}")
}

/// Drains one conversation queue, then exits. Popping the next event and
/// removing the drained queue happen under the same map entry, so a
/// concurrent `send_event` either sees the worker or starts a new one.
async fn run_queue(inner: Arc<Inner>, key: String) {
    loop {
        if inner.shutdown.is_cancelled() {
            inner.queues.remove(&key);
            return;
        }
        let next = match inner.queues.entry(key.clone()) {
            Entry::Occupied(mut slot) => match slot.get_mut().queued.pop_front() {
                Some(event) => {
                    slot.get_mut().current = Some(event.id.clone());
                    Some(event)
                }
                None => {
                    slot.remove();
                    None
                }
            },
            Entry::Vacant(_) => None,
        };
        let Some(event) = next else {
            debug!(queue = %key, "conversation worker drained");
            return;
        };

        process(&inner, event).await;
    }
}

#[tracing::instrument(skip(inner, event), fields(event_id = %event.id, direction = %event.direction))]
async fn process(inner: &Inner, mut event: Event) {
    let started = Instant::now();
    let persisted = !event.flags.has(WellKnownFlag::SkipStore);
    if persisted {
        if let Err(err) = inner.store.set_status(&event.id, EventStatus::Processing).await {
            warn!(error = %err, "could not mark event as processing");
        }
    }

    let original = persisted.then(|| event.clone());
    let chain = match inner.chain.read() {
        Ok(chain) => chain.snapshot(event.direction),
        Err(_) => {
            error!("middleware chain lock poisoned");
            return;
        }
    };

    let mut status = EventStatus::Completed;
    let mut failure = None;
    let mut processed_by = Vec::with_capacity(chain.len());

    for registration in chain {
        let timeout = registration.timeout.unwrap_or(inner.default_timeout);
        let step = Instant::now();
        let result = tokio::time::timeout(timeout, registration.handler.handle(&mut event)).await;
        inner.metrics.middleware_finished(&registration.name, step.elapsed());

        match result {
            Ok(Ok(MiddlewareOutcome::Continue)) => processed_by.push(registration.name.clone()),
            Ok(Ok(MiddlewareOutcome::ShortCircuit)) => {
                processed_by.push(registration.name.clone());
                debug!(middleware = %registration.name, "chain short-circuited");
                status = EventStatus::ShortCircuited;
                break;
            }
            Ok(Err(err)) => {
                let err = EventError::Processing {
                    middleware: registration.name.clone(),
                    reason: format!("{err:#}"),
                };
                error!(middleware = %registration.name, error = %err, "middleware failed");
                failure = Some(err.to_string());
                status = EventStatus::Failed;
                break;
            }
            Err(_) => {
                let err = EventError::Processing {
                    middleware: registration.name.clone(),
                    reason: format!("timed out after {} ms", timeout.as_millis()),
                };
                error!(middleware = %registration.name, error = %err, "middleware timed out");
                failure = Some(err.to_string());
                status = EventStatus::Failed;
                break;
            }
        }
    }

    if let Some(original) = original {
        let recorded = match EventChanges::between(&original, &event) {
            Ok(changes) => {
                debug!(changed = ?changes.paths(), "recording event outcome");
                inner
                    .store
                    .record_outcome(&event.id, &changes, status, failure, processed_by)
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = recorded {
            error!(error = %err, "could not record event outcome");
        }
    }

    if status == EventStatus::Completed && event.direction == EventDirection::Outgoing {
        deliver(inner, &event).await;
    }

    inner
        .metrics
        .event_finished(&event.id, &event.direction.to_string(), &status.to_string(), started.elapsed());
}

async fn deliver(inner: &Inner, event: &Event) {
    let handlers = match inner.outgoing.read() {
        Ok(handlers) => handlers.clone(),
        Err(_) => return,
    };
    if handlers.is_empty() {
        warn!(event_id = %event.id, "no transport subscribed for outgoing events");
    }
    for handler in handlers {
        if let Err(err) = handler.deliver(event).await {
            error!(event_id = %event.id, error = %err, "delivery failed");
        }
    }
}
