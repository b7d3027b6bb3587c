use std::sync::Arc;

use chrono::Utc;
use converse_sdk::{Event, EventPayload};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::DialogError;
use super::flow::{Action, FlowSet, Target};
use super::registry::FlowRegistry;
use super::script::ScriptHost;
use super::session::{DialogSession, SessionStore};
use crate::events::EventEngine;

/// Node entries allowed in one call before the flow is considered looping.
pub const DEFAULT_MAX_STEPS: usize = 32;

/// Drives each conversation through its bot's flows.
#[derive(Clone)]
pub struct DialogEngine {
    registry: FlowRegistry,
    sessions: Arc<dyn SessionStore>,
    events: EventEngine,
    scripts: Arc<ScriptHost>,
    entry_flow: String,
    max_steps: usize,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Working copy of a session for the duration of one call.
struct Turn<'a> {
    flows: &'a FlowSet,
    event: &'a Event,
    session: DialogSession,
    outgoing: Vec<Event>,
    steps: usize,
}

impl DialogEngine {
    pub fn new(
        registry: FlowRegistry,
        sessions: Arc<dyn SessionStore>,
        events: EventEngine,
        scripts: Arc<ScriptHost>,
        entry_flow: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            sessions,
            events,
            scripts,
            entry_flow: entry_flow.into(),
            max_steps: DEFAULT_MAX_STEPS,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn sessions(&self) -> Arc<dyn SessionStore> {
        self.sessions.clone()
    }

    /// SHA-256 of the conversation key, hex encoded.
    pub fn create_id(event: &Event) -> String {
        hex::encode(Sha256::digest(event.conversation_key().as_bytes()))
    }

    /// Advances the session with `event`. Returns the ids of the outgoing
    /// events it emitted. On error the session is left as it was.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.id, bot_id = %event.bot_id()))]
    pub async fn process_event(&self, session_id: &str, event: &Event) -> Result<Vec<String>, DialogError> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.process_locked(session_id, event).await
        };
        drop(lock);
        self.release_lock(session_id);
        result
    }

    /// Moves the session to `flow`/`node` (default: the flow's start node)
    /// and enters it.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn jump_to(
        &self,
        session_id: &str,
        event: &Event,
        flow: &str,
        node: Option<&str>,
    ) -> Result<Vec<String>, DialogError> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.jump_locked(session_id, event, flow, node).await
        };
        drop(lock);
        self.release_lock(session_id);
        result
    }

    /// Forgets the session. Deleting an unknown session is not an error.
    pub async fn delete_session(&self, session_id: &str, bot_id: &str) -> Result<(), DialogError> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.sessions.remove(session_id).await
        };
        drop(lock);
        self.release_lock(session_id);
        info!(session_id, bot_id, "dialog session deleted");
        result
    }

    async fn process_locked(&self, session_id: &str, event: &Event) -> Result<Vec<String>, DialogError> {
        let flows = self.flows_for(event)?;
        let session = self.load_session(session_id, event).await?;
        let mut turn = Turn {
            flows: flows.as_ref(),
            event,
            session,
            outgoing: vec![],
            steps: 0,
        };

        let entry = match turn.session.position() {
            Some((flow, node)) if flows.node(flow, node).is_some() => None,
            Some((flow, node)) => {
                warn!(session_id, flow, node, "session points at a node that no longer exists, restarting");
                Some(self.entry_target(&flows, event.bot_id())?)
            }
            None => Some(self.entry_target(&flows, event.bot_id())?),
        };
        // a new position is taken without entering it: this event is
        // evaluated against the entry node's transitions
        if let Some((flow, node)) = entry {
            turn.session.move_to(flow, node);
        }

        self.advance(&mut turn, None)?;
        self.commit(turn).await
    }

    async fn jump_locked(
        &self,
        session_id: &str,
        event: &Event,
        flow: &str,
        node: Option<&str>,
    ) -> Result<Vec<String>, DialogError> {
        let flows = self.flows_for(event)?;
        let target_flow = flows.get(flow).ok_or_else(|| DialogError::UnknownFlow {
            bot_id: event.bot_id().to_string(),
            flow: flow.to_string(),
        })?;
        let node = node.unwrap_or(&target_flow.start_node);
        if target_flow.node(node).is_none() {
            return Err(DialogError::UnknownNode {
                flow: flow.to_string(),
                node: node.to_string(),
            });
        }
        let target = (flow.to_string(), node.to_string());

        let session = self.load_session(session_id, event).await?;
        let mut turn = Turn {
            flows: flows.as_ref(),
            event,
            session,
            outgoing: vec![],
            steps: 0,
        };
        self.advance(&mut turn, Some(target))?;
        self.commit(turn).await
    }

    /// Enters `pending` (if any), then keeps taking the first true transition
    /// until a node waits for input, nothing matches or the conversation ends.
    fn advance(&self, turn: &mut Turn<'_>, mut pending: Option<(String, String)>) -> Result<(), DialogError> {
        let flows = turn.flows;
        loop {
            if let Some((flow, node)) = pending.take() {
                if self.enter(turn, flow, node)? {
                    return Ok(());
                }
            }

            let Some((flow, node)) = turn
                .session
                .position()
                .map(|(f, n)| (f.to_string(), n.to_string()))
            else {
                return Ok(());
            };
            let current = flows
                .node(&flow, &node)
                .ok_or_else(|| DialogError::UnknownNode {
                    flow: flow.clone(),
                    node: node.clone(),
                })?;

            let mut taken = None;
            for transition in &current.next {
                let hit = self
                    .scripts
                    .condition(&transition.condition, turn.event, &turn.session.context)
                    .map_err(|reason| DialogError::Processing(format!("{flow}/{node}: {reason}")))?;
                if hit {
                    taken = Some(transition);
                    break;
                }
            }
            let Some(transition) = taken else {
                debug!(flow, node, "no transition matched, staying");
                return Ok(());
            };

            match flows
                .resolve(&flow, transition)
                .map_err(DialogError::Processing)?
            {
                Target::End => {
                    debug!(flow, node, "conversation ended");
                    turn.session.end();
                    return Ok(());
                }
                Target::Node { flow, node } => pending = Some((flow, node)),
            }
        }
    }

    /// Runs the node's `on_enter` actions. Returns whether it waits for input.
    fn enter(&self, turn: &mut Turn<'_>, flow: String, node: String) -> Result<bool, DialogError> {
        turn.steps += 1;
        if turn.steps > self.max_steps {
            return Err(DialogError::Processing(format!(
                "more than {} nodes entered in one turn (stopped at {flow}/{node})",
                self.max_steps
            )));
        }
        let flows = turn.flows;
        let definition = flows
            .node(&flow, &node)
            .ok_or_else(|| DialogError::UnknownNode {
                flow: flow.clone(),
                node: node.clone(),
            })?;

        for action in &definition.on_enter {
            match action {
                Action::Say { text } => {
                    let text = self
                        .scripts
                        .render(text, turn.event, &turn.session.context)
                        .map_err(|reason| DialogError::Processing(format!("{flow}/{node}: {reason}")))?;
                    turn.outgoing.push(reply(turn.event, text));
                }
                Action::Set { key, value } => {
                    turn.session.context.insert(key.clone(), value.clone());
                }
                Action::Script { code } => {
                    self.scripts
                        .run(code, turn.event, &mut turn.session.context)
                        .map_err(|reason| DialogError::Processing(format!("{flow}/{node}: {reason}")))?;
                }
            }
        }

        debug!(flow, node, "entered node");
        turn.session.move_to(flow, node);
        Ok(definition.wait_for_input)
    }

    /// Persists the session, then submits what the turn produced.
    async fn commit(&self, turn: Turn<'_>) -> Result<Vec<String>, DialogError> {
        let Turn {
            event,
            mut session,
            outgoing,
            ..
        } = turn;
        session.last_event_id = Some(event.id.clone());
        session.updated_at = Utc::now();
        self.sessions.put(session).await?;

        let mut ids = Vec::with_capacity(outgoing.len());
        for out in outgoing {
            ids.push(out.id.clone());
            if let Err(err) = self.events.send_event(out).await {
                error!(error = %err, "could not emit dialog reply");
                return Err(DialogError::Processing(err.to_string()));
            }
        }
        Ok(ids)
    }

    fn flows_for(&self, event: &Event) -> Result<Arc<FlowSet>, DialogError> {
        self.registry
            .bot(event.bot_id())
            .ok_or_else(|| DialogError::UnknownBot(event.bot_id().to_string()))
    }

    fn entry_target(&self, flows: &FlowSet, bot_id: &str) -> Result<(String, String), DialogError> {
        let flow = flows.get(&self.entry_flow).ok_or_else(|| DialogError::UnknownFlow {
            bot_id: bot_id.to_string(),
            flow: self.entry_flow.clone(),
        })?;
        Ok((flow.name.clone(), flow.start_node.clone()))
    }

    async fn load_session(&self, session_id: &str, event: &Event) -> Result<DialogSession, DialogError> {
        Ok(self
            .sessions
            .get(session_id)
            .await?
            .unwrap_or_else(|| DialogSession::new(session_id, event.bot_id())))
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the per-session mutex once nobody else holds or waits on it.
    fn release_lock(&self, session_id: &str) {
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn reply(event: &Event, text: String) -> Event {
    let thread_id = event.thread_id.clone().unwrap_or_else(|| event.id.clone());
    Event::outgoing(event.destination.clone(), EventPayload::text(text))
        .in_reply_to(event.id.clone())
        .with_thread_id(thread_id)
}
