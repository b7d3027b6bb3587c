use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converse_sdk::{Event, EventDirection};

use super::EventError;

/// Priority the runtime gives the dialog middleware so it runs after every plugin.
pub const LAST_PRIORITY: i32 = i32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareOutcome {
    Continue,
    /// Stop the chain here. The event is not failed.
    ShortCircuit,
}

/// One step of the event chain. May mutate the event in place.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, event: &mut Event) -> anyhow::Result<MiddlewareOutcome>;
}

/// Adapts a synchronous closure into a [`Middleware`].
pub struct FnMiddleware<F>(pub F);

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut Event) -> anyhow::Result<MiddlewareOutcome> + Send + Sync,
{
    async fn handle(&self, event: &mut Event) -> anyhow::Result<MiddlewareOutcome> {
        (self.0)(event)
    }
}

#[derive(Clone)]
pub struct MiddlewareRegistration {
    pub name: String,
    pub direction: EventDirection,
    /// Lower runs first; ties keep registration order.
    pub priority: i32,
    pub description: String,
    /// `None` uses the engine default.
    pub timeout: Option<Duration>,
    pub handler: Arc<dyn Middleware>,
}

impl MiddlewareRegistration {
    pub fn new(name: impl Into<String>, direction: EventDirection, handler: Arc<dyn Middleware>) -> Self {
        Self {
            name: name.into(),
            direction,
            priority: 0,
            description: String::new(),
            timeout: None,
            handler,
        }
    }

    pub fn incoming(name: impl Into<String>, handler: Arc<dyn Middleware>) -> Self {
        Self::new(name, EventDirection::Incoming, handler)
    }

    pub fn outgoing(name: impl Into<String>, handler: Arc<dyn Middleware>) -> Self {
        Self::new(name, EventDirection::Outgoing, handler)
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for MiddlewareRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareRegistration")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Both directions' middleware, each kept sorted by (priority, registration order).
///
/// Runs hand out snapshots, so a registration change never affects an event
/// already walking the chain.
#[derive(Debug, Default)]
pub struct MiddlewareChain {
    incoming: Vec<Arc<MiddlewareRegistration>>,
    outgoing: Vec<Arc<MiddlewareRegistration>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: MiddlewareRegistration) -> Result<(), EventError> {
        let chain = self.direction_mut(registration.direction);
        if chain.iter().any(|r| r.name == registration.name) {
            return Err(EventError::DuplicateName {
                name: registration.name,
                direction: registration.direction,
            });
        }
        // stable: equal priorities stay FIFO
        let pos = chain
            .iter()
            .position(|r| r.priority > registration.priority)
            .unwrap_or(chain.len());
        chain.insert(pos, Arc::new(registration));
        Ok(())
    }

    /// Removes `name` from both directions. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.len();
        self.incoming.retain(|r| r.name != name);
        self.outgoing.retain(|r| r.name != name);
        self.len() < before
    }

    pub fn snapshot(&self, direction: EventDirection) -> Vec<Arc<MiddlewareRegistration>> {
        match direction {
            EventDirection::Incoming => self.incoming.clone(),
            EventDirection::Outgoing => self.outgoing.clone(),
        }
    }

    pub fn names(&self, direction: EventDirection) -> Vec<String> {
        self.snapshot(direction)
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.incoming.clear();
        self.outgoing.clear();
    }

    fn direction_mut(&mut self, direction: EventDirection) -> &mut Vec<Arc<MiddlewareRegistration>> {
        match direction {
            EventDirection::Incoming => &mut self.incoming,
            EventDirection::Outgoing => &mut self.outgoing,
        }
    }
}
