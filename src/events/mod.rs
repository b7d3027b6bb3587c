pub mod engine;
pub mod middleware;
pub mod store;

use converse_sdk::EventDirection;
use thiserror::Error;

pub use engine::{EventEngine, OutgoingHandler};
pub use middleware::{FnMiddleware, Middleware, MiddlewareChain, MiddlewareOutcome, MiddlewareRegistration};
pub use store::{EventChanges, EventStatus, EventStore, Feedback, InMemoryEventStore, SearchParams, StoredEvent};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("middleware `{name}` is already registered for {direction} events")]
    DuplicateName { name: String, direction: EventDirection },
    #[error("event `{0}` not found")]
    NotFound(String),
    #[error("middleware `{middleware}` failed: {reason}")]
    Processing { middleware: String, reason: String },
    #[error("event store: {0}")]
    Store(String),
    #[error("event engine is shutting down")]
    ShuttingDown,
}
