pub mod engine;
pub mod flow;
pub mod middleware;
pub mod registry;
pub mod script;
pub mod session;

use thiserror::Error;

pub use engine::DialogEngine;
pub use flow::{Action, Flow, FlowError, FlowSet, Node, Transition};
pub use middleware::DialogMiddleware;
pub use registry::FlowRegistry;
pub use session::{DialogSession, InMemorySessionStore, SessionStore};

#[derive(Debug, Error)]
pub enum DialogError {
    #[error("bot `{bot_id}` has no flow `{flow}`")]
    UnknownFlow { bot_id: String, flow: String },
    #[error("flow `{flow}` has no node `{node}`")]
    UnknownNode { flow: String, node: String },
    #[error("no flows loaded for bot `{0}`")]
    UnknownBot(String),
    #[error("dialog processing failed: {0}")]
    Processing(String),
}
