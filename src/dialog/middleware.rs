use async_trait::async_trait;
use converse_sdk::{Event, WellKnownFlag};
use serde_json::json;
use tracing::{debug, warn};

use super::DialogError;
use super::engine::DialogEngine;
use crate::events::{Middleware, MiddlewareOutcome};

pub const DIALOG_MIDDLEWARE: &str = "dialog-engine";

/// Last step of the incoming chain: hands the event to the dialog engine
/// unless a previous step set `skip_dialog_engine`.
pub struct DialogMiddleware {
    engine: DialogEngine,
}

impl DialogMiddleware {
    pub fn new(engine: DialogEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Middleware for DialogMiddleware {
    async fn handle(&self, event: &mut Event) -> anyhow::Result<MiddlewareOutcome> {
        if event.flags.has(WellKnownFlag::SkipDialogEngine) {
            debug!(event_id = %event.id, "dialog engine skipped by flag");
            return Ok(MiddlewareOutcome::Continue);
        }

        let session_id = DialogEngine::create_id(event);
        match self.engine.process_event(&session_id, event).await {
            Ok(replies) => {
                event.state.insert("session_id".into(), json!(session_id));
                if !replies.is_empty() {
                    event.flags.set(WellKnownFlag::AlreadyReplied, true);
                }
                Ok(MiddlewareOutcome::Continue)
            }
            Err(DialogError::UnknownBot(bot_id)) => {
                warn!(event_id = %event.id, bot_id, "no flows for bot, event not routed to a dialog");
                Ok(MiddlewareOutcome::Continue)
            }
            Err(err) => Err(err.into()),
        }
    }
}
