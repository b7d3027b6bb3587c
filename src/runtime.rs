use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::dialog::middleware::DIALOG_MIDDLEWARE;
use crate::dialog::script::ScriptHost;
use crate::dialog::{DialogEngine, DialogMiddleware, FlowRegistry, InMemorySessionStore};
use crate::distributed::{Fabric, JobService, LocalFabric, PgFabric};
use crate::events::middleware::LAST_PRIORITY;
use crate::events::{EventEngine, EventStore, InMemoryEventStore, MiddlewareRegistration};
use crate::watcher::DirectoryWatcher;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one instance runs, wired together. Owns the background tasks;
/// call `shutdown` to stop them.
pub struct Runtime {
    config: RuntimeConfig,
    events: EventEngine,
    dialog: DialogEngine,
    jobs: JobService,
    flows: FlowRegistry,
    watcher: Option<DirectoryWatcher>,
    listener: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Runtime {
    /// Uses the Postgres fabric when `database_url` is set, otherwise an
    /// in-process one.
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        let fabric: Arc<dyn Fabric> = match &config.database_url {
            Some(url) => Arc::new(PgFabric::connect(url).await.context("connecting the postgres fabric")?),
            None => Arc::new(LocalFabric::new()),
        };
        Self::with_fabric(config, fabric, Arc::new(InMemoryEventStore::new())).await
    }

    pub async fn with_fabric(
        config: RuntimeConfig,
        fabric: Arc<dyn Fabric>,
        store: Arc<dyn EventStore>,
    ) -> Result<Self> {
        let jobs = JobService::new(fabric, config.instance_id.clone());
        let scripts = Arc::new(ScriptHost::new());
        let flows = FlowRegistry::new(jobs.clone(), scripts.clone(), config.lock_ttl());

        let watcher = match &config.flows_dir {
            Some(dir) => {
                let bots = flows
                    .load_bot_dir(dir)
                    .with_context(|| format!("loading flows from {}", dir.display()))?;
                info!(?bots, dir = %dir.display(), "flows loaded");
                Some(flows.watch(dir.clone()).await?)
            }
            None => None,
        };

        let events = EventEngine::new(store, config.middleware_timeout());
        let dialog = DialogEngine::new(
            flows.clone(),
            InMemorySessionStore::new(config.session_timeout_secs),
            events.clone(),
            scripts,
            config.entry_flow.clone(),
        );
        events.register(
            MiddlewareRegistration::incoming(DIALOG_MIDDLEWARE, Arc::new(DialogMiddleware::new(dialog.clone())))
                .priority(LAST_PRIORITY)
                .description("routes incoming events to the dialog engine"),
        )?;

        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen(
            jobs.clone(),
            flows.clone(),
            config.flows_dir.clone(),
            cancel.clone(),
        ));

        info!(instance_id = %config.instance_id, "runtime started");
        Ok(Self {
            config,
            events,
            dialog,
            jobs,
            flows,
            watcher,
            listener,
            cancel,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEngine {
        &self.events
    }

    pub fn dialog(&self) -> &DialogEngine {
        &self.dialog
    }

    pub fn distributed(&self) -> &JobService {
        &self.jobs
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    /// Lets queued events finish (bounded), then stops every task and
    /// releases the fabric.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher {
            watcher.shutdown();
        }
        if !self.events.wait_idle(DRAIN_TIMEOUT).await {
            warn!("events still queued at shutdown, dropping them");
        }
        self.events.shutdown();
        self.dialog.sessions().clear();
        if let Err(e) = self.listener.await {
            if !e.is_cancelled() {
                error!(?e, "broadcast listener panicked");
            }
        }
        self.jobs.fabric().shutdown().await;
        info!(instance_id = %self.config.instance_id, "runtime stopped");
    }
}

async fn listen(jobs: JobService, flows: FlowRegistry, flows_dir: Option<PathBuf>, cancel: CancellationToken) {
    let mut feed = jobs.subscribe();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = feed.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let Some(dir) = &flows_dir else {
            debug!(topic = %message.topic, "no flows directory, broadcast ignored");
            continue;
        };
        if let Err(e) = flows.apply_broadcast(&message, dir) {
            error!(topic = %message.topic, origin = %message.origin, %e, "applying broadcast failed");
        }
    }
    debug!("broadcast listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use converse_sdk::{Event, EventDestination, EventDirection, EventPayload};
    use std::fs;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const MAIN: &str = r#"
start_node: start
nodes:
  start:
    next:
      - node: greet
  greet:
    on_enter:
      - type: say
        text: "Hello!"
"#;

    fn config(dir: Option<PathBuf>) -> RuntimeConfig {
        RuntimeConfig {
            instance_id: "test".into(),
            flows_dir: dir,
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_runtime_wires_dialog_middleware_last() {
        let runtime = Runtime::new(config(None)).await.unwrap();
        assert_eq!(runtime.events().middleware_names(EventDirection::Incoming), vec![DIALOG_MIDDLEWARE]);
        assert_eq!(runtime.distributed().instance_id(), "test");
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_answers_from_flows_dir() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("demo")).unwrap();
        fs::write(tmp.path().join("demo").join("main.yaml"), MAIN).unwrap();

        let runtime = Runtime::new(config(Some(tmp.path().to_path_buf()))).await.unwrap();
        assert_eq!(runtime.flows().flows("demo"), vec!["main"]);

        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        runtime.events().subscribe_outgoing(Arc::new(tx));
        runtime
            .events()
            .send_event(Event::incoming(
                EventDestination::new("webchat", "demo", "c1", "u1"),
                EventPayload::text("hi"),
            ))
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply.payload.as_text(), Some("Hello!"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_flows_dir_fails_startup() {
        let result = Runtime::new(config(Some(PathBuf::from("./no/such/flows")))).await;
        assert!(result.is_err());
    }
}
