use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use super::flow::{Flow, FlowError, FlowSet};
use super::script::ScriptHost;
use crate::distributed::{BroadcastMessage, JobService};
use crate::watcher::{DirectoryWatcher, WatchedType};

/// Broadcast topic announcing that a bot's flows changed on disk.
pub const RELOADED_TOPIC: &str = "flows.reloaded";
pub const FLOW_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Compiled flows per bot. Clones share the same maps.
#[derive(Clone)]
pub struct FlowRegistry {
    bots: Arc<DashMap<String, Arc<FlowSet>>>,
    scripts: Arc<ScriptHost>,
    jobs: JobService,
    lock_ttl: Duration,
}

impl FlowRegistry {
    pub fn new(jobs: JobService, scripts: Arc<ScriptHost>, lock_ttl: Duration) -> Self {
        Self {
            bots: Arc::new(DashMap::new()),
            scripts,
            jobs,
            lock_ttl,
        }
    }

    /// Compiles `flows` and replaces whatever the bot had.
    pub fn register(&self, bot_id: &str, flows: Vec<Flow>) -> Result<(), FlowError> {
        let set = FlowSet::compile(flows, &self.scripts)?;
        info!(bot_id, flows = ?set.names(), "flows registered");
        self.bots.insert(bot_id.to_string(), Arc::new(set));
        Ok(())
    }

    pub fn bot(&self, bot_id: &str) -> Option<Arc<FlowSet>> {
        self.bots.get(bot_id).map(|set| set.clone())
    }

    pub fn get(&self, bot_id: &str, flow: &str) -> Option<Flow> {
        self.bot(bot_id).and_then(|set| set.get(flow).cloned())
    }

    pub fn flows(&self, bot_id: &str) -> Vec<String> {
        self.bot(bot_id).map(|set| set.names()).unwrap_or_default()
    }

    pub fn bots(&self) -> Vec<String> {
        let mut bots: Vec<String> = self.bots.iter().map(|e| e.key().clone()).collect();
        bots.sort();
        bots
    }

    pub fn remove_bot(&self, bot_id: &str) {
        if self.bots.remove(bot_id).is_some() {
            info!(bot_id, "bot flows removed");
        }
    }

    /// Loads every flow file directly inside `bot_dir`. A directory without
    /// flow files unloads the bot.
    pub fn load_bot(&self, bot_id: &str, bot_dir: &Path) -> Result<usize, FlowError> {
        let mut paths = Vec::new();
        if bot_dir.is_dir() {
            let entries = fs::read_dir(bot_dir).map_err(|e| FlowError::Io {
                path: bot_dir.display().to_string(),
                reason: e.to_string(),
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && has_flow_extension(&path) {
                    paths.push(path);
                }
            }
        }
        paths.sort();

        if paths.is_empty() {
            self.remove_bot(bot_id);
            return Ok(0);
        }
        let flows = paths
            .iter()
            .map(|path| Flow::load_from_file(path))
            .collect::<Result<Vec<_>, _>>()?;
        let count = flows.len();
        self.register(bot_id, flows)?;
        Ok(count)
    }

    /// Loads `<dir>/<bot_id>/*.{json,yaml,yml}` for every bot directory.
    pub fn load_bot_dir(&self, dir: &Path) -> Result<Vec<String>, FlowError> {
        let entries = fs::read_dir(dir).map_err(|e| FlowError::Io {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut loaded = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(bot_id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if self.load_bot(&bot_id, &path)? > 0 {
                loaded.push(bot_id);
            }
        }
        loaded.sort();
        Ok(loaded)
    }

    /// Reloads one bot under the cluster lock `flows:reload:<bot>` and tells
    /// the other instances to do the same.
    #[tracing::instrument(skip(self, dir))]
    pub async fn reload_bot(&self, bot_id: &str, dir: &Path) -> Result<()> {
        let lock = format!("flows:reload:{bot_id}");
        let bot_dir = dir.join(bot_id);
        let count = self
            .jobs
            .with_lock(&lock, self.lock_ttl, self.lock_ttl, async { self.load_bot(bot_id, &bot_dir) })
            .await
            .context("flow reload lock")??;
        debug!(count, "bot reloaded");

        self.jobs
            .broadcast(RELOADED_TOPIC, json!({ "bot_id": bot_id }))
            .await
            .context("announcing flow reload")?;
        Ok(())
    }

    /// Applies a reload announced by another instance. Returns whether
    /// anything was reloaded.
    pub fn apply_broadcast(&self, message: &BroadcastMessage, dir: &Path) -> Result<bool, FlowError> {
        if message.topic != RELOADED_TOPIC || message.origin == self.jobs.instance_id() {
            return Ok(false);
        }
        let Some(bot_id) = message.payload.get("bot_id").and_then(|v| v.as_str()) else {
            warn!(payload = %message.payload, "reload broadcast without bot_id");
            return Ok(false);
        };
        self.load_bot(bot_id, &dir.join(bot_id))?;
        info!(bot_id, origin = %message.origin, "flows reloaded on peer request");
        Ok(true)
    }

    /// Hot reload: any flow file change under `dir` reloads its bot.
    pub async fn watch(&self, dir: PathBuf) -> Result<DirectoryWatcher> {
        let watcher = FlowWatcher {
            registry: self.clone(),
            root: dir.clone(),
        };
        DirectoryWatcher::new(dir, Arc::new(watcher), FLOW_EXTENSIONS, false, true).await
    }
}

fn has_flow_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| FLOW_EXTENSIONS.contains(&e))
}

struct FlowWatcher {
    registry: FlowRegistry,
    root: PathBuf,
}

impl FlowWatcher {
    /// `<root>/<bot>/<file>` → `bot`
    fn bot_of(&self, path: &Path) -> Option<String> {
        let bot_dir = path.parent()?;
        if bot_dir.parent()? != self.root.as_path() {
            return None;
        }
        bot_dir.file_name()?.to_str().map(str::to_string)
    }

    async fn reload(&self, path: &Path) -> Result<()> {
        match self.bot_of(path) {
            Some(bot_id) => self.registry.reload_bot(&bot_id, &self.root).await,
            None => {
                debug!(?path, "flow file outside a bot directory, ignored");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl WatchedType for FlowWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        has_flow_extension(path)
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        self.reload(path).await
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        self.reload(path).await
    }
}
