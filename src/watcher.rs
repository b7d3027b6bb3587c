use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Something that is reloaded from disk when files under a directory change.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// The tasks watching one directory. Dropping it does not stop them; call
/// `shutdown`.
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Watches `dir` recursively for files matching `exts` or
    /// `WatchedType::is_relevant`. With `initial_scan` every matching entry
    /// directly inside `dir` is loaded first; with `enable_retry` failed
    /// loads of that scan are retried a few times.
    pub async fn new(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watcher_impl.is_relevant(&path) || is_valid_extension(&path, exts) {
                    try_reload(&watcher_impl, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let mut watcher = PollWatcher::new(
            move |res| {
                // receiver gone means nobody is listening any more
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )
        .context("creating poll watcher")?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", dir.display()))?;

        // owns the notify watcher for as long as the task lives
        let handle_watcher = tokio::spawn(async move {
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();
        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(CreateKind::Any) | EventKind::Modify(ModifyKind::Data(_)),
                        paths,
                        ..
                    }) => {
                        for path in paths {
                            if matches(&watcher_impl, &path, &exts) {
                                let watched = watcher_impl.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = watched.on_create_or_modify(&path).await {
                                        warn!(?path, ?e, "Failed to handle create/modify");
                                    }
                                });
                            }
                        }
                    }
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        paths,
                        ..
                    }) => {
                        for path in paths {
                            if matches(&watcher_impl, &path, &exts) {
                                if let Err(e) = watcher_impl.on_remove(&path).await {
                                    warn!(?path, ?e, "Failed to handle removal");
                                }
                            }
                        }
                    }
                    Err(e) => warn!(?e, "Watcher error"),
                    _ => {}
                }
            }
        });

        Ok(DirectoryWatcher {
            handles: vec![handle_dispatch, handle_watcher],
        })
    }

    /// Aborts the watcher tasks. No more callbacks fire afterwards.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn matches(watched: &Arc<dyn WatchedType>, path: &Path, exts: &[String]) -> bool {
    watched.is_relevant(path)
        || path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| exts.iter().any(|x| x == e))
}

fn is_valid_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.contains(&ext))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
