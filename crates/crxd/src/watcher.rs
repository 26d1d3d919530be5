//! Config file watcher
//!
//! Watches the directory holding the config file, since editors usually
//! replace the file instead of writing it in place. Bursts of events are
//! debounced before the file is parsed again and handed to the coordinator.

use anyhow::{Context, Result};
use crx_common::Config;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::logging::LogHandle;

const DEBOUNCE: Duration = Duration::from_millis(500);

pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Send `()` on `tx` whenever the config file may have changed.
    pub fn new(config_path: &Path, tx: mpsc::UnboundedSender<()>) -> Result<Self> {
        let file_name = config_path
            .file_name()
            .context("Config path has no file name")?
            .to_os_string();
        let dir = match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if touches_config(&event, &file_name) {
                    debug!("Config event: {:?}", event.kind);
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("Config watch error: {}", e),
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        info!("Watching {} for changes", config_path.display());
        Ok(Self { _watcher: watcher })
    }
}

fn touches_config(event: &Event, file_name: &OsStr) -> bool {
    !matches!(event.kind, EventKind::Access(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name))
}

/// Reload the config on every (debounced) change until the channel closes.
pub async fn reload_loop(
    config_path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<()>,
    coordinator: Arc<Coordinator>,
    log: LogHandle,
    mut running: Config,
) {
    while rx.recv().await.is_some() {
        let mut closed = false;
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        if let Some(config) = reload(&config_path, &coordinator, &log, &running).await {
            running = config;
        }
        if closed {
            break;
        }
    }
    debug!("Config reload loop finished");
}

async fn reload(
    config_path: &Path,
    coordinator: &Coordinator,
    log: &LogHandle,
    running: &Config,
) -> Option<Config> {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Ignoring config change, keeping current extensions: {}", e);
            return None;
        }
    };
    if &config == running {
        debug!("Config unchanged");
        return None;
    }

    info!("Config changed, reloading");
    log.apply_config(&config);
    warn_restart_only(running, &config);

    // Already validated by load
    match config.extension_specs() {
        Ok(specs) => {
            coordinator.reconcile(specs).await;
        }
        Err(e) => {
            error!("Ignoring config change: {}", e);
            return None;
        }
    }
    Some(config)
}

/// Settings that only take effect after a restart.
fn restart_only_changes(old: &Config, new: &Config) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if old.listen != new.listen {
        changed.push("listen");
    }
    if old.cache_dir != new.cache_dir {
        changed.push("cache-dir");
    }
    if old.manifest_path != new.manifest_path {
        changed.push("manifest-path");
    }
    if old.prefix != new.prefix {
        changed.push("prefix");
    }
    if old.base != new.base {
        changed.push("base");
    }
    if old.timeout != new.timeout {
        changed.push("timeout");
    }
    changed
}

fn warn_restart_only(old: &Config, new: &Config) {
    let changed = restart_only_changes(old, new);
    if !changed.is_empty() {
        warn!(
            "Changes to {} take effect after a restart",
            changed.join(", ")
        );
    }
}
