//! Poller supervision
//!
//! The coordinator owns one running `Poller` per tracked extension and
//! brings that set in line with the configuration through `reconcile`.
//! Only one reconcile runs at a time; the poller map lock is held for the
//! whole diff.
//!
//! Readers get committed cache entries through `snapshot`, which never waits
//! on a poller or an in-flight download.

use crx_common::{CacheEntry, ExtensionSpec};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::poller::Poller;
use crate::source::{SourceAdapter, SourceFactory};

struct PollerHandle {
    spec: ExtensionSpec,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }

    async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("Poller for {} panicked", self.spec.id);
            }
        }
    }
}

/// What a reconcile pass did, by extension id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.restarted.is_empty()
    }
}

pub struct Coordinator {
    store: Arc<CacheStore>,
    sources: Arc<dyn SourceFactory>,
    timeout: Duration,
    pollers: Mutex<HashMap<String, PollerHandle>>,
}

impl Coordinator {
    pub fn new(store: Arc<CacheStore>, sources: Arc<dyn SourceFactory>, timeout: Duration) -> Self {
        Self {
            store,
            sources,
            timeout,
            pollers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Launch pollers for the initial configuration.
    ///
    /// Cached extensions that are no longer configured are purged, the same
    /// as if they had been removed by a reload.
    pub async fn start(&self, specs: Vec<ExtensionSpec>) -> ReconcileReport {
        let report = self.reconcile(specs).await;
        info!(
            "Tracking {} extensions ({} purged from cache)",
            report.added.len(),
            report.removed.len()
        );
        report
    }

    /// Bring the running pollers in line with `specs`.
    ///
    /// Removed extensions are stopped and purged from the cache. Extensions
    /// whose spec changed are restarted and keep their cached package.
    pub async fn reconcile(&self, specs: Vec<ExtensionSpec>) -> ReconcileReport {
        let mut pollers = self.pollers.lock().await;
        let mut report = ReconcileReport::default();

        let wanted: HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();

        let gone: Vec<String> = pollers
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            if let Some(handle) = pollers.remove(&id) {
                info!("Stopping poller for {}", handle.spec.label);
                handle.shutdown().await;
            }
            self.purge(&id).await;
            report.removed.push(id);
        }

        for id in self.store.ids() {
            if !wanted.contains(id.as_str()) && !pollers.contains_key(&id) {
                info!("Purging {} from cache (no longer configured)", id);
                self.purge(&id).await;
                report.removed.push(id);
            }
        }

        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(spec.id.clone()) {
                warn!("Ignoring duplicate entry for {}", spec.id);
                continue;
            }
            if pollers.get(&spec.id).is_some_and(|h| h.spec == spec) {
                report.unchanged.push(spec.id);
                continue;
            }

            let source = match self.sources.adapter_for(&spec) {
                Ok(source) => source,
                Err(e) if pollers.contains_key(&spec.id) => {
                    error!(
                        "Cannot apply new settings for {}, previous settings stay in effect: {:#}",
                        spec.label, e
                    );
                    report.unchanged.push(spec.id);
                    continue;
                }
                Err(e) => {
                    error!("Cannot poll {}: {:#}", spec.id, e);
                    continue;
                }
            };

            // The old poller must be gone before its replacement starts
            let restarted = match pollers.remove(&spec.id) {
                Some(old) => {
                    info!("Restarting poller for {} with new settings", spec.label);
                    old.shutdown().await;
                    true
                }
                None => false,
            };

            let id = spec.id.clone();
            pollers.insert(id.clone(), self.spawn(spec, source));
            if restarted {
                report.restarted.push(id);
            } else {
                report.added.push(id);
            }
        }

        if report.is_noop() {
            debug!("Reconcile: nothing changed");
        } else {
            info!(
                "Reconcile: {} added, {} removed, {} restarted, {} unchanged",
                report.added.len(),
                report.removed.len(),
                report.restarted.len(),
                report.unchanged.len()
            );
        }
        report
    }

    fn spawn(&self, spec: ExtensionSpec, source: Arc<dyn SourceAdapter>) -> PollerHandle {
        let cancel = CancellationToken::new();
        let poller = Poller::new(spec.clone(), source, self.store.clone(), self.timeout);
        let task = tokio::spawn(poller.run(cancel.clone()));
        PollerHandle { spec, cancel, task }
    }

    async fn purge(&self, extension_id: &str) {
        if let Err(e) = self.store.remove(extension_id).await {
            error!("Failed to purge {} from cache: {}", extension_id, e);
        }
    }

    /// Last committed entry for every cached extension.
    pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        self.store.snapshot()
    }

    pub fn entry(&self, extension_id: &str) -> Option<CacheEntry> {
        self.store.read(extension_id)
    }

    /// Specs of the running pollers, sorted by id.
    pub async fn tracked(&self) -> Vec<ExtensionSpec> {
        let pollers = self.pollers.lock().await;
        let mut specs: Vec<ExtensionSpec> = pollers.values().map(|h| h.spec.clone()).collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    /// Cancel every poller and wait for them to finish.
    pub async fn stop(&self) {
        let mut pollers = self.pollers.lock().await;
        let handles: Vec<PollerHandle> = pollers.drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }

        info!("Stopping {} pollers", handles.len());
        for handle in &handles {
            handle.cancel.cancel();
        }
        futures_util::future::join_all(handles.into_iter().map(PollerHandle::join)).await;
    }
}
