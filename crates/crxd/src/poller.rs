//! Per-extension poll loop
//!
//! Each tracked extension gets one `Poller` running as its own task:
//!
//! ```text
//! Idle -> Checking -> UpToDate ----------------------> Idle
//!                  -> Downloading -> Committed/Failed -> Idle
//! ```
//!
//! Checks and downloads for one extension are strictly sequential. Failures
//! never leave the task; the next tick simply tries again.

use chrono::Utc;
use crx_common::{is_newer_version, CacheEntry, ExtensionSpec, FetchError, FetchErrorKind, StoreError};
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::source::{ByteStream, SourceAdapter};

/// Upper bound on the random delay added to every sleep
const MAX_JITTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Checking,
    Downloading,
    Stopped,
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("update check failed: {0}")]
    Check(FetchError),

    #[error("download failed: {0}")]
    Download(FetchError),

    #[error("cache write failed: {0}")]
    Store(StoreError),
}

impl PollError {
    fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            PollError::Check(e) | PollError::Download(e) => Some(e),
            PollError::Store(_) => None,
        }
    }

    /// Whether the failure is worth noting on the cache entry. Transient and
    /// malformed responses are only logged.
    pub fn is_recorded(&self) -> bool {
        self.fetch_error().map_or(true, |e| !e.is_retryable())
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    UpToDate,
    Committed(CacheEntry),
    Failed(PollError),
}

pub struct Poller {
    spec: ExtensionSpec,
    source: Arc<dyn SourceAdapter>,
    store: Arc<CacheStore>,
    timeout: Duration,
    state: watch::Sender<PollerState>,
}

impl Poller {
    pub fn new(
        spec: ExtensionSpec,
        source: Arc<dyn SourceAdapter>,
        store: Arc<CacheStore>,
        timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(PollerState::Idle);
        Self {
            spec,
            source,
            store,
            timeout,
            state,
        }
    }

    pub fn spec(&self) -> &ExtensionSpec {
        &self.spec
    }

    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PollerState) {
        self.state.send_replace(state);
    }

    /// Run until cancelled. The first check happens right away.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Polling {} ({}) every {:?}",
            self.spec.label, self.spec.source, self.spec.interval
        );

        loop {
            // Dropping an in-flight write discards its temp file
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }

            let delay = self.spec.interval + jitter(self.spec.interval);
            debug!("Next check for {} in {:?}", self.spec.id, delay);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(PollerState::Stopped);
        debug!("Poller for {} stopped", self.spec.id);
    }

    /// One full check cycle.
    pub async fn poll_once(&self) -> PollOutcome {
        self.set_state(PollerState::Checking);
        let outcome = self.check_and_fetch().await;
        self.report(&outcome);
        self.set_state(PollerState::Idle);
        outcome
    }

    async fn check_and_fetch(&self) -> PollOutcome {
        let id = self.spec.id.as_str();

        let latest = match self
            .bounded("update check", self.source.latest_version(id))
            .await
        {
            Ok(latest) => latest,
            Err(e) => return PollOutcome::Failed(PollError::Check(e)),
        };

        if let Some(current) = self.store.read(id) {
            if !is_newer_version(&latest.version, &current.version) {
                debug!(
                    "{} is up to date ({}, source has {})",
                    id, current.version, latest.version
                );
                self.store.record_check(id, Utc::now());
                return PollOutcome::UpToDate;
            }
            info!(
                "Update available for {}: {} -> {}",
                self.spec.label, current.version, latest.version
            );
        } else {
            info!("Fetching {} {} (not cached)", self.spec.label, latest.version);
        }

        self.set_state(PollerState::Downloading);
        let stream = match self
            .bounded("download", self.source.download(id, &latest))
            .await
        {
            Ok(stream) => with_idle_timeout(stream, self.timeout),
            Err(e) => return PollOutcome::Failed(PollError::Download(e)),
        };

        match self.store.write(id, &latest, stream).await {
            Ok(entry) => PollOutcome::Committed(entry),
            Err(StoreError::Source(e)) => PollOutcome::Failed(PollError::Download(e)),
            Err(e) => PollOutcome::Failed(PollError::Store(e)),
        }
    }

    async fn bounded<T>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, FetchError>>,
    ) -> Result<T, FetchError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::transient(format!(
                "{} timed out after {:?}",
                what, self.timeout
            ))),
        }
    }

    fn report(&self, outcome: &PollOutcome) {
        let id = self.spec.id.as_str();
        let err = match outcome {
            PollOutcome::UpToDate => return,
            PollOutcome::Committed(entry) => {
                info!(
                    "Cached {} {} ({} bytes)",
                    self.spec.label, entry.version, entry.size
                );
                return;
            }
            PollOutcome::Failed(err) => err,
        };

        let cached = self.store.read(id);
        match err.fetch_error().map(|e| e.kind) {
            Some(FetchErrorKind::Transient) => warn!("{}: {}", id, err),
            Some(FetchErrorKind::Malformed) => error!("{}: {}", id, err),
            Some(FetchErrorKind::NotFound) => match &cached {
                Some(entry) => warn!("{}: {}, keeping cached {}", id, err, entry.version),
                None => warn!("{}: {}", id, err),
            },
            Some(FetchErrorKind::Unauthorized) | None => error!("{}: {}", id, err),
        }

        if err.is_recorded() {
            self.store.record_error(id, err.to_string());
        }
    }
}

/// Random extra delay for one sleep, at most a tenth of the interval.
pub fn jitter(interval: Duration) -> Duration {
    let bound = jitter_bound(interval).as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
}

pub fn jitter_bound(interval: Duration) -> Duration {
    (interval / 10).min(MAX_JITTER)
}

/// Fail the stream with a transient error if no chunk arrives in time.
fn with_idle_timeout(stream: ByteStream, limit: Duration) -> ByteStream {
    stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(limit, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => Some((
                Err(FetchError::transient(format!(
                    "download stalled for {:?}",
                    limit
                ))),
                None,
            )),
        }
    })
    .boxed()
}
