//! Scripted source for tests.
//!
//! ```rust,ignore
//! let fake = FakeSource::new();
//! fake.publish("1.0.0", b"package bytes");
//! fake.fail_next_download(FetchError::transient("connection reset"));
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use crx_common::{FetchError, VersionInfo};
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ByteStream, SourceAdapter};

struct FakeState {
    latest: Result<VersionInfo, FetchError>,
    packages: HashMap<String, Vec<u8>>,
    check_failures: VecDeque<FetchError>,
    download_failures: VecDeque<FetchError>,
    chunk_delay: Option<Duration>,
    check_calls: usize,
    download_calls: usize,
}

/// Source with pre-configured versions and failures.
pub struct FakeSource {
    state: Mutex<FakeState>,
}

impl FakeSource {
    /// A source that knows no extension until something is published.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                latest: Err(FetchError::not_found("nothing published")),
                packages: HashMap::new(),
                check_failures: VecDeque::new(),
                download_failures: VecDeque::new(),
                chunk_delay: None,
                check_calls: 0,
                download_calls: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `version` the latest, served with the given bytes. The version
    /// info carries the package's sha256 and size.
    pub fn publish(&self, version: &str, bytes: &[u8]) {
        let mut info = VersionInfo::new(version, format!("fake://{}", version));
        info.sha256 = Some(hex::encode(Sha256::digest(bytes)));
        info.size = Some(bytes.len() as u64);

        let mut state = self.state();
        state.packages.insert(version.to_string(), bytes.to_vec());
        state.latest = Ok(info);
    }

    /// Advertise a version without integrity data.
    pub fn publish_unverified(&self, version: &str, bytes: &[u8]) {
        let mut state = self.state();
        state.packages.insert(version.to_string(), bytes.to_vec());
        state.latest = Ok(VersionInfo::new(version, format!("fake://{}", version)));
    }

    /// Every check fails with `err` until something is published again.
    pub fn set_check_error(&self, err: FetchError) {
        self.state().latest = Err(err);
    }

    pub fn fail_next_check(&self, err: FetchError) {
        self.state().check_failures.push_back(err);
    }

    pub fn fail_next_download(&self, err: FetchError) {
        self.state().download_failures.push_back(err);
    }

    /// Sleep before each of the two chunks a download yields.
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.state().chunk_delay = Some(delay);
    }

    pub fn check_calls(&self) -> usize {
        self.state().check_calls
    }

    pub fn download_calls(&self) -> usize {
        self.state().download_calls
    }
}

impl Default for FakeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for FakeSource {
    async fn latest_version(&self, _extension_id: &str) -> Result<VersionInfo, FetchError> {
        let mut state = self.state();
        state.check_calls += 1;
        if let Some(err) = state.check_failures.pop_front() {
            return Err(err);
        }
        state.latest.clone()
    }

    async fn download(
        &self,
        _extension_id: &str,
        version: &VersionInfo,
    ) -> Result<ByteStream, FetchError> {
        let mut state = self.state();
        state.download_calls += 1;
        if let Some(err) = state.download_failures.pop_front() {
            return Err(err);
        }

        let bytes = state
            .packages
            .get(&version.version)
            .cloned()
            .ok_or_else(|| FetchError::not_found(format!("no package for {}", version.version)))?;
        let delay = state.chunk_delay;

        let mid = bytes.len() / 2;
        let chunks = vec![
            Bytes::copy_from_slice(&bytes[..mid]),
            Bytes::copy_from_slice(&bytes[mid..]),
        ];

        Ok(stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, FetchError>(chunk)
            })
            .boxed())
    }
}
