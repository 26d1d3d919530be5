//! Source adapters
//!
//! A source can report the latest version of an extension and stream the
//! package bytes for that version. One implementation per source kind,
//! picked by the `SourceKind` tag on the extension spec.
//!
//! Production code uses `WebStoreSource`; tests use `FakeSource` with
//! scripted responses.

pub mod fake;
pub mod webstore;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use crx_common::{ExtensionSpec, FetchError, SourceKind, VersionInfo};
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

pub use fake::FakeSource;
pub use webstore::WebStoreSource;

/// Package bytes as they arrive from the source.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Capability every source kind implements.
///
/// Adapters hold no state between calls apart from their HTTP connection
/// pool.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Ask the source for the latest available version.
    async fn latest_version(&self, extension_id: &str) -> Result<VersionInfo, FetchError>;

    /// Start downloading the package described by `version`.
    async fn download(
        &self,
        extension_id: &str,
        version: &VersionInfo,
    ) -> Result<ByteStream, FetchError>;
}

/// Builds the adapter for an extension spec.
pub trait SourceFactory: Send + Sync {
    fn adapter_for(&self, spec: &ExtensionSpec) -> Result<Arc<dyn SourceAdapter>>;
}

impl<F> SourceFactory for F
where
    F: Fn(&ExtensionSpec) -> Arc<dyn SourceAdapter> + Send + Sync,
{
    fn adapter_for(&self, spec: &ExtensionSpec) -> Result<Arc<dyn SourceAdapter>> {
        Ok(self(spec))
    }
}

/// Factory for real HTTP-backed sources.
///
/// Clients are shared between extensions that use the same proxy so they
/// share a connection pool.
pub struct HttpSourceFactory {
    connect_timeout: Duration,
    webstore_base: String,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl HttpSourceFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            webstore_base: webstore::WEBSTORE_BASE.to_string(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Point web store adapters at another host (used by tests).
    pub fn with_webstore_base(mut self, base: impl Into<String>) -> Self {
        self.webstore_base = base.into();
        self
    }

    fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let key = proxy.map(str::to_string);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(format!("crxd/{}", crx_common::VERSION))
            .connect_timeout(self.connect_timeout);
        if let Some(proxy) = proxy {
            debug!("Using proxy {} for source requests", proxy);
            builder = builder.proxy(
                reqwest::Proxy::all(proxy).with_context(|| format!("Invalid proxy {}", proxy))?,
            );
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl SourceFactory for HttpSourceFactory {
    fn adapter_for(&self, spec: &ExtensionSpec) -> Result<Arc<dyn SourceAdapter>> {
        let client = self.client(spec.proxy.as_deref())?;
        match &spec.source {
            SourceKind::WebStore { prodversion } => Ok(Arc::new(
                WebStoreSource::new(client, prodversion.clone())
                    .with_base_url(self.webstore_base.clone()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(proxy: Option<&str>) -> ExtensionSpec {
        ExtensionSpec::new(
            "aapbdbdomjkkjkaonfhkkikfgjllcleb",
            SourceKind::WebStore {
                prodversion: "128.0".into(),
            },
            Duration::from_secs(60),
        )
        .with_proxy(proxy.map(str::to_string))
    }

    #[test]
    fn test_clients_are_pooled_per_proxy() {
        let factory = HttpSourceFactory::new(Duration::from_secs(5));
        factory.adapter_for(&spec(None)).unwrap();
        factory.adapter_for(&spec(None)).unwrap();
        factory.adapter_for(&spec(Some("http://proxy.local:3128"))).unwrap();

        assert_eq!(factory.clients.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_proxy_is_an_error() {
        let factory = HttpSourceFactory::new(Duration::from_secs(5));
        assert!(factory.adapter_for(&spec(Some("not a url"))).is_err());
    }

    #[test]
    fn test_closure_factory() {
        let fake = Arc::new(FakeSource::new());
        let factory = move |_: &ExtensionSpec| -> Arc<dyn SourceAdapter> { fake.clone() };
        assert!(factory.adapter_for(&spec(None)).is_ok());
    }
}
