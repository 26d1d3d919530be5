//! Web store source
//!
//! Asks the store's update service for the latest version of an extension
//! (same gupdate protocol crxd serves) and downloads the package from the
//! returned codebase URL.

use async_trait::async_trait;
use crx_common::{is_valid_version, FetchError, GUpdate, VersionInfo};
use futures_util::StreamExt;
use reqwest::StatusCode;
use tracing::debug;

use super::{ByteStream, SourceAdapter};

/// Default update service host
pub const WEBSTORE_BASE: &str = "https://clients2.google.com";

const UPDATE_PATH: &str = "/service/update2/crx";

pub struct WebStoreSource {
    client: reqwest::Client,
    base_url: String,
    prodversion: String,
}

impl WebStoreSource {
    pub fn new(client: reqwest::Client, prodversion: impl Into<String>) -> Self {
        Self {
            client,
            base_url: WEBSTORE_BASE.to_string(),
            prodversion: prodversion.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn update_url(&self) -> String {
        format!("{}{}", self.base_url, UPDATE_PATH)
    }
}

/// Map a non-success HTTP status to a fetch error.
fn status_error(status: StatusCode, what: &str) -> FetchError {
    let message = format!("{} returned HTTP {}", what, status);
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::not_found(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            FetchError::transient(message)
        }
        s if s.is_server_error() => FetchError::transient(message),
        _ => FetchError::malformed(message),
    }
}

fn request_error(e: reqwest::Error) -> FetchError {
    if e.is_decode() {
        FetchError::malformed(e.to_string())
    } else {
        // connect, timeout, body and redirect failures are all network trouble
        FetchError::transient(e.to_string())
    }
}

/// Pull the version info for `extension_id` out of a gupdate response.
pub fn parse_update_response(extension_id: &str, text: &str) -> Result<VersionInfo, FetchError> {
    let gupdate = GUpdate::from_xml(text).map_err(|e| FetchError::malformed(e.to_string()))?;

    let app = gupdate
        .app(extension_id)
        .ok_or_else(|| FetchError::not_found(format!("{} missing from response", extension_id)))?;
    if !app.is_ok() {
        return Err(FetchError::not_found(format!(
            "store reports status {:?} for {}",
            app.status, extension_id
        )));
    }

    let (check, codebase, version) = app
        .updatechecks
        .iter()
        .find_map(|c| Some((c, c.codebase.clone()?, c.version.clone()?)))
        .ok_or_else(|| FetchError::not_found(format!("no update offered for {}", extension_id)))?;

    if !is_valid_version(&version) {
        return Err(FetchError::malformed(format!(
            "unusable version {:?} for {}",
            version, extension_id
        )));
    }

    let mut info = VersionInfo::new(version, codebase);
    info.sha256 = check
        .hash_sha256
        .clone()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_ascii_lowercase());
    info.size = check.size;
    info.prodversionmin = check.prodversionmin.clone().filter(|v| !v.is_empty());
    Ok(info)
}

#[async_trait]
impl SourceAdapter for WebStoreSource {
    async fn latest_version(&self, extension_id: &str) -> Result<VersionInfo, FetchError> {
        // No updatecheck element comes back without `&uc`
        let x = format!("id={}&uc", extension_id);
        let resp = self
            .client
            .get(self.update_url())
            .query(&[
                ("response", "updatecheck"),
                ("acceptformat", "crx2,crx3"),
                ("prodversion", self.prodversion.as_str()),
                ("x", x.as_str()),
            ])
            .send()
            .await
            .map_err(request_error)?;
        debug!("Update check sent to {}", resp.url());

        if !resp.status().is_success() {
            return Err(status_error(resp.status(), "update check"));
        }

        let text = resp.text().await.map_err(request_error)?;
        debug!("Update check response for {}: {}", extension_id, text);

        parse_update_response(extension_id, &text)
    }

    async fn download(
        &self,
        extension_id: &str,
        version: &VersionInfo,
    ) -> Result<ByteStream, FetchError> {
        debug!(
            "Downloading {} {} from {}",
            extension_id, version.version, version.download_url
        );
        let resp = self
            .client
            .get(&version.download_url)
            .send()
            .await
            .map_err(request_error)?;

        if !resp.status().is_success() {
            return Err(status_error(resp.status(), "download"));
        }

        if let (Some(expected), Some(length)) = (version.size, resp.content_length()) {
            if expected != length {
                debug!(
                    "Content-Length {} differs from advertised size {} for {}",
                    length, expected, extension_id
                );
            }
        }

        Ok(resp.bytes_stream().map(|chunk| chunk.map_err(request_error)).boxed())
    }
}
