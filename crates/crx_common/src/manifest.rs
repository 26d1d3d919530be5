//! Update manifest (gupdate protocol 2.0) model.
//!
//! The same document shape is returned by the web store's update service and
//! served by crxd:
//!
//! ```xml
//! <gupdate xmlns="http://www.google.com/update2/response" protocol="2.0">
//!   <app appid="<id>" status="ok">
//!     <updatecheck codebase="<url>" hash_sha256="" size="" version=""/>
//!   </app>
//! </gupdate>
//! ```

use quick_xml::events::Event;
use quick_xml::se::Serializer;
use quick_xml::Reader;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::types::CacheEntry;

pub const GUPDATE_NAMESPACE: &str = "http://www.google.com/update2/response";
pub const GUPDATE_PROTOCOL: &str = "2.0";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to parse update manifest: {0}")]
    Parse(String),

    #[error("Failed to write update manifest: {0}")]
    Write(String),
}

/// Sizes come back as empty strings from some store responses.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.trim().parse().ok()))
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateCheck {
    #[serde(rename = "@codebase", default, skip_serializing_if = "Option::is_none")]
    pub codebase: Option<String>,

    #[serde(rename = "@hash_sha256", default, skip_serializing_if = "Option::is_none")]
    pub hash_sha256: Option<String>,

    #[serde(
        rename = "@size",
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<u64>,

    #[serde(rename = "@status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(rename = "@version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(rename = "@prodversionmin", default, skip_serializing_if = "Option::is_none")]
    pub prodversionmin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    #[serde(rename = "@appid")]
    pub appid: String,

    #[serde(rename = "@status", default)]
    pub status: String,

    #[serde(rename = "updatecheck", default)]
    pub updatechecks: Vec<UpdateCheck>,
}

impl App {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "gupdate")]
pub struct GUpdate {
    #[serde(rename = "@xmlns", default = "default_namespace")]
    pub xmlns: String,

    #[serde(rename = "@protocol", default = "default_protocol")]
    pub protocol: String,

    #[serde(rename = "app", default)]
    pub apps: Vec<App>,
}

fn default_namespace() -> String {
    GUPDATE_NAMESPACE.to_string()
}

fn default_protocol() -> String {
    GUPDATE_PROTOCOL.to_string()
}

impl Default for GUpdate {
    fn default() -> Self {
        Self {
            xmlns: default_namespace(),
            protocol: default_protocol(),
            apps: Vec::new(),
        }
    }
}

impl GUpdate {
    pub fn from_xml(text: &str) -> Result<Self, ManifestError> {
        let root = root_element(text)?;
        if root != "gupdate" {
            return Err(ManifestError::Parse(format!(
                "expected <gupdate>, found <{}>",
                root
            )));
        }
        quick_xml::de::from_str(text).map_err(|e| ManifestError::Parse(e.to_string()))
    }

    /// Render the document with an XML declaration, indented.
    pub fn to_xml(&self) -> Result<String, ManifestError> {
        let mut body = String::new();
        let mut serializer = Serializer::new(&mut body);
        serializer.indent(' ', 2);
        self.serialize(serializer)
            .map_err(|e| ManifestError::Write(e.to_string()))?;

        Ok(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}\n",
            body
        ))
    }

    pub fn app(&self, appid: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.appid == appid)
    }

    /// Append one `ok` app entry describing a cached package.
    pub fn push_entry(&mut self, entry: &CacheEntry, codebase: String) {
        self.apps.push(App {
            appid: entry.extension_id.clone(),
            status: "ok".to_string(),
            updatechecks: vec![UpdateCheck {
                codebase: Some(codebase),
                hash_sha256: Some(entry.sha256.clone()),
                size: Some(entry.size),
                status: None,
                version: Some(entry.version.clone()),
                prodversionmin: entry.prodversionmin.clone(),
            }],
        });
    }
}

/// Local name of the document's first element.
fn root_element(text: &str) -> Result<String, ManifestError> {
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned())
            }
            Ok(Event::Eof) => return Err(ManifestError::Parse("empty document".into())),
            Ok(_) => {}
            Err(e) => return Err(ManifestError::Parse(e.to_string())),
        }
    }
}

/// Download URL of a cached package: `<base><prefix>/<id>/<version>.crx`.
pub fn codebase_url(base: &str, prefix: &str, extension_id: &str, version: &str) -> String {
    format!("{}{}/{}/{}.crx", base, prefix, extension_id, version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    const STORE_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gupdate xmlns="http://www.google.com/update2/response" protocol="2.0" server="prod">
  <daystart elapsed_days="6741" elapsed_seconds="8266"/>
  <app appid="aapbdbdomjkkjkaonfhkkikfgjllcleb" cohort="1::" cohortname="" status="ok">
    <updatecheck _esbAllowlist="true" codebase="https://clients2.googleusercontent.com/crx/blobs/abc/EXT_2_0_16_0.crx" fp="1.deadbeef" hash_sha256="9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08" protected="0" size="1024" status="ok" version="2.0.16"/>
  </app>
</gupdate>"#;

    #[test]
    fn test_parse_store_response() {
        let gupdate = GUpdate::from_xml(STORE_RESPONSE).unwrap();
        assert_eq!(gupdate.protocol, "2.0");

        let app = gupdate.app("aapbdbdomjkkjkaonfhkkikfgjllcleb").unwrap();
        assert!(app.is_ok());
        assert_eq!(app.updatechecks.len(), 1);

        let check = &app.updatechecks[0];
        assert_eq!(check.version.as_deref(), Some("2.0.16"));
        assert_eq!(check.size, Some(1024));
        assert_eq!(check.status.as_deref(), Some("ok"));
        assert!(check.codebase.as_deref().unwrap().ends_with(".crx"));
    }

    #[test]
    fn test_parse_unknown_application() {
        let text = r#"<gupdate xmlns="http://www.google.com/update2/response" protocol="2.0">
  <app appid="aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" status="error-unknownApplication"/>
</gupdate>"#;
        let gupdate = GUpdate::from_xml(text).unwrap();
        let app = gupdate.app("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        assert!(!app.is_ok());
        assert!(app.updatechecks.is_empty());
    }

    #[test]
    fn test_empty_size_is_none() {
        let text = r#"<gupdate protocol="2.0"><app appid="x" status="ok"><updatecheck codebase="u" size="" version="1"/></app></gupdate>"#;
        let gupdate = GUpdate::from_xml(text).unwrap();
        assert_eq!(gupdate.apps[0].updatechecks[0].size, None);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(GUpdate::from_xml("<html><body>oops").is_err());
        assert!(GUpdate::from_xml("<html><app appid=\"x\"/></html>").is_err());
        assert!(GUpdate::from_xml("").is_err());
    }

    #[test]
    fn test_render_entry() {
        let entry = CacheEntry {
            extension_id: "aapbdbdomjkkjkaonfhkkikfgjllcleb".into(),
            version: "1.2.3".into(),
            path: PathBuf::from("/cache/aapbdbdomjkkjkaonfhkkikfgjllcleb/1.2.3.crx"),
            sha256: "abc".into(),
            size: 42,
            prodversionmin: None,
            committed_at: Utc::now(),
            last_check: None,
            last_error: None,
        };
        let mut gupdate = GUpdate::default();
        gupdate.push_entry(
            &entry,
            codebase_url("http://localhost:8888", "/crx-repo", &entry.extension_id, &entry.version),
        );

        let xml = gupdate.to_xml().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(r#"xmlns="http://www.google.com/update2/response""#));
        assert!(xml.contains(r#"protocol="2.0""#));
        assert!(xml.contains(r#"appid="aapbdbdomjkkjkaonfhkkikfgjllcleb""#));
        assert!(xml.contains(
            r#"codebase="http://localhost:8888/crx-repo/aapbdbdomjkkjkaonfhkkikfgjllcleb/1.2.3.crx""#
        ));
        assert!(xml.contains(r#"size="42""#));
        assert!(!xml.contains("prodversionmin"));

        // What we serve must be readable by the same parser
        let parsed = GUpdate::from_xml(&xml).unwrap();
        assert_eq!(parsed.apps[0].updatechecks[0].version.as_deref(), Some("1.2.3"));
    }
}
