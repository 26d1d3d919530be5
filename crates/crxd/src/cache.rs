//! On-disk package cache
//!
//! Layout: `<root>/<extension-id>/<version>.crx` plus a `<version>.json`
//! sidecar with the package's checksum and size. Only the latest version of
//! each extension is kept.
//!
//! Packages are streamed into a hidden temporary file in the extension's
//! directory and renamed into place once complete and verified, so a reader
//! never sees a partial file. Dropping a `write` future (cancellation or
//! timeout) deletes the temporary file.

use chrono::{DateTime, Utc};
use crx_common::config::is_valid_extension_id;
use crx_common::{compare_versions, is_valid_version, CacheEntry, StoreError, VersionInfo};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::source::ByteStream;

const PACKAGE_EXT: &str = "crx";
const META_EXT: &str = "json";
const PART_SUFFIX: &str = ".part";

/// Sidecar written next to each package.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageMeta {
    version: String,
    sha256: String,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prodversionmin: Option<String>,
    committed_at: DateTime<Utc>,
}

pub struct CacheStore {
    root: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Open (creating if needed) the cache directory and rebuild entries
    /// from what is on disk.
    ///
    /// Fails only when the directory itself cannot be created. Unreadable
    /// packages are skipped, so the extension is downloaded again.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        if root.exists() && !root.is_dir() {
            warn!("Removing {} to create cache directory", root.display());
            fs::remove_file(root)?;
        }
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;

        let mut entries = HashMap::new();
        for dir in fs::read_dir(&root)? {
            let dir = match dir {
                Ok(d) => d,
                Err(e) => {
                    warn!("Failed to read cache directory entry: {}", e);
                    continue;
                }
            };
            let path = dir.path();
            let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !path.is_dir() || !is_valid_extension_id(&id) {
                debug!("Ignoring {} in cache directory", path.display());
                continue;
            }

            match scan_extension(&id, &path) {
                Ok(Some(entry)) => {
                    debug!("Found cached {} {}", id, entry.version);
                    entries.insert(id, entry);
                }
                Ok(None) => debug!("No usable package cached for {}", id),
                Err(e) => warn!("Ignoring cache for {}: {}", id, e),
            }
        }

        info!(
            "Cache at {} holds {} extensions",
            root.display(),
            entries.len()
        );
        Ok(Self {
            root,
            entries: RwLock::new(entries),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn extension_dir(&self, extension_id: &str) -> PathBuf {
        self.root.join(extension_id)
    }

    /// Canonical location of a package.
    pub fn package_path(&self, extension_id: &str, version: &str) -> PathBuf {
        self.extension_dir(extension_id)
            .join(format!("{}.{}", version, PACKAGE_EXT))
    }

    fn meta_path(&self, extension_id: &str, version: &str) -> PathBuf {
        self.extension_dir(extension_id)
            .join(format!("{}.{}", version, META_EXT))
    }

    pub fn read(&self, extension_id: &str) -> Option<CacheEntry> {
        self.entries().get(extension_id).cloned()
    }

    /// Point-in-time copy of every committed entry.
    pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        self.entries()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    /// A check succeeded without a download. Only the timestamp changes;
    /// `last_error` stays until a new package is committed.
    pub fn record_check(&self, extension_id: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.entries_mut().get_mut(extension_id) {
            entry.last_check = Some(at);
        }
    }

    pub fn record_error(&self, extension_id: &str, error: impl Into<String>) {
        if let Some(entry) = self.entries_mut().get_mut(extension_id) {
            entry.last_error = Some(error.into());
        }
    }

    /// Stream a package into the cache and make it the current entry.
    ///
    /// On any error the previous entry and its file are left as they were.
    pub async fn write(
        &self,
        extension_id: &str,
        info: &VersionInfo,
        mut stream: ByteStream,
    ) -> Result<CacheEntry, StoreError> {
        if !is_valid_version(&info.version) {
            return Err(StoreError::InvalidVersion(info.version.clone()));
        }

        let dir = self.extension_dir(extension_id);
        tokio::fs::create_dir_all(&dir).await?;

        let part_dir = dir.clone();
        let temp = blocking(move || {
            Ok(tempfile::Builder::new()
                .prefix(".")
                .suffix(&format!(".{}{}", PACKAGE_EXT, PART_SUFFIX))
                .tempfile_in(&part_dir)?)
        })
        .await?;
        // The TempPath removes the file if we bail out or get dropped
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if size == 0 {
            return Err(StoreError::SizeMismatch {
                expected: info.size.unwrap_or(0),
                actual: 0,
            });
        }
        if let Some(expected) = info.size {
            if expected != size {
                return Err(StoreError::SizeMismatch {
                    expected,
                    actual: size,
                });
            }
        }
        let sha256 = hex::encode(hasher.finalize());
        if let Some(expected) = &info.sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(StoreError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: sha256,
                });
            }
        }

        let path = self.package_path(extension_id, &info.version);
        let target = path.clone();
        blocking(move || {
            temp_path
                .persist(&target)
                .map_err(|e| StoreError::from(e.error))
        })
        .await?;

        // The package is committed; a missing sidecar only costs a checksum
        // recompute on the next startup.
        let committed_at = Utc::now();
        let meta = PackageMeta {
            version: info.version.clone(),
            sha256: sha256.clone(),
            size,
            prodversionmin: info.prodversionmin.clone(),
            committed_at,
        };
        let meta_path = self.meta_path(extension_id, &info.version);
        let meta_target = meta_path.clone();
        if let Err(e) = blocking(move || write_meta(&dir, &meta_target, &meta)).await {
            warn!("Failed to write {}: {}", meta_path.display(), e);
            let _ = tokio::fs::remove_file(&meta_path).await;
        }

        let entry = CacheEntry {
            extension_id: extension_id.to_string(),
            version: info.version.clone(),
            path,
            sha256,
            size,
            prodversionmin: info.prodversionmin.clone(),
            committed_at,
            last_check: Some(committed_at),
            last_error: None,
        };
        let previous = self
            .entries_mut()
            .insert(extension_id.to_string(), entry.clone());

        if let Some(previous) = previous {
            if previous.version != entry.version {
                self.discard_version(extension_id, &previous.version).await;
            }
        }

        Ok(entry)
    }

    async fn discard_version(&self, extension_id: &str, version: &str) {
        for path in [
            self.package_path(extension_id, version),
            self.meta_path(extension_id, version),
        ] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Drop an extension's entry and delete its files.
    pub async fn remove(&self, extension_id: &str) -> Result<(), StoreError> {
        self.entries_mut().remove(extension_id);

        match tokio::fs::remove_dir_all(self.extension_dir(extension_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run filesystem work that blocks (fsync, rename) off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn write_meta(dir: &Path, path: &Path, meta: &PackageMeta) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(meta)
        .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(&format!(".{}{}", META_EXT, PART_SUFFIX))
        .tempfile_in(dir)?;
    temp.write_all(&json)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| StoreError::from(e.error))?;
    Ok(())
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Rebuild the entry for one extension directory, pruning leftovers.
fn scan_extension(extension_id: &str, dir: &Path) -> io::Result<Option<CacheEntry>> {
    let mut packages: Vec<(String, PathBuf, u64)> = Vec::new();
    let mut sidecars: Vec<(String, PathBuf)> = Vec::new();

    for item in fs::read_dir(dir)? {
        let path = item?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.ends_with(PART_SUFFIX) {
            debug!("Removing unfinished download {}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
            continue;
        }
        let Some(version) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some(PACKAGE_EXT) => {}
            Some(META_EXT) => {
                sidecars.push((version.to_string(), path.clone()));
                continue;
            }
            _ => continue,
        }
        if !is_valid_version(version) {
            continue;
        }

        let meta = fs::metadata(&path)?;
        if !meta.is_file() {
            continue;
        }
        let len = meta.len();
        if len == 0 {
            warn!("Ignoring empty package {}", path.display());
            continue;
        }
        packages.push((version.to_string(), path, len));
    }

    packages.sort_by(|a, b| compare_versions(&a.0, &b.0));
    let current = packages.pop();

    for (_, old_path, _) in packages {
        debug!("Pruning old package {}", old_path.display());
        let _ = fs::remove_file(&old_path);
    }
    // Sidecars of pruned versions, or left behind without their package
    for (meta_version, meta_path) in sidecars {
        if current.as_ref().map(|(v, _, _)| v) != Some(&meta_version) {
            debug!("Removing orphan sidecar {}", meta_path.display());
            let _ = fs::remove_file(&meta_path);
        }
    }

    let Some((version, path, size)) = current else {
        return Ok(None);
    };

    let meta_path = dir.join(format!("{}.{}", version, META_EXT));
    let meta = fs::read(&meta_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<PackageMeta>(&bytes).ok())
        .filter(|meta| meta.version == version && meta.size == size);

    let (sha256, prodversionmin, committed_at) = match meta {
        Some(meta) => (meta.sha256, meta.prodversionmin, meta.committed_at),
        None => {
            debug!("Recomputing checksum for {}", path.display());
            let committed_at = fs::metadata(&path)?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            (sha256_file(&path)?, None, committed_at)
        }
    };

    Ok(Some(CacheEntry {
        extension_id: extension_id.to_string(),
        version,
        path,
        sha256,
        size,
        prodversionmin,
        committed_at,
        last_check: None,
        last_error: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crx_common::FetchError;
    use futures_util::stream;
    use tempfile::TempDir;

    const ID: &str = "aapbdbdomjkkjkaonfhkkikfgjllcleb";

    fn ok(bytes: &'static [u8]) -> Result<&'static [u8], FetchError> {
        Ok(bytes)
    }

    fn byte_stream(chunks: Vec<Result<&'static [u8], FetchError>>) -> ByteStream {
        stream::iter(
            chunks
                .into_iter()
                .map(|c| c.map(Bytes::from_static))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    fn info(version: &str, bytes: &[u8]) -> VersionInfo {
        let mut info = VersionInfo::new(version, "unused");
        info.sha256 = Some(hex::encode(Sha256::digest(bytes)));
        info.size = Some(bytes.len() as u64);
        info
    }

    fn visible_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();

        let entry = store
            .write(ID, &info("1.0.0", b"hello crx"), byte_stream(vec![ok(b"hello "), ok(b"crx")]))
            .await
            .unwrap();

        assert_eq!(entry.version, "1.0.0");
        assert_eq!(entry.size, 9);
        assert!(entry.path.is_absolute());
        assert_eq!(fs::read(&entry.path).unwrap(), b"hello crx");
        assert_eq!(store.read(ID), Some(entry));
        assert_eq!(
            visible_files(&store.root().join(ID)),
            vec!["1.0.0.crx", "1.0.0.json"]
        );
    }

    #[tokio::test]
    async fn test_newer_version_replaces_old_files() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();

        let old = store
            .write(ID, &info("1.0.0", b"old"), byte_stream(vec![ok(b"old")]))
            .await
            .unwrap();
        let new = store
            .write(ID, &info("2.0.0", b"new!"), byte_stream(vec![ok(b"new!")]))
            .await
            .unwrap();

        assert!(!old.path.exists());
        assert_eq!(fs::read(&new.path).unwrap(), b"new!");
        assert_eq!(store.read(ID).unwrap().version, "2.0.0");
        assert_eq!(
            visible_files(&store.root().join(ID)),
            vec!["2.0.0.crx", "2.0.0.json"]
        );
    }

    #[tokio::test]
    async fn test_interrupted_stream_keeps_previous_entry() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        let old = store
            .write(ID, &info("1.0.0", b"old"), byte_stream(vec![ok(b"old")]))
            .await
            .unwrap();

        let err = store
            .write(
                ID,
                &info("2.0.0", b"newnew"),
                byte_stream(vec![ok(b"new"), Err(FetchError::transient("reset"))]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Source(_)));
        assert_eq!(store.read(ID), Some(old.clone()));
        assert_eq!(fs::read(&old.path).unwrap(), b"old");
        // temp file is gone
        assert_eq!(
            visible_files(&store.root().join(ID)),
            vec!["1.0.0.crx", "1.0.0.json"]
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();

        let mut bad = info("1.0.0", b"expected");
        bad.size = None;
        let err = store
            .write(ID, &bad, byte_stream(vec![ok(b"tampered")]))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
        assert!(store.read(ID).is_none());
        assert!(visible_files(&store.root().join(ID)).is_empty());
    }

    #[tokio::test]
    async fn test_size_mismatch_and_empty_body_rejected() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();

        let mut short = VersionInfo::new("1.0.0", "unused");
        short.size = Some(100);
        let err = store
            .write(ID, &short, byte_stream(vec![ok(b"tiny")]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SizeMismatch { expected: 100, actual: 4 }));

        let empty = VersionInfo::new("1.0.0", "unused");
        let err = store.write(ID, &empty, byte_stream(vec![])).await.unwrap_err();
        assert!(matches!(err, StoreError::SizeMismatch { actual: 0, .. }));
        assert!(store.read(ID).is_none());
    }

    #[tokio::test]
    async fn test_invalid_version_rejected() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();

        let err = store
            .write(ID, &VersionInfo::new("../escape", "unused"), byte_stream(vec![ok(b"x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidVersion(_)));
    }

    #[tokio::test]
    async fn test_reopen_reconstructs_entries() {
        let temp = TempDir::new().unwrap();
        let written = {
            let store = CacheStore::open(temp.path()).unwrap();
            let mut i = info("1.2.3", b"package");
            i.prodversionmin = Some("100.0".into());
            store
                .write(ID, &i, byte_stream(vec![ok(b"package")]))
                .await
                .unwrap()
        };

        let store = CacheStore::open(temp.path()).unwrap();
        let entry = store.read(ID).unwrap();
        assert_eq!(entry.version, "1.2.3");
        assert_eq!(entry.sha256, written.sha256);
        assert_eq!(entry.size, 7);
        assert_eq!(entry.prodversionmin.as_deref(), Some("100.0"));
        assert_eq!(entry.path, written.path);
    }

    #[test]
    fn test_open_prunes_and_recovers() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(ID);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("1.0.0.crx"), b"one").unwrap();
        fs::write(dir.join("1.10.0.crx"), b"one-ten").unwrap();
        fs::write(dir.join("1.9.0.crx"), b"one-nine").unwrap();
        fs::write(dir.join(".abc.crx.part"), b"partial").unwrap();
        // corrupt sidecar forces a checksum recompute
        fs::write(dir.join("1.10.0.json"), b"{not json").unwrap();
        // unrelated directories are ignored
        fs::create_dir_all(temp.path().join("not-an-extension")).unwrap();

        let store = CacheStore::open(temp.path()).unwrap();
        let entry = store.read(ID).unwrap();
        assert_eq!(entry.version, "1.10.0");
        assert_eq!(entry.sha256, hex::encode(Sha256::digest(b"one-ten")));
        assert_eq!(store.ids(), vec![ID.to_string()]);
        assert_eq!(visible_files(&dir), vec!["1.10.0.crx", "1.10.0.json"]);
    }

    #[test]
    fn test_open_removes_orphan_sidecars() {
        let temp = TempDir::new().unwrap();
        let kept = temp.path().join(ID);
        fs::create_dir_all(&kept).unwrap();
        fs::write(kept.join("2.0.0.crx"), b"two").unwrap();
        fs::write(kept.join("3.0.0.json"), b"{}").unwrap();

        let orphaned = temp.path().join("cccccccccccccccccccccccccccccccc");
        fs::create_dir_all(&orphaned).unwrap();
        fs::write(orphaned.join("1.0.0.json"), b"{}").unwrap();

        let store = CacheStore::open(temp.path()).unwrap();
        assert_eq!(store.read(ID).unwrap().version, "2.0.0");
        assert_eq!(visible_files(&kept), vec!["2.0.0.crx"]);
        assert!(store.read("cccccccccccccccccccccccccccccccc").is_none());
        assert!(visible_files(&orphaned).is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_sidecar() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        let old = store
            .write(ID, &info("1.0.0", b"old"), byte_stream(vec![ok(b"old")]))
            .await
            .unwrap();

        // a directory where the package should land makes the rename fail
        let blocker = store.package_path(ID, "2.0.0");
        fs::create_dir_all(blocker.join("occupied")).unwrap();

        let err = store
            .write(ID, &info("2.0.0", b"new"), byte_stream(vec![ok(b"new")]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(store.read(ID), Some(old));
        assert!(!store.root().join(ID).join("2.0.0.json").exists());

        fs::remove_dir_all(&blocker).unwrap();
        drop(store);
        let store = CacheStore::open(temp.path()).unwrap();
        assert_eq!(store.read(ID).unwrap().version, "1.0.0");
        assert_eq!(
            visible_files(&store.root().join(ID)),
            vec!["1.0.0.crx", "1.0.0.json"]
        );
    }

    #[tokio::test]
    async fn test_read_during_write_sees_previous_entry() {
        use crate::source::{FakeSource, SourceAdapter};
        use std::sync::Arc;
        use std::time::Duration;

        let temp = TempDir::new().unwrap();
        let store = Arc::new(CacheStore::open(temp.path()).unwrap());
        let old = store
            .write(ID, &info("1.0.0", b"old"), byte_stream(vec![ok(b"old")]))
            .await
            .unwrap();

        let fake = FakeSource::new();
        fake.publish("2.0.0", b"new package");
        fake.set_chunk_delay(Duration::from_millis(300));
        let latest = fake.latest_version(ID).await.unwrap();
        let stream = fake.download(ID, &latest).await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.write(ID, &latest, stream).await })
        };

        // wait until the download is in flight
        let dir = store.root().join(ID);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !visible_files(&dir).iter().any(|name| name.ends_with(PART_SUFFIX)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(store.read(ID), Some(old.clone()));
        assert_eq!(store.snapshot()[ID], old);
        assert_eq!(fs::read(&old.path).unwrap(), b"old");
        assert!(!writer.is_finished());

        let new = writer.await.unwrap().unwrap();
        assert_eq!(new.version, "2.0.0");
        assert_eq!(store.read(ID), Some(new.clone()));
        assert_eq!(fs::read(&new.path).unwrap(), b"new package");
        assert!(!old.path.exists());
    }

    #[test]
    fn test_empty_package_is_no_entry() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(ID);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("1.0.0.crx"), b"").unwrap();

        let store = CacheStore::open(temp.path()).unwrap();
        assert!(store.read(ID).is_none());
    }

    #[test]
    fn test_open_replaces_plain_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        fs::write(&root, b"in the way").unwrap();

        let store = CacheStore::open(&root).unwrap();
        assert!(store.root().is_dir());
    }

    #[tokio::test]
    async fn test_remove_purges_files_and_entry() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        store
            .write(ID, &info("1.0.0", b"bytes"), byte_stream(vec![ok(b"bytes")]))
            .await
            .unwrap();

        store.remove(ID).await.unwrap();
        assert!(store.read(ID).is_none());
        assert!(!store.root().join(ID).exists());

        // removing again is fine
        store.remove(ID).await.unwrap();
    }

    #[tokio::test]
    async fn test_record_check_and_error() {
        let temp = TempDir::new().unwrap();
        let store = CacheStore::open(temp.path()).unwrap();
        store
            .write(ID, &info("1.0.0", b"bytes"), byte_stream(vec![ok(b"bytes")]))
            .await
            .unwrap();

        store.record_error(ID, "store said no");
        assert_eq!(store.read(ID).unwrap().last_error.as_deref(), Some("store said no"));

        // an up-to-date check only moves the timestamp
        let now = Utc::now();
        store.record_check(ID, now);
        let entry = store.read(ID).unwrap();
        assert_eq!(entry.last_check, Some(now));
        assert_eq!(entry.last_error.as_deref(), Some("store said no"));

        // a committed package starts clean
        let entry = store
            .write(ID, &info("1.1.0", b"newer"), byte_stream(vec![ok(b"newer")]))
            .await
            .unwrap();
        assert!(entry.last_error.is_none());

        // no entry, nothing to record
        store.record_error("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", "ignored");
        assert!(store.read("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb").is_none());
    }
}
