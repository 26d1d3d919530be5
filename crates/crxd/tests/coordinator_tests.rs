//! Pollers, cache and manifest working together

use axum::body::Body;
use axum::http::{Request, StatusCode};
use crx_common::{Config, ExtensionSpec, FetchError, GUpdate, SourceKind};
use crxd::server::{router, AppState};
use crxd::source::FakeSource;
use crxd::{CacheStore, Coordinator, SourceAdapter};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const ID: &str = "cjpalhdlnbpafiamejdnhcphjbkeiagm";
const OTHER: &str = "nngceckbapebfimnlniiiahkandclblb";

fn spec(id: &str, interval: Duration) -> ExtensionSpec {
    ExtensionSpec::new(
        id,
        SourceKind::WebStore {
            prodversion: "128.0".into(),
        },
        interval,
    )
}

fn coordinator(root: &std::path::Path, fake: Arc<FakeSource>) -> Arc<Coordinator> {
    let store = Arc::new(CacheStore::open(root).unwrap());
    let factory = move |_: &ExtensionSpec| -> Arc<dyn SourceAdapter> { fake.clone() };
    Arc::new(Coordinator::new(store, Arc::new(factory), Duration::from_secs(5)))
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn fetch_manifest(coordinator: &Arc<Coordinator>) -> GUpdate {
    let app = router(
        AppState {
            coordinator: coordinator.clone(),
            base: "http://crx.local".into(),
            prefix: "/crx-repo".into(),
        },
        "/updates.xml",
    );
    let response = app
        .oneshot(Request::builder().uri("/updates.xml").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    GUpdate::from_xml(std::str::from_utf8(&bytes).unwrap()).unwrap()
}

#[tokio::test]
async fn test_new_version_reaches_manifest() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeSource::new());
    fake.publish("1.0.0", b"first package");

    let coordinator = coordinator(temp.path(), fake.clone());
    coordinator
        .start(vec![spec(ID, Duration::from_millis(100))])
        .await;

    wait_for(|| coordinator.entry(ID).is_some()).await;
    let doc = fetch_manifest(&coordinator).await;
    assert_eq!(
        doc.app(ID).unwrap().updatechecks[0].codebase.as_deref(),
        Some(format!("http://crx.local/crx-repo/{}/1.0.0.crx", ID).as_str())
    );

    // a failed download keeps serving 1.0.0, the next tick picks up 2.0.0
    fake.fail_next_download(FetchError::transient("connection reset"));
    fake.publish("2.0.0", b"second package");
    wait_for(|| coordinator.entry(ID).is_some_and(|e| e.version == "2.0.0")).await;
    assert!(fake.download_calls() >= 3);

    let entry = coordinator.entry(ID).unwrap();
    assert_eq!(std::fs::read(&entry.path).unwrap(), b"second package");
    let doc = fetch_manifest(&coordinator).await;
    assert_eq!(
        doc.app(ID).unwrap().updatechecks[0].version.as_deref(),
        Some("2.0.0")
    );

    coordinator.stop().await;
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeSource::new());
    fake.publish("3.1.0", b"kept across restarts");

    let first = coordinator(temp.path(), fake.clone());
    first.start(vec![spec(ID, Duration::from_secs(3600))]).await;
    wait_for(|| first.entry(ID).is_some()).await;
    first.stop().await;
    let before = first.entry(ID).unwrap();

    // the source is down after the restart; the old package is still served
    let down = Arc::new(FakeSource::new());
    down.set_check_error(FetchError::transient("store unreachable"));
    let second = coordinator(temp.path(), down.clone());
    second.start(vec![spec(ID, Duration::from_secs(3600))]).await;
    wait_for(|| down.check_calls() >= 1).await;

    let after = second.entry(ID).unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.sha256, before.sha256);
    assert_eq!(fetch_manifest(&second).await.apps.len(), 1);

    second.stop().await;
}

#[tokio::test]
async fn test_reload_from_config_text() {
    let temp = TempDir::new().unwrap();
    let fake = Arc::new(FakeSource::new());
    fake.publish("1.0", b"shared package");

    let coordinator = coordinator(temp.path(), fake.clone());

    let config = Config::parse(&format!(
        "interval = 3600\nextensions = [\"{}\", \"{}\"]\n",
        ID, OTHER
    ))
    .unwrap();
    coordinator.start(config.extension_specs().unwrap()).await;
    wait_for(|| coordinator.snapshot().len() == 2).await;
    let other_dir = coordinator.store().root().join(OTHER);
    assert!(other_dir.exists());

    let config = Config::parse(&format!(
        "interval = 7200\n[[extensions]]\nextension-id = \"{}\"\nname = \"Reader\"\n",
        ID
    ))
    .unwrap();
    let report = coordinator.reconcile(config.extension_specs().unwrap()).await;
    assert_eq!(report.removed, vec![OTHER.to_string()]);
    assert_eq!(report.restarted, vec![ID.to_string()]);

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains_key(ID));
    assert!(!other_dir.exists());

    let tracked = coordinator.tracked().await;
    assert_eq!(tracked[0].label, "Reader");
    assert_eq!(tracked[0].interval, Duration::from_secs(7200));

    coordinator.stop().await;
}
