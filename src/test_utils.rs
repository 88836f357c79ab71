use axum::response::Response;
use http_body_util::BodyExt;
use tempfile::TempDir;

use crate::api::Api;
use crate::config::NodeConfig;
use crate::store::Store;

pub(crate) fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// A fresh store over a temp directory. Keep the guard alive for the
/// duration of the test.
pub(crate) fn temp_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(dir.path()).expect("store");
    (dir, store)
}

/// A full API over a temp store, with the container runtime stubbed out by
/// `true` so launches succeed without Apptainer installed.
pub(crate) fn test_api() -> (TempDir, Api) {
    let (dir, store) = temp_store();
    let cfg = NodeConfig {
        runtime: "true".to_string(),
        ..Default::default()
    };
    (dir, Api::new(store, &cfg))
}

pub(crate) async fn body_json(res: Response) -> serde_json::Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub(crate) async fn body_text(res: Response) -> String {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub(crate) async fn body_bytes(res: Response) -> bytes::Bytes {
    res.into_body().collect().await.unwrap().to_bytes()
}
