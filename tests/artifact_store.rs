//! Artifact cache and remote store tests against an in-process HTTP responder

use exoplanet_classifier::config::ArtifactsConfig;
use exoplanet_classifier::error::ArtifactLoadError;
use exoplanet_classifier::models::{ArtifactSource, ArtifactStore};
use exoplanet_classifier::service::PredictionService;
use exoplanet_classifier::types::{ClassifyRequest, PlanetClass};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const TRIPLE: [&str; 3] = ["classifier.json", "scaler.json", "label_codec.json"];
const FIXTURE_RUN: &str = "6f1c2a4e-8d3b-4b8e-9a51-2f7d0c3e9b14";
const NEXT_RUN: &str = "0b7e4d2c-5a19-4f3e-8c6d-7e2a9b1f4d30";

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/artifacts")
}

fn fixture_files() -> HashMap<String, Vec<u8>> {
    TRIPLE
        .iter()
        .map(|file| (file.to_string(), std::fs::read(fixture_dir().join(file)).unwrap()))
        .collect()
}

/// The fixture triple re-stamped as another training run
fn files_for_run(run_id: &str) -> HashMap<String, Vec<u8>> {
    fixture_files()
        .into_iter()
        .map(|(file, body)| {
            let body = String::from_utf8(body).unwrap().replace(FIXTURE_RUN, run_id);
            (file, body.into_bytes())
        })
        .collect()
}

fn staging_dirs(cache_dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.file_name().unwrap().to_string_lossy().starts_with(".staging-"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Minimal HTTP/1.1 file server. The first `unavailable` requests get a 503.
struct FakeStore {
    base_url: String,
    hits: Arc<Mutex<Vec<String>>>,
}

impl FakeStore {
    async fn start(files: HashMap<String, Vec<u8>>, unavailable: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/exoplanet/v1", listener.local_addr().unwrap());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let files = Arc::new(files);
        let served = Arc::new(AtomicUsize::new(0));

        let log = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let files = Arc::clone(&files);
                let log = Arc::clone(&log);
                let served = Arc::clone(&served);

                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }

                    let head = String::from_utf8_lossy(&request);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let file = path.rsplit('/').next().unwrap_or("").to_string();
                    log.lock().unwrap().push(file.clone());

                    let (status, body) = if served.fetch_add(1, Ordering::SeqCst) < unavailable {
                        ("503 Service Unavailable", Vec::new())
                    } else if !path.starts_with("/exoplanet/v1/") {
                        ("404 Not Found", Vec::new())
                    } else {
                        match files.get(&file) {
                            Some(body) => ("200 OK", body.clone()),
                            None => ("404 Not Found", Vec::new()),
                        }
                    };

                    let header = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { base_url, hits }
    }

    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

fn store_config(cache_dir: &Path, base_url: &str) -> ArtifactsConfig {
    ArtifactsConfig {
        remote_base_url: Some(base_url.to_string()),
        download_timeout_secs: 5,
        download_retries: 3,
        retry_backoff_ms: 1,
        ..ArtifactsConfig::local(cache_dir)
    }
}

fn request() -> ClassifyRequest {
    ClassifyRequest {
        orbital_period: 9.49,
        duration: 2.96,
        transit_depth: 615.8,
        radius: 2.26,
        star_temp: 5455.0,
        star_radius: 0.93,
        model_snr: 35.8,
    }
}

#[tokio::test]
async fn test_missing_files_are_downloaded_once() {
    let remote = FakeStore::start(fixture_files(), 0).await;
    let cache = tempfile::tempdir().unwrap();
    let cache_dir = cache.path().join("artifacts");

    let store = ArtifactStore::new(store_config(&cache_dir, &remote.base_url), 1).unwrap();
    let downloaded = store.ensure_cached().await.unwrap();
    assert_eq!(downloaded, TRIPLE.map(String::from).to_vec());

    for file in TRIPLE {
        assert_eq!(
            std::fs::read(cache_dir.join(file)).unwrap(),
            std::fs::read(fixture_dir().join(file)).unwrap()
        );
        assert!(!cache_dir.join(format!("{file}.part")).exists());
    }
    assert!(staging_dirs(&cache_dir).is_empty());

    // Everything is cached now
    assert!(store.ensure_cached().await.unwrap().is_empty());
    assert_eq!(remote.hits().len(), 3);
}

#[tokio::test]
async fn test_cached_files_are_not_downloaded() {
    let remote = FakeStore::start(fixture_files(), 0).await;
    let cache = tempfile::tempdir().unwrap();
    for file in ["scaler.json", "label_codec.json"] {
        std::fs::copy(fixture_dir().join(file), cache.path().join(file)).unwrap();
    }

    let store = ArtifactStore::new(store_config(cache.path(), &remote.base_url), 1).unwrap();
    let service = PredictionService::with_source(store, 4);

    let result = service.classify(&request()).await.unwrap();
    assert_eq!(result.classification, PlanetClass::Confirmed);
    assert_eq!(remote.hits(), vec!["classifier.json".to_string()]);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let remote = FakeStore::start(fixture_files(), 2).await;
    let cache = tempfile::tempdir().unwrap();

    let store = ArtifactStore::new(store_config(cache.path(), &remote.base_url), 1).unwrap();
    let set = store.load().await.unwrap();

    assert_eq!(set.codec().num_classes(), 3);
    // Two 503s on the first file, then one request per file
    assert_eq!(remote.hits().len(), 5);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let remote = FakeStore::start(fixture_files(), usize::MAX).await;
    let cache = tempfile::tempdir().unwrap();

    let store = ArtifactStore::new(store_config(cache.path(), &remote.base_url), 1).unwrap();
    let err = store.load().await.unwrap_err();

    assert_eq!(
        err,
        ArtifactLoadError::Download {
            file: "classifier.json".to_string(),
            attempts: 3,
            reason: "HTTP 503 Service Unavailable".to_string(),
        }
    );
    assert_eq!(remote.hits().len(), 3);
    assert!(!cache.path().join("classifier.json").exists());
}

#[tokio::test]
async fn test_missing_remote_file_is_not_retried() {
    let mut files = fixture_files();
    files.remove("label_codec.json");
    let remote = FakeStore::start(files, 0).await;
    let cache = tempfile::tempdir().unwrap();

    let store = ArtifactStore::new(store_config(cache.path(), &remote.base_url), 1).unwrap();
    let err = store.ensure_cached().await.unwrap_err();

    assert!(matches!(
        err,
        ArtifactLoadError::Download { ref file, attempts: 1, .. } if file == "label_codec.json"
    ));

    // Nothing from the incomplete run reaches the cache
    for file in TRIPLE {
        assert!(!cache.path().join(file).exists());
    }
    assert!(staging_dirs(cache.path()).is_empty());
}

#[tokio::test]
async fn test_incomplete_download_does_not_block_next_run() {
    let cache = tempfile::tempdir().unwrap();

    let mut partial = fixture_files();
    partial.remove("label_codec.json");
    let old_remote = FakeStore::start(partial, 0).await;
    let store = ArtifactStore::new(store_config(cache.path(), &old_remote.base_url), 1).unwrap();
    assert!(store.ensure_cached().await.is_err());

    let new_remote = FakeStore::start(files_for_run(NEXT_RUN), 0).await;
    let store = ArtifactStore::new(store_config(cache.path(), &new_remote.base_url), 1).unwrap();
    let service = PredictionService::with_source(store, 4);

    let result = service.classify(&request()).await.unwrap();
    assert_eq!(result.classification, PlanetClass::Confirmed);
    assert!(service.is_loaded());
    assert_eq!(new_remote.hits().len(), 3);
}

#[tokio::test]
async fn test_cached_files_from_another_run_are_refreshed() {
    let cache = tempfile::tempdir().unwrap();
    // An earlier run left two of its three files behind
    for file in ["classifier.json", "scaler.json"] {
        std::fs::copy(fixture_dir().join(file), cache.path().join(file)).unwrap();
    }

    let remote = FakeStore::start(files_for_run(NEXT_RUN), 0).await;
    let store = ArtifactStore::new(store_config(cache.path(), &remote.base_url), 1).unwrap();
    let set = store.load().await.unwrap();

    assert_eq!(set.run_id().to_string(), NEXT_RUN);
    let mut hits = remote.hits();
    hits.sort();
    assert_eq!(hits, vec!["classifier.json", "label_codec.json", "scaler.json"]);
    assert!(staging_dirs(cache.path()).is_empty());

    // The refreshed cache is consistent, so nothing more is fetched
    assert!(store.ensure_cached().await.unwrap().is_empty());
    assert_eq!(remote.hits().len(), 3);
}

#[tokio::test]
async fn test_complete_cache_mixing_runs_is_refreshed() {
    let cache = tempfile::tempdir().unwrap();
    let next = files_for_run(NEXT_RUN);
    std::fs::copy(fixture_dir().join("classifier.json"), cache.path().join("classifier.json")).unwrap();
    for file in ["scaler.json", "label_codec.json"] {
        std::fs::write(cache.path().join(file), &next[file]).unwrap();
    }

    let remote = FakeStore::start(next, 0).await;
    let store = ArtifactStore::new(store_config(cache.path(), &remote.base_url), 1).unwrap();
    let downloaded = store.ensure_cached().await.unwrap();

    assert_eq!(downloaded, TRIPLE.map(String::from).to_vec());
    assert_eq!(store.load().await.unwrap().run_id().to_string(), NEXT_RUN);
}

#[tokio::test]
async fn test_remote_serving_mixed_runs_is_rejected() {
    let mut files = fixture_files();
    files.insert(
        "label_codec.json".to_string(),
        files_for_run(NEXT_RUN).remove("label_codec.json").unwrap(),
    );
    let remote = FakeStore::start(files, 0).await;
    let cache = tempfile::tempdir().unwrap();

    let store = ArtifactStore::new(store_config(cache.path(), &remote.base_url), 1).unwrap();
    let err = store.ensure_cached().await.unwrap_err();

    assert!(matches!(err, ArtifactLoadError::Mismatch(_)));
    for file in TRIPLE {
        assert!(!cache.path().join(file).exists());
    }
}

#[tokio::test]
async fn test_concurrent_first_calls_download_once() {
    let remote = FakeStore::start(fixture_files(), 0).await;
    let cache = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(store_config(cache.path(), &remote.base_url), 1).unwrap();
    let service = Arc::new(PredictionService::with_source(store, 4));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.classify(&request()).await })
        })
        .collect();

    for handle in futures::future::join_all(handles).await {
        let result = handle.unwrap().unwrap();
        assert_eq!(result.classification, PlanetClass::Confirmed);
    }
    assert_eq!(remote.hits().len(), 3);
    assert_eq!(service.metrics().artifact_loads.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_no_remote_store_means_unavailable() {
    let cache = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(ArtifactsConfig::local(cache.path()), 1).unwrap();

    let service = PredictionService::with_source(store, 4);
    let err = service.classify(&request()).await.unwrap_err();
    assert_eq!(err.kind(), "artifact_load_error");
    assert!(!service.is_loaded());
}
