//! Artifact triple loading: local cache, remote store, cross-validation

use crate::config::{AppConfig, ArtifactsConfig};
use crate::error::ArtifactLoadError;
use crate::feature_extractor::{FeatureBuilder, FEATURE_COUNT};
use crate::models::codec::LabelCodec;
use crate::models::inference::InferenceEngine;
use crate::models::metadata::ArtifactMetadata;
use crate::models::network::DenseNetwork;
use crate::models::transform::FittedTransform;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Classifier weights, in one of the supported formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ClassifierModel {
    /// Layer weights stored inline
    Dense(DenseNetwork),
    /// ONNX graph stored next to the artifact, needs the `onnx` feature
    Onnx {
        file: String,
        input_width: usize,
        num_classes: usize,
    },
}

impl ClassifierModel {
    pub fn format(&self) -> &'static str {
        match self {
            ClassifierModel::Dense(_) => "dense",
            ClassifierModel::Onnx { .. } => "onnx",
        }
    }

    pub fn input_width(&self) -> usize {
        match self {
            ClassifierModel::Dense(network) => network.input_width(),
            ClassifierModel::Onnx { input_width, .. } => *input_width,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            ClassifierModel::Dense(network) => network.output_width(),
            ClassifierModel::Onnx { num_classes, .. } => *num_classes,
        }
    }

    /// Extra file the classifier needs in the cache, if any
    pub fn companion_file(&self) -> Option<&str> {
        match self {
            ClassifierModel::Dense(_) => None,
            ClassifierModel::Onnx { file, .. } => Some(file),
        }
    }
}

/// Persisted classifier artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierArtifact {
    pub metadata: ArtifactMetadata,
    pub model: ClassifierModel,
}

/// The loaded, cross-checked artifact triple. Immutable once built.
#[derive(Debug)]
pub struct ArtifactSet {
    run_id: Uuid,
    transform: FittedTransform,
    codec: LabelCodec,
    engine: InferenceEngine,
    builder: FeatureBuilder,
}

impl ArtifactSet {
    /// Assemble a triple, rejecting pieces from different training runs or
    /// with incompatible shapes.
    pub fn new(
        classifier: &ArtifactMetadata,
        engine: InferenceEngine,
        transform: FittedTransform,
        codec: LabelCodec,
    ) -> Result<Self, ArtifactLoadError> {
        let run_id = classifier.run_id;
        if transform.metadata().run_id != run_id || codec.metadata().run_id != run_id {
            return Err(ArtifactLoadError::Mismatch(format!(
                "run ids differ: classifier {}, transform {}, codec {}",
                run_id,
                transform.metadata().run_id,
                codec.metadata().run_id
            )));
        }
        if !classifier.is_current_pipeline() {
            return Err(ArtifactLoadError::Mismatch(format!(
                "classifier was trained under pipeline `{}`",
                classifier.pipeline_version
            )));
        }
        if engine.input_width() != FEATURE_COUNT || transform.feature_count() != FEATURE_COUNT {
            return Err(ArtifactLoadError::Mismatch(format!(
                "classifier takes {} features, transform produces {}, pipeline defines {}",
                engine.input_width(),
                transform.feature_count(),
                FEATURE_COUNT
            )));
        }
        if engine.num_classes() != codec.num_classes() {
            return Err(ArtifactLoadError::Mismatch(format!(
                "classifier has {} outputs, codec has {} classes",
                engine.num_classes(),
                codec.num_classes()
            )));
        }

        let builder = transform.feature_builder();
        Ok(Self {
            run_id,
            transform,
            codec,
            engine,
            builder,
        })
    }

    /// Read and validate the triple from a local directory.
    pub fn load_from_dir(
        dir: &Path,
        config: &ArtifactsConfig,
        onnx_threads: usize,
    ) -> Result<Self, ArtifactLoadError> {
        let classifier: ClassifierArtifact = read_json(dir, &config.classifier_file)?;
        Self::load_with_classifier(dir, config, classifier, onnx_threads)
    }

    /// Finish loading when `classifier.json` has already been parsed.
    fn load_with_classifier(
        dir: &Path,
        config: &ArtifactsConfig,
        classifier: ClassifierArtifact,
        onnx_threads: usize,
    ) -> Result<Self, ArtifactLoadError> {
        let transform: FittedTransform = read_json(dir, &config.transform_file)?;
        transform.validate(&config.transform_file)?;

        let codec: LabelCodec = read_json(dir, &config.codec_file)?;
        codec.validate(&config.codec_file)?;

        let engine = build_engine(dir, &config.classifier_file, classifier.model, onnx_threads)?;
        let set = Self::new(&classifier.metadata, engine, transform, codec)?;

        info!(
            run_id = %set.run_id,
            backend = set.engine.backend_name(),
            classes = ?set.codec.classes(),
            dir = %dir.display(),
            "Artifact triple loaded"
        );
        Ok(set)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn transform(&self) -> &FittedTransform {
        &self.transform
    }

    pub fn codec(&self) -> &LabelCodec {
        &self.codec
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    /// Serving feature builder carrying this run's imputation medians
    pub fn builder(&self) -> &FeatureBuilder {
        &self.builder
    }
}

fn read_json<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<T, ArtifactLoadError> {
    let path = dir.join(file);
    let bytes = std::fs::read(&path).map_err(|e| unreadable(file, &path, e))?;
    parse_json(file, &bytes)
}

async fn read_json_async<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<T, ArtifactLoadError> {
    let path = dir.join(file);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| unreadable(file, &path, e))?;
    parse_json(file, &bytes)
}

fn parse_json<T: DeserializeOwned>(file: &str, bytes: &[u8]) -> Result<T, ArtifactLoadError> {
    serde_json::from_slice(bytes).map_err(|e| ArtifactLoadError::Corrupt {
        file: file.to_string(),
        reason: e.to_string(),
    })
}

fn unreadable(file: &str, path: &Path, e: std::io::Error) -> ArtifactLoadError {
    ArtifactLoadError::Unavailable {
        file: file.to_string(),
        reason: format!("{}: {e}", path.display()),
    }
}

/// The `metadata` block every artifact of the triple carries.
#[derive(Deserialize)]
struct RunStamp {
    metadata: ArtifactMetadata,
}

async fn read_run_id(dir: &Path, file: &str) -> Result<Uuid, ArtifactLoadError> {
    let stamp: RunStamp = read_json_async(dir, file).await?;
    Ok(stamp.metadata.run_id)
}

/// The run shared by every stamp, if there is exactly one.
fn common_run<I: IntoIterator<Item = Option<Uuid>>>(runs: I) -> Option<Uuid> {
    let mut runs = runs.into_iter();
    let first = runs.next()??;
    runs.all(|run| run == Some(first)).then_some(first)
}

async fn is_cached(dir: &Path, file: &str) -> bool {
    tokio::fs::try_exists(dir.join(file)).await.unwrap_or(false)
}

#[cfg_attr(not(feature = "onnx"), allow(unused_variables))]
fn build_engine(
    dir: &Path,
    file: &str,
    model: ClassifierModel,
    onnx_threads: usize,
) -> Result<InferenceEngine, ArtifactLoadError> {
    match model {
        ClassifierModel::Dense(network) => {
            network
                .validate()
                .map_err(|reason| ArtifactLoadError::Corrupt {
                    file: file.to_string(),
                    reason,
                })?;
            Ok(InferenceEngine::from_dense(network))
        }
        #[cfg(feature = "onnx")]
        ClassifierModel::Onnx {
            file,
            input_width,
            num_classes,
        } => {
            let classifier = crate::models::onnx::OnnxClassifier::load(
                &dir.join(file),
                onnx_threads,
                input_width,
                num_classes,
            )?;
            Ok(InferenceEngine::from_onnx(classifier))
        }
        #[cfg(not(feature = "onnx"))]
        other @ ClassifierModel::Onnx { .. } => {
            Err(ArtifactLoadError::UnsupportedFormat(other.format().to_string()))
        }
    }
}

/// Anything that can produce a loaded artifact triple.
pub trait ArtifactSource: Send + Sync + 'static {
    fn load(&self) -> impl Future<Output = Result<ArtifactSet, ArtifactLoadError>> + Send;
}

/// Local artifact cache backed by an optional remote store.
///
/// Files already in the cache are never downloaded again, unless the cached
/// triple mixes runs. Downloads are staged and only move into the cache once
/// every staged and cached file agrees on one run.
pub struct ArtifactStore {
    config: ArtifactsConfig,
    onnx_threads: usize,
    client: Client,
}

impl ArtifactStore {
    pub fn new(config: ArtifactsConfig, onnx_threads: usize) -> Result<Self, ArtifactLoadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
            .map_err(|e| ArtifactLoadError::HttpClient(e.to_string()))?;

        Ok(Self {
            config,
            onnx_threads,
            client,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ArtifactLoadError> {
        Self::new(config.artifacts.clone(), config.inference.onnx_threads)
    }

    pub fn config(&self) -> &ArtifactsConfig {
        &self.config
    }

    /// Make sure the cache holds one complete run, downloading what is
    /// missing or stale. Returns the files that were downloaded.
    pub async fn ensure_cached(&self) -> Result<Vec<String>, ArtifactLoadError> {
        let (downloaded, _) = self.sync_cache().await?;
        Ok(downloaded)
    }

    async fn sync_cache(&self) -> Result<(Vec<String>, ClassifierArtifact), ArtifactLoadError> {
        let cache_dir = self.config.cache_dir.as_path();
        let triple = self.config.file_names();

        let mut cached = Vec::new();
        let mut missing = Vec::new();
        for file in triple {
            if is_cached(cache_dir, file).await {
                debug!(file = %file, "Artifact found in cache");
                cached.push((file, read_run_id(cache_dir, file).await.ok()));
            } else {
                missing.push(file);
            }
        }

        // A complete cache that mixes runs can only heal from the remote
        let mut fetch = missing;
        if fetch.is_empty()
            && self.config.remote_base_url.is_some()
            && common_run(cached.iter().map(|(_, run)| *run)).is_none()
        {
            warn!(
                cache = %cache_dir.display(),
                "Cached artifacts do not share one run, refreshing the triple"
            );
            fetch = triple.to_vec();
        }

        let mut staging = Staging::new(cache_dir);
        let result = self.refresh(&mut staging, fetch, &cached).await;
        staging.remove().await;
        result
    }

    /// Stage `fetch`, then any cached file from another run, then the
    /// classifier's companion file, and commit them together.
    async fn refresh(
        &self,
        staging: &mut Staging,
        fetch: Vec<&str>,
        cached: &[(&str, Option<Uuid>)],
    ) -> Result<(Vec<String>, ClassifierArtifact), ArtifactLoadError> {
        let cache_dir = self.config.cache_dir.as_path();
        let classifier_file = self.config.classifier_file.as_str();

        let mut staged = Vec::new();
        let mut runs = Vec::new();
        for file in fetch {
            self.stage(staging, file).await?;
            runs.push(Some(read_run_id(&staging.dir, file).await?));
            staged.push(file);
        }

        if !runs.is_empty() {
            let run_id = common_run(runs).ok_or_else(|| {
                ArtifactLoadError::Mismatch(format!(
                    "remote store serves {} from different runs",
                    staged.join(", ")
                ))
            })?;

            let stale: Vec<&str> = cached
                .iter()
                .filter(|(file, run)| *run != Some(run_id) && !staged.contains(file))
                .map(|(file, _)| *file)
                .collect();
            if !stale.is_empty() {
                warn!(run_id = %run_id, files = ?stale, "Cached artifacts belong to another run, refreshing");
            }
            for file in stale {
                self.stage(staging, file).await?;
                let remote_run = read_run_id(&staging.dir, file).await?;
                if remote_run != run_id {
                    return Err(ArtifactLoadError::Mismatch(format!(
                        "remote `{file}` belongs to run {remote_run}, expected {run_id}"
                    )));
                }
                staged.push(file);
            }
        }

        // An ONNX classifier keeps its graph in a separate file
        let refreshed = staged.contains(&classifier_file);
        let classifier_dir = if refreshed { staging.dir.as_path() } else { cache_dir };
        let classifier: ClassifierArtifact = read_json_async(classifier_dir, classifier_file).await?;
        if let Some(file) = classifier.model.companion_file() {
            if refreshed || !is_cached(cache_dir, file).await {
                self.stage(staging, file).await?;
                staged.push(file);
            }
        }

        staging.commit(cache_dir, &staged).await?;
        let downloaded = staged.iter().map(|file| file.to_string()).collect();
        Ok((downloaded, classifier))
    }

    /// Download `file` into the staging directory.
    async fn stage(&self, staging: &mut Staging, file: &str) -> Result<(), ArtifactLoadError> {
        let Some(base_url) = self.config.remote_base_url.as_deref() else {
            return Err(ArtifactLoadError::Unavailable {
                file: file.to_string(),
                reason: format!(
                    "not in cache {} and no remote store configured",
                    self.config.cache_dir.display()
                ),
            });
        };

        staging
            .create()
            .await
            .map_err(|e| ArtifactLoadError::Unavailable {
                file: file.to_string(),
                reason: format!("cannot create staging dir {}: {e}", staging.dir.display()),
            })?;

        let url = format!("{}/{}", base_url.trim_end_matches('/'), file);
        self.download(&url, file, &staging.dir.join(file)).await
    }

    /// Download with bounded retries and exponential backoff. Client errors
    /// (4xx) are not retried.
    async fn download(&self, url: &str, file: &str, dest: &Path) -> Result<(), ArtifactLoadError> {
        let max_attempts = self.config.download_retries.max(1);
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!(url = %url, attempt = attempt, "Downloading artifact");

            match self.download_once(url, dest).await {
                Ok(bytes) => {
                    info!(file = %file, bytes = bytes, "Artifact downloaded");
                    return Ok(());
                }
                Err(failure) if !failure.retryable || attempt >= max_attempts => {
                    warn!(file = %file, attempts = attempt, error = %failure.reason, "Artifact download failed");
                    return Err(ArtifactLoadError::Download {
                        file: file.to_string(),
                        attempts: attempt,
                        reason: failure.reason,
                    });
                }
                Err(failure) => {
                    warn!(
                        file = %file,
                        attempt = attempt,
                        retry_in_ms = backoff.as_millis() as u64,
                        error = %failure.reason,
                        "Artifact download failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    /// One download attempt.
    async fn download_once(&self, url: &str, dest: &Path) -> Result<usize, DownloadFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(DownloadFailure::transient)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadFailure {
                reason: format!("HTTP {status}"),
                retryable: !status.is_client_error(),
            });
        }

        let body = response.bytes().await.map_err(DownloadFailure::transient)?;
        write_via_partial(dest, &body)
            .await
            .map_err(DownloadFailure::transient)?;

        Ok(body.len())
    }
}

impl ArtifactSource for ArtifactStore {
    async fn load(&self) -> Result<ArtifactSet, ArtifactLoadError> {
        let (downloaded, classifier) = self.sync_cache().await?;
        if !downloaded.is_empty() {
            info!(files = ?downloaded, "Artifact cache refreshed");
        }

        let dir = self.config.cache_dir.clone();
        let config = self.config.clone();
        let onnx_threads = self.onnx_threads;

        tokio::task::spawn_blocking(move || {
            ArtifactSet::load_with_classifier(&dir, &config, classifier, onnx_threads)
        })
        .await
        .map_err(|e| ArtifactLoadError::Unavailable {
            file: self.config.classifier_file.clone(),
            reason: format!("load task failed: {e}"),
        })?
    }
}

/// Scratch directory inside the cache, created on first use.
struct Staging {
    dir: PathBuf,
    created: bool,
}

impl Staging {
    fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join(format!(".staging-{}", Uuid::new_v4())),
            created: false,
        }
    }

    async fn create(&mut self) -> std::io::Result<()> {
        if !self.created {
            tokio::fs::create_dir_all(&self.dir).await?;
            self.created = true;
        }
        Ok(())
    }

    async fn commit(&self, cache_dir: &Path, files: &[&str]) -> Result<(), ArtifactLoadError> {
        for file in files {
            tokio::fs::rename(self.dir.join(file), cache_dir.join(file))
                .await
                .map_err(|e| ArtifactLoadError::Unavailable {
                    file: file.to_string(),
                    reason: format!("cannot move into cache {}: {e}", cache_dir.display()),
                })?;
        }
        Ok(())
    }

    async fn remove(self) {
        if !self.created {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "Failed to remove staging dir");
        }
    }
}

struct DownloadFailure {
    reason: String,
    retryable: bool,
}

impl DownloadFailure {
    fn transient<E: std::fmt::Display>(e: E) -> Self {
        Self {
            reason: e.to_string(),
            retryable: true,
        }
    }
}

/// Write through a `.part` file so a cut-off transfer never looks like a
/// finished one. The `.part` file is removed on failure.
async fn write_via_partial(dest: &Path, body: &[u8]) -> std::io::Result<()> {
    let partial = partial_path(dest);
    let written = match tokio::fs::write(&partial, body).await {
        Ok(()) => tokio::fs::rename(&partial, dest).await,
        Err(e) => Err(e),
    };
    if written.is_err() {
        let _ = tokio::fs::remove_file(&partial).await;
    }
    written
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
