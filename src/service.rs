//! Prediction service: lazy artifact loading and the classify operation

use crate::config::AppConfig;
use crate::error::{ArtifactLoadError, ClassifyError, InferenceError};
use crate::feature_extractor::BuildMode;
use crate::metrics::ServiceMetrics;
use crate::models::loader::{ArtifactSet, ArtifactSource, ArtifactStore};
use crate::types::class::Classification;
use crate::types::record::{CanonicalRecord, ClassifyRequest, RawClassifyRequest};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info};

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<ArtifactSet>, ArtifactLoadError>>>;

/// A load in progress. Every caller arriving while it runs awaits the same
/// future and sees the same outcome.
struct InflightLoad {
    attempt: u64,
    future: LoadFuture,
}

enum LoadState {
    Ready(Arc<ArtifactSet>),
    Pending(u64, LoadFuture),
}

/// Classifies observations with a lazily loaded artifact triple.
///
/// The first call loads the artifacts; concurrent first callers share that
/// one load. After a successful load the triple is read without locking.
/// A failed load is reported to everyone waiting on it and the next call
/// tries again.
pub struct PredictionService<S: ArtifactSource = ArtifactStore> {
    source: Arc<S>,
    loaded: OnceLock<Arc<ArtifactSet>>,
    inflight: Mutex<Option<InflightLoad>>,
    attempts: AtomicU64,
    confidence_decimals: u32,
    metrics: Arc<ServiceMetrics>,
}

impl PredictionService<ArtifactStore> {
    /// Service backed by the configured artifact cache and remote store
    pub fn from_config(config: &AppConfig) -> Result<Self, ArtifactLoadError> {
        let store = ArtifactStore::from_config(config)?;
        Ok(Self::with_source(store, config.service.confidence_decimals))
    }
}

impl<S: ArtifactSource> PredictionService<S> {
    pub fn with_source(source: S, confidence_decimals: u32) -> Self {
        Self {
            source: Arc::new(source),
            loaded: OnceLock::new(),
            inflight: Mutex::new(None),
            attempts: AtomicU64::new(0),
            confidence_decimals,
            metrics: Arc::new(ServiceMetrics::new()),
        }
    }

    /// Report into an existing metrics collector
    pub fn with_metrics(mut self, metrics: Arc<ServiceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Load the artifact triple unless already loaded. Idempotent.
    pub async fn ensure_loaded(&self) -> Result<Arc<ArtifactSet>, ArtifactLoadError> {
        if let Some(set) = self.loaded.get() {
            return Ok(Arc::clone(set));
        }

        let (attempt, future) = match self.join_or_start_load() {
            LoadState::Ready(set) => return Ok(set),
            LoadState::Pending(attempt, future) => (attempt, future),
        };

        let result = future.await;

        // Publish before clearing so no caller can start a second load
        // in between.
        if let Ok(set) = &result {
            let _ = self.loaded.set(Arc::clone(set));
        }
        let mut inflight = self.lock_inflight();
        if inflight.as_ref().is_some_and(|load| load.attempt == attempt) {
            *inflight = None;
        }

        result
    }

    fn lock_inflight(&self) -> MutexGuard<'_, Option<InflightLoad>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join_or_start_load(&self) -> LoadState {
        let mut inflight = self.lock_inflight();

        if let Some(set) = self.loaded.get() {
            return LoadState::Ready(Arc::clone(set));
        }
        if let Some(load) = inflight.as_ref() {
            debug!(attempt = load.attempt, "Joining artifact load in progress");
            return LoadState::Pending(load.attempt, load.future.clone());
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let source = Arc::clone(&self.source);
        let metrics = Arc::clone(&self.metrics);

        let future = async move {
            let started = Instant::now();
            info!(attempt = attempt, "Loading classification artifacts");

            match source.load().await {
                Ok(set) => {
                    let elapsed = started.elapsed();
                    metrics.record_artifact_load(elapsed);
                    info!(
                        attempt = attempt,
                        run_id = %set.run_id(),
                        load_time_ms = elapsed.as_millis() as u64,
                        "Classification artifacts ready"
                    );
                    Ok(Arc::new(set))
                }
                Err(e) => {
                    error!(attempt = attempt, error = %e, "Artifact load failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared();

        *inflight = Some(InflightLoad {
            attempt,
            future: future.clone(),
        });
        LoadState::Pending(attempt, future)
    }

    /// Validate a raw request, then classify it.
    ///
    /// Invalid requests fail before the artifacts are touched.
    pub async fn classify_raw(
        &self,
        raw: &RawClassifyRequest,
    ) -> Result<Classification, ClassifyError> {
        match ClassifyRequest::parse(raw) {
            Ok(request) => self.classify(&request).await,
            Err(e) => {
                let error = ClassifyError::from(e);
                debug!(error = %error, "Request rejected");
                self.metrics.record_failure(&error);
                Err(error)
            }
        }
    }

    /// Classify one validated request, loading the artifacts on first use.
    pub async fn classify(
        &self,
        request: &ClassifyRequest,
    ) -> Result<Classification, ClassifyError> {
        let started = Instant::now();

        let result = match self.ensure_loaded().await {
            Ok(set) => self.classify_with(&set, request),
            Err(e) => Err(ClassifyError::ArtifactLoad(e)),
        };

        match &result {
            Ok(classification) => {
                let latency = started.elapsed();
                self.metrics.record_classification(latency, classification);
                debug!(
                    classification = %classification.classification,
                    confidence = classification.confidence,
                    latency_us = latency.as_micros() as u64,
                    "Observation classified"
                );
            }
            Err(e) => self.metrics.record_failure(e),
        }
        result
    }

    /// Classify against an already loaded triple. Pure computation.
    pub fn classify_with(
        &self,
        set: &ArtifactSet,
        request: &ClassifyRequest,
    ) -> Result<Classification, ClassifyError> {
        let record = CanonicalRecord::from(request);
        let features = set.builder().build(&record, BuildMode::Serving)?;
        let scaled = set.transform().apply(&features)?;

        let probabilities = set.engine().predict(&scaled).map_err(internal)?;
        let (index, probability) = probabilities
            .argmax()
            .ok_or(InferenceError::EmptyOutput)
            .map_err(internal)?;
        let classification = set
            .codec()
            .decode(index)
            .ok_or(InferenceError::UnknownClassIndex(index))
            .map_err(internal)?;

        Ok(Classification {
            classification,
            confidence: round_confidence(probability, self.confidence_decimals),
        })
    }
}

/// Inference failures are logged here and reach the caller only as a
/// generic internal error.
pub(crate) fn internal(e: InferenceError) -> ClassifyError {
    error!(error = %e, "Inference failed");
    ClassifyError::Internal
}

/// Round to `decimals` places, staying within [0, 1]
pub fn round_confidence(probability: f64, decimals: u32) -> f64 {
    let factor = 10_f64.powi(decimals.min(15) as i32);
    ((probability * factor).round() / factor).clamp(0.0, 1.0)
}
