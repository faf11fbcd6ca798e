//! Error kinds for the classification pipeline.
//!
//! Validation failures are caller-facing and never fatal. Artifact failures
//! make the service unusable until a later load succeeds. Inference failures
//! are internal and are never shown to callers in detail.

use crate::types::record::Field;
use thiserror::Error;

/// A classify request that cannot be turned into a feature vector.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    Missing(Field),

    #[error("field `{field}` is not numeric: {value:?}")]
    NotNumeric { field: Field, value: String },

    #[error("field `{field}` is out of representable range: {value}")]
    OutOfRange { field: Field, value: f64 },
}

/// The artifact triple could not be fetched, read, or trusted.
///
/// Cloneable so that every caller waiting on a shared load receives the same
/// failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArtifactLoadError {
    #[error("artifact `{file}` is not available: {reason}")]
    Unavailable { file: String, reason: String },

    #[error("artifact `{file}` is corrupt: {reason}")]
    Corrupt { file: String, reason: String },

    #[error("failed to download `{file}` after {attempts} attempt(s): {reason}")]
    Download {
        file: String,
        attempts: u32,
        reason: String,
    },

    #[error("artifact mismatch: {0}")]
    Mismatch(String),

    #[error("classifier format `{0}` is not supported by this build")]
    UnsupportedFormat(String),

    #[error("cannot build HTTP client for the artifact store: {0}")]
    HttpClient(String),
}

/// Internal numeric failure of the classifier.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    #[error("input has {actual} features, classifier expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("classifier produced a non-finite value at output {index}")]
    NonFinite { index: usize },

    #[error("classifier produced an empty probability vector")]
    EmptyOutput,

    #[error("classifier output index {0} has no label")]
    UnknownClassIndex(usize),

    #[error("runtime failure: {0}")]
    Runtime(String),
}

/// Outcome of a failed `classify` call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("classification artifacts unavailable: {0}")]
    ArtifactLoad(#[from] ArtifactLoadError),

    /// Inference details are logged, not returned.
    #[error("internal error during classification")]
    Internal,
}

impl ClassifyError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            ClassifyError::Validation(_) => "validation_error",
            ClassifyError::ArtifactLoad(_) => "artifact_load_error",
            ClassifyError::Internal => "internal_error",
        }
    }
}

/// Unknown source survey identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown source survey `{0}` (expected one of: kepler, k2, tess)")]
    UnknownSource(String),
}

/// Fitting the transform or label codec failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("training set is empty")]
    EmptyTrainingSet,

    #[error("no valid training values for `{0}`")]
    NoValues(&'static str),

    #[error("training record has no label")]
    Unlabelled,

    #[error("cannot build training features: {0}")]
    Features(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error_kinds() {
        let validation: ClassifyError = ValidationError::Missing(Field::ModelSnr).into();
        assert_eq!(validation.kind(), "validation_error");
        assert_eq!(validation.to_string(), "missing required field `model_snr`");

        let load: ClassifyError = ArtifactLoadError::Mismatch("run ids differ".into()).into();
        assert_eq!(load.kind(), "artifact_load_error");

        let client: ClassifyError = ArtifactLoadError::HttpClient("no TLS backend".into()).into();
        assert_eq!(client.kind(), "artifact_load_error");
        assert_eq!(
            client.to_string(),
            "classification artifacts unavailable: cannot build HTTP client for the artifact store: no TLS backend"
        );

        assert_eq!(ClassifyError::Internal.kind(), "internal_error");
        assert_eq!(
            ClassifyError::Internal.to_string(),
            "internal error during classification"
        );
    }
}
