//! Provenance shared by the three artifacts of one training run

use crate::feature_extractor::PIPELINE_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the training run an artifact belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Shared by the classifier, transform and codec of one run
    pub run_id: Uuid,
    /// Feature definition the artifacts were fitted under
    pub pipeline_version: String,
    /// Fit timestamp
    pub fitted_at: DateTime<Utc>,
}

impl ArtifactMetadata {
    /// Metadata for a new training run under the current feature definition
    pub fn new_run() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_version: PIPELINE_VERSION.to_string(),
            fitted_at: Utc::now(),
        }
    }

    /// Whether the artifact was fitted under the current feature definition
    pub fn is_current_pipeline(&self) -> bool {
        self.pipeline_version == PIPELINE_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_runs_are_distinct() {
        let a = ArtifactMetadata::new_run();
        let b = ArtifactMetadata::new_run();
        assert_ne!(a.run_id, b.run_id);
        assert!(a.is_current_pipeline());
    }

    #[test]
    fn test_metadata_serialization() {
        let json = r#"{
            "run_id": "6f1c2a4e-8d3b-4b8e-9a51-2f7d0c3e9b14",
            "pipeline_version": "exoplanet-features/v0",
            "fitted_at": "2025-10-05T14:22:31Z"
        }"#;
        let metadata: ArtifactMetadata = serde_json::from_str(json).unwrap();
        assert!(!metadata.is_current_pipeline());
        assert_eq!(
            metadata.run_id.to_string(),
            "6f1c2a4e-8d3b-4b8e-9a51-2f7d0c3e9b14"
        );
    }
}
