//! Classifier output index ↔ class label mapping

use crate::error::{ArtifactLoadError, FitError};
use crate::models::metadata::ArtifactMetadata;
use crate::types::class::PlanetClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Bijection between classifier output positions and class labels.
///
/// The ordering is fixed when the codec is fitted and persisted with the run;
/// serving always uses the persisted ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCodec {
    metadata: ArtifactMetadata,
    classes: Vec<PlanetClass>,
}

impl LabelCodec {
    /// Build the codec from the labels observed in training, ordered
    /// alphabetically by label name.
    pub fn fit<I>(labels: I, metadata: ArtifactMetadata) -> Result<Self, FitError>
    where
        I: IntoIterator<Item = PlanetClass>,
    {
        let distinct: BTreeSet<&'static str> = labels.into_iter().map(|l| l.as_str()).collect();
        if distinct.is_empty() {
            return Err(FitError::EmptyTrainingSet);
        }

        let classes = distinct
            .into_iter()
            .filter_map(|name| name.parse().ok())
            .collect();

        Ok(Self { metadata, classes })
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    /// Labels in output-index order
    pub fn classes(&self) -> &[PlanetClass] {
        &self.classes
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Output index of `label`
    pub fn encode(&self, label: PlanetClass) -> Option<usize> {
        self.classes.iter().position(|c| *c == label)
    }

    /// Label at output index `index`
    pub fn decode(&self, index: usize) -> Option<PlanetClass> {
        self.classes.get(index).copied()
    }

    /// Re-stamp the codec with another run's metadata
    pub fn with_metadata(mut self, metadata: ArtifactMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check the persisted mapping is a bijection.
    pub fn validate(&self, file: &str) -> Result<(), ArtifactLoadError> {
        let corrupt = |reason: &str| ArtifactLoadError::Corrupt {
            file: file.to_string(),
            reason: reason.to_string(),
        };

        if self.classes.is_empty() {
            return Err(corrupt("codec has no classes"));
        }
        let distinct: BTreeSet<_> = self.classes.iter().collect();
        if distinct.len() != self.classes.len() {
            return Err(corrupt("codec lists a class more than once"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_orders_alphabetically() {
        let labels = [
            PlanetClass::FalsePositive,
            PlanetClass::Confirmed,
            PlanetClass::FalsePositive,
            PlanetClass::Candidate,
        ];
        let codec = LabelCodec::fit(labels, ArtifactMetadata::new_run()).unwrap();

        assert_eq!(
            codec.classes(),
            &[
                PlanetClass::Candidate,
                PlanetClass::Confirmed,
                PlanetClass::FalsePositive
            ]
        );
        assert_eq!(codec.encode(PlanetClass::Confirmed), Some(1));
        assert_eq!(codec.decode(2), Some(PlanetClass::FalsePositive));
        assert_eq!(codec.decode(3), None);
    }

    #[test]
    fn test_round_trip_for_every_index() {
        let codec = LabelCodec::fit(PlanetClass::ALL, ArtifactMetadata::new_run()).unwrap();
        for index in 0..codec.num_classes() {
            let label = codec.decode(index).unwrap();
            assert_eq!(codec.encode(label), Some(index));
        }
    }

    #[test]
    fn test_only_observed_labels_are_kept() {
        let codec = LabelCodec::fit(
            [PlanetClass::FalsePositive, PlanetClass::Confirmed],
            ArtifactMetadata::new_run(),
        )
        .unwrap();
        assert_eq!(codec.num_classes(), 2);
        assert_eq!(codec.encode(PlanetClass::Candidate), None);
        assert_eq!(codec.encode(PlanetClass::FalsePositive), Some(1));
    }

    #[test]
    fn test_fit_requires_labels() {
        assert_eq!(
            LabelCodec::fit(Vec::new(), ArtifactMetadata::new_run()),
            Err(FitError::EmptyTrainingSet)
        );
    }

    #[test]
    fn test_persisted_order_is_kept() {
        let json = r#"{
            "metadata": {
                "run_id": "6f1c2a4e-8d3b-4b8e-9a51-2f7d0c3e9b14",
                "pipeline_version": "exoplanet-features/v1",
                "fitted_at": "2025-10-05T14:22:31Z"
            },
            "classes": ["false_positive", "candidate", "confirmed"]
        }"#;
        let codec: LabelCodec = serde_json::from_str(json).unwrap();

        assert!(codec.validate("label_codec.json").is_ok());
        assert_eq!(codec.decode(0), Some(PlanetClass::FalsePositive));
        assert_eq!(codec.encode(PlanetClass::Confirmed), Some(2));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_unknown_labels() {
        let json = r#"{
            "metadata": {
                "run_id": "6f1c2a4e-8d3b-4b8e-9a51-2f7d0c3e9b14",
                "pipeline_version": "exoplanet-features/v1",
                "fitted_at": "2025-10-05T14:22:31Z"
            },
            "classes": ["confirmed", "confirmed"]
        }"#;
        let codec: LabelCodec = serde_json::from_str(json).unwrap();
        assert!(matches!(
            codec.validate("label_codec.json"),
            Err(ArtifactLoadError::Corrupt { .. })
        ));

        let unknown = json.replace("\"confirmed\", \"confirmed\"", "\"exomoon\"");
        assert!(serde_json::from_str::<LabelCodec>(&unknown).is_err());
    }
}
