//! Robust feature scaling fitted once per training run

use crate::error::{ArtifactLoadError, FitError};
use crate::feature_extractor::{
    FeatureBuilder, FeatureVector, ImputationMedians, FEATURE_COUNT, FEATURE_NAMES,
};
use crate::models::metadata::ArtifactMetadata;
use serde::{Deserialize, Serialize};

/// Inter-quantile range used for the spread.
const QUANTILE_RANGE: (f64, f64) = (0.25, 0.75);

/// Feature vector after scaling, ready for the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledVector(Vec<f64>);

impl ScaledVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f64>> for ScaledVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// Median / inter-quartile-range scaling plus the imputation medians of the
/// same run. Immutable once fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedTransform {
    metadata: ArtifactMetadata,
    feature_names: Vec<String>,
    center: Vec<f64>,
    scale: Vec<f64>,
    quantile_range: (f64, f64),
    imputation: ImputationMedians,
}

impl FittedTransform {
    /// Fit center and spread per feature column.
    ///
    /// A column with zero spread keeps a scale of 1 so it is only centered.
    pub fn fit(
        matrix: &[FeatureVector],
        imputation: ImputationMedians,
        metadata: ArtifactMetadata,
    ) -> Result<Self, FitError> {
        if matrix.is_empty() {
            return Err(FitError::EmptyTrainingSet);
        }

        let mut center = Vec::with_capacity(FEATURE_COUNT);
        let mut scale = Vec::with_capacity(FEATURE_COUNT);

        for (column, &name) in FEATURE_NAMES.iter().enumerate() {
            let mut values: Vec<f64> = matrix.iter().map(|row| row[column]).collect();
            values.sort_by(f64::total_cmp);

            let median = quantile(&values, 0.5).ok_or(FitError::NoValues(name))?;
            let low = quantile(&values, QUANTILE_RANGE.0).ok_or(FitError::NoValues(name))?;
            let high = quantile(&values, QUANTILE_RANGE.1).ok_or(FitError::NoValues(name))?;

            let spread = high - low;
            center.push(median);
            scale.push(if spread > 0.0 { spread } else { 1.0 });
        }

        Ok(Self {
            metadata,
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            center,
            scale,
            quantile_range: QUANTILE_RANGE,
            imputation,
        })
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn center(&self) -> &[f64] {
        &self.center
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn imputation(&self) -> &ImputationMedians {
        &self.imputation
    }

    /// Number of features the transform was fitted on
    pub fn feature_count(&self) -> usize {
        self.center.len()
    }

    /// Feature builder using this run's imputation medians
    pub fn feature_builder(&self) -> FeatureBuilder {
        FeatureBuilder::new(self.imputation)
    }

    /// Re-stamp the transform with another run's metadata
    pub fn with_metadata(mut self, metadata: ArtifactMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Scale one feature vector.
    ///
    /// A length mismatch means the deployed artifacts do not belong to this
    /// feature definition and is reported as an artifact error.
    pub fn apply(&self, features: &FeatureVector) -> Result<ScaledVector, ArtifactLoadError> {
        if features.len() != self.feature_count() {
            return Err(ArtifactLoadError::Mismatch(format!(
                "transform expects {} features, got {}",
                self.feature_count(),
                features.len()
            )));
        }

        Ok(ScaledVector(
            features
                .as_slice()
                .iter()
                .zip(self.center.iter().zip(&self.scale))
                .map(|(x, (c, s))| (x - c) / s)
                .collect(),
        ))
    }

    /// Check the transform was fitted under the current feature definition
    /// and is numerically usable.
    pub fn validate(&self, file: &str) -> Result<(), ArtifactLoadError> {
        let corrupt = |reason: String| ArtifactLoadError::Corrupt {
            file: file.to_string(),
            reason,
        };

        if !self.metadata.is_current_pipeline() {
            return Err(ArtifactLoadError::Mismatch(format!(
                "transform was fitted under pipeline `{}`",
                self.metadata.pipeline_version
            )));
        }
        if self.feature_names.iter().map(String::as_str).ne(FEATURE_NAMES) {
            return Err(ArtifactLoadError::Mismatch(format!(
                "transform feature order {:?} differs from {:?}",
                self.feature_names, FEATURE_NAMES
            )));
        }
        if self.center.len() != FEATURE_COUNT || self.scale.len() != FEATURE_COUNT {
            return Err(corrupt(format!(
                "expected {FEATURE_COUNT} centers and scales, found {} and {}",
                self.center.len(),
                self.scale.len()
            )));
        }
        if self.center.iter().any(|c| !c.is_finite()) {
            return Err(corrupt("non-finite center".to_string()));
        }
        if self.scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(corrupt("scale must be finite and positive".to_string()));
        }
        if !self.imputation.is_valid() {
            return Err(corrupt("imputation medians are invalid".to_string()));
        }
        Ok(())
    }
}

/// Linearly interpolated quantile of already sorted values.
pub(crate) fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let position = q.clamp(0.0, 1.0) * last as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_extractor::BuildMode;
    use crate::types::record::CanonicalRecord;

    fn medians() -> ImputationMedians {
        ImputationMedians {
            period: 9.8,
            duration: 3.8,
            transit_depth: 420.0,
            planet_radius: 2.5,
            star_temp: 5760.0,
            star_radius: 1.0,
            model_snr: 25.0,
        }
    }

    fn features(period: f64, snr: f64) -> FeatureVector {
        let record = CanonicalRecord {
            period: Some(period),
            duration: Some(3.0),
            transit_depth: Some(500.0),
            planet_radius: Some(2.0),
            star_temp: Some(5700.0),
            star_radius: Some(1.0),
            model_snr: Some(snr),
            label: None,
        };
        FeatureBuilder::new(medians())
            .build(&record, BuildMode::Training)
            .unwrap()
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&sorted, 0.5), Some(2.5));
        assert_eq!(quantile(&sorted, 0.25), Some(1.75));
        assert_eq!(quantile(&sorted, 0.75), Some(3.25));
        assert_eq!(quantile(&[7.0], 0.25), Some(7.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_fit_uses_median_and_iqr() {
        let matrix: Vec<FeatureVector> = [1.0, 2.0, 3.0, 4.0, 5.0]
            .iter()
            .map(|&p| features(p, p * 10.0))
            .collect();

        let transform = FittedTransform::fit(&matrix, medians(), ArtifactMetadata::new_run()).unwrap();

        assert_eq!(transform.center()[0], 3.0);
        assert_eq!(transform.scale()[0], 2.0);
        assert_eq!(transform.center()[4], 30.0);
        assert_eq!(transform.scale()[4], 20.0);
        // Constant column: only centered
        assert_eq!(transform.scale()[1], 1.0);
        assert!(transform.validate("scaler.json").is_ok());
    }

    #[test]
    fn test_apply_scales_each_feature() {
        let matrix: Vec<FeatureVector> = [1.0, 2.0, 3.0, 4.0, 5.0]
            .iter()
            .map(|&p| features(p, 20.0))
            .collect();
        let transform = FittedTransform::fit(&matrix, medians(), ArtifactMetadata::new_run()).unwrap();

        let scaled = transform.apply(&features(7.0, 20.0)).unwrap();
        assert_eq!(scaled.len(), FEATURE_COUNT);
        assert_eq!(scaled.as_slice()[0], 2.0);
        assert_eq!(scaled.as_slice()[1], 0.0);
    }

    #[test]
    fn test_fit_requires_rows() {
        assert_eq!(
            FittedTransform::fit(&[], medians(), ArtifactMetadata::new_run()),
            Err(FitError::EmptyTrainingSet)
        );
    }

    #[test]
    fn test_validate_rejects_other_pipelines_and_bad_scales() {
        let matrix = vec![features(1.0, 10.0), features(2.0, 20.0)];
        let transform = FittedTransform::fit(&matrix, medians(), ArtifactMetadata::new_run()).unwrap();

        let mut old = transform.clone();
        old.metadata.pipeline_version = "exoplanet-features/v0".to_string();
        assert!(matches!(old.validate("scaler.json"), Err(ArtifactLoadError::Mismatch(_))));

        let mut reordered = transform.clone();
        reordered.feature_names.swap(5, 6);
        assert!(matches!(
            reordered.validate("scaler.json"),
            Err(ArtifactLoadError::Mismatch(_))
        ));

        let mut zero = transform.clone();
        zero.scale[2] = 0.0;
        assert!(matches!(
            zero.validate("scaler.json"),
            Err(ArtifactLoadError::Corrupt { .. })
        ));

        let mut short = transform;
        short.center.pop();
        assert!(matches!(
            short.validate("scaler.json"),
            Err(ArtifactLoadError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_apply_rejects_length_mismatch() {
        let matrix = vec![features(1.0, 10.0), features(2.0, 20.0)];
        let mut transform = FittedTransform::fit(&matrix, medians(), ArtifactMetadata::new_run()).unwrap();
        transform.center.push(0.0);
        transform.scale.push(1.0);

        assert!(matches!(
            transform.apply(&features(1.0, 10.0)),
            Err(ArtifactLoadError::Mismatch(_))
        ));
    }
}
