//! Feature construction shared by training and serving.
//!
//! Both paths go through [`FeatureBuilder::build`], so the cleaning rules,
//! their order and the output column order cannot drift apart. The only
//! difference between modes is how absent measurements are treated: a
//! training row from a survey without that column is imputed, a serving
//! request without it is rejected.

use crate::error::{FitError, ValidationError};
use crate::models::transform::quantile;
use crate::types::record::{CanonicalRecord, Field};
use serde::{Deserialize, Serialize};
use std::ops::Index;
use tracing::debug;

/// Version tag of the feature definition below. Stored in every fitted
/// artifact; artifacts fitted under another definition are rejected.
pub const PIPELINE_VERSION: &str = "exoplanet-features/v1";

/// Number of features produced.
pub const FEATURE_COUNT: usize = 7;

/// Output column order. Changing it requires refitting every artifact.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "period",
    "duration",
    "star_temp",
    "star_radius",
    "model_snr",
    "transit_depth_log",
    "planet_radius_log",
];

/// Which pipeline is asking for features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Absent measurements are imputed
    Training,
    /// Absent measurements are validation errors
    Serving,
}

/// Fixed-order feature vector, see [`FEATURE_NAMES`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        FEATURE_COUNT
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn into_inner(self) -> [f64; FEATURE_COUNT] {
        self.0
    }
}

impl Index<usize> for FeatureVector {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.0[index]
    }
}

/// Training-distribution medians used to fill missing measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImputationMedians {
    pub period: f64,
    pub duration: f64,
    pub transit_depth: f64,
    pub planet_radius: f64,
    pub star_temp: f64,
    pub star_radius: f64,
    pub model_snr: f64,
}

impl ImputationMedians {
    pub fn get(&self, field: Field) -> f64 {
        match field {
            Field::Period => self.period,
            Field::Duration => self.duration,
            Field::TransitDepth => self.transit_depth,
            Field::PlanetRadius => self.planet_radius,
            Field::StarTemp => self.star_temp,
            Field::StarRadius => self.star_radius,
            Field::ModelSnr => self.model_snr,
        }
    }

    /// Median of every measurement over the training records, computed after
    /// domain-invalidity masking so impossible values never shift it.
    pub fn fit(records: &[CanonicalRecord]) -> Result<Self, FitError> {
        if records.is_empty() {
            return Err(FitError::EmptyTrainingSet);
        }

        let median = |field: Field| -> Result<f64, FitError> {
            let mut values: Vec<f64> = records
                .iter()
                .filter_map(|r| r.get(field))
                .filter_map(|v| mask_invalid(field, v))
                .collect();
            values.sort_by(f64::total_cmp);
            quantile(&values, 0.5).ok_or(FitError::NoValues(field.canonical_name()))
        };

        Ok(Self {
            period: median(Field::Period)?,
            duration: median(Field::Duration)?,
            transit_depth: median(Field::TransitDepth)?,
            planet_radius: median(Field::PlanetRadius)?,
            star_temp: median(Field::StarTemp)?,
            star_radius: median(Field::StarRadius)?,
            model_snr: median(Field::ModelSnr)?,
        })
    }

    /// All medians are finite and pass their own masking rule
    pub fn is_valid(&self) -> bool {
        Field::ALL
            .into_iter()
            .all(|field| mask_invalid(field, self.get(field)).is_some())
    }
}

/// Turns canonical records into feature vectors.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    medians: ImputationMedians,
}

impl FeatureBuilder {
    pub fn new(medians: ImputationMedians) -> Self {
        Self { medians }
    }

    pub fn medians(&self) -> &ImputationMedians {
        &self.medians
    }

    /// Build the feature vector for one record.
    ///
    /// Steps, in order: presence check, domain-invalidity masking, median
    /// imputation, `ln(1 + x)` of depth and planet radius, column assembly.
    pub fn build(
        &self,
        record: &CanonicalRecord,
        mode: BuildMode,
    ) -> Result<FeatureVector, ValidationError> {
        let value = |field: Field| -> Result<f64, ValidationError> {
            let present = match (record.get(field), mode) {
                (Some(v), _) if v.is_finite() => Some(v),
                (Some(v), BuildMode::Serving) => {
                    return Err(ValidationError::OutOfRange { field, value: v })
                }
                (None, BuildMode::Serving) => return Err(ValidationError::Missing(field)),
                (_, BuildMode::Training) => None,
            };

            let cleaned = present.and_then(|v| mask_invalid(field, v));
            if cleaned.is_none() {
                debug!(field = %field, "Imputing missing or invalid value with training median");
            }
            Ok(cleaned.unwrap_or_else(|| self.medians.get(field)))
        };

        let period = value(Field::Period)?;
        let duration = value(Field::Duration)?;
        let transit_depth = value(Field::TransitDepth)?;
        let planet_radius = value(Field::PlanetRadius)?;
        let star_temp = value(Field::StarTemp)?;
        let star_radius = value(Field::StarRadius)?;
        let model_snr = value(Field::ModelSnr)?;

        Ok(FeatureVector([
            period,
            duration,
            star_temp,
            star_radius,
            model_snr,
            transit_depth.ln_1p(),
            planet_radius.ln_1p(),
        ]))
    }

    /// Build features for a batch of training records
    pub fn build_training_matrix(
        &self,
        records: &[CanonicalRecord],
    ) -> Result<Vec<FeatureVector>, ValidationError> {
        records
            .iter()
            .map(|r| self.build(r, BuildMode::Training))
            .collect()
    }
}

/// Replace physically impossible values with "missing".
fn mask_invalid(field: Field, value: f64) -> Option<f64> {
    let valid = if field.requires_positive() {
        value > 0.0
    } else {
        value >= 0.0
    };
    (valid && value.is_finite()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn record(values: [f64; 7]) -> CanonicalRecord {
        CanonicalRecord {
            period: Some(values[0]),
            duration: Some(values[1]),
            transit_depth: Some(values[2]),
            planet_radius: Some(values[3]),
            star_temp: Some(values[4]),
            star_radius: Some(values[5]),
            model_snr: Some(values[6]),
            label: None,
        }
    }

    #[test]
    fn test_feature_order_and_log_transforms() {
        let builder = FeatureBuilder::new(medians());
        let features = builder
            .build(&record([9.49, 2.96, 615.8, 2.26, 5455.0, 0.93, 35.8]), BuildMode::Serving)
            .unwrap();

        assert_eq!(features.len(), FEATURE_NAMES.len());
        assert_eq!(features[0], 9.49);
        assert_eq!(features[1], 2.96);
        assert_eq!(features[2], 5455.0);
        assert_eq!(features[3], 0.93);
        assert_eq!(features[4], 35.8);
        assert_eq!(features[5], 615.8_f64.ln_1p());
        assert_eq!(features[6], 2.26_f64.ln_1p());
    }

    #[test]
    fn test_training_and_serving_are_bit_identical() {
        let builder = FeatureBuilder::new(medians());
        let table: [([f64; 7], [f64; 7]); 4] = [
            (
                [9.49, 2.96, 615.8, 2.26, 5455.0, 0.93, 35.8],
                [9.49, 2.96, 5455.0, 0.93, 35.8, 615.8_f64.ln_1p(), 2.26_f64.ln_1p()],
            ),
            (
                [0.0, 2.0, -10.0, 1.5, 6000.0, 1.1, 12.0],
                [9.8, 2.0, 6000.0, 1.1, 12.0, 420.0_f64.ln_1p(), 1.5_f64.ln_1p()],
            ),
            (
                [54.4, -1.0, 0.0, 0.0, 0.0, -0.2, -3.0],
                [54.4, 3.8, 0.0, 1.0, 25.0, 0.0, 2.5_f64.ln_1p()],
            ),
            (
                [1.2, 1.1, 20000.0, 30.0, 3900.0, 0.5, 1500.0],
                [1.2, 1.1, 3900.0, 0.5, 1500.0, 20000.0_f64.ln_1p(), 30.0_f64.ln_1p()],
            ),
        ];

        for (input, expected) in table {
            let rec = record(input);
            let serving = builder.build(&rec, BuildMode::Serving).unwrap();
            let training = builder.build(&rec, BuildMode::Training).unwrap();

            assert_eq!(serving.into_inner(), expected);
            for (s, t) in serving.as_slice().iter().zip(training.as_slice()) {
                assert_eq!(s.to_bits(), t.to_bits());
            }
        }
    }

    #[test]
    fn test_invalid_values_are_imputed_before_log() {
        let sentinel = ImputationMedians {
            period: 111.0,
            transit_depth: 12345.0,
            ..medians()
        };
        let builder = FeatureBuilder::new(sentinel);

        let features = builder
            .build(&record([0.0, 2.96, -5.0, 2.26, 5455.0, 0.93, 35.8]), BuildMode::Serving)
            .unwrap();

        assert_eq!(features[0], 111.0);
        assert_eq!(features[5], 12345.0_f64.ln_1p());
    }

    #[test]
    fn test_serving_rejects_absent_fields() {
        let builder = FeatureBuilder::new(medians());
        let mut rec = record([9.49, 2.96, 615.8, 2.26, 5455.0, 0.93, 35.8]);
        rec.model_snr = None;

        assert_eq!(
            builder.build(&rec, BuildMode::Serving).unwrap_err(),
            ValidationError::Missing(Field::ModelSnr)
        );

        let training = builder.build(&rec, BuildMode::Training).unwrap();
        assert_eq!(training[4], 25.0);
    }

    #[test]
    fn test_serving_rejects_non_finite_values() {
        let builder = FeatureBuilder::new(medians());
        let rec = record([f64::NAN, 2.96, 615.8, 2.26, 5455.0, 0.93, 35.8]);

        assert!(matches!(
            builder.build(&rec, BuildMode::Serving),
            Err(ValidationError::OutOfRange { field: Field::Period, .. })
        ));
        assert_eq!(builder.build(&rec, BuildMode::Training).unwrap()[0], 9.8);
    }

    #[test]
    fn test_medians_ignore_masked_values() {
        let records = vec![
            record([1.0, 2.0, -1.0, 1.0, 5000.0, 1.0, 10.0]),
            record([3.0, 4.0, 100.0, 2.0, 6000.0, 0.0, 20.0]),
            record([0.0, 6.0, 300.0, 3.0, -1.0, 2.0, 30.0]),
        ];

        let medians = ImputationMedians::fit(&records).unwrap();
        assert_eq!(medians.period, 2.0);
        assert_eq!(medians.duration, 4.0);
        assert_eq!(medians.transit_depth, 200.0);
        assert_eq!(medians.star_temp, 5500.0);
        assert_eq!(medians.star_radius, 1.5);
        assert_eq!(medians.model_snr, 20.0);
        assert!(medians.is_valid());
    }

    #[test]
    fn test_medians_require_values() {
        assert_eq!(ImputationMedians::fit(&[]), Err(FitError::EmptyTrainingSet));

        let mut rec = record([1.0, 2.0, 3.0, 1.0, 5000.0, 1.0, 10.0]);
        rec.model_snr = None;
        assert_eq!(
            ImputationMedians::fit(&[rec]),
            Err(FitError::NoValues("model_snr"))
        );
    }
}
