//! Held-out evaluation of a fitted artifact triple.
//!
//! Complete held-out records go through the serving path exactly as a
//! classify call would. Every record, complete or not, is also scored through
//! the training feature path, and the two predictions are compared.

use crate::error::{ClassifyError, InferenceError};
use crate::feature_extractor::BuildMode;
use crate::models::loader::{ArtifactSet, ArtifactSource};
use crate::service::{internal, PredictionService};
use crate::types::class::PlanetClass;
use crate::types::record::{CanonicalRecord, ClassifyRequest};
use tracing::{info, warn};

/// Counts of actual (rows) against predicted (columns) classes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    classes: Vec<PlanetClass>,
    counts: Vec<Vec<usize>>,
}

/// Per-class scores, as in a classification report
#[derive(Debug, Clone, PartialEq)]
pub struct ClassReport {
    pub class: PlanetClass,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

impl ConfusionMatrix {
    pub fn new(classes: &[PlanetClass]) -> Self {
        Self {
            classes: classes.to_vec(),
            counts: vec![vec![0; classes.len()]; classes.len()],
        }
    }

    pub fn classes(&self) -> &[PlanetClass] {
        &self.classes
    }

    /// Returns `false` when either class is not part of the matrix.
    pub fn record(&mut self, actual: PlanetClass, predicted: PlanetClass) -> bool {
        match (self.index(actual), self.index(predicted)) {
            (Some(row), Some(column)) => {
                self.counts[row][column] += 1;
                true
            }
            _ => false,
        }
    }

    pub fn count(&self, actual: PlanetClass, predicted: PlanetClass) -> usize {
        match (self.index(actual), self.index(predicted)) {
            (Some(row), Some(column)) => self.counts[row][column],
            _ => 0,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let correct: usize = (0..self.classes.len()).map(|i| self.counts[i][i]).sum();
        ratio(correct, self.total())
    }

    /// Precision, recall and F1 per class. Undefined ratios are zero.
    pub fn report(&self) -> Vec<ClassReport> {
        (0..self.classes.len())
            .map(|i| {
                let true_positive = self.counts[i][i];
                let support: usize = self.counts[i].iter().sum();
                let predicted: usize = self.counts.iter().map(|row| row[i]).sum();

                let precision = ratio(true_positive, predicted);
                let recall = ratio(true_positive, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };

                ClassReport {
                    class: self.classes[i],
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect()
    }

    /// Log the report and the matrix
    pub fn print_summary(&self, title: &str) {
        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║ {:<60} ║", title);
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ {:>14}  precision  recall  f1-score  support               ║", "");
        for row in self.report() {
            info!(
                "║ {:>14}  {:>9.2}  {:>6.2}  {:>8.2}  {:>7}               ║",
                row.class.as_str(),
                row.precision,
                row.recall,
                row.f1,
                row.support
            );
        }
        info!(
            "║ {:>14}  {:>9}  {:>6}  {:>8.2}  {:>7}               ║",
            "accuracy",
            "",
            "",
            self.accuracy(),
            self.total()
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Confusion matrix (rows actual, columns predicted):           ║");
        for (class, row) in self.classes.iter().zip(&self.counts) {
            let cells: Vec<String> = row.iter().map(|n| format!("{n:>6}")).collect();
            info!("║ {:>14} {}", class.as_str(), cells.join(""));
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }

    fn index(&self, class: PlanetClass) -> Option<usize> {
        self.classes.iter().position(|&c| c == class)
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Outcome of scoring a held-out set
#[derive(Debug, Clone)]
pub struct HoldoutEvaluation {
    /// Complete records scored through `classify_with`
    pub serving: ConfusionMatrix,
    /// Every labelled record scored through the training feature path
    pub training_path: ConfusionMatrix,
    /// Labelled records the serving path cannot take (missing or non-finite values)
    pub not_servable: usize,
    /// Records without a label
    pub unlabelled: usize,
    /// Servable records where the two paths predict different classes
    pub disagreements: usize,
}

impl HoldoutEvaluation {
    /// Score `records` against `set`.
    pub fn run<S: ArtifactSource>(
        service: &PredictionService<S>,
        set: &ArtifactSet,
        records: &[CanonicalRecord],
    ) -> Result<Self, ClassifyError> {
        let classes = set.codec().classes();
        let mut evaluation = Self {
            serving: ConfusionMatrix::new(classes),
            training_path: ConfusionMatrix::new(classes),
            not_servable: 0,
            unlabelled: 0,
            disagreements: 0,
        };

        for record in records {
            let Some(actual) = record.label else {
                evaluation.unlabelled += 1;
                continue;
            };

            let offline = predict_training_path(set, record)?;
            evaluation.training_path.record(actual, offline);

            let served = match ClassifyRequest::try_from(record) {
                Ok(request) => match service.classify_with(set, &request) {
                    Ok(result) => Some(result.classification),
                    Err(ClassifyError::Validation(_)) => None,
                    Err(e) => return Err(e),
                },
                Err(_) => None,
            };
            match served {
                Some(predicted) => {
                    evaluation.serving.record(actual, predicted);
                    if predicted != offline {
                        evaluation.disagreements += 1;
                    }
                }
                None => evaluation.not_servable += 1,
            }
        }

        if evaluation.disagreements > 0 {
            warn!(
                disagreements = evaluation.disagreements,
                "Serving and training feature paths disagree on held-out records"
            );
        }
        Ok(evaluation)
    }
}

/// Predict from the training feature path: missing values are imputed
/// instead of rejected.
fn predict_training_path(
    set: &ArtifactSet,
    record: &CanonicalRecord,
) -> Result<PlanetClass, ClassifyError> {
    let features = set.builder().build(record, BuildMode::Training)?;
    let scaled = set.transform().apply(&features)?;
    let probabilities = set.engine().predict(&scaled).map_err(internal)?;
    let (index, _) = probabilities
        .argmax()
        .ok_or(InferenceError::EmptyOutput)
        .map_err(internal)?;
    set.codec()
        .decode(index)
        .ok_or(InferenceError::UnknownClassIndex(index))
        .map_err(internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifactsConfig;
    use crate::models::loader::ArtifactStore;
    use std::path::{Path, PathBuf};

    use crate::types::class::PlanetClass::{Candidate, Confirmed, FalsePositive};

    fn fixture_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/artifacts")
    }

    fn record(values: [f64; 7], label: Option<PlanetClass>) -> CanonicalRecord {
        let [period, duration, transit_depth, planet_radius, star_temp, star_radius, model_snr] =
            values;
        CanonicalRecord {
            period: Some(period),
            duration: Some(duration),
            transit_depth: Some(transit_depth),
            planet_radius: Some(planet_radius),
            star_temp: Some(star_temp),
            star_radius: Some(star_radius),
            model_snr: Some(model_snr),
            label,
        }
    }

    #[test]
    fn test_confusion_matrix_scores() {
        let mut matrix = ConfusionMatrix::new(&PlanetClass::ALL);
        for (actual, predicted, n) in [
            (Confirmed, Confirmed, 8),
            (Confirmed, Candidate, 2),
            (Candidate, Candidate, 3),
            (Candidate, Confirmed, 1),
            (FalsePositive, FalsePositive, 5),
        ] {
            for _ in 0..n {
                assert!(matrix.record(actual, predicted));
            }
        }

        assert_eq!(matrix.total(), 19);
        assert_eq!(matrix.count(Confirmed, Candidate), 2);
        assert!((matrix.accuracy() - 16.0 / 19.0).abs() < 1e-12);

        let report = matrix.report();
        let confirmed = &report[1];
        assert_eq!(confirmed.class, Confirmed);
        assert_eq!(confirmed.support, 10);
        assert!((confirmed.precision - 8.0 / 9.0).abs() < 1e-12);
        assert!((confirmed.recall - 0.8).abs() < 1e-12);

        let false_positive = &report[2];
        assert_eq!(false_positive.precision, 1.0);
        assert_eq!(false_positive.f1, 1.0);
    }

    #[test]
    fn test_empty_matrix_scores_are_zero() {
        let mut matrix = ConfusionMatrix::new(&[Candidate, Confirmed]);
        assert_eq!(matrix.accuracy(), 0.0);
        assert!(matrix.report().iter().all(|row| row.precision == 0.0 && row.f1 == 0.0));
        assert!(!matrix.record(FalsePositive, Candidate));
        assert_eq!(matrix.total(), 0);
    }

    #[test]
    fn test_holdout_runs_through_serving_path() {
        let dir = fixture_dir();
        let config = ArtifactsConfig::local(&dir);
        let set = ArtifactSet::load_from_dir(&dir, &config, 1).unwrap();
        let service = PredictionService::with_source(ArtifactStore::new(config, 1).unwrap(), 4);

        let mut no_snr = record([9.49, 2.96, 615.8, 2.26, 5455.0, 0.93, 0.0], Some(Candidate));
        no_snr.model_snr = None;
        let records = vec![
            record([9.49, 2.96, 615.8, 2.26, 5455.0, 0.93, 35.8], Some(Confirmed)),
            record([2.5, 2.0, 20000.0, 30.0, 6000.0, 1.2, 12.0], Some(FalsePositive)),
            no_snr,
            record([9.49, 2.96, 615.8, 2.26, 5455.0, 0.93, 35.8], None),
        ];

        let evaluation = HoldoutEvaluation::run(&service, &set, &records).unwrap();

        assert_eq!(evaluation.serving.total(), 2);
        assert_eq!(evaluation.serving.accuracy(), 1.0);
        assert_eq!(evaluation.training_path.total(), 3);
        assert_eq!(evaluation.not_servable, 1);
        assert_eq!(evaluation.unlabelled, 1);
        assert_eq!(evaluation.disagreements, 0);
        // Evaluation reads the triple directly and never triggers a load
        assert!(!service.is_loaded());
    }
}
