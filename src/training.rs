//! Training-set assembly from survey archive tables.
//!
//! Rows from each survey are normalized onto the canonical schema, rows whose
//! disposition carries no supervision signal are dropped, and the remaining
//! records are used to fit the imputation medians, the scaler and the label
//! codec in that order.

use crate::error::FitError;
use crate::feature_extractor::{FeatureBuilder, FeatureVector, ImputationMedians};
use crate::models::codec::LabelCodec;
use crate::models::metadata::ArtifactMetadata;
use crate::models::transform::FittedTransform;
use crate::schema::{RawRecord, SchemaNormalizer, Survey};
use crate::types::class::PlanetClass;
use crate::types::record::CanonicalRecord;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

/// Fraction of every class held out for evaluation
pub const TEST_FRACTION: f64 = 0.2;

/// Seed of the default train/test split
pub const SPLIT_SEED: u64 = 42;

/// Row counts for one source table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub survey: Survey,
    pub rows_read: usize,
    pub rows_used: usize,
    /// Rows whose disposition is not usable for training
    pub rows_unlabelled: usize,
    /// Rows the CSV reader could not parse
    pub rows_malformed: usize,
    pub labels: BTreeMap<PlanetClass, usize>,
}

impl SourceSummary {
    fn new(survey: Survey) -> Self {
        Self {
            survey,
            rows_read: 0,
            rows_used: 0,
            rows_unlabelled: 0,
            rows_malformed: 0,
            labels: BTreeMap::new(),
        }
    }
}

/// Labelled canonical records from one or more surveys
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    records: Vec<CanonicalRecord>,
    summaries: Vec<SourceSummary>,
}

/// Everything fitted from one training set
#[derive(Debug, Clone)]
pub struct FittedPipeline {
    pub transform: FittedTransform,
    pub codec: LabelCodec,
    /// Unscaled training features, one row per record
    pub features: Vec<FeatureVector>,
    /// Encoded label per row
    pub labels: Vec<usize>,
}

impl TrainingSet {
    /// Read every `(survey, csv path)` pair
    pub fn from_sources<P: AsRef<Path>>(sources: &[(Survey, P)]) -> Result<Self> {
        let mut set = Self::default();

        for (survey, path) in sources {
            let path = path.as_ref();
            let file = File::open(path)
                .with_context(|| format!("Failed to open {} table {}", survey, path.display()))?;
            set.add_source(*survey, file)
                .with_context(|| format!("Failed to read {} table {}", survey, path.display()))?;
        }

        info!(
            records = set.len(),
            labels = ?set.label_counts(),
            "Training set assembled"
        );
        Ok(set)
    }

    /// Build a training set from already normalized records. Records without
    /// a label are skipped.
    pub fn from_records<I: IntoIterator<Item = CanonicalRecord>>(records: I) -> Self {
        Self {
            records: records.into_iter().filter(|r| r.label.is_some()).collect(),
            summaries: Vec::new(),
        }
    }

    /// Append the rows of one survey table. Lines starting with `#` are
    /// archive comments.
    pub fn add_source<R: Read>(&mut self, survey: Survey, reader: R) -> Result<&SourceSummary> {
        let normalizer = SchemaNormalizer::new(survey);
        let mut summary = SourceSummary::new(survey);

        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader.headers().context("Failed to read CSV headers")?.clone();

        for (idx, result) in reader.records().enumerate() {
            summary.rows_read += 1;

            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    warn!(survey = %survey, line = idx + 2, error = %e, "Skipping malformed row");
                    summary.rows_malformed += 1;
                    continue;
                }
            };

            let raw: RawRecord = headers
                .iter()
                .zip(row.iter())
                .map(|(column, value)| (column.to_string(), value.to_string()))
                .collect();

            match normalizer.normalize_for_training(&raw) {
                Some(record) => {
                    if let Some(label) = record.label {
                        *summary.labels.entry(label).or_insert(0) += 1;
                    }
                    summary.rows_used += 1;
                    self.records.push(record);
                }
                None => summary.rows_unlabelled += 1,
            }
        }

        info!(
            survey = %survey,
            rows_read = summary.rows_read,
            rows_used = summary.rows_used,
            rows_unlabelled = summary.rows_unlabelled,
            rows_malformed = summary.rows_malformed,
            "Source table ingested"
        );

        self.summaries.push(summary);
        Ok(&self.summaries[self.summaries.len() - 1])
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Per-source ingestion summaries, in reading order
    pub fn summaries(&self) -> &[SourceSummary] {
        &self.summaries
    }

    /// Record count per label over all sources
    pub fn label_counts(&self) -> BTreeMap<PlanetClass, usize> {
        let mut counts = BTreeMap::new();
        for label in self.records.iter().filter_map(|r| r.label) {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }

    /// Fit imputation medians, the feature matrix, the scaler and the label
    /// codec, all stamped with `metadata`.
    pub fn fit(&self, metadata: ArtifactMetadata) -> Result<FittedPipeline, FitError> {
        if self.records.is_empty() {
            return Err(FitError::EmptyTrainingSet);
        }

        let medians = ImputationMedians::fit(&self.records)?;
        let features = FeatureBuilder::new(medians).build_training_matrix(&self.records)?;
        let transform = FittedTransform::fit(&features, medians, metadata.clone())?;

        let labels: Vec<PlanetClass> = self
            .records
            .iter()
            .map(|r| r.label.ok_or(FitError::Unlabelled))
            .collect::<Result<_, _>>()?;
        let codec = LabelCodec::fit(labels.iter().copied(), metadata)?;
        let labels = labels
            .into_iter()
            .map(|label| codec.encode(label).ok_or(FitError::Unlabelled))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            rows = features.len(),
            classes = ?codec.classes(),
            run_id = %transform.metadata().run_id,
            "Training pipeline fitted"
        );

        Ok(FittedPipeline {
            transform,
            codec,
            features,
            labels,
        })
    }
}

/// Row indices of a train/test split, both sorted ascending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl DataSplit {
    /// Hold out `test_fraction` of each class, picked by a shuffle seeded
    /// with `seed`. Every class keeps at least one training row.
    pub fn stratified(labels: &[usize], test_fraction: f64, seed: u64) -> Self {
        let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (row, &label) in labels.iter().enumerate() {
            by_class.entry(label).or_default().push(row);
        }

        let fraction = test_fraction.clamp(0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = Vec::with_capacity(labels.len());
        let mut test = Vec::new();

        for rows in by_class.values_mut() {
            rows.shuffle(&mut rng);
            let held_out = ((rows.len() as f64 * fraction).round() as usize)
                .min(rows.len().saturating_sub(1));
            test.extend_from_slice(&rows[..held_out]);
            train.extend_from_slice(&rows[held_out..]);
        }

        train.sort_unstable();
        test.sort_unstable();
        Self { train, test }
    }
}

/// Balanced class weights, `rows / (classes present * rows in class)`.
/// A class with no rows gets weight zero.
pub fn balanced_class_weights(labels: &[usize], num_classes: usize) -> Vec<f64> {
    let mut counts = vec![0usize; num_classes];
    for &label in labels {
        if let Some(count) = counts.get_mut(label) {
            *count += 1;
        }
    }

    let present = counts.iter().filter(|&&count| count > 0).count();
    counts
        .iter()
        .map(|&count| {
            if count == 0 {
                0.0
            } else {
                labels.len() as f64 / (present * count) as f64
            }
        })
        .collect()
}
