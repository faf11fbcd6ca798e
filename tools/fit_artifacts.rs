//! Artifact Fitting Tool
//!
//! Steps around the external optimizer:
//!
//!   fit_artifacts prepare <out_dir> <survey=csv>...
//!       Fit the scaler and label codec on the survey tables and write them.
//!       A stratified 20% of each class is held out; the remaining rows are
//!       written as the scaled, class-weighted matrix the optimizer trains on.
//!
//!   fit_artifacts bundle <out_dir> <weights.json>
//!       Stamp the optimizer's classifier weights with the run of the fitted
//!       scaler and codec, write `classifier.json`, check the triple loads
//!       and evaluate it on the held-out rows.
//!
//!   fit_artifacts evaluate <out_dir>
//!       Evaluate the triple in <out_dir> on its held-out rows again.

use anyhow::{bail, ensure, Context, Result};
use exoplanet_classifier::config::ArtifactsConfig;
use exoplanet_classifier::evaluation::HoldoutEvaluation;
use exoplanet_classifier::feature_extractor::FEATURE_NAMES;
use exoplanet_classifier::models::{
    ArtifactMetadata, ArtifactSet, ArtifactStore, ClassifierArtifact, ClassifierModel,
    FittedTransform, LabelCodec,
};
use exoplanet_classifier::schema::Survey;
use exoplanet_classifier::service::PredictionService;
use exoplanet_classifier::training::{
    balanced_class_weights, DataSplit, TrainingSet, SPLIT_SEED, TEST_FRACTION,
};
use exoplanet_classifier::{ArtifactLoadError, CanonicalRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MATRIX_FILE: &str = "training_matrix.csv";
const HOLDOUT_FILE: &str = "holdout.csv";

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fit_artifacts=info".parse()?)
                .add_directive("exoplanet_classifier=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [command, out_dir, sources @ ..] if command == "prepare" && !sources.is_empty() => {
            prepare(Path::new(out_dir), sources)
        }
        [command, out_dir, weights] if command == "bundle" => {
            bundle(Path::new(out_dir), Path::new(weights))
        }
        [command, out_dir] if command == "evaluate" => evaluate(Path::new(out_dir)),
        _ => bail!(
            "usage:\n  fit_artifacts prepare <out_dir> <survey=csv>...\n  fit_artifacts bundle <out_dir> <weights.json>\n  fit_artifacts evaluate <out_dir>"
        ),
    }
}

fn prepare(out_dir: &Path, sources: &[String]) -> Result<()> {
    let sources = sources
        .iter()
        .map(|arg| parse_source(arg))
        .collect::<Result<Vec<_>>>()?;

    let set = TrainingSet::from_sources(&sources)?;
    for summary in set.summaries() {
        info!(
            survey = %summary.survey,
            rows_read = summary.rows_read,
            rows_used = summary.rows_used,
            labels = ?summary.labels,
            "Source summary"
        );
    }

    let metadata = ArtifactMetadata::new_run();
    let fitted = set.fit(metadata.clone()).context("Failed to fit artifacts")?;

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let config = ArtifactsConfig::local(out_dir);
    write_json(&out_dir.join(&config.transform_file), &fitted.transform)?;
    write_json(&out_dir.join(&config.codec_file), &fitted.codec)?;

    let split = DataSplit::stratified(&fitted.labels, TEST_FRACTION, SPLIT_SEED);
    let train_labels: Vec<usize> = split.train.iter().map(|&row| fitted.labels[row]).collect();
    let weights = balanced_class_weights(&train_labels, fitted.codec.num_classes());
    for (class, weight) in fitted.codec.classes().iter().zip(&weights) {
        info!(class = %class, weight = weight, "Class weight");
    }

    // Scaled features, encoded label and class weight, one row per training record
    let matrix_path = out_dir.join(MATRIX_FILE);
    let mut writer = csv::Writer::from_path(&matrix_path)
        .with_context(|| format!("Failed to create {}", matrix_path.display()))?;
    writer.write_record(FEATURE_NAMES.iter().copied().chain(["label", "weight"]))?;
    for &row in &split.train {
        let label = fitted.labels[row];
        let scaled = fitted.transform.apply(&fitted.features[row])?;
        let mut record: Vec<String> = scaled.as_slice().iter().map(|v| v.to_string()).collect();
        record.push(label.to_string());
        record.push(weights[label].to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;

    // Held-out rows stay canonical so evaluation can replay them as requests
    let holdout_path = out_dir.join(HOLDOUT_FILE);
    let mut writer = csv::Writer::from_path(&holdout_path)
        .with_context(|| format!("Failed to create {}", holdout_path.display()))?;
    for &row in &split.test {
        writer.serialize(&set.records()[row])?;
    }
    writer.flush()?;

    info!(
        run_id = %metadata.run_id,
        train_rows = split.train.len(),
        holdout_rows = split.test.len(),
        seed = SPLIT_SEED,
        classes = ?fitted.codec.classes(),
        out_dir = %out_dir.display(),
        "Scaler, codec, training matrix and holdout written"
    );
    Ok(())
}

fn bundle(out_dir: &Path, weights: &Path) -> Result<()> {
    let config = ArtifactsConfig::local(out_dir);
    let transform: FittedTransform = read_json(&out_dir.join(&config.transform_file))?;
    let codec: LabelCodec = read_json(&out_dir.join(&config.codec_file))?;
    let model: ClassifierModel = read_json(weights)?;

    ensure!(
        transform.metadata() == codec.metadata(),
        "scaler and codec in {} come from different runs; rerun `prepare`",
        out_dir.display()
    );
    ensure!(
        model.input_width() == transform.feature_count(),
        "classifier takes {} inputs, scaler produces {}",
        model.input_width(),
        transform.feature_count()
    );
    ensure!(
        model.num_classes() == codec.num_classes(),
        "classifier has {} outputs, codec has {} classes",
        model.num_classes(),
        codec.num_classes()
    );

    if let Some(file) = model.companion_file() {
        let source = weights.parent().unwrap_or(Path::new(".")).join(file);
        let dest = out_dir.join(file);
        if source != dest {
            std::fs::copy(&source, &dest)
                .with_context(|| format!("Failed to copy {}", source.display()))?;
        }
    }

    let artifact = ClassifierArtifact {
        metadata: transform.metadata().clone(),
        model,
    };
    write_json(&out_dir.join(&config.classifier_file), &artifact)?;

    match ArtifactSet::load_from_dir(out_dir, &config, 1) {
        Ok(set) => {
            info!(run_id = %set.run_id(), "Artifact triple verified");
            if out_dir.join(HOLDOUT_FILE).exists() {
                evaluate_set(out_dir, &set)?;
            } else {
                warn!(out_dir = %out_dir.display(), "No holdout rows, skipping evaluation");
            }
        }
        Err(e @ ArtifactLoadError::UnsupportedFormat(_)) => {
            warn!(error = %e, "Triple written but not verified by this build")
        }
        Err(e) => return Err(e).context("Written triple does not load"),
    }
    Ok(())
}

fn evaluate(out_dir: &Path) -> Result<()> {
    let config = ArtifactsConfig::local(out_dir);
    let set = ArtifactSet::load_from_dir(out_dir, &config, 1).context("Triple does not load")?;
    evaluate_set(out_dir, &set)
}

/// Replay the held-out rows through the serving path and report the scores
fn evaluate_set(out_dir: &Path, set: &ArtifactSet) -> Result<()> {
    let holdout_path = out_dir.join(HOLDOUT_FILE);
    let mut reader = csv::Reader::from_path(&holdout_path)
        .with_context(|| format!("Failed to open {}", holdout_path.display()))?;
    let records = reader
        .deserialize()
        .collect::<Result<Vec<CanonicalRecord>, _>>()
        .with_context(|| format!("Failed to parse {}", holdout_path.display()))?;

    let store = ArtifactStore::new(ArtifactsConfig::local(out_dir), 1)?;
    let service = PredictionService::with_source(store, 4);
    let evaluation = HoldoutEvaluation::run(&service, set, &records)?;

    evaluation.serving.print_summary("HOLDOUT - SERVING PATH");
    evaluation.training_path.print_summary("HOLDOUT - TRAINING PATH (imputed)");
    info!(
        rows = records.len(),
        served = evaluation.serving.total(),
        not_servable = evaluation.not_servable,
        unlabelled = evaluation.unlabelled,
        disagreements = evaluation.disagreements,
        "Holdout evaluation finished"
    );
    ensure!(
        evaluation.disagreements == 0,
        "serving and training feature paths disagree on {} held-out rows",
        evaluation.disagreements
    );
    Ok(())
}

fn parse_source(arg: &str) -> Result<(Survey, PathBuf)> {
    let (survey, path) = arg
        .split_once('=')
        .with_context(|| format!("expected <survey>=<csv path>, got `{arg}`"))?;
    Ok((survey.parse()?, PathBuf::from(path)))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Artifact written");
    Ok(())
}
