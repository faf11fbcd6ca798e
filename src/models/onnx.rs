//! ONNX Runtime classifier backend (cargo feature `onnx`)

use crate::error::{ArtifactLoadError, InferenceError};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Classifier exported to ONNX with a `[1, features]` float input and a
/// `[1, classes]` probability output.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    input_width: usize,
    num_classes: usize,
}

impl OnnxClassifier {
    /// Load a classifier session from file
    pub fn load(
        path: &Path,
        threads: usize,
        input_width: usize,
        num_classes: usize,
    ) -> Result<Self, ArtifactLoadError> {
        info!(path = %path.display(), threads = threads, "Loading ONNX classifier");

        let session = Session::builder()
            .map_err(|e| corrupt(path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| corrupt(path, e))?
            .with_intra_threads(threads)
            .map_err(|e| corrupt(path, e))?
            .commit_from_file(path)
            .map_err(|e| corrupt(path, e))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob") || o.name.contains("output"))
            .or_else(|| session.outputs.last())
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "probabilities".to_string());

        info!(
            input = %input_name,
            output = %output_name,
            "ONNX classifier loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            input_width,
            num_classes,
        })
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Run the session on one row and return the probability output
    pub fn run(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        let data: Vec<f32> = features.iter().map(|&v| v as f32).collect();
        let shape = vec![1_i64, data.len() as i64];
        let input = Tensor::from_array((shape, data)).map_err(runtime)?;

        // ort sessions need exclusive access to run.
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(runtime)?;

        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            InferenceError::Runtime(format!("missing output `{}`", self.output_name))
        })?;
        let (_, probabilities) = output.try_extract_tensor::<f32>().map_err(runtime)?;

        let probabilities: Vec<f64> = probabilities.iter().map(|&p| p as f64).collect();
        let total: f64 = probabilities.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(InferenceError::NonFinite { index: 0 });
        }
        Ok(probabilities.into_iter().map(|p| p / total).collect())
    }
}

fn corrupt<E: std::fmt::Display>(path: &Path, e: E) -> ArtifactLoadError {
    ArtifactLoadError::Corrupt {
        file: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn runtime<E: std::fmt::Display>(e: E) -> InferenceError {
    InferenceError::Runtime(e.to_string())
}
