//! Inference engine wrapping the trained classifier

use crate::error::InferenceError;
use crate::models::network::DenseNetwork;
use crate::models::transform::ScaledVector;
use tracing::debug;

#[cfg(feature = "onnx")]
use crate::models::onnx::OnnxClassifier;

/// Class probabilities in codec index order, summing to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityVector(Vec<f64>);

impl ProbabilityVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index and probability of the most likely class.
    ///
    /// Ties resolve to the lowest index.
    pub fn argmax(&self) -> Option<(usize, f64)> {
        self.0
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
    }
}

/// Classifier backends
enum Backend {
    Dense(DenseNetwork),
    #[cfg(feature = "onnx")]
    Onnx(OnnxClassifier),
}

/// Single-pass classifier. Weights are read-only after construction, so one
/// engine serves any number of concurrent callers.
pub struct InferenceEngine {
    backend: Backend,
    input_width: usize,
    num_classes: usize,
}

impl InferenceEngine {
    /// Engine over an in-process dense network
    pub fn from_dense(network: DenseNetwork) -> Self {
        let input_width = network.input_width();
        let num_classes = network.output_width();
        Self {
            backend: Backend::Dense(network),
            input_width,
            num_classes,
        }
    }

    /// Engine over an ONNX Runtime session
    #[cfg(feature = "onnx")]
    pub fn from_onnx(classifier: OnnxClassifier) -> Self {
        let input_width = classifier.input_width();
        let num_classes = classifier.num_classes();
        Self {
            backend: Backend::Onnx(classifier),
            input_width,
            num_classes,
        }
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    /// Length of every probability vector produced
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Dense(_) => "dense",
            #[cfg(feature = "onnx")]
            Backend::Onnx(_) => "onnx",
        }
    }

    /// Run one forward pass.
    pub fn predict(&self, input: &ScaledVector) -> Result<ProbabilityVector, InferenceError> {
        if input.len() != self.input_width {
            return Err(InferenceError::ShapeMismatch {
                expected: self.input_width,
                actual: input.len(),
            });
        }

        let probabilities = match &self.backend {
            Backend::Dense(network) => network.forward(input.as_slice())?,
            #[cfg(feature = "onnx")]
            Backend::Onnx(classifier) => classifier.run(input.as_slice())?,
        };

        if probabilities.is_empty() {
            return Err(InferenceError::EmptyOutput);
        }
        if probabilities.len() != self.num_classes {
            return Err(InferenceError::ShapeMismatch {
                expected: self.num_classes,
                actual: probabilities.len(),
            });
        }
        if let Some(index) = probabilities.iter().position(|p| !p.is_finite()) {
            return Err(InferenceError::NonFinite { index });
        }

        debug!(
            backend = self.backend_name(),
            probabilities = ?probabilities,
            "Inference complete"
        );

        Ok(ProbabilityVector(probabilities))
    }
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("backend", &self.backend_name())
            .field("input_width", &self.input_width)
            .field("num_classes", &self.num_classes)
            .finish()
    }
}
