//! Fitted artifacts and classifier inference

pub mod codec;
pub mod inference;
pub mod loader;
pub mod metadata;
pub mod network;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod transform;

pub use codec::LabelCodec;
pub use inference::{InferenceEngine, ProbabilityVector};
pub use loader::{ArtifactSet, ArtifactSource, ArtifactStore, ClassifierArtifact, ClassifierModel};
pub use metadata::ArtifactMetadata;
pub use network::DenseNetwork;
pub use transform::{FittedTransform, ScaledVector};
