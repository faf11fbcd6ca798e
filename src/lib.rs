//! Exoplanet Classification Library
//!
//! Classifies transit-survey observations as confirmed planets, planet
//! candidates or false positives. Survey tables from Kepler, K2 and TESS are
//! normalized onto one schema, turned into a fixed feature vector, robustly
//! scaled and fed to a softmax classifier whose artifacts are fitted offline.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod feature_extractor;
pub mod metrics;
pub mod models;
pub mod schema;
pub mod service;
pub mod training;
pub mod types;

pub use config::AppConfig;
pub use error::{ArtifactLoadError, ClassifyError, FitError, InferenceError, SchemaError, ValidationError};
pub use feature_extractor::{BuildMode, FeatureBuilder, FeatureVector};
pub use models::{ArtifactSet, ArtifactSource, ArtifactStore, InferenceEngine};
pub use schema::{SchemaNormalizer, Survey};
pub use service::PredictionService;
pub use training::{DataSplit, TrainingSet};
pub use types::{CanonicalRecord, Classification, ClassifyRequest, PlanetClass, RawClassifyRequest};
