//! Type definitions for the classification pipeline

pub mod class;
pub mod record;

pub use class::{Classification, PlanetClass};
pub use record::{CanonicalRecord, ClassifyRequest, Field, RawClassifyRequest};
