//! Survey schema normalization.
//!
//! Kepler, K2 and TESS publish the same physical measurements under different
//! column names, units and disposition codes. This module maps a raw row from
//! any of them onto the canonical record.

use crate::error::SchemaError;
use crate::types::class::PlanetClass;
use crate::types::record::{CanonicalRecord, Field};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A raw tabular row keyed by the source column name.
pub type RawRecord = HashMap<String, String>;

/// K2 reports transit depth in percent; the canonical unit is ppm.
const PERCENT_TO_PPM: f64 = 1.0e4;

/// Kepler false-positive flag columns (not in transit, stellar eclipse,
/// centroid offset, ephemeris match).
const KEPLER_FP_FLAGS: [&str; 4] = [
    "koi_fpflag_nt",
    "koi_fpflag_ss",
    "koi_fpflag_co",
    "koi_fpflag_ec",
];

/// Supported source surveys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Survey {
    Kepler,
    K2,
    Tess,
}

impl Survey {
    pub const ALL: [Survey; 3] = [Survey::Kepler, Survey::K2, Survey::Tess];

    pub fn as_str(&self) -> &'static str {
        match self {
            Survey::Kepler => "kepler",
            Survey::K2 => "k2",
            Survey::Tess => "tess",
        }
    }

    /// Source column holding `field`, if the survey publishes it.
    pub fn column(&self, field: Field) -> Option<&'static str> {
        match (self, field) {
            (Survey::Kepler, Field::Period) => Some("koi_period"),
            (Survey::Kepler, Field::Duration) => Some("koi_duration"),
            (Survey::Kepler, Field::TransitDepth) => Some("koi_depth"),
            (Survey::Kepler, Field::PlanetRadius) => Some("koi_prad"),
            (Survey::Kepler, Field::StarTemp) => Some("koi_steff"),
            (Survey::Kepler, Field::StarRadius) => Some("koi_srad"),
            (Survey::Kepler, Field::ModelSnr) => Some("koi_model_snr"),

            (Survey::K2, Field::Period) => Some("pl_orbper"),
            (Survey::K2, Field::Duration) => Some("pl_trandur"),
            (Survey::K2, Field::TransitDepth) => Some("pl_trandep"),
            (Survey::K2, Field::PlanetRadius) => Some("pl_rade"),
            (Survey::K2, Field::StarTemp) => Some("st_teff"),
            (Survey::K2, Field::StarRadius) => Some("st_rad"),

            (Survey::Tess, Field::Period) => Some("pl_orbper"),
            (Survey::Tess, Field::Duration) => Some("pl_trandurh"),
            (Survey::Tess, Field::TransitDepth) => Some("pl_trandep"),
            (Survey::Tess, Field::PlanetRadius) => Some("pl_rade"),
            (Survey::Tess, Field::StarTemp) => Some("st_teff"),
            (Survey::Tess, Field::StarRadius) => Some("st_rad"),

            (Survey::K2 | Survey::Tess, Field::ModelSnr) => None,
        }
    }

    /// Source column holding the survey disposition
    pub fn disposition_column(&self) -> &'static str {
        match self {
            Survey::Kepler => "koi_disposition",
            Survey::K2 => "disposition",
            Survey::Tess => "tfopwg_disp",
        }
    }

    /// False-positive flag columns published by the survey
    pub fn fp_flag_columns(&self) -> &'static [&'static str] {
        match self {
            Survey::Kepler => &KEPLER_FP_FLAGS,
            Survey::K2 | Survey::Tess => &[],
        }
    }

    /// Map a disposition code to `Some(true)` (confirmed), `Some(false)`
    /// (false positive) or `None` when the code carries no supervision signal.
    pub fn disposition(&self, code: &str) -> Option<bool> {
        match (self, code.trim()) {
            (Survey::Kepler | Survey::K2, "CONFIRMED") => Some(true),
            (Survey::Kepler | Survey::K2, "FALSE POSITIVE") => Some(false),
            (Survey::Tess, "CP") => Some(true),
            (Survey::Tess, "FP") => Some(false),
            _ => None,
        }
    }

    /// Factor converting the survey's unit for `field` to the canonical unit
    fn unit_factor(&self, field: Field) -> f64 {
        match (self, field) {
            (Survey::K2, Field::TransitDepth) => PERCENT_TO_PPM,
            _ => 1.0,
        }
    }
}

impl fmt::Display for Survey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Survey {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Survey::ALL
            .into_iter()
            .find(|survey| survey.as_str() == wanted)
            .ok_or_else(|| SchemaError::UnknownSource(s.to_string()))
    }
}

/// Maps raw rows of one survey onto [`CanonicalRecord`]s.
#[derive(Debug, Clone, Copy)]
pub struct SchemaNormalizer {
    survey: Survey,
}

impl SchemaNormalizer {
    pub fn new(survey: Survey) -> Self {
        Self { survey }
    }

    /// Build a normalizer from a source identifier such as `"kepler"`.
    pub fn for_source(source: &str) -> Result<Self, SchemaError> {
        Ok(Self::new(source.parse()?))
    }

    pub fn survey(&self) -> Survey {
        self.survey
    }

    /// Map a raw row to a canonical record.
    ///
    /// Columns the survey does not publish, empty cells and unparsable cells
    /// all become missing values. The label is set only when the disposition
    /// is classifiable under the survey's convention.
    pub fn normalize(&self, raw: &RawRecord) -> CanonicalRecord {
        let mut record = CanonicalRecord::default();

        for field in Field::ALL {
            let value = self
                .survey
                .column(field)
                .and_then(|column| cell(raw, column))
                .map(|v| v * self.survey.unit_factor(field));
            record.set(field, value);
        }

        record.label = self.label(raw);
        record
    }

    /// Normalize a training row, dropping it when its disposition carries no
    /// supervision signal.
    pub fn normalize_for_training(&self, raw: &RawRecord) -> Option<CanonicalRecord> {
        let record = self.normalize(raw);
        record.label.is_some().then_some(record)
    }

    /// Three-class training label.
    ///
    /// Confirmed dispositions are `confirmed`. Non-confirmed dispositions are
    /// `false_positive` only when a false-positive flag is raised and
    /// `candidate` otherwise. Missing flags count as unset.
    fn label(&self, raw: &RawRecord) -> Option<PlanetClass> {
        let code = raw.get(self.survey.disposition_column())?;
        let confirmed = self.survey.disposition(code)?;

        if confirmed {
            return Some(PlanetClass::Confirmed);
        }

        let flagged = self
            .survey
            .fp_flag_columns()
            .iter()
            .filter_map(|column| cell(raw, column))
            .any(|flag| flag > 0.0);

        Some(if flagged {
            PlanetClass::FalsePositive
        } else {
            PlanetClass::Candidate
        })
    }
}

fn cell(raw: &RawRecord, column: &str) -> Option<f64> {
    raw.get(column)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}
