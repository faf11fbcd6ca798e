//! Canonical observation records and classify requests

use crate::error::ValidationError;
use crate::types::class::PlanetClass;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One of the seven measurements every canonical record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Period,
    Duration,
    TransitDepth,
    PlanetRadius,
    StarTemp,
    StarRadius,
    ModelSnr,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Period,
        Field::Duration,
        Field::TransitDepth,
        Field::PlanetRadius,
        Field::StarTemp,
        Field::StarRadius,
        Field::ModelSnr,
    ];

    /// Key used by classify requests
    pub fn request_key(&self) -> &'static str {
        match self {
            Field::Period => "orbital_period",
            Field::Duration => "duration",
            Field::TransitDepth => "transit_depth",
            Field::PlanetRadius => "radius",
            Field::StarTemp => "star_temp",
            Field::StarRadius => "star_radius",
            Field::ModelSnr => "model_snr",
        }
    }

    /// Name used in the canonical schema and in fitted artifacts
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Field::Period => "period",
            Field::Duration => "duration",
            Field::TransitDepth => "transit_depth",
            Field::PlanetRadius => "planet_radius",
            Field::StarTemp => "star_temp",
            Field::StarRadius => "star_radius",
            Field::ModelSnr => "model_snr",
        }
    }

    /// Whether zero is a physically impossible value (negatives always are).
    pub fn requires_positive(&self) -> bool {
        !matches!(self, Field::TransitDepth | Field::StarTemp)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.request_key())
    }
}

/// Survey-independent observation.
///
/// Units: period in days, duration in hours, transit depth in ppm, planet
/// radius in Earth radii, stellar temperature in K, stellar radius in solar
/// radii. `None` means the value is missing (never zero-filled).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub period: Option<f64>,
    pub duration: Option<f64>,
    pub transit_depth: Option<f64>,
    pub planet_radius: Option<f64>,
    pub star_temp: Option<f64>,
    pub star_radius: Option<f64>,
    pub model_snr: Option<f64>,
    /// Supervision label, only present for training records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<PlanetClass>,
}

impl CanonicalRecord {
    pub fn get(&self, field: Field) -> Option<f64> {
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

    pub fn set(&mut self, field: Field, value: Option<f64>) {
        let slot = match field {
            Field::Period => &mut self.period,
            Field::Duration => &mut self.duration,
            Field::TransitDepth => &mut self.transit_depth,
            Field::PlanetRadius => &mut self.planet_radius,
            Field::StarTemp => &mut self.star_temp,
            Field::StarRadius => &mut self.star_radius,
            Field::ModelSnr => &mut self.model_snr,
        };
        *slot = value;
    }
}

/// Classify request as received, before any validation.
///
/// Values may be JSON numbers or numeric strings; `""`, `"null"` and
/// `"undefined"` are treated the same as an absent key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawClassifyRequest {
    #[serde(default)]
    pub orbital_period: Option<Value>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub transit_depth: Option<Value>,
    #[serde(default)]
    pub radius: Option<Value>,
    #[serde(default)]
    pub star_temp: Option<Value>,
    #[serde(default)]
    pub star_radius: Option<Value>,
    #[serde(default)]
    pub model_snr: Option<Value>,
}

impl RawClassifyRequest {
    fn get(&self, field: Field) -> Option<&Value> {
        match field {
            Field::Period => self.orbital_period.as_ref(),
            Field::Duration => self.duration.as_ref(),
            Field::TransitDepth => self.transit_depth.as_ref(),
            Field::PlanetRadius => self.radius.as_ref(),
            Field::StarTemp => self.star_temp.as_ref(),
            Field::StarRadius => self.star_radius.as_ref(),
            Field::ModelSnr => self.model_snr.as_ref(),
        }
    }
}

/// Validated classify request: every measurement present, numeric and finite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub orbital_period: f64,
    pub duration: f64,
    pub transit_depth: f64,
    pub radius: f64,
    pub star_temp: f64,
    pub star_radius: f64,
    pub model_snr: f64,
}

impl ClassifyRequest {
    /// Parse a raw request, failing on the first invalid field in schema order.
    pub fn parse(raw: &RawClassifyRequest) -> Result<Self, ValidationError> {
        let value = |field: Field| parse_field(field, raw.get(field));

        Ok(Self {
            orbital_period: value(Field::Period)?,
            duration: value(Field::Duration)?,
            transit_depth: value(Field::TransitDepth)?,
            radius: value(Field::PlanetRadius)?,
            star_temp: value(Field::StarTemp)?,
            star_radius: value(Field::StarRadius)?,
            model_snr: value(Field::ModelSnr)?,
        })
    }
}

impl TryFrom<&RawClassifyRequest> for ClassifyRequest {
    type Error = ValidationError;

    fn try_from(raw: &RawClassifyRequest) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

/// A canonical record is servable once every measurement is present.
impl TryFrom<&CanonicalRecord> for ClassifyRequest {
    type Error = ValidationError;

    fn try_from(record: &CanonicalRecord) -> Result<Self, Self::Error> {
        let value = |field: Field| record.get(field).ok_or(ValidationError::Missing(field));

        Ok(Self {
            orbital_period: value(Field::Period)?,
            duration: value(Field::Duration)?,
            transit_depth: value(Field::TransitDepth)?,
            radius: value(Field::PlanetRadius)?,
            star_temp: value(Field::StarTemp)?,
            star_radius: value(Field::StarRadius)?,
            model_snr: value(Field::ModelSnr)?,
        })
    }
}

impl From<&ClassifyRequest> for CanonicalRecord {
    fn from(request: &ClassifyRequest) -> Self {
        Self {
            period: Some(request.orbital_period),
            duration: Some(request.duration),
            transit_depth: Some(request.transit_depth),
            planet_radius: Some(request.radius),
            star_temp: Some(request.star_temp),
            star_radius: Some(request.star_radius),
            model_snr: Some(request.model_snr),
            label: None,
        }
    }
}

const EMPTY_MARKERS: [&str; 3] = ["", "null", "undefined"];

fn parse_field(field: Field, value: Option<&Value>) -> Result<f64, ValidationError> {
    let parsed = match value {
        None | Some(Value::Null) => return Err(ValidationError::Missing(field)),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| ValidationError::NotNumeric {
            field,
            value: n.to_string(),
        })?,
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if EMPTY_MARKERS.contains(&trimmed) {
                return Err(ValidationError::Missing(field));
            }
            trimmed
                .parse::<f64>()
                .map_err(|_| ValidationError::NotNumeric {
                    field,
                    value: s.clone(),
                })?
        }
        Some(other) => {
            return Err(ValidationError::NotNumeric {
                field,
                value: other.to_string(),
            })
        }
    };

    if !parsed.is_finite() {
        return Err(ValidationError::OutOfRange {
            field,
            value: parsed,
        });
    }

    Ok(parsed)
}
