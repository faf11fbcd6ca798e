//! Classification labels and results

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Class assigned to a transit-survey observation.
///
/// Variants are declared in alphabetical order of their wire names, which is
/// also the order a label codec fitted on all three classes uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanetClass {
    Candidate,
    Confirmed,
    FalsePositive,
}

impl PlanetClass {
    pub const ALL: [PlanetClass; 3] = [
        PlanetClass::Candidate,
        PlanetClass::Confirmed,
        PlanetClass::FalsePositive,
    ];

    /// Wire name of the class
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanetClass::Candidate => "candidate",
            PlanetClass::Confirmed => "confirmed",
            PlanetClass::FalsePositive => "false_positive",
        }
    }
}

impl fmt::Display for PlanetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanetClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlanetClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown class label `{s}`"))
    }
}

/// Result of classifying one observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Predicted class
    pub classification: PlanetClass,
    /// Probability of the predicted class, rounded for presentation
    pub confidence: f64,
}
