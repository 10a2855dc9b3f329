//! Precision modes an engine can be built in

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BuildError;

/// Numeric format used by a compiled engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
    Int8,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Int8 => "int8",
        }
    }

    /// Maximum absolute error tolerated between the full-precision network
    /// and an engine built in this mode, on outputs in [-1, 1].
    pub fn tolerance(&self) -> f32 {
        match self {
            Precision::Fp32 => 1e-3,
            Precision::Fp16 => 5e-2,
            Precision::Int8 => 2.5e-1,
        }
    }

    pub fn requires_calibration(&self) -> bool {
        matches!(self, Precision::Int8)
    }

    /// Bytes per weight element once built.
    pub fn weight_bytes(&self) -> u64 {
        match self {
            Precision::Fp32 => 4,
            Precision::Fp16 => 2,
            Precision::Int8 => 1,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fp32" => Ok(Precision::Fp32),
            "fp16" => Ok(Precision::Fp16),
            "int8" => Ok(Precision::Int8),
            other => Err(BuildError::UnsupportedPrecision(other.to_string())),
        }
    }
}
