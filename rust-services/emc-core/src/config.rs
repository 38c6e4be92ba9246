//! Per-call configuration surface shared by the projector and the engines.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EmcError, Result};

/// Lanes used for every per-rotation reduction.
pub const DEFAULT_INNER_WIDTH: usize = 128;

/// How a slice pixel is spread over the volume on insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// The whole value goes to the closest voxel.
    NearestNeighbour,
    /// Trilinear (bilinear in 2-D) split over the neighbouring voxels.
    #[default]
    Linear,
}

impl FromStr for Interpolation {
    type Err = EmcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nearest_neighbour" => Ok(Self::NearestNeighbour),
            "linear" => Ok(Self::Linear),
            other => Err(EmcError::UnknownInterpolation(other.to_string())),
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NearestNeighbour => f.write_str("nearest_neighbour"),
            Self::Linear => f.write_str("linear"),
        }
    }
}

/// Configuration for one EMC context.
///
/// Every field has a default, so a JSON file only needs to name what it
/// overrides:
///
/// ```json
/// { "interpolation": "nearest_neighbour", "resp_threshold": 1e-6 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmcConfig {
    /// Number of lanes each rotation's pixel reduction is split over.
    pub inner_width: usize,
    /// Interpolation used when inserting slices into the model.
    pub interpolation: Interpolation,
    /// Sparse slice updates skip pattern/rotation pairs whose
    /// responsibility is below this value.
    pub resp_threshold: f32,
}

impl Default for EmcConfig {
    fn default() -> Self {
        Self {
            inner_width: DEFAULT_INNER_WIDTH,
            interpolation: Interpolation::Linear,
            resp_threshold: 0.0,
        }
    }
}

impl EmcConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_inner_width(mut self, inner_width: usize) -> Self {
        self.inner_width = inner_width;
        self
    }

    pub fn with_interpolation(mut self, interpolation: Interpolation) -> Self {
        self.interpolation = interpolation;
        self
    }

    pub fn with_resp_threshold(mut self, resp_threshold: f32) -> Self {
        self.resp_threshold = resp_threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.inner_width == 0 {
            return Err(EmcError::InvalidValue {
                what: "inner_width",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.resp_threshold.is_nan() || self.resp_threshold < 0.0 {
            return Err(EmcError::InvalidValue {
                what: "resp_threshold",
                reason: format!("must be a non-negative number, got {}", self.resp_threshold),
            });
        }
        Ok(())
    }
}
