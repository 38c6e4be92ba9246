//! Maximum-likelihood intensity scaling.
//!
//! For fixed slice intensities `λ` and observed counts `k` the Poisson
//! likelihood of `s·λ` peaks at `s = Σk / Σλ`. The pair-wise variant solves
//! this for every rotation/pattern pair; the per-pattern variant uses the
//! responsibility-weighted mixture of slices as `λ`.

use ndarray::{Array1, Array2, Array3};
use rayon::prelude::*;
use tracing::debug;

use crate::context::EmcContext;
use crate::error::{EmcError, Result};
use crate::numeric::lane_sum;
use crate::patterns::{PatternData, PatternSet};
use crate::validate::{
    check_finite, check_patterns, check_responsibilities, check_weights, contiguous, contiguous_mut, shape_error,
};

/// Scaling applied to the slice intensities before they are compared with
/// a pattern.
#[derive(Debug, Clone, Copy, Default)]
pub enum Scaling<'a> {
    /// No correction.
    #[default]
    Unit,
    /// One factor per rotation/pattern pair, shape `[rotations, patterns]`.
    PerPair(&'a Array2<f32>),
    /// One factor per pattern, shared by all rotations.
    PerPattern(&'a Array1<f32>),
}

/// Flat form of [`Scaling`] used inside the kernels.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ScalingData<'a> {
    Unit,
    PerPair { values: &'a [f32], patterns: usize },
    PerPattern(&'a [f32]),
}

impl<'a> Scaling<'a> {
    pub fn is_per_pattern(&self) -> bool {
        matches!(self, Self::PerPattern(_))
    }

    pub(crate) fn data(&self) -> Result<ScalingData<'a>> {
        Ok(match *self {
            Self::Unit => ScalingData::Unit,
            Self::PerPair(matrix) => ScalingData::PerPair {
                values: contiguous("scaling", matrix)?,
                patterns: matrix.ncols(),
            },
            Self::PerPattern(vector) => ScalingData::PerPattern(contiguous("scaling", vector)?),
        })
    }
}

impl ScalingData<'_> {
    #[inline]
    pub(crate) fn get(&self, rotation: usize, pattern: usize) -> f64 {
        match self {
            Self::Unit => 1.0,
            Self::PerPair { values, patterns } => values[rotation * patterns + pattern] as f64,
            Self::PerPattern(values) => values[pattern] as f64,
        }
    }
}

/// Photons of `pattern` that land on observed (non-negative) pixels of
/// `slice`.
fn observed_photons(data: &PatternData<'_>, pattern: usize, slice: &[f32], width: usize) -> f64 {
    match data {
        PatternData::Dense(dense) => {
            let pixels = slice.len();
            let counts = &dense[pattern * pixels..(pattern + 1) * pixels];
            lane_sum(pixels, width, |i| {
                if slice[i] >= 0.0 {
                    counts[i] as f64
                } else {
                    0.0
                }
            })
        }
        _ => data.sum_listed(pattern, width, |pixel, k| {
            if slice[pixel] >= 0.0 {
                k as f64
            } else {
                0.0
            }
        }),
    }
}

/// `photons / intensity`, falling back to unit scaling when there is no
/// intensity to scale.
fn ml_scaling(photons: f64, intensity: f64) -> f32 {
    if intensity > 0.0 {
        (photons / intensity) as f32
    } else {
        1.0
    }
}

impl EmcContext {
    /// Best scaling for every rotation/pattern pair.
    ///
    /// patterns: any layout, `npatterns` patterns of `H x W` pixels
    /// slices:   shape (R, H, W)
    /// scaling:  output, shape (R, npatterns)
    pub fn calculate_scaling_poisson(
        &mut self,
        patterns: &PatternSet,
        slices: &Array3<f32>,
        scaling: &mut Array2<f32>,
    ) -> Result<()> {
        let (rotations, npatterns, pixels) = check_patterns(patterns, slices)?;
        if scaling.dim() != (rotations, npatterns) {
            return Err(shape_error(
                "scaling",
                format!("nrotations x npatterns = [{rotations}, {npatterns}]"),
                scaling.shape(),
            ));
        }
        let data = patterns.data()?;
        let slices_flat = contiguous("slices", slices)?;
        check_finite("slices", slices_flat)?;
        let out = contiguous_mut("scaling", scaling)?;
        if rotations == 0 || npatterns == 0 {
            return Ok(());
        }

        debug!(kind = ?patterns.kind(), rotations, patterns = npatterns, "calculating pair scaling");
        let width = self.config.inner_width;
        let sums = self.slice_sums.ensure(slices)?;
        out.par_chunks_mut(npatterns)
            .enumerate()
            .for_each(|(rotation, row)| {
                let slice = &slices_flat[rotation * pixels..(rotation + 1) * pixels];
                for (pattern, value) in row.iter_mut().enumerate() {
                    let photons = observed_photons(&data, pattern, slice, width);
                    *value = ml_scaling(photons, sums[rotation]);
                }
            });
        Ok(())
    }

    /// Best scaling for every pattern against its responsibility-weighted
    /// mixture of slices.
    ///
    /// `responsibilities` must hold the normalized, non-negative weights of
    /// each pattern over the rotations, shape (R, npatterns). Not available
    /// for the sparser layout.
    pub fn calculate_scaling_per_pattern_poisson(
        &mut self,
        patterns: &PatternSet,
        slices: &Array3<f32>,
        responsibilities: &Array2<f32>,
        scaling: &mut Array1<f32>,
    ) -> Result<()> {
        if let PatternSet::Sparser(_) = patterns {
            return Err(EmcError::Unsupported(
                "per-pattern scaling can not be used with the sparser format",
            ));
        }
        let (rotations, npatterns, pixels) = check_patterns(patterns, slices)?;
        check_responsibilities(responsibilities, rotations, npatterns)?;
        if scaling.len() != npatterns {
            return Err(shape_error(
                "scaling",
                format!("npatterns = [{npatterns}]"),
                scaling.shape(),
            ));
        }
        let weights = contiguous("responsibilities", responsibilities)?;
        check_weights(weights)?;
        let data = patterns.data()?;
        let slices_flat = contiguous("slices", slices)?;
        check_finite("slices", slices_flat)?;
        let out = contiguous_mut("scaling", scaling)?;
        if npatterns == 0 {
            return Ok(());
        }

        debug!(kind = ?patterns.kind(), rotations, patterns = npatterns, "calculating per-pattern scaling");
        let width = self.config.inner_width;
        let sums = self.slice_sums.ensure(slices)?;
        out.par_iter_mut().enumerate().for_each(|(pattern, value)| {
            let mut photons = 0.0;
            let mut intensity = 0.0;
            for rotation in 0..rotations {
                let weight = weights[rotation * npatterns + pattern] as f64;
                if weight == 0.0 {
                    continue;
                }
                let slice = &slices_flat[rotation * pixels..(rotation + 1) * pixels];
                photons += weight * observed_photons(&data, pattern, slice, width);
                intensity += weight * sums[rotation];
            }
            *value = ml_scaling(photons, intensity);
        });
        Ok(())
    }
}
