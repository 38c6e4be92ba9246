//! Poisson log-likelihood of every pattern under every slice.
//!
//! `responsibilities[r, p] = Σ_pixels k·ln(λ) − λ − ln(k!)` with `λ` the
//! (scaled) intensity of slice `r` and `k` the photon count of pattern `p`.
//! Values are left unnormalized.
//!
//! The sparse layouts never touch zero-photon pixels: their `−λ` terms add
//! up to the slice total, taken from the slice-sum cache once per rotation,
//! so only listed pixels contribute `k·ln(λ) − ln(k!)` on top of it.
//! Single-photon pixels of the sparser layout contribute `ln(λ)`.

use ndarray::{Array2, Array3};
use rayon::prelude::*;
use tracing::debug;

use crate::context::EmcContext;
use crate::error::{EmcError, Result};
use crate::numeric::{lane_sum, poisson_log_likelihood};
use crate::patterns::{PatternData, PatternSet};
use crate::scaling::Scaling;
use crate::validate::{
    check_finite, check_patterns, check_responsibilities, check_scaling, contiguous, contiguous_mut,
};

fn dense_log_likelihood(counts: &[i32], slice: &[f32], scaling: f64, log_factorial: &[f64], width: usize) -> f64 {
    lane_sum(slice.len(), width, |i| {
        let lambda = slice[i];
        if lambda < 0.0 {
            0.0
        } else {
            poisson_log_likelihood(counts[i], scaling * lambda as f64, log_factorial)
        }
    })
}

fn sparse_log_likelihood(
    data: &PatternData<'_>,
    pattern: usize,
    slice: &[f32],
    scaling: f64,
    slice_sum: f64,
    log_factorial: &[f64],
    width: usize,
) -> f64 {
    let listed = data.sum_listed(pattern, width, |pixel, k| {
        let lambda = slice[pixel];
        if lambda < 0.0 {
            0.0
        } else {
            k as f64 * (scaling * lambda as f64).ln() - log_factorial[k as usize]
        }
    });
    listed - scaling * slice_sum
}

impl EmcContext {
    /// Fills `responsibilities` (shape `[rotations, patterns]`) with the
    /// Poisson log-likelihood of each pattern given each slice.
    ///
    /// Slice pixels with a negative value are treated as unobserved and do
    /// not contribute. A slice with zero intensity where photons were seen
    /// yields negative infinity.
    ///
    /// Per-pattern scaling is not available for the sparser layout.
    pub fn calculate_responsibilities_poisson(
        &mut self,
        patterns: &PatternSet,
        slices: &Array3<f32>,
        responsibilities: &mut Array2<f32>,
        scaling: Scaling<'_>,
    ) -> Result<()> {
        if matches!(patterns, PatternSet::Sparser(_)) && scaling.is_per_pattern() {
            return Err(EmcError::Unsupported(
                "per-pattern scaling can not be used together with the sparser format",
            ));
        }
        let (rotations, npatterns, pixels) = check_patterns(patterns, slices)?;
        check_responsibilities(responsibilities, rotations, npatterns)?;
        check_scaling(&scaling, rotations, npatterns)?;
        let data = patterns.data()?;
        let scale = scaling.data()?;
        let slices_flat = contiguous("slices", slices)?;
        check_finite("slices", slices_flat)?;
        let out = contiguous_mut("responsibilities", responsibilities)?;

        self.log_factorial
            .ensure_capacity(patterns.max_photon_count())?;
        if rotations == 0 || npatterns == 0 {
            return Ok(());
        }

        debug!(kind = ?patterns.kind(), rotations, patterns = npatterns, pixels, "calculating responsibilities");
        let width = self.config.inner_width;
        let log_factorial = self.log_factorial.as_slice();
        let sums: &[f64] = match data {
            PatternData::Dense(_) => &[],
            _ => self.slice_sums.ensure(slices)?,
        };

        out.par_chunks_mut(npatterns)
            .enumerate()
            .for_each(|(rotation, row)| {
                let slice = &slices_flat[rotation * pixels..(rotation + 1) * pixels];
                for (pattern, value) in row.iter_mut().enumerate() {
                    let s = scale.get(rotation, pattern);
                    let log_likelihood = match data {
                        PatternData::Dense(dense) => {
                            let counts = &dense[pattern * pixels..(pattern + 1) * pixels];
                            dense_log_likelihood(counts, slice, s, log_factorial, width)
                        }
                        _ => sparse_log_likelihood(
                            &data,
                            pattern,
                            slice,
                            s,
                            sums[rotation],
                            log_factorial,
                            width,
                        ),
                    };
                    *value = log_likelihood as f32;
                }
            });
        Ok(())
    }
}
