//! Merging patterns back into slices.
//!
//! Every slice becomes the responsibility-weighted average of the patterns,
//! with each pattern divided by its scaling first:
//!
//! ```text
//! slice[r, i] = Σ_p w[r, p] · k[p, i] / s[r, p]  /  Σ_p w[r, p]
//! ```
//!
//! Dense patterns are averaged in one pass. The sparse layouts only scatter
//! their listed pixels ([`EmcContext::accumulate_slices`]) and are divided
//! by the total weight afterwards ([`normalize_slices`]), so unlisted pixels
//! end up as the zero they stand for.

use ndarray::{Array2, Array3};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::context::EmcContext;
use crate::error::{EmcError, Result};
use crate::patterns::{PatternData, PatternSet};
use crate::scaling::{Scaling, ScalingData};
use crate::validate::{
    check_patterns, check_responsibilities, check_scaling, check_weights, contiguous, contiguous_mut,
    shape_error, slice_dims,
};

/// Validated inputs shared by the update passes.
struct UpdateInputs<'a> {
    data: PatternData<'a>,
    scale: ScalingData<'a>,
    weights: &'a [f32],
    npatterns: usize,
    pixels: usize,
}

fn prepare<'a>(
    slices: &Array3<f32>,
    patterns: &'a PatternSet,
    responsibilities: &'a Array2<f32>,
    scaling: Scaling<'a>,
) -> Result<UpdateInputs<'a>> {
    if matches!(patterns, PatternSet::Sparser(_)) && scaling.is_per_pattern() {
        return Err(EmcError::Unsupported(
            "per-pattern scaling can not be used together with the sparser format",
        ));
    }
    let (rotations, npatterns, pixels) = check_patterns(patterns, slices)?;
    check_responsibilities(responsibilities, rotations, npatterns)?;
    check_scaling(&scaling, rotations, npatterns)?;
    let weights = contiguous("responsibilities", responsibilities)?;
    check_weights(weights)?;
    Ok(UpdateInputs {
        data: patterns.data()?,
        scale: scaling.data()?,
        weights,
        npatterns,
        pixels,
    })
}

/// Sum of the row of `weights` belonging to `rotation`, in `f64`.
fn total_weight(weights: &[f32], rotation: usize, npatterns: usize) -> f64 {
    weights[rotation * npatterns..(rotation + 1) * npatterns]
        .iter()
        .map(|&w| w as f64)
        .sum()
}

fn divide_or_clear(slice: &mut [f32], total: f64, rotation: usize) {
    if total > 0.0 {
        slice.iter_mut().for_each(|v| *v = (*v as f64 / total) as f32);
    } else {
        warn!(rotation, "rotation has no responsibility, slice set to zero");
        slice.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Divides every slice by the total responsibility of its rotation,
/// summed over all patterns.
///
/// A rotation with no responsibility at all gets an all-zero slice.
pub fn normalize_slices(slices: &mut Array3<f32>, responsibilities: &Array2<f32>) -> Result<()> {
    let (rotations, pixels) = slice_dims(slices);
    if responsibilities.nrows() != rotations {
        return Err(shape_error(
            "responsibilities",
            format!("{rotations} rows, one per rotation"),
            responsibilities.shape(),
        ));
    }
    let npatterns = responsibilities.ncols();
    let weights = contiguous("responsibilities", responsibilities)?;
    check_weights(weights)?;
    let out = contiguous_mut("slices", slices)?;
    if pixels == 0 {
        return Ok(());
    }
    out.par_chunks_mut(pixels)
        .enumerate()
        .for_each(|(rotation, slice)| {
            divide_or_clear(slice, total_weight(weights, rotation, npatterns), rotation);
        });
    Ok(())
}

impl EmcContext {
    /// Replaces `slices` with the responsibility-weighted average of the
    /// patterns.
    ///
    /// `responsibilities` are the normalized weights, shape (R, npatterns).
    /// Pairs whose scaling is not positive are left out of the numerator.
    /// Per-pattern scaling is not available for the sparser layout.
    pub fn update_slices(
        &self,
        slices: &mut Array3<f32>,
        patterns: &PatternSet,
        responsibilities: &Array2<f32>,
        scaling: Scaling<'_>,
    ) -> Result<()> {
        let inputs = prepare(slices, patterns, responsibilities, scaling)?;
        match inputs.data {
            PatternData::Dense(counts) => {
                debug!(rotations = slices.dim().0, patterns = inputs.npatterns, "updating slices");
                let out = contiguous_mut("slices", slices)?;
                if inputs.pixels == 0 {
                    return Ok(());
                }
                let pixels = inputs.pixels;
                out.par_chunks_mut(pixels)
                    .enumerate()
                    .for_each(|(rotation, slice)| {
                        let mut accumulated = vec![0.0f64; pixels];
                        for pattern in 0..inputs.npatterns {
                            let w = inputs.weights[rotation * inputs.npatterns + pattern] as f64;
                            let s = inputs.scale.get(rotation, pattern);
                            if w == 0.0 || s <= 0.0 {
                                continue;
                            }
                            let factor = w / s;
                            let pattern_counts = &counts[pattern * pixels..(pattern + 1) * pixels];
                            accumulated
                                .iter_mut()
                                .zip(pattern_counts)
                                .for_each(|(acc, &k)| *acc += factor * k as f64);
                        }
                        let total = total_weight(inputs.weights, rotation, inputs.npatterns);
                        slice
                            .iter_mut()
                            .zip(&accumulated)
                            .for_each(|(v, &acc)| *v = acc as f32);
                        divide_or_clear(slice, total, rotation);
                    });
                Ok(())
            }
            _ => {
                self.accumulate_slices(slices, patterns, responsibilities, scaling)?;
                normalize_slices(slices, responsibilities)
            }
        }
    }

    /// First pass of the sparse update: `slices` is cleared and every listed
    /// photon pixel receives `w · k / s`. Pairs with a weight below the
    /// configured `resp_threshold` are skipped.
    ///
    /// Dense patterns have nothing to scatter and are rejected.
    pub fn accumulate_slices(
        &self,
        slices: &mut Array3<f32>,
        patterns: &PatternSet,
        responsibilities: &Array2<f32>,
        scaling: Scaling<'_>,
    ) -> Result<()> {
        let inputs = prepare(slices, patterns, responsibilities, scaling)?;
        if let PatternData::Dense(_) = inputs.data {
            return Err(EmcError::Unsupported(
                "scatter accumulation needs sparse or sparser patterns",
            ));
        }
        let threshold = self.config.resp_threshold as f64;
        debug!(
            kind = ?patterns.kind(),
            rotations = slices.dim().0,
            patterns = inputs.npatterns,
            threshold,
            "accumulating slices"
        );
        let out = contiguous_mut("slices", slices)?;
        if inputs.pixels == 0 {
            return Ok(());
        }
        out.par_chunks_mut(inputs.pixels)
            .enumerate()
            .for_each(|(rotation, slice)| {
                let mut accumulated = vec![0.0f64; slice.len()];
                for pattern in 0..inputs.npatterns {
                    let w = inputs.weights[rotation * inputs.npatterns + pattern] as f64;
                    let s = inputs.scale.get(rotation, pattern);
                    if w < threshold || w == 0.0 || s <= 0.0 {
                        continue;
                    }
                    let factor = w / s;
                    inputs
                        .data
                        .for_each_listed(pattern, |pixel, k| accumulated[pixel] += factor * k as f64);
                }
                slice
                    .iter_mut()
                    .zip(&accumulated)
                    .for_each(|(v, &acc)| *v = acc as f32);
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmcConfig;
    use crate::patterns::{SparsePatterns, SparserPatterns};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    fn dense() -> Array3<i32> {
        array![
            [[0, 1, 0], [4, 0, 1]],
            [[2, 0, 0], [0, 0, 0]],
            [[1, 1, 1], [1, 3, 0]],
        ]
    }

    fn responsibilities() -> Array2<f32> {
        array![[0.5, 0.25, 0.25], [0.0, 0.5, 0.0], [0.0, 0.0, 0.0]]
    }

    fn context() -> EmcContext {
        EmcContext::new(EmcConfig::default()).unwrap()
    }

    #[test]
    fn dense_update_is_weighted_average() {
        let ctx = context();
        let mut slices = Array3::from_elem((3, 2, 3), 7.0f32);
        ctx.update_slices(
            &mut slices,
            &PatternSet::Dense(dense()),
            &responsibilities(),
            Scaling::Unit,
        )
        .unwrap();

        let expected: Array3<f32> = array![
            [[0.75, 0.75, 0.25], [2.25, 0.75, 0.5]],
            [[2.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
            [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
        ];
        assert_abs_diff_eq!(slices, expected, epsilon = 1e-6);
    }

    #[test]
    fn sparse_layouts_match_dense() {
        let scaling = array![[1.0f32, 2.0, 0.5], [4.0, 1.0, 1.0], [1.0, 1.0, 1.0]];
        let ctx = context();
        let mut reference = Array3::zeros((3, 2, 3));
        ctx.update_slices(
            &mut reference,
            &PatternSet::Dense(dense()),
            &responsibilities(),
            Scaling::PerPair(&scaling),
        )
        .unwrap();
        for patterns in [
            PatternSet::Sparse(SparsePatterns::from_dense(&dense())),
            PatternSet::Sparser(SparserPatterns::from_dense(&dense())),
        ] {
            let mut slices = Array3::from_elem((3, 2, 3), -1.0f32);
            ctx.update_slices(&mut slices, &patterns, &responsibilities(), Scaling::PerPair(&scaling))
                .unwrap();
            assert_abs_diff_eq!(slices, reference, epsilon = 1e-6);
        }
    }

    #[test]
    fn shared_context_updates_from_several_threads() {
        let ctx = context();
        let sparse = PatternSet::Sparse(SparsePatterns::from_dense(&dense()));
        let dense = PatternSet::Dense(dense());
        let (a, b) = std::thread::scope(|scope| {
            let run = |patterns: &PatternSet| {
                let mut slices = Array3::zeros((3, 2, 3));
                ctx.update_slices(&mut slices, patterns, &responsibilities(), Scaling::Unit)
                    .map(|_| slices)
            };
            let a = scope.spawn(move || run(&sparse));
            let b = scope.spawn(move || run(&dense));
            (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
        });
        assert_abs_diff_eq!(a, b, epsilon = 1e-6);
    }

    #[test]
    fn per_pattern_scaling_divides_counts() {
        let scaling = array![2.0f32, 1.0, 1.0];
        let ctx = context();
        let mut scaled = Array3::zeros((3, 2, 3));
        ctx.update_slices(
            &mut scaled,
            &PatternSet::Sparse(SparsePatterns::from_dense(&dense())),
            &responsibilities(),
            Scaling::PerPattern(&scaling),
        )
        .unwrap();
        // Rotation 1 only sees pattern 1, which is unscaled.
        assert_abs_diff_eq!(scaled[[1, 0, 0]], 2.0, epsilon = 1e-6);
        // Rotation 0: pixel (1, 0) holds 0.5 * 4 / 2 + 0.25 * 1.
        assert_abs_diff_eq!(scaled[[0, 1, 0]], 1.25, epsilon = 1e-6);
    }

    #[test]
    fn normalization_is_a_pure_division() {
        let ctx = context();
        let patterns = PatternSet::Sparser(SparserPatterns::from_dense(&dense()));
        let weights = responsibilities();

        let mut accumulated = Array3::zeros((3, 2, 3));
        ctx.accumulate_slices(&mut accumulated, &patterns, &weights, Scaling::Unit)
            .unwrap();
        let mut normalized = accumulated.clone();
        normalize_slices(&mut normalized, &weights).unwrap();

        let totals = weights.sum_axis(ndarray::Axis(1));
        for ((rotation, y, x), &value) in accumulated.indexed_iter() {
            if totals[rotation] > 0.0 {
                assert_abs_diff_eq!(normalized[[rotation, y, x]] * totals[rotation], value, epsilon = 1e-6);
            } else {
                assert_eq!(normalized[[rotation, y, x]], 0.0);
            }
        }
    }

    #[test]
    fn threshold_only_skips_the_scatter() {
        let weights = responsibilities();
        let ctx = EmcContext::new(EmcConfig::default().with_resp_threshold(0.9)).unwrap();
        let patterns = PatternSet::Sparse(SparsePatterns::from_dense(&dense()));

        let mut slices = Array3::from_elem((3, 2, 3), 5.0f32);
        ctx.accumulate_slices(&mut slices, &patterns, &weights, Scaling::Unit)
            .unwrap();
        assert!(slices.iter().all(|&v| v == 0.0));

        let mut partial = Array3::zeros((3, 2, 3));
        EmcContext::new(EmcConfig::default().with_resp_threshold(0.3))
            .unwrap()
            .update_slices(&mut partial, &patterns, &weights, Scaling::Unit)
            .unwrap();
        // Rotation 0 keeps only pattern 0 (w = 0.5) but is still divided by the
        // full total of 1.0.
        assert_abs_diff_eq!(partial[[0, 1, 0]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(partial[[0, 0, 0]], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_scaling_drops_the_pair() {
        let scaling = array![[0.0f32, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]];
        let ctx = context();
        let mut slices = Array3::zeros((3, 2, 3));
        ctx.update_slices(
            &mut slices,
            &PatternSet::Dense(dense()),
            &responsibilities(),
            Scaling::PerPair(&scaling),
        )
        .unwrap();
        assert!(slices.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(slices[[0, 1, 0]], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn rejects_bad_inputs() {
        let ctx = context();
        let mut slices = Array3::zeros((3, 2, 3));
        let log_likelihoods = array![[-0.5f32, 0.25, 0.25], [0.0, 0.5, 0.0], [0.0, 0.0, 0.0]];
        let err = ctx
            .update_slices(&mut slices, &PatternSet::Dense(dense()), &log_likelihoods, Scaling::Unit)
            .unwrap_err();
        assert!(matches!(err, EmcError::InvalidValue { what: "responsibilities", .. }));

        let scaling = Array1::ones(3);
        let err = ctx
            .update_slices(
                &mut slices,
                &PatternSet::Sparser(SparserPatterns::from_dense(&dense())),
                &responsibilities(),
                Scaling::PerPattern(&scaling),
            )
            .unwrap_err();
        assert!(matches!(err, EmcError::Unsupported(_)));

        let err = ctx
            .accumulate_slices(&mut slices, &PatternSet::Dense(dense()), &responsibilities(), Scaling::Unit)
            .unwrap_err();
        assert!(matches!(err, EmcError::Unsupported(_)));

        let err = normalize_slices(&mut slices, &Array2::zeros((2, 3))).unwrap_err();
        assert!(matches!(err, EmcError::Shape { .. }));
    }
}
