//! Precondition checks run at the top of every public operation, before
//! any buffer is written.

use ndarray::{ArrayBase, Data, DataMut, Dimension, Ix2, Ix3};

use crate::error::{EmcError, Result};
use crate::patterns::PatternSet;
use crate::scaling::Scaling;

pub(crate) fn shape_error(what: &'static str, expected: impl Into<String>, actual: &[usize]) -> EmcError {
    EmcError::Shape {
        what,
        expected: expected.into(),
        actual: actual.to_vec(),
    }
}

pub(crate) fn contiguous<'a, S, D>(what: &'static str, array: &'a ArrayBase<S, D>) -> Result<&'a [S::Elem]>
where
    S: Data,
    D: Dimension,
{
    array.as_slice().ok_or(EmcError::Layout { what })
}

pub(crate) fn contiguous_mut<'a, S, D>(
    what: &'static str,
    array: &'a mut ArrayBase<S, D>,
) -> Result<&'a mut [S::Elem]>
where
    S: DataMut,
    D: Dimension,
{
    array.as_slice_mut().ok_or(EmcError::Layout { what })
}

/// Slices must be `rotations x height x width`; returns `(rotations, pixels)`.
pub(crate) fn slice_dims<S: Data<Elem = f32>>(slices: &ArrayBase<S, Ix3>) -> (usize, usize) {
    let (rotations, height, width) = slices.dim();
    (rotations, height * width)
}

/// Checks patterns against the slice image size. Returns
/// `(rotations, patterns, pixels)`.
pub(crate) fn check_patterns<S: Data<Elem = f32>>(
    patterns: &PatternSet,
    slices: &ArrayBase<S, Ix3>,
) -> Result<(usize, usize, usize)> {
    let (rotations, height, width) = slices.dim();
    patterns.validate(height, width)?;
    Ok((rotations, patterns.num_patterns(), height * width))
}

/// Slice intensities may be negative (unobserved) but never NaN or infinite.
pub(crate) fn check_finite(what: &'static str, values: &[f32]) -> Result<()> {
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(EmcError::InvalidValue {
            what,
            reason: format!("values must be finite, found {bad}"),
        });
    }
    Ok(())
}

pub(crate) fn check_responsibilities<S: Data<Elem = f32>>(
    responsibilities: &ArrayBase<S, Ix2>,
    rotations: usize,
    patterns: usize,
) -> Result<()> {
    if responsibilities.dim() != (rotations, patterns) {
        return Err(shape_error(
            "responsibilities",
            format!("nrotations x npatterns = [{rotations}, {patterns}]"),
            responsibilities.shape(),
        ));
    }
    Ok(())
}

/// Responsibilities used as merge or mixture weights must be normalized
/// probabilities, not log-likelihoods.
pub(crate) fn check_weights(weights: &[f32]) -> Result<()> {
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(EmcError::InvalidValue {
            what: "responsibilities",
            reason: format!("weights must be finite and non-negative, found {bad}"),
        });
    }
    Ok(())
}

pub(crate) fn check_scaling(scaling: &Scaling<'_>, rotations: usize, patterns: usize) -> Result<()> {
    let values = match scaling {
        Scaling::Unit => return Ok(()),
        Scaling::PerPair(matrix) => {
            if matrix.dim() != (rotations, patterns) {
                return Err(shape_error(
                    "scaling",
                    format!("nrotations x npatterns = [{rotations}, {patterns}]"),
                    matrix.shape(),
                ));
            }
            contiguous("scaling", *matrix)?
        }
        Scaling::PerPattern(vector) => {
            if vector.len() != patterns {
                return Err(shape_error(
                    "scaling",
                    format!("npatterns = [{patterns}]"),
                    vector.shape(),
                ));
            }
            contiguous("scaling", *vector)?
        }
    };
    if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
        return Err(EmcError::InvalidValue {
            what: "scaling",
            reason: format!("scalings must be finite and non-negative, found {bad}"),
        });
    }
    Ok(())
}
