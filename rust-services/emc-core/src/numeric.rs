//! Lookup tables and caches backing the Poisson engines.

use ndarray::{ArrayBase, Data, Ix3};
use rayon::prelude::*;
use tracing::info;

use crate::error::{EmcError, Result};
use crate::validate::{contiguous, slice_dims};

/// Largest photon count the log-factorial table may be grown to.
pub const MAX_PHOTON_COUNT: usize = 200_000;

/// `ln(k!)` for `k` in `0..len()`.
///
/// The table only grows. Asking for a count it already covers is free; a
/// larger count rebuilds it from scratch up to that count.
#[derive(Debug, Clone, Default)]
pub struct LogFactorialTable {
    values: Vec<f64>,
}

impl LogFactorialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Makes sure `ln(max_k!)` is available. Returns whether the table was
    /// rebuilt.
    pub fn ensure_capacity(&mut self, max_k: usize) -> Result<bool> {
        if max_k < self.values.len() {
            return Ok(false);
        }
        if max_k > MAX_PHOTON_COUNT {
            return Err(EmcError::PhotonCountTooLarge {
                count: max_k,
                max: MAX_PHOTON_COUNT,
            });
        }
        let mut values = Vec::with_capacity(max_k + 1);
        values.push(0.0);
        for k in 1..=max_k {
            values.push(values[k - 1] + (k as f64).ln());
        }
        info!(max_k, "rebuilt log-factorial table");
        self.values = values;
        Ok(true)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

/// Per-rotation total intensity, reused across every pattern scored
/// against the same slice.
///
/// Negative pixels mark unobserved regions and are left out of the total.
#[derive(Debug, Clone, Default)]
pub struct SliceSums {
    sums: Vec<f64>,
    reallocations: usize,
}

impl SliceSums {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the sums for `slices`. The buffer is only reallocated
    /// when the number of rotations changes.
    pub fn ensure<S: Data<Elem = f32>>(&mut self, slices: &ArrayBase<S, Ix3>) -> Result<&[f64]> {
        let (rotations, pixels) = slice_dims(slices);
        let flat = contiguous("slices", slices)?;
        if self.sums.len() != rotations {
            self.sums = vec![0.0; rotations];
            self.reallocations += 1;
        }
        if pixels == 0 {
            self.sums.iter_mut().for_each(|s| *s = 0.0);
            return Ok(&self.sums);
        }
        self.sums
            .par_iter_mut()
            .zip(flat.par_chunks(pixels))
            .for_each(|(sum, slice)| {
                *sum = slice.iter().filter(|&&v| v > 0.0).map(|&v| v as f64).sum();
            });
        Ok(&self.sums)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.sums
    }

    /// How many times the buffer has been (re)allocated.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }
}

/// Sums `term(i)` for `i` in `0..len` the way one compute unit of `width`
/// lanes does it: every lane accumulates a strided partial sum and the
/// partials are added at the end.
#[inline]
pub(crate) fn lane_sum(len: usize, width: usize, term: impl Fn(usize) -> f64) -> f64 {
    let width = width.max(1).min(len.max(1));
    let mut total = 0.0;
    for lane in 0..width {
        let mut partial = 0.0;
        let mut i = lane;
        while i < len {
            partial += term(i);
            i += width;
        }
        total += partial;
    }
    total
}

/// Poisson log-likelihood of `k` photons given an expected `lambda`.
///
/// `k = 0` gives exactly `-lambda`; `lambda = 0` with photons present gives
/// negative infinity.
#[inline]
pub(crate) fn poisson_log_likelihood(k: i32, lambda: f64, log_factorial: &[f64]) -> f64 {
    if k == 0 {
        -lambda
    } else {
        k as f64 * lambda.ln() - lambda - log_factorial[k as usize]
    }
}
