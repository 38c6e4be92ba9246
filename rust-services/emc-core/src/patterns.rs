//! Diffraction pattern representations.
//!
//! A pattern collection arrives in one of three layouts and keeps that layout
//! for a whole engine call:
//!
//! - **Dense**: `[pattern, y, x]` photon counts.
//! - **Sparse**: per-pattern lists of `(pixel, count)` pairs concatenated in
//!   `indices`/`values`, delimited by `start_indices` (length
//!   `npatterns + 1`). Unlisted pixels hold zero photons.
//! - **Sparser**: like sparse, but single-photon pixels are moved into a
//!   second list (`ones_indices`/`ones_start_indices`) that carries no
//!   values; `indices`/`values` then only hold multi-photon pixels.
//!
//! Pixel offsets are row-major positions in a `height x width` image. A pixel
//! appears at most once per pattern, across both sparser lists.

use ndarray::{Array1, Array3};

use crate::error::{EmcError, Result};
use crate::numeric::lane_sum;
use crate::validate::{contiguous, shape_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Dense,
    Sparse,
    Sparser,
}

/// Photon lists for every pattern, concatenated.
#[derive(Debug, Clone, PartialEq)]
pub struct SparsePatterns {
    pub start_indices: Array1<i32>,
    pub indices: Array1<i32>,
    pub values: Array1<i32>,
}

/// Sparse lists for multi-photon pixels plus value-less lists for
/// single-photon pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct SparserPatterns {
    pub start_indices: Array1<i32>,
    pub indices: Array1<i32>,
    pub values: Array1<i32>,
    pub ones_start_indices: Array1<i32>,
    pub ones_indices: Array1<i32>,
}

/// A pattern collection in any of the supported layouts.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternSet {
    Dense(Array3<i32>),
    Sparse(SparsePatterns),
    Sparser(SparserPatterns),
}

/// Borrowed flat view of one `(start_indices, indices[, values])` list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhotonList<'a> {
    starts: &'a [i32],
    indices: &'a [i32],
    values: Option<&'a [i32]>,
}

impl<'a> PhotonList<'a> {
    fn range(&self, pattern: usize) -> std::ops::Range<usize> {
        self.starts[pattern] as usize..self.starts[pattern + 1] as usize
    }

    #[inline]
    fn entry(&self, n: usize) -> (usize, i32) {
        (self.indices[n] as usize, self.values.map_or(1, |values| values[n]))
    }

    /// Lane-reduced sum of `term(pixel, count)` over one pattern's entries.
    pub(crate) fn sum_over(&self, pattern: usize, width: usize, term: impl Fn(usize, i32) -> f64) -> f64 {
        let range = self.range(pattern);
        lane_sum(range.len(), width, |n| {
            let (pixel, count) = self.entry(range.start + n);
            term(pixel, count)
        })
    }

    /// `(pixel, count)` pairs of one pattern. Lists without values yield a
    /// count of one.
    pub(crate) fn entries(&self, pattern: usize) -> impl Iterator<Item = (usize, i32)> + 'a {
        let range = self.range(pattern);
        let indices: &'a [i32] = self.indices;
        let indices = &indices[range.clone()];
        let values = self.values.map(|values| &values[range]);
        indices
            .iter()
            .enumerate()
            .map(move |(n, &pixel)| (pixel as usize, values.map_or(1, |values| values[n])))
    }
}

/// Checks an offsets array against the number of entries it delimits.
fn check_offsets(what: &str, starts: &[i32], entries: usize) -> Result<()> {
    let Some(&first) = starts.first() else {
        return Err(EmcError::InvalidPatterns(format!(
            "{what} must hold at least one element"
        )));
    };
    if first != 0 {
        return Err(EmcError::InvalidPatterns(format!(
            "{what} must start at 0, found {first}"
        )));
    }
    if let Some(pos) = starts.windows(2).position(|w| w[1] < w[0]) {
        return Err(EmcError::InvalidPatterns(format!(
            "{what} must be non-decreasing, but entry {} is {} and entry {} is {}",
            pos,
            starts[pos],
            pos + 1,
            starts[pos + 1]
        )));
    }
    let last = starts[starts.len() - 1] as usize;
    if last != entries {
        return Err(EmcError::InvalidPatterns(format!(
            "{what} ends at {last} but {entries} entries are listed"
        )));
    }
    Ok(())
}

fn check_pixels(what: &str, indices: &[i32], num_pixels: usize) -> Result<()> {
    if let Some(bad) = indices
        .iter()
        .find(|&&i| i < 0 || i as usize >= num_pixels)
    {
        return Err(EmcError::InvalidPatterns(format!(
            "{what} contains pixel {bad}, outside an image of {num_pixels} pixels"
        )));
    }
    Ok(())
}

/// Rejects a pixel listed twice within one pattern, counting every list
/// given.
fn check_unique(lists: &[PhotonList<'_>], npatterns: usize, num_pixels: usize) -> Result<()> {
    let mut seen_in = vec![usize::MAX; num_pixels];
    for pattern in 0..npatterns {
        for list in lists {
            for n in list.range(pattern) {
                let pixel = list.indices[n] as usize;
                if seen_in[pixel] == pattern {
                    return Err(EmcError::InvalidPatterns(format!(
                        "pattern {pattern} lists pixel {pixel} more than once"
                    )));
                }
                seen_in[pixel] = pattern;
            }
        }
    }
    Ok(())
}

fn list_sizes(starts: &Array1<i32>) -> Vec<usize> {
    starts
        .iter()
        .zip(starts.iter().skip(1))
        .map(|(a, b)| (b - a).max(0) as usize)
        .collect()
}

impl SparsePatterns {
    pub fn new(start_indices: Array1<i32>, indices: Array1<i32>, values: Array1<i32>) -> Self {
        Self {
            start_indices,
            indices,
            values,
        }
    }

    pub fn num_patterns(&self) -> usize {
        self.start_indices.len().saturating_sub(1)
    }

    /// Number of listed pixels of every pattern.
    pub fn pattern_sizes(&self) -> Vec<usize> {
        list_sizes(&self.start_indices)
    }

    /// Encodes dense photon counts, keeping every nonzero pixel.
    pub fn from_dense(patterns: &Array3<i32>) -> Self {
        let mut start_indices = Vec::with_capacity(patterns.len_of(ndarray::Axis(0)) + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        start_indices.push(0);
        for pattern in patterns.outer_iter() {
            for (pixel, &count) in pattern.iter().enumerate() {
                if count != 0 {
                    indices.push(pixel as i32);
                    values.push(count);
                }
            }
            start_indices.push(indices.len() as i32);
        }
        Self::new(
            Array1::from(start_indices),
            Array1::from(indices),
            Array1::from(values),
        )
    }

    pub fn to_dense(&self, height: usize, width: usize) -> Result<Array3<i32>> {
        self.validate(height * width)?;
        let list = self.list()?;
        let mut dense = Array3::zeros((self.num_patterns(), height, width));
        for (pattern, mut image) in dense.outer_iter_mut().enumerate() {
            for (pixel, count) in list.entries(pattern) {
                image[[pixel / width, pixel % width]] += count;
            }
        }
        Ok(dense)
    }

    pub(crate) fn list(&self) -> Result<PhotonList<'_>> {
        Ok(PhotonList {
            starts: contiguous("start_indices", &self.start_indices)?,
            indices: contiguous("indices", &self.indices)?,
            values: Some(contiguous("values", &self.values)?),
        })
    }

    pub fn validate(&self, num_pixels: usize) -> Result<()> {
        if self.indices.len() != self.values.len() {
            return Err(shape_error(
                "values",
                format!("the same length as indices ({})", self.indices.len()),
                self.values.shape(),
            ));
        }
        let list = self.list()?;
        check_offsets("start_indices", list.starts, list.indices.len())?;
        check_pixels("indices", list.indices, num_pixels)?;
        check_unique(&[list], self.num_patterns(), num_pixels)?;
        if let Some(bad) = self.values.iter().find(|&&v| v < 1) {
            return Err(EmcError::InvalidPatterns(format!(
                "listed photon counts must be at least 1, found {bad}"
            )));
        }
        Ok(())
    }

    fn max_photon_count(&self) -> usize {
        self.values.iter().copied().max().unwrap_or(0).max(0) as usize
    }
}

impl SparserPatterns {
    pub fn new(
        start_indices: Array1<i32>,
        indices: Array1<i32>,
        values: Array1<i32>,
        ones_start_indices: Array1<i32>,
        ones_indices: Array1<i32>,
    ) -> Self {
        Self {
            start_indices,
            indices,
            values,
            ones_start_indices,
            ones_indices,
        }
    }

    pub fn num_patterns(&self) -> usize {
        self.start_indices.len().saturating_sub(1)
    }

    /// Number of multi-photon pixels of every pattern.
    pub fn pattern_sizes(&self) -> Vec<usize> {
        list_sizes(&self.start_indices)
    }

    /// Number of single-photon pixels of every pattern.
    pub fn ones_pattern_sizes(&self) -> Vec<usize> {
        list_sizes(&self.ones_start_indices)
    }

    /// Encodes dense photon counts, splitting single-photon pixels off into
    /// the value-less list.
    pub fn from_dense(patterns: &Array3<i32>) -> Self {
        let npatterns = patterns.len_of(ndarray::Axis(0));
        let mut start_indices = Vec::with_capacity(npatterns + 1);
        let mut ones_start_indices = Vec::with_capacity(npatterns + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        let mut ones_indices = Vec::new();
        start_indices.push(0);
        ones_start_indices.push(0);
        for pattern in patterns.outer_iter() {
            for (pixel, &count) in pattern.iter().enumerate() {
                match count {
                    0 => {}
                    1 => ones_indices.push(pixel as i32),
                    _ => {
                        indices.push(pixel as i32);
                        values.push(count);
                    }
                }
            }
            start_indices.push(indices.len() as i32);
            ones_start_indices.push(ones_indices.len() as i32);
        }
        Self::new(
            Array1::from(start_indices),
            Array1::from(indices),
            Array1::from(values),
            Array1::from(ones_start_indices),
            Array1::from(ones_indices),
        )
    }

    pub fn to_dense(&self, height: usize, width: usize) -> Result<Array3<i32>> {
        self.validate(height * width)?;
        let (list, ones) = self.lists()?;
        let mut dense = Array3::zeros((self.num_patterns(), height, width));
        for (pattern, mut image) in dense.outer_iter_mut().enumerate() {
            for (pixel, count) in list.entries(pattern).chain(ones.entries(pattern)) {
                image[[pixel / width, pixel % width]] += count;
            }
        }
        Ok(dense)
    }

    pub(crate) fn lists(&self) -> Result<(PhotonList<'_>, PhotonList<'_>)> {
        let list = PhotonList {
            starts: contiguous("start_indices", &self.start_indices)?,
            indices: contiguous("indices", &self.indices)?,
            values: Some(contiguous("values", &self.values)?),
        };
        let ones = PhotonList {
            starts: contiguous("ones_start_indices", &self.ones_start_indices)?,
            indices: contiguous("ones_indices", &self.ones_indices)?,
            values: None,
        };
        Ok((list, ones))
    }

    pub fn validate(&self, num_pixels: usize) -> Result<()> {
        if self.indices.len() != self.values.len() {
            return Err(shape_error(
                "values",
                format!("the same length as indices ({})", self.indices.len()),
                self.values.shape(),
            ));
        }
        if self.ones_start_indices.len() != self.start_indices.len() {
            return Err(shape_error(
                "ones_start_indices",
                format!("the same length as start_indices ({})", self.start_indices.len()),
                self.ones_start_indices.shape(),
            ));
        }
        let (list, ones) = self.lists()?;
        check_offsets("start_indices", list.starts, list.indices.len())?;
        check_offsets("ones_start_indices", ones.starts, ones.indices.len())?;
        check_pixels("indices", list.indices, num_pixels)?;
        check_pixels("ones_indices", ones.indices, num_pixels)?;
        check_unique(&[list, ones], self.num_patterns(), num_pixels)?;
        if let Some(bad) = self.values.iter().find(|&&v| v < 2) {
            return Err(EmcError::InvalidPatterns(format!(
                "multi-photon counts must be at least 2, single photons go in ones_indices, found {bad}"
            )));
        }
        Ok(())
    }

    fn max_photon_count(&self) -> usize {
        let listed = self.values.iter().copied().max().unwrap_or(0).max(0) as usize;
        if self.ones_indices.is_empty() {
            listed
        } else {
            listed.max(1)
        }
    }
}

impl PatternSet {
    pub fn kind(&self) -> PatternKind {
        match self {
            Self::Dense(_) => PatternKind::Dense,
            Self::Sparse(_) => PatternKind::Sparse,
            Self::Sparser(_) => PatternKind::Sparser,
        }
    }

    /// Pattern count. For the sparse layouts `start_indices` is the
    /// source of truth.
    pub fn num_patterns(&self) -> usize {
        match self {
            Self::Dense(patterns) => patterns.len_of(ndarray::Axis(0)),
            Self::Sparse(patterns) => patterns.num_patterns(),
            Self::Sparser(patterns) => patterns.num_patterns(),
        }
    }

    /// Largest photon count of any pixel in the collection.
    pub fn max_photon_count(&self) -> usize {
        match self {
            Self::Dense(patterns) => patterns.iter().copied().max().unwrap_or(0).max(0) as usize,
            Self::Sparse(patterns) => patterns.max_photon_count(),
            Self::Sparser(patterns) => patterns.max_photon_count(),
        }
    }

    /// Structural checks against an image of `height x width` pixels.
    pub fn validate(&self, height: usize, width: usize) -> Result<()> {
        match self {
            Self::Dense(patterns) => {
                let (_, pattern_height, pattern_width) = patterns.dim();
                if (pattern_height, pattern_width) != (height, width) {
                    return Err(shape_error(
                        "patterns",
                        format!("npatterns x {height} x {width} to match the slices"),
                        patterns.shape(),
                    ));
                }
                contiguous("patterns", patterns)?;
                if let Some(bad) = patterns.iter().find(|&&v| v < 0) {
                    return Err(EmcError::InvalidPatterns(format!(
                        "photon counts must be non-negative, found {bad}"
                    )));
                }
                Ok(())
            }
            Self::Sparse(patterns) => patterns.validate(height * width),
            Self::Sparser(patterns) => patterns.validate(height * width),
        }
    }
}

/// Flat buffers of a validated pattern set, as handed to the kernels.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PatternData<'a> {
    Dense(&'a [i32]),
    Sparse(PhotonList<'a>),
    Sparser(PhotonList<'a>, PhotonList<'a>),
}

impl<'a> PatternData<'a> {
    /// Sum of `term(pixel, count)` over every listed photon pixel of a
    /// sparse or sparser pattern. Dense data has no photon list and sums to
    /// zero.
    pub(crate) fn sum_listed(&self, pattern: usize, width: usize, term: impl Fn(usize, i32) -> f64) -> f64 {
        match self {
            Self::Dense(_) => 0.0,
            Self::Sparse(list) => list.sum_over(pattern, width, term),
            Self::Sparser(list, ones) => list.sum_over(pattern, width, &term) + ones.sum_over(pattern, width, &term),
        }
    }

    /// Visits every listed photon pixel of a sparse or sparser pattern.
    pub(crate) fn for_each_listed(&self, pattern: usize, mut visit: impl FnMut(usize, i32)) {
        match self {
            Self::Dense(_) => {}
            Self::Sparse(list) => list.entries(pattern).for_each(|(p, k)| visit(p, k)),
            Self::Sparser(list, ones) => list
                .entries(pattern)
                .chain(ones.entries(pattern))
                .for_each(|(p, k)| visit(p, k)),
        }
    }
}

impl PatternSet {
    pub(crate) fn data(&self) -> Result<PatternData<'_>> {
        Ok(match self {
            Self::Dense(patterns) => PatternData::Dense(contiguous("patterns", patterns)?),
            Self::Sparse(patterns) => PatternData::Sparse(patterns.list()?),
            Self::Sparser(patterns) => {
                let (list, ones) = patterns.lists()?;
                PatternData::Sparser(list, ones)
            }
        })
    }
}

impl From<Array3<i32>> for PatternSet {
    fn from(patterns: Array3<i32>) -> Self {
        Self::Dense(patterns)
    }
}

impl From<SparsePatterns> for PatternSet {
    fn from(patterns: SparsePatterns) -> Self {
        Self::Sparse(patterns)
    }
}

impl From<SparserPatterns> for PatternSet {
    fn from(patterns: SparserPatterns) -> Self {
        Self::Sparser(patterns)
    }
}
