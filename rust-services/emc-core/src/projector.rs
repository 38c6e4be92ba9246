//! Model <-> slice projection.
//!
//! Volumes are indexed `[z, y, x]` (planar models `[y, x]`). Detector
//! coordinates are given in voxel units relative to the volume centre,
//! which for an axis of length `n` sits at index `n / 2`.

use ndarray::{Array, Array1, Array2, Array3, Dimension, Zip};
use rayon::prelude::*;
use tracing::debug;

use crate::config::Interpolation;
use crate::error::{EmcError, Result};
use crate::patterns::PatternSet;
use crate::validate::{contiguous, contiguous_mut, shape_error};

/// Value written where the model holds no information.
pub const UNOBSERVED: f32 = -1.0;

/// Rotation matrix of the quaternion `(w, x, y, z)`. The quaternion does
/// not need to be normalized.
pub fn rotation_matrix(quaternion: [f32; 4]) -> [[f32; 3]; 3] {
    let [w, x, y, z] = quaternion;
    let s = 2.0 / (w * w + x * x + y * y + z * z);
    [
        [
            1.0 - s * (y * y + z * z),
            s * (x * y - w * z),
            s * (x * z + w * y),
        ],
        [
            s * (x * y + w * z),
            1.0 - s * (x * x + z * z),
            s * (y * z - w * x),
        ],
        [
            s * (x * z - w * y),
            s * (y * z + w * x),
            1.0 - s * (x * x + y * y),
        ],
    ]
}

#[inline]
fn rotate(matrix: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        matrix[0][0] * v[0] + matrix[0][1] * v[1] + matrix[0][2] * v[2],
        matrix[1][0] * v[0] + matrix[1][1] * v[1] + matrix[1][2] * v[2],
        matrix[2][0] * v[0] + matrix[2][1] * v[1] + matrix[2][2] * v[2],
    ]
}

/// Row-major voxel grid of `N` axes.
#[derive(Debug, Clone, Copy)]
struct Grid<const N: usize> {
    shape: [usize; N],
}

impl<const N: usize> Grid<N> {
    fn len(&self) -> usize {
        self.shape.iter().product()
    }

    fn center(&self, axis: usize) -> f32 {
        (self.shape[axis] / 2) as f32
    }

    fn offset(&self, index: [isize; N]) -> Option<usize> {
        let mut offset = 0;
        for axis in 0..N {
            let i = index[axis];
            if i < 0 || i as usize >= self.shape[axis] {
                return None;
            }
            offset = offset * self.shape[axis] + i as usize;
        }
        Some(offset)
    }

    fn nearest(&self, pos: [f32; N]) -> Option<usize> {
        if !pos.iter().all(|p| p.is_finite()) {
            return None;
        }
        self.offset(pos.map(|p| p.round() as isize))
    }

    /// In-bounds neighbours of `pos` with their (non-zero) linear
    /// interpolation weights. Positions a full voxel or more outside the
    /// grid have none.
    fn corners(&self, pos: [f32; N]) -> impl Iterator<Item = (usize, f32)> {
        let grid = *self;
        let near = pos
            .iter()
            .zip(grid.shape)
            .all(|(&p, n)| p > -1.0 && p < n as f32);
        let base = pos.map(|p| p.floor());
        let count = if near { 1usize << N } else { 0 };
        (0..count).filter_map(move |mask| {
            let mut index = [0isize; N];
            let mut weight = 1.0f32;
            for axis in 0..N {
                let frac = pos[axis] - base[axis];
                if mask & (1 << axis) == 0 {
                    index[axis] = base[axis] as isize;
                    weight *= 1.0 - frac;
                } else {
                    index[axis] = base[axis] as isize + 1;
                    weight *= frac;
                }
            }
            if weight <= 0.0 {
                return None;
            }
            grid.offset(index).map(|offset| (offset, weight))
        })
    }

    /// Linear interpolation over the observed neighbours only.
    fn interpolate(&self, model: &[f32], pos: [f32; N]) -> f32 {
        let mut value = 0.0;
        let mut total = 0.0;
        for (offset, weight) in self.corners(pos) {
            let v = model[offset];
            if v >= 0.0 {
                value += weight * v;
                total += weight;
            }
        }
        if total > 0.0 {
            value / total
        } else {
            UNOBSERVED
        }
    }
}

/// Fills every slice by sampling the model at the rotated pixel positions.
fn expand_kernel<const N: usize>(
    model: &[f32],
    grid: Grid<N>,
    slices: &mut [f32],
    pixels: usize,
    position: impl Fn(usize, usize) -> [f32; N] + Sync,
) {
    if pixels == 0 {
        return;
    }
    slices
        .par_chunks_mut(pixels)
        .enumerate()
        .for_each(|(rotation, slice)| {
            for (pixel, value) in slice.iter_mut().enumerate() {
                *value = grid.interpolate(model, position(rotation, pixel));
            }
        });
}

/// Scatters every slice into fresh model/weight accumulators. Rotations are
/// handed out in one chunk per thread, each chunk owning its own pair of
/// accumulators; they are summed at the end.
fn insert_kernel<const N: usize>(
    grid: Grid<N>,
    slices: &[f32],
    pixels: usize,
    slice_weights: &[f32],
    interpolation: Interpolation,
    position: impl Fn(usize, usize) -> [f32; N] + Sync,
) -> (Vec<f32>, Vec<f32>) {
    let len = grid.len();
    let empty = || (vec![0.0f32; len], vec![0.0f32; len]);
    if pixels == 0 {
        return empty();
    }
    let rotations = slices.len() / pixels;
    let job_size = rotations.div_ceil(rayon::current_num_threads()).max(1);
    slices
        .par_chunks(pixels)
        .enumerate()
        .fold_chunks(job_size, empty, |(mut model, mut weights), (rotation, slice)| {
            let slice_weight = slice_weights[rotation];
            if slice_weight == 0.0 {
                return (model, weights);
            }
            for (pixel, &value) in slice.iter().enumerate() {
                if value < 0.0 {
                    continue;
                }
                let pos = position(rotation, pixel);
                match interpolation {
                    Interpolation::NearestNeighbour => {
                        if let Some(offset) = grid.nearest(pos) {
                            model[offset] += value * slice_weight;
                            weights[offset] += slice_weight;
                        }
                    }
                    Interpolation::Linear => {
                        for (offset, weight) in grid.corners(pos) {
                            model[offset] += weight * value * slice_weight;
                            weights[offset] += weight * slice_weight;
                        }
                    }
                }
            }
            (model, weights)
        })
        .reduce(empty, |(mut model, mut weights), (other_model, other_weights)| {
            model.iter_mut().zip(&other_model).for_each(|(a, b)| *a += b);
            weights.iter_mut().zip(&other_weights).for_each(|(a, b)| *a += b);
            (model, weights)
        })
}

fn check_quaternions(rotations: &Array2<f32>, count: usize) -> Result<Vec<[[f32; 3]; 3]>> {
    if rotations.dim() != (count, 4) {
        return Err(shape_error(
            "rotations",
            format!("nrotations x 4 = [{count}, 4]"),
            rotations.shape(),
        ));
    }
    rotations
        .outer_iter()
        .map(|q| {
            let q = [q[0], q[1], q[2], q[3]];
            let norm2: f32 = q.iter().map(|v| v * v).sum();
            if !(norm2.is_finite() && norm2 > 0.0) {
                return Err(EmcError::InvalidValue {
                    what: "rotations",
                    reason: format!("{q:?} is not a valid quaternion"),
                });
            }
            Ok(rotation_matrix(q))
        })
        .collect()
}

fn check_coordinates(coordinates: &Array3<f32>, height: usize, width: usize) -> Result<&[f32]> {
    if coordinates.dim() != (3, height, width) {
        return Err(shape_error(
            "coordinates",
            format!("3 x {height} x {width} to match the slices"),
            coordinates.shape(),
        ));
    }
    contiguous("coordinates", coordinates)
}

fn check_slice_weights(slice_weights: &Array1<f32>, rotations: usize) -> Result<&[f32]> {
    if slice_weights.len() != rotations {
        return Err(shape_error(
            "slice_weights",
            format!("one weight per slice ({rotations})"),
            slice_weights.shape(),
        ));
    }
    contiguous("slice_weights", slice_weights)
}

fn grid3(model: &Array3<f32>) -> Grid<3> {
    let (z, y, x) = model.dim();
    Grid { shape: [z, y, x] }
}

fn grid2(model: &Array2<f32>) -> Grid<2> {
    let (y, x) = model.dim();
    Grid { shape: [y, x] }
}

/// Index-space position of pixel `pixel` under `matrix`.
#[inline]
fn position_3d(grid: &Grid<3>, matrix: &[[f32; 3]; 3], coordinates: &[f32], pixels: usize, pixel: usize) -> [f32; 3] {
    let [x, y, z] = rotate(
        matrix,
        [
            coordinates[pixel],
            coordinates[pixels + pixel],
            coordinates[2 * pixels + pixel],
        ],
    );
    [z + grid.center(0), y + grid.center(1), x + grid.center(2)]
}

/// Index-space position of pixel `(i, j)` of a `height x width` slice turned
/// by `angle` around the image centre.
#[inline]
fn position_2d(grid: &Grid<2>, angle: f32, height: usize, width: usize, pixel: usize) -> [f32; 2] {
    let x = (pixel % width) as f32 - (width / 2) as f32;
    let y = (pixel / width) as f32 - (height / 2) as f32;
    let (sin, cos) = angle.sin_cos();
    [
        sin * x + cos * y + grid.center(0),
        cos * x - sin * y + grid.center(1),
    ]
}

/// Samples one slice per rotation out of `model`.
///
/// model:       volume, shape (Z, Y, X)
/// slices:      output, shape (R, H, W)
/// rotations:   quaternions `(w, x, y, z)`, shape (R, 4)
/// coordinates: detector pixel positions, shape (3, H, W)
///
/// Pixels that fall outside the observed part of the model are set to
/// [`UNOBSERVED`].
pub fn expand_model(
    model: &Array3<f32>,
    slices: &mut Array3<f32>,
    rotations: &Array2<f32>,
    coordinates: &Array3<f32>,
) -> Result<()> {
    let (count, height, width) = slices.dim();
    let matrices = check_quaternions(rotations, count)?;
    let coordinates = check_coordinates(coordinates, height, width)?;
    let model_flat = contiguous("model", model)?;
    let grid = grid3(model);
    let pixels = height * width;
    let slices_flat = contiguous_mut("slices", slices)?;

    debug!(rotations = count, pixels, "expanding model");
    expand_kernel(model_flat, grid, slices_flat, pixels, |rotation, pixel| {
        position_3d(&grid, &matrices[rotation], coordinates, pixels, pixel)
    });
    Ok(())
}

/// Adds every slice into `model`, weighted by its slice weight.
///
/// `model` accumulates `value * weight` and `model_weights` accumulates
/// `weight`, so repeated calls can be normalized together afterwards with
/// [`normalize_model`]. Slice pixels holding a negative value are skipped.
pub fn insert_slices(
    model: &mut Array3<f32>,
    model_weights: &mut Array3<f32>,
    slices: &Array3<f32>,
    slice_weights: &Array1<f32>,
    rotations: &Array2<f32>,
    coordinates: &Array3<f32>,
    interpolation: Interpolation,
) -> Result<()> {
    let (count, height, width) = slices.dim();
    if model.dim() != model_weights.dim() {
        return Err(shape_error(
            "model_weights",
            format!("the model shape {:?}", model.shape()),
            model_weights.shape(),
        ));
    }
    let matrices = check_quaternions(rotations, count)?;
    let slice_weights = check_slice_weights(slice_weights, count)?;
    let coordinates = check_coordinates(coordinates, height, width)?;
    let slices_flat = contiguous("slices", slices)?;
    let grid = grid3(model);
    let pixels = height * width;
    let model_flat = contiguous_mut("model", model)?;
    let weights_flat = contiguous_mut("model_weights", model_weights)?;

    debug!(rotations = count, pixels, %interpolation, "inserting slices");
    let (added, added_weights) = insert_kernel(
        grid,
        slices_flat,
        pixels,
        slice_weights,
        interpolation,
        |rotation, pixel| position_3d(&grid, &matrices[rotation], coordinates, pixels, pixel),
    );
    model_flat.iter_mut().zip(&added).for_each(|(m, a)| *m += a);
    weights_flat.iter_mut().zip(&added_weights).for_each(|(w, a)| *w += a);
    Ok(())
}

/// Planar variant of [`expand_model`]. Rotations are in-plane angles in
/// radians; the slice pixel grid itself, centred, serves as coordinates.
pub fn expand_model_2d(model: &Array2<f32>, slices: &mut Array3<f32>, rotations: &Array1<f32>) -> Result<()> {
    let (count, height, width) = slices.dim();
    if rotations.len() != count {
        return Err(shape_error(
            "rotations",
            format!("one angle per slice ({count})"),
            rotations.shape(),
        ));
    }
    let angles = contiguous("rotations", rotations)?;
    let model_flat = contiguous("model", model)?;
    let grid = grid2(model);
    let slices_flat = contiguous_mut("slices", slices)?;

    debug!(rotations = count, pixels = height * width, "expanding planar model");
    expand_kernel(model_flat, grid, slices_flat, height * width, |rotation, pixel| {
        position_2d(&grid, angles[rotation], height, width, pixel)
    });
    Ok(())
}

/// Planar variant of [`insert_slices`].
pub fn insert_slices_2d(
    model: &mut Array2<f32>,
    model_weights: &mut Array2<f32>,
    slices: &Array3<f32>,
    slice_weights: &Array1<f32>,
    rotations: &Array1<f32>,
    interpolation: Interpolation,
) -> Result<()> {
    let (count, height, width) = slices.dim();
    if model.dim() != model_weights.dim() {
        return Err(shape_error(
            "model_weights",
            format!("the model shape {:?}", model.shape()),
            model_weights.shape(),
        ));
    }
    if rotations.len() != count {
        return Err(shape_error(
            "rotations",
            format!("one angle per slice ({count})"),
            rotations.shape(),
        ));
    }
    let angles = contiguous("rotations", rotations)?;
    let slice_weights = check_slice_weights(slice_weights, count)?;
    let slices_flat = contiguous("slices", slices)?;
    let grid = grid2(model);
    let model_flat = contiguous_mut("model", model)?;
    let weights_flat = contiguous_mut("model_weights", model_weights)?;

    debug!(rotations = count, pixels = height * width, %interpolation, "inserting planar slices");
    let (added, added_weights) = insert_kernel(
        grid,
        slices_flat,
        height * width,
        slice_weights,
        interpolation,
        |rotation, pixel| position_2d(&grid, angles[rotation], height, width, pixel),
    );
    model_flat.iter_mut().zip(&added).for_each(|(m, a)| *m += a);
    weights_flat.iter_mut().zip(&added_weights).for_each(|(w, a)| *w += a);
    Ok(())
}

/// Divides an accumulated model by its weights. Voxels that never received
/// any weight are set to [`UNOBSERVED`].
pub fn normalize_model<D: Dimension>(model: &mut Array<f32, D>, weights: &Array<f32, D>) -> Result<()> {
    if model.shape() != weights.shape() {
        return Err(shape_error(
            "model_weights",
            format!("the model shape {:?}", model.shape()),
            weights.shape(),
        ));
    }
    Zip::from(model).and(weights).for_each(|m, &w| {
        if w > 0.0 {
            *m /= w;
        } else {
            *m = UNOBSERVED;
        }
    });
    Ok(())
}

/// Builds a model directly from patterns with known orientations.
///
/// Every pattern is inserted with unit weight using linear interpolation.
/// Without an explicit `shape` the model is a cube whose side is the mean of
/// the pattern height and width.
pub fn assemble_model(
    patterns: &PatternSet,
    rotations: &Array2<f32>,
    coordinates: &Array3<f32>,
    shape: Option<(usize, usize, usize)>,
) -> Result<Array3<f32>> {
    let PatternSet::Dense(dense) = patterns else {
        return Err(EmcError::Unsupported("assemble_model does not support sparse data"));
    };
    let (count, height, width) = dense.dim();
    patterns.validate(height, width)?;

    let shape = shape.unwrap_or_else(|| {
        let side = (height + width) / 2;
        (side, side, side)
    });
    let slices = dense.mapv(|v| v as f32);
    let slice_weights = Array1::ones(count);
    let mut model = Array3::zeros(shape);
    let mut model_weights = Array3::zeros(shape);
    insert_slices(
        &mut model,
        &mut model_weights,
        &slices,
        &slice_weights,
        rotations,
        coordinates,
        Interpolation::Linear,
    )?;
    normalize_model(&mut model, &model_weights)?;
    Ok(model)
}
