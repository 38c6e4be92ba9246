use approx::assert_abs_diff_eq;
use ndarray::{Array, Array1, Array2, Array3, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use emc_core::{
    expand_model, insert_slices, normalize_model, EmcConfig, EmcContext, Interpolation, PatternSet,
    Scaling, SparsePatterns, SparserPatterns, UNOBSERVED,
};

const ROTATIONS: usize = 6;
const PATTERNS: usize = 9;
const HEIGHT: usize = 5;
const WIDTH: usize = 7;

/// Photon counts dominated by zeros and ones, with the odd larger count.
fn random_patterns(rng: &mut StdRng) -> Array3<i32> {
    Array::random_using((PATTERNS, HEIGHT, WIDTH), Uniform::new(0i32, 9), rng)
        .mapv(|v| (v - 5).max(0))
}

fn random_slices(rng: &mut StdRng) -> Array3<f32> {
    Array::random_using((ROTATIONS, HEIGHT, WIDTH), Uniform::new(0.1f32, 3.0), rng)
}

fn layouts(dense: &Array3<i32>) -> [PatternSet; 3] {
    [
        PatternSet::Dense(dense.clone()),
        PatternSet::Sparse(SparsePatterns::from_dense(dense)),
        PatternSet::Sparser(SparserPatterns::from_dense(dense)),
    ]
}

/// Softmax over rotations for every pattern.
fn normalize_responsibilities(responsibilities: &mut Array2<f32>) {
    for mut column in responsibilities.axis_iter_mut(Axis(1)) {
        let max = column.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        column.mapv_inplace(|v| (v - max).exp());
        let total = column.sum();
        column.mapv_inplace(|v| v / total);
    }
}

/// Detector plane through the volume centre, one voxel per pixel.
fn planar_coordinates(height: usize, width: usize) -> Array3<f32> {
    let mut coordinates = Array3::zeros((3, height, width));
    for i in 0..height {
        for j in 0..width {
            coordinates[[0, i, j]] = j as f32 - (width / 2) as f32;
            coordinates[[1, i, j]] = i as f32 - (height / 2) as f32;
        }
    }
    coordinates
}

#[test]
fn responsibilities_agree_across_layouts() {
    let mut rng = StdRng::seed_from_u64(7);
    let dense = random_patterns(&mut rng);
    let mut slices = random_slices(&mut rng);
    slices[[2, 1, 3]] = UNOBSERVED;
    slices[[4, 0, 0]] = UNOBSERVED;

    let mut ctx = EmcContext::default();
    let mut scaling = Array2::zeros((ROTATIONS, PATTERNS));
    ctx.calculate_scaling_poisson(&layouts(&dense)[0], &slices, &mut scaling)
        .unwrap();

    for scaling in [Scaling::Unit, Scaling::PerPair(&scaling)] {
        let mut results = Vec::new();
        for patterns in layouts(&dense) {
            let mut responsibilities = Array2::zeros((ROTATIONS, PATTERNS));
            ctx.calculate_responsibilities_poisson(&patterns, &slices, &mut responsibilities, scaling)
                .unwrap();
            assert!(responsibilities.iter().all(|v| v.is_finite()));
            results.push(responsibilities);
        }
        assert_abs_diff_eq!(results[1], results[0], epsilon = 1e-3);
        assert_abs_diff_eq!(results[2], results[0], epsilon = 1e-3);
    }
}

#[test]
fn scaling_agrees_across_layouts() {
    let mut rng = StdRng::seed_from_u64(11);
    let dense = random_patterns(&mut rng);
    let slices = random_slices(&mut rng);
    let mut ctx = EmcContext::default();

    let mut reference = Array2::zeros((ROTATIONS, PATTERNS));
    ctx.calculate_scaling_poisson(&layouts(&dense)[0], &slices, &mut reference)
        .unwrap();
    for patterns in layouts(&dense) {
        let mut scaling = Array2::zeros((ROTATIONS, PATTERNS));
        ctx.calculate_scaling_poisson(&patterns, &slices, &mut scaling)
            .unwrap();
        assert_abs_diff_eq!(scaling, reference, epsilon = 1e-5);
    }

    let mut weights = Array2::random_using((ROTATIONS, PATTERNS), Uniform::new(0.0f32, 1.0), &mut rng);
    let totals = weights.sum_axis(Axis(0));
    weights /= &totals;
    let mut dense_scaling = Array1::zeros(PATTERNS);
    ctx.calculate_scaling_per_pattern_poisson(&layouts(&dense)[0], &slices, &weights, &mut dense_scaling)
        .unwrap();
    let mut sparse_scaling = Array1::zeros(PATTERNS);
    ctx.calculate_scaling_per_pattern_poisson(&layouts(&dense)[1], &slices, &weights, &mut sparse_scaling)
        .unwrap();
    assert_abs_diff_eq!(sparse_scaling, dense_scaling, epsilon = 1e-5);
}

#[test]
fn slice_update_agrees_across_layouts() {
    let mut rng = StdRng::seed_from_u64(13);
    let dense = random_patterns(&mut rng);
    let slices = random_slices(&mut rng);
    let mut ctx = EmcContext::default();

    let mut responsibilities = Array2::zeros((ROTATIONS, PATTERNS));
    ctx.calculate_responsibilities_poisson(&layouts(&dense)[0], &slices, &mut responsibilities, Scaling::Unit)
        .unwrap();
    normalize_responsibilities(&mut responsibilities);
    let per_pattern = Array1::random_using(PATTERNS, Uniform::new(0.5f32, 2.0), &mut rng);

    for scaling in [Scaling::Unit, Scaling::PerPattern(&per_pattern)] {
        let mut results = Vec::new();
        for patterns in layouts(&dense) {
            if matches!(patterns, PatternSet::Sparser(_)) && scaling.is_per_pattern() {
                continue;
            }
            let mut updated = Array3::zeros((ROTATIONS, HEIGHT, WIDTH));
            ctx.update_slices(&mut updated, &patterns, &responsibilities, scaling)
                .unwrap();
            results.push(updated);
        }
        for updated in &results[1..] {
            assert_abs_diff_eq!(*updated, results[0], epsilon = 1e-5);
        }
    }
}

#[test]
fn insert_inverts_expand_on_observed_voxels() {
    let mut rng = StdRng::seed_from_u64(17);
    let side = 5;
    let model = Array3::random_using((side, side, side), Uniform::new(0.5f32, 2.0), &mut rng);
    let coordinates = planar_coordinates(side, side);
    let half = std::f32::consts::FRAC_1_SQRT_2;
    // Identity, a quarter turn about z and a half turn about x all map the
    // detector plane onto voxel centres.
    let rotations: Array2<f32> = ndarray::array![
        [1.0, 0.0, 0.0, 0.0],
        [half, 0.0, 0.0, half],
        [0.0, 1.0, 0.0, 0.0],
    ];

    let mut slices = Array3::zeros((3, side, side));
    expand_model(&model, &mut slices, &rotations, &coordinates).unwrap();
    assert!(slices.iter().all(|&v| v >= 0.0));

    for interpolation in [Interpolation::Linear, Interpolation::NearestNeighbour] {
        let mut assembled = Array3::zeros((side, side, side));
        let mut weights = Array3::zeros((side, side, side));
        insert_slices(
            &mut assembled,
            &mut weights,
            &slices,
            &Array1::ones(3),
            &rotations,
            &coordinates,
            interpolation,
        )
        .unwrap();
        normalize_model(&mut assembled, &weights).unwrap();

        let centre = side / 2;
        for ((z, y, x), &weight) in weights.indexed_iter() {
            if z == centre {
                assert!(weight > 0.0, "voxel {:?} was never hit", (z, y, x));
            }
            if weight > 1e-3 {
                assert_abs_diff_eq!(assembled[[z, y, x]], model[[z, y, x]], epsilon = 1e-3);
            }
        }
        assert_eq!(assembled[[0, 0, 0]], UNOBSERVED);
    }
}

#[test]
fn full_iteration_produces_a_consistent_model() {
    let mut rng = StdRng::seed_from_u64(23);
    let side = 7;
    let model = Array3::random_using((side, side, side), Uniform::new(0.0f32, 2.0), &mut rng);
    let coordinates = planar_coordinates(HEIGHT, WIDTH);
    let rotations = Array2::random_using((ROTATIONS, 4), Uniform::new(-1.0f32, 1.0), &mut rng);
    let dense = random_patterns(&mut rng);

    let config = EmcConfig::default().with_interpolation(Interpolation::NearestNeighbour);
    let mut models = Vec::new();
    for patterns in layouts(&dense) {
        let mut ctx = EmcContext::new(config.clone()).unwrap();
        let mut slices = Array3::zeros((ROTATIONS, HEIGHT, WIDTH));
        expand_model(&model, &mut slices, &rotations, &coordinates).unwrap();

        let mut scaling = Array2::zeros((ROTATIONS, PATTERNS));
        ctx.calculate_scaling_poisson(&patterns, &slices, &mut scaling)
            .unwrap();
        let mut responsibilities = Array2::zeros((ROTATIONS, PATTERNS));
        ctx.calculate_responsibilities_poisson(
            &patterns,
            &slices,
            &mut responsibilities,
            Scaling::PerPair(&scaling),
        )
        .unwrap();
        normalize_responsibilities(&mut responsibilities);
        ctx.update_slices(&mut slices, &patterns, &responsibilities, Scaling::PerPair(&scaling))
            .unwrap();
        assert!(slices.iter().all(|&v| v.is_finite() && v >= 0.0));

        let mut assembled = Array3::zeros((side, side, side));
        let mut weights = Array3::zeros((side, side, side));
        insert_slices(
            &mut assembled,
            &mut weights,
            &slices,
            &responsibilities.sum_axis(Axis(1)),
            &rotations,
            &coordinates,
            ctx.config().interpolation,
        )
        .unwrap();
        normalize_model(&mut assembled, &weights).unwrap();
        assert!(assembled.iter().all(|&v| v == UNOBSERVED || v >= 0.0));
        models.push(assembled);
    }
    assert_abs_diff_eq!(models[1], models[0], epsilon = 1e-3);
    assert_abs_diff_eq!(models[2], models[0], epsilon = 1e-3);
}
