use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use ndarray::{Array, Array2, Array3, Axis, Dimension};
use ndarray_npy::{write_npy, NpzReader, ReadableElement};

use emc_core::{
    expand_model, insert_slices, normalize_model, EmcConfig, EmcContext, PatternSet, Scaling,
    SparsePatterns, SparserPatterns,
};

/// Runs a single EMC iteration on data stored in an NPZ file.
///
/// Expected NPZ file structure:
///   - key "model": 3D array (Z, Y, X) of f32
///   - key "rotations": 2D array (R, 4) of f32 quaternions (w, x, y, z)
///   - key "coordinates": 3D array (3, H, W) of f32
///   - either key "patterns": 3D array (N, H, W) of i32
///   - or keys "start_indices", "indices", "values" (i32) for sparse
///     patterns, plus "ones_start_indices" and "ones_indices" for the
///     sparser layout
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to NPZ file holding model, rotations, coordinates and patterns
    #[arg(long)]
    input: PathBuf,

    /// Path to an engine configuration JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fit a scaling factor to every rotation/pattern pair
    #[arg(long)]
    scaling: bool,

    /// Output path for the updated model (.npy)
    #[arg(long)]
    output: PathBuf,

    /// Optional output path for the normalized responsibilities (.npy)
    #[arg(long)]
    responsibilities: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

struct Inputs {
    model: Array3<f32>,
    rotations: Array2<f32>,
    coordinates: Array3<f32>,
    patterns: PatternSet,
}

fn read_array<T, D>(npz: &mut NpzReader<File>, key: &str) -> Result<Array<T, D>>
where
    T: ReadableElement,
    D: Dimension,
{
    npz.by_name(key)
        .map_err(|e| anyhow::anyhow!("Missing or invalid '{}' array in NPZ: {}", key, e))
}

fn load_inputs(path: &Path) -> Result<Inputs> {
    let file = File::open(path).map_err(|e| anyhow::anyhow!("Failed to open NPZ {:?}: {}", path, e))?;
    let mut npz = NpzReader::new(file).map_err(|e| anyhow::anyhow!("Failed to read NPZ {:?}: {}", path, e))?;
    let names: Vec<String> = npz
        .names()
        .map_err(|e| anyhow::anyhow!("Failed to list arrays in NPZ {:?}: {}", path, e))?
        .into_iter()
        .map(|name| name.trim_end_matches(".npy").to_string())
        .collect();
    let has = |key: &str| names.iter().any(|name| name == key);

    let patterns = if has("start_indices") && has("ones_start_indices") {
        PatternSet::Sparser(SparserPatterns::new(
            read_array(&mut npz, "start_indices")?,
            read_array(&mut npz, "indices")?,
            read_array(&mut npz, "values")?,
            read_array(&mut npz, "ones_start_indices")?,
            read_array(&mut npz, "ones_indices")?,
        ))
    } else if has("start_indices") {
        PatternSet::Sparse(SparsePatterns::new(
            read_array(&mut npz, "start_indices")?,
            read_array(&mut npz, "indices")?,
            read_array(&mut npz, "values")?,
        ))
    } else if has("patterns") {
        PatternSet::Dense(read_array(&mut npz, "patterns")?)
    } else {
        bail!("NPZ {:?} holds neither 'patterns' nor sparse 'start_indices'", path);
    };

    Ok(Inputs {
        model: read_array(&mut npz, "model")?,
        rotations: read_array(&mut npz, "rotations")?,
        coordinates: read_array(&mut npz, "coordinates")?,
        patterns,
    })
}

/// Turns log-likelihoods into a probability distribution over rotations for
/// every pattern. A pattern that fits no rotation gets all-zero weights.
fn normalize_responsibilities(responsibilities: &mut Array2<f32>) {
    for mut column in responsibilities.axis_iter_mut(Axis(1)) {
        let max = column.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        if !max.is_finite() {
            column.fill(0.0);
            continue;
        }
        column.mapv_inplace(|v| (v - max).exp());
        let total = column.sum();
        column.mapv_inplace(|v| v / total);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match &args.config {
        Some(path) => EmcConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {:?}: {}", path, e))?,
        None => EmcConfig::default(),
    };
    let Inputs {
        model,
        rotations,
        coordinates,
        patterns,
    } = load_inputs(&args.input)?;

    let (_, height, width) = coordinates.dim();
    let nrotations = rotations.nrows();
    let npatterns = patterns.num_patterns();
    println!(
        "Running EMC iteration with R = {}, N = {} ({:?}), image = {}x{}, model = {:?}",
        nrotations,
        npatterns,
        patterns.kind(),
        height,
        width,
        model.shape()
    );

    let mut ctx = EmcContext::new(config)?;

    // --- Expand ---
    let mut slices = Array3::zeros((nrotations, height, width));
    expand_model(&model, &mut slices, &rotations, &coordinates)?;

    // --- Maximize ---
    let mut pair_scaling = Array2::ones((nrotations, npatterns));
    if args.scaling {
        ctx.calculate_scaling_poisson(&patterns, &slices, &mut pair_scaling)?;
    }
    let scaling = if args.scaling {
        Scaling::PerPair(&pair_scaling)
    } else {
        Scaling::Unit
    };
    let mut responsibilities = Array2::zeros((nrotations, npatterns));
    ctx.calculate_responsibilities_poisson(&patterns, &slices, &mut responsibilities, scaling)?;
    normalize_responsibilities(&mut responsibilities);
    ctx.update_slices(&mut slices, &patterns, &responsibilities, scaling)?;

    // --- Compress ---
    let slice_weights = responsibilities.sum_axis(Axis(1));
    let mut new_model = Array3::zeros(model.dim());
    let mut model_weights = Array3::zeros(model.dim());
    insert_slices(
        &mut new_model,
        &mut model_weights,
        &slices,
        &slice_weights,
        &rotations,
        &coordinates,
        ctx.config().interpolation,
    )?;
    normalize_model(&mut new_model, &model_weights)?;

    write_npy(&args.output, &new_model)
        .map_err(|e| anyhow::anyhow!("Failed to write output NPY {:?}: {}", args.output, e))?;
    if let Some(path) = &args.responsibilities {
        write_npy(path, &responsibilities)
            .map_err(|e| anyhow::anyhow!("Failed to write responsibilities NPY {:?}: {}", path, e))?;
    }

    println!("Updated model written to {:?}", args.output);

    Ok(())
}
