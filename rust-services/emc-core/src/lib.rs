//! Numerical core of the EMC (Expand-Maximize-Compress) reconstruction.
//!
//! One iteration looks like this:
//!
//! 1. [`expand_model`] cuts one slice per candidate rotation out of the model,
//! 2. [`EmcContext::calculate_responsibilities_poisson`] scores every pattern
//!    against every slice, optionally after
//!    [`EmcContext::calculate_scaling_poisson`],
//! 3. the driver normalizes the scores into weights and
//!    [`EmcContext::update_slices`] averages the patterns into new slices,
//! 4. [`insert_slices`] and [`normalize_model`] fold the slices back into a
//!    model.
//!
//! Patterns come as a [`PatternSet`]: dense photon counts or one of the two
//! sparse photon lists. All engines give the same results for every layout.

pub mod config;
pub mod context;
pub mod error;
pub mod numeric;
pub mod patterns;
pub mod projector;
pub mod responsibilities;
pub mod scaling;
pub mod update;

mod validate;

pub use config::{EmcConfig, Interpolation, DEFAULT_INNER_WIDTH};
pub use context::EmcContext;
pub use error::{EmcError, Result};
pub use numeric::{LogFactorialTable, SliceSums, MAX_PHOTON_COUNT};
pub use patterns::{PatternKind, PatternSet, SparsePatterns, SparserPatterns};
pub use projector::{
    assemble_model, expand_model, expand_model_2d, insert_slices, insert_slices_2d, normalize_model,
    rotation_matrix, UNOBSERVED,
};
pub use scaling::Scaling;
pub use update::normalize_slices;
