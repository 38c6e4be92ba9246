use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmcError {
    #[error("{what} has shape {actual:?}, expected {expected}")]
    Shape {
        what: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("{what} must be a contiguous array in standard layout")]
    Layout { what: &'static str },

    #[error("Invalid pattern data: {0}")]
    InvalidPatterns(String),

    #[error("Invalid value in {what}: {reason}")]
    InvalidValue { what: &'static str, reason: String },

    #[error("Unsupported combination: {0}")]
    Unsupported(&'static str),

    #[error("Poisson values can not be used with photon counts higher than {max} (got {count})")]
    PhotonCountTooLarge { count: usize, max: usize },

    #[error("Unknown interpolation mode '{0}', expected 'nearest_neighbour' or 'linear'")]
    UnknownInterpolation(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EmcError>;
