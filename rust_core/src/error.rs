use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, evaluating, optimizing or sampling a model.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter or gradient vector has the wrong length.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    Dimension { expected: usize, found: usize },

    /// A node produced a scalar where a vector was needed, or vectors of
    /// different lengths were combined.
    #[error("shape error at node {node}: {reason}")]
    Shape { node: usize, reason: String },

    /// A lookup by name failed.
    #[error("unknown {kind} `{name}`")]
    Unknown { kind: &'static str, name: String },

    /// A configuration value is out of range.
    #[error("invalid configuration `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// A value that must be finite was NaN or infinite.
    #[error("non-finite {what}: {value}")]
    NonFinite { what: &'static str, value: f64 },

    /// Chains are too short for a reliable autocorrelation time.
    #[error(
        "chain of {n_draws} draws is shorter than {tol} autocorrelation times (tau = {tau:?})"
    )]
    ChainTooShort {
        n_draws: usize,
        tol: f64,
        tau: Vec<f64>,
    },

    #[error("optimizer failed: {0}")]
    Optimizer(String),

    #[error("plotting failed: {0}")]
    Plot(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl From<argmin::core::Error> for Error {
    fn from(e: argmin::core::Error) -> Self {
        Error::Optimizer(e.to_string())
    }
}

/// Check that `v` has length `expected`.
pub(crate) fn check_dim(v: &[f64], expected: usize) -> Result<()> {
    if v.len() != expected {
        return Err(Error::Dimension {
            expected,
            found: v.len(),
        });
    }
    Ok(())
}
