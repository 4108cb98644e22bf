pub mod autocorr;
pub mod autodiff;
pub mod config;
pub mod corner;
pub mod data;
pub mod diagnostics;
pub mod ensemble;
pub mod error;
pub mod graph;
pub mod hmc;
pub mod metric;
pub mod model;
pub mod nuts;
pub mod optimize;
pub mod progress;
pub mod regression;
pub mod sampler;
pub mod session;

pub use error::{Error, Result};
pub use model::{LogDensity, Model};
pub use sampler::SampleResult;
