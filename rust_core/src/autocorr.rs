//! Integrated autocorrelation time with Sokal's automatic window.
//!
//! For each parameter the normalized autocorrelation function is averaged
//! over chains (or ensemble walkers) and summed into
//! `τ(M) = 2 Σ_{t<=M} ρ(t) - 1`. The window is the smallest `M` with
//! `M >= c τ(M)`. Lags are accumulated one at a time and the sum stops at
//! the window, so the cost is `O(n · M)` per chain rather than `O(n²)`.

use log::warn;
use rayon::prelude::*;

use crate::error::{Error, Result};

pub const DEFAULT_WINDOW_C: f64 = 5.0;
pub const DEFAULT_TOL: f64 = 50.0;

/// A mean-subtracted series and its sum of squares.
struct Centered {
    values: Vec<f64>,
    sum_sq: f64,
}

impl Centered {
    fn new(series: &[f64]) -> Self {
        let mean = series.iter().sum::<f64>() / series.len() as f64;
        let values: Vec<f64> = series.iter().map(|x| x - mean).collect();
        let sum_sq = values.iter().map(|x| x * x).sum();
        Self { values, sum_sq }
    }

    /// Normalized autocorrelation at `lag`.
    fn rho(&self, lag: usize) -> f64 {
        let cov: f64 = self
            .values
            .iter()
            .zip(&self.values[lag..])
            .map(|(a, b)| a * b)
            .sum();
        cov / self.sum_sq
    }
}

/// Sokal's stopping rule: the window `m` is large enough once `m >= c τ(m)`.
fn window_closed(m: usize, tau: f64, c: f64) -> bool {
    m as f64 >= c * tau
}

/// Normalized autocorrelation function of a single series, `ρ(0) = 1`.
/// A constant series gives NaN.
pub fn function_1d(series: &[f64]) -> Vec<f64> {
    let centered = Centered::new(series);
    (0..series.len()).map(|lag| centered.rho(lag)).collect()
}

/// Index of the Sokal window for cumulative estimates `taus`, where
/// `taus[m] = 2 Σ_{t<=m} ρ(t) - 1`.
pub fn auto_window(taus: &[f64], c: f64) -> usize {
    taus.iter()
        .enumerate()
        .position(|(m, &tau)| window_closed(m, tau, c))
        .unwrap_or(taus.len().saturating_sub(1))
}

/// τ of one parameter given its trace in every chain. Equivalent to
/// [`auto_window`] over the chain-averaged [`function_1d`], but only the
/// lags up to the window are computed.
fn tau_of(traces: &[Vec<f64>], c: f64) -> f64 {
    let n = traces[0].len();
    let centered: Vec<Centered> = traces.iter().map(|t| Centered::new(t)).collect();
    let k = centered.len() as f64;

    // ρ(0) = 1 contributes 2·1 - 1.
    let mut tau = 1.0;
    for lag in 1..n {
        let rho = centered.iter().map(|ch| ch.rho(lag)).sum::<f64>() / k;
        tau += 2.0 * rho;
        if window_closed(lag, tau, c) || tau.is_nan() {
            break;
        }
    }
    tau
}

/// Integrated autocorrelation time of every parameter of
/// `samples[chain][draw][param]`.
///
/// When `tol * τ` exceeds the number of draws for any parameter the
/// estimate is unreliable: that is an [`Error::ChainTooShort`], or only a
/// warning when `quiet` is set.
pub fn integrated_time(
    samples: &[Vec<Vec<f64>>],
    c: f64,
    tol: f64,
    quiet: bool,
) -> Result<Vec<f64>> {
    let n_draws = samples.first().map_or(0, |chain| chain.len());
    if n_draws < 2 {
        return Err(Error::Dimension {
            expected: 2,
            found: n_draws,
        });
    }
    if let Some(bad) = samples.iter().find(|chain| chain.len() != n_draws) {
        return Err(Error::Dimension {
            expected: n_draws,
            found: bad.len(),
        });
    }
    let n_params = samples[0][0].len();

    let tau: Vec<f64> = (0..n_params)
        .into_par_iter()
        .map(|p| {
            let traces: Vec<Vec<f64>> = samples
                .iter()
                .map(|chain| chain.iter().map(|draw| draw[p]).collect())
                .collect();
            tau_of(&traces, c)
        })
        .collect();

    if tau.iter().any(|&t| tol * t > n_draws as f64) {
        if quiet {
            warn!(
                "chain of {} draws is shorter than {} autocorrelation times; tau = {:?}",
                n_draws, tol, tau
            );
        } else {
            return Err(Error::ChainTooShort { n_draws, tol, tau });
        }
    }
    Ok(tau)
}
