//! Affine-invariant ensemble sampler (Goodman & Weare 2010).
//!
//! The walkers are split into two halves. Each half is moved with the
//! stretch move using the other half as the complementary ensemble, so the
//! proposals within a half are independent and their log-probabilities can
//! be evaluated in parallel.

use std::sync::Arc;

use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{check_dim, Error, Result};
use crate::model::LogDensity;
use crate::progress::{ProgressBar, ProgressState};
use crate::sampler::SampleResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub n_walkers: usize,
    /// Steps kept after burn-in.
    pub n_steps: usize,
    pub n_burn: usize,
    /// Stretch scale `a`.
    pub stretch: f64,
    /// Standard deviation of the Gaussian ball the walkers start in.
    pub init_scale: f64,
    pub seed: u64,
    pub progress: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            n_walkers: 32,
            n_steps: 4000,
            n_burn: 500,
            stretch: 2.0,
            init_scale: 1e-4,
            seed: 42,
            progress: false,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_walkers < 2 || self.n_walkers % 2 != 0 {
            return Err(Error::InvalidConfig {
                field: "ensemble.n_walkers",
                reason: format!("need a positive even number of walkers, got {}", self.n_walkers),
            });
        }
        if self.n_steps == 0 {
            return Err(Error::InvalidConfig {
                field: "ensemble.n_steps",
                reason: "must be positive".to_string(),
            });
        }
        if !(self.stretch > 1.0 && self.stretch.is_finite()) {
            return Err(Error::InvalidConfig {
                field: "ensemble.stretch",
                reason: format!("scale must be finite and > 1, got {}", self.stretch),
            });
        }
        if !(self.init_scale >= 0.0 && self.init_scale.is_finite()) {
            return Err(Error::InvalidConfig {
                field: "ensemble.init_scale",
                reason: format!("must be finite and non-negative, got {}", self.init_scale),
            });
        }
        Ok(())
    }
}

/// The stretch move: `y = c + z (x - c)` with `z ~ g(z) ∝ 1/sqrt(z)` on `[1/a, a]`.
#[derive(Debug, Clone, Copy)]
pub struct StretchMove {
    pub a: f64,
}

impl Default for StretchMove {
    fn default() -> Self {
        Self { a: 2.0 }
    }
}

impl StretchMove {
    pub fn new(a: f64) -> Result<Self> {
        if !(a > 1.0 && a.is_finite()) {
            return Err(Error::InvalidConfig {
                field: "ensemble.stretch",
                reason: format!("scale must be finite and > 1, got {}", a),
            });
        }
        Ok(Self { a })
    }

    /// Inverse-CDF draw: `z = ((a - 1) u + 1)^2 / a`.
    pub fn sample_z<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        ((self.a - 1.0) * u + 1.0).powi(2) / self.a
    }

    pub fn propose(&self, current: &[f64], complement: &[f64], z: f64) -> Vec<f64> {
        current
            .iter()
            .zip(complement)
            .map(|(&x, &c)| c + z * (x - c))
            .collect()
    }

    /// Log of the Metropolis ratio, `(dim - 1) ln z + lp_new - lp_old`.
    /// NaN proposals get `-inf`.
    pub fn log_accept(&self, z: f64, dim: usize, lp_old: f64, lp_new: f64) -> f64 {
        if lp_new.is_nan() {
            return f64::NEG_INFINITY;
        }
        (dim as f64 - 1.0) * z.ln() + lp_new - lp_old
    }
}

/// `n_walkers` points drawn from `N(center, scale^2 I)`.
pub fn ball_init<R: Rng + ?Sized>(
    center: &[f64],
    scale: f64,
    n_walkers: usize,
    rng: &mut R,
) -> Vec<Vec<f64>> {
    (0..n_walkers)
        .map(|_| {
            center
                .iter()
                .map(|&c| {
                    let z: f64 = StandardNormal.sample(rng);
                    c + scale * z
                })
                .collect()
        })
        .collect()
}

/// Randoms of one walker update, drawn serially so a run only depends on
/// the seed.
struct Draw {
    walker: usize,
    partner: usize,
    z: f64,
    log_u: f64,
}

fn evaluate_all<D: LogDensity>(density: &D, points: &[Vec<f64>]) -> Result<Vec<f64>> {
    points.par_iter().map(|q| density.logp(q)).collect()
}

/// Run the ensemble sampler from a Gaussian ball around `center`.
pub fn run_ensemble<D: LogDensity>(
    density: &D,
    config: &EnsembleConfig,
    center: &[f64],
) -> Result<SampleResult> {
    config.validate()?;
    check_dim(center, density.dim())?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let walkers = ball_init(center, config.init_scale, config.n_walkers, &mut rng);
    run_ensemble_from(density, config, walkers, &mut rng)
}

/// Run the ensemble sampler from explicit walker positions.
pub fn run_ensemble_from<D: LogDensity>(
    density: &D,
    config: &EnsembleConfig,
    mut walkers: Vec<Vec<f64>>,
    rng: &mut ChaCha8Rng,
) -> Result<SampleResult> {
    config.validate()?;
    let dim = density.dim();
    let n_walkers = walkers.len();
    if n_walkers != config.n_walkers {
        return Err(Error::Dimension {
            expected: config.n_walkers,
            found: n_walkers,
        });
    }
    if n_walkers < 2 * dim {
        return Err(Error::InvalidConfig {
            field: "ensemble.n_walkers",
            reason: format!("need at least {} walkers for {} parameters", 2 * dim, dim),
        });
    }
    for w in &walkers {
        check_dim(w, dim)?;
    }
    let stretch = StretchMove::new(config.stretch)?;

    let mut log_probs = evaluate_all(density, &walkers)?;
    if let Some(&bad) = log_probs.iter().find(|lp| !lp.is_finite()) {
        return Err(Error::NonFinite {
            what: "initial walker log-probability",
            value: bad,
        });
    }
    let mut evals = n_walkers;

    let total_steps = config.n_burn + config.n_steps;
    let bar = ProgressBar::start(
        Arc::new(ProgressState::new("ensemble", 1, total_steps)),
        config.progress,
    );

    let half = n_walkers / 2;
    let halves = [(0..half, half..n_walkers), (half..n_walkers, 0..half)];
    let mut accepted = vec![0usize; n_walkers];
    let mut samples: Vec<Vec<Vec<f64>>> = (0..n_walkers)
        .map(|_| Vec::with_capacity(config.n_steps))
        .collect();

    debug!(
        "ensemble: {} walkers, {} burn-in + {} steps, a = {}",
        n_walkers, config.n_burn, config.n_steps, stretch.a
    );

    for step in 0..total_steps {
        for (active, complement) in halves.iter().cloned() {
            let draws: Vec<Draw> = active
                .map(|walker| Draw {
                    walker,
                    partner: rng.gen_range(complement.clone()),
                    z: stretch.sample_z(rng),
                    log_u: rng.gen::<f64>().ln(),
                })
                .collect();
            let proposals: Vec<Vec<f64>> = draws
                .iter()
                .map(|d| stretch.propose(&walkers[d.walker], &walkers[d.partner], d.z))
                .collect();
            let new_lps = evaluate_all(density, &proposals)?;
            evals += proposals.len();

            for ((d, y), lp_new) in draws.into_iter().zip(proposals).zip(new_lps) {
                let log_ratio = stretch.log_accept(d.z, dim, log_probs[d.walker], lp_new);
                if d.log_u < log_ratio {
                    walkers[d.walker] = y;
                    log_probs[d.walker] = lp_new;
                    accepted[d.walker] += 1;
                }
            }
        }

        if step >= config.n_burn {
            for (chain, w) in samples.iter_mut().zip(&walkers) {
                chain.push(w.clone());
            }
        }
        bar.state().increment();
        bar.state().add_evals(n_walkers);
    }
    bar.finish();

    let accept_rates: Vec<f64> = accepted
        .iter()
        .map(|&a| a as f64 / total_steps as f64)
        .collect();
    let mean_accept = accept_rates.iter().sum::<f64>() / n_walkers as f64;
    info!(
        "ensemble: {} walkers x {} steps, mean acceptance {:.3}, {} evaluations",
        n_walkers, config.n_steps, mean_accept, evals
    );

    Ok(SampleResult {
        samples,
        accept_rates,
        divergences: 0,
        evals,
        param_names: density.param_names(),
    })
}
