use std::sync::Arc;

use log::info;
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{check_dim, Error, Result};
use crate::hmc::{self, ChainResult, HmcConfig};
use crate::metric::DiagonalMetric;
use crate::model::LogDensity;
use crate::nuts::{self, NutsConfig};
use crate::progress::{ProgressBar, ProgressState};

/// Configuration for the multi-chain driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub num_chains: usize,
    pub seed: u64,
    /// Standard deviation of the jitter applied to the starting point of
    /// each chain.
    pub init_jitter: f64,
    /// Render a live progress bar on stderr.
    pub progress: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_chains: 4,
            seed: 42,
            init_jitter: 1e-2,
            progress: false,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_chains == 0 {
            return Err(Error::InvalidConfig {
                field: "sampler.num_chains",
                reason: "must be positive".to_string(),
            });
        }
        if !(self.init_jitter >= 0.0 && self.init_jitter.is_finite()) {
            return Err(Error::InvalidConfig {
                field: "sampler.init_jitter",
                reason: format!("must be finite and non-negative, got {}", self.init_jitter),
            });
        }
        Ok(())
    }
}

/// Draws from every chain of one run. Ensemble runs store one chain per walker.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// Indexed `[chain][draw][param]`.
    pub samples: Vec<Vec<Vec<f64>>>,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
    /// Gradient evaluations (HMC/NUTS) or log-probability evaluations
    /// (ensemble), warmup included.
    pub evals: usize,
    pub param_names: Vec<String>,
}

impl SampleResult {
    pub fn num_chains(&self) -> usize {
        self.samples.len()
    }

    pub fn num_draws(&self) -> usize {
        self.samples.first().map_or(0, |c| c.len())
    }

    /// Pooled draws as a `(draws, params)` matrix, or `None` when empty.
    pub fn draws_matrix(&self) -> Option<Array2<f64>> {
        let dim = self.param_names.len();
        let flat: Vec<f64> = self.samples.iter().flatten().flatten().copied().collect();
        if flat.is_empty() || dim == 0 {
            return None;
        }
        Array2::from_shape_vec((flat.len() / dim, dim), flat).ok()
    }

    /// Posterior mean per parameter over every chain; NaN without draws.
    pub fn mean(&self) -> Vec<f64> {
        self.draws_matrix()
            .and_then(|m| m.mean_axis(Axis(0)))
            .map(|m| m.to_vec())
            .unwrap_or_else(|| vec![f64::NAN; self.param_names.len()])
    }

    /// Posterior standard deviation per parameter (population form).
    pub fn std(&self) -> Vec<f64> {
        self.draws_matrix()
            .map(|m| m.std_axis(Axis(0), 0.0).to_vec())
            .unwrap_or_else(|| vec![f64::NAN; self.param_names.len()])
    }

    /// All draws of all chains, chain after chain.
    pub fn flatten(&self) -> Vec<Vec<f64>> {
        self.samples.iter().flatten().cloned().collect()
    }

    /// Write the draws as CSV with a `chain` and `draw` column.
    pub fn write_csv<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        let mut header = vec!["chain".to_string(), "draw".to_string()];
        header.extend(self.param_names.iter().cloned());
        wtr.write_record(&header)?;
        for (c, chain) in self.samples.iter().enumerate() {
            for (d, draw) in chain.iter().enumerate() {
                let mut row = vec![c.to_string(), d.to_string()];
                row.extend(draw.iter().map(|v| v.to_string()));
                wtr.write_record(&row)?;
            }
        }
        wtr.flush()?;
        Ok(())
    }

    fn from_chains(results: Vec<ChainResult>, param_names: Vec<String>) -> Self {
        SampleResult {
            accept_rates: results.iter().map(|r| r.accept_rate).collect(),
            divergences: results.iter().map(|r| r.divergences).sum(),
            evals: results.iter().map(|r| r.grad_evals).sum(),
            samples: results.into_iter().map(|r| r.samples).collect(),
            param_names,
        }
    }
}

/// Starting points: `init` plus Gaussian jitter, one per chain, each drawn
/// from the chain's own RNG.
fn jittered(init: &[f64], jitter: f64, rng: &mut ChaCha8Rng) -> Vec<f64> {
    use rand_distr::{Distribution, StandardNormal};
    init.iter()
        .map(|&v| {
            let z: f64 = StandardNormal.sample(rng);
            v + jitter * z
        })
        .collect()
}

/// Fan the chains out over rayon. Chain `i` draws from its own
/// `ChaCha8Rng` seeded with `config.seed + i`, so results do not depend on
/// thread scheduling.
fn run_parallel<D, F>(
    density: &D,
    init: &[f64],
    config: &SamplerConfig,
    label: &str,
    iters_per_chain: usize,
    run: F,
) -> Result<SampleResult>
where
    D: LogDensity,
    F: Fn(&mut ChaCha8Rng, &[f64], Option<&ProgressState>) -> Result<ChainResult> + Sync,
{
    config.validate()?;
    check_dim(init, density.dim())?;

    let bar = ProgressBar::start(
        Arc::new(ProgressState::new(label, config.num_chains, iters_per_chain)),
        config.progress,
    );

    let results: Result<Vec<ChainResult>> = (0..config.num_chains)
        .into_par_iter()
        .map(|chain_idx| {
            let mut rng = ChaCha8Rng::seed_from_u64(config.seed + chain_idx as u64);
            let start = jittered(init, config.init_jitter, &mut rng);
            run(&mut rng, &start, Some(bar.state()))
        })
        .collect();

    bar.finish();

    let result = SampleResult::from_chains(results?, density.param_names());
    info!(
        "{}: {} chains x {} draws, {} evaluations, {} divergences",
        label,
        result.num_chains(),
        result.num_draws(),
        result.evals,
        result.divergences
    );
    Ok(result)
}

/// Run parallel NUTS chains, each starting from a jittered copy of `init`
/// with the given starting metric.
pub fn sample_nuts<D: LogDensity>(
    density: &D,
    init: &[f64],
    metric: &DiagonalMetric,
    nuts_config: &NutsConfig,
    config: &SamplerConfig,
) -> Result<SampleResult> {
    nuts_config.validate()?;
    run_parallel(
        density,
        init,
        config,
        "NUTS",
        nuts_config.num_warmup + nuts_config.num_draws,
        |rng, start, progress| {
            nuts::run_chain(density, nuts_config, metric.clone(), rng, start, progress)
        },
    )
}

/// Run parallel static-trajectory HMC chains.
pub fn sample_hmc<D: LogDensity>(
    density: &D,
    init: &[f64],
    metric: &DiagonalMetric,
    hmc_config: &HmcConfig,
    config: &SamplerConfig,
) -> Result<SampleResult> {
    hmc_config.validate()?;
    run_parallel(
        density,
        init,
        config,
        "HMC",
        hmc_config.num_warmup + hmc_config.num_draws,
        |rng, start, progress| hmc::run_chain(density, hmc_config, metric, rng, start, progress),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::model::Model;

    fn standard_normal_2d() -> Model {
        let mut g = Graph::new();
        let a = g.add_param("a", 0.0);
        let b = g.add_param("b", 0.0);
        let zero = g.add_constant(0.0);
        let one = g.add_constant(1.0);
        let la = g.normal_logp(a, zero, one);
        let lb = g.normal_logp(b, zero, one);
        g.add_logp_term(la);
        g.add_logp_term(lb);
        Model::from_logp_terms(g).unwrap()
    }

    #[test]
    fn parallel_nuts_is_reproducible_per_seed() {
        let model = standard_normal_2d();
        let nuts_cfg = NutsConfig {
            num_draws: 200,
            num_warmup: 200,
            ..NutsConfig::default()
        };
        let cfg = SamplerConfig {
            num_chains: 3,
            ..SamplerConfig::default()
        };
        let metric = DiagonalMetric::identity(2);
        let r1 = sample_nuts(&model, &[0.0, 0.0], &metric, &nuts_cfg, &cfg).unwrap();
        let r2 = sample_nuts(&model, &[0.0, 0.0], &metric, &nuts_cfg, &cfg).unwrap();
        assert_eq!(r1.samples, r2.samples);
        assert_eq!(r1.num_chains(), 3);
        assert_eq!(r1.num_draws(), 200);
        assert_eq!(r1.param_names, vec!["a", "b"]);
        assert_eq!(r1.flatten().len(), 600);
        assert!(r1.mean().iter().all(|m| m.abs() < 0.3));
        assert!(r1.std().iter().all(|s| (s - 1.0).abs() < 0.3));
    }

    #[test]
    fn parallel_hmc_runs() {
        let model = standard_normal_2d();
        let hmc_cfg = HmcConfig {
            num_draws: 100,
            num_warmup: 100,
            num_leapfrog_steps: 5,
            ..HmcConfig::default()
        };
        let res = sample_hmc(
            &model,
            &[0.0, 0.0],
            &DiagonalMetric::identity(2),
            &hmc_cfg,
            &SamplerConfig::default(),
        )
        .unwrap();
        assert_eq!(res.num_chains(), 4);
        assert!(res.evals >= 4 * 200 * 5);
    }

    #[test]
    fn rejects_wrong_init_length() {
        let model = standard_normal_2d();
        let err = sample_nuts(
            &model,
            &[0.0],
            &DiagonalMetric::identity(2),
            &NutsConfig::default(),
            &SamplerConfig::default(),
        );
        assert!(matches!(err, Err(Error::Dimension { .. })));
    }
}
