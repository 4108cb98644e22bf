use log::debug;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{check_dim, Error, Result};
use crate::metric::DiagonalMetric;
use crate::model::LogDensity;
use crate::progress::ProgressState;

/// Configuration for the static-trajectory HMC sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HmcConfig {
    /// Initial step size; 0 means search for one.
    pub step_size: f64,
    pub num_leapfrog_steps: usize,
    pub num_draws: usize,
    pub num_warmup: usize,
    pub target_accept: f64,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            num_leapfrog_steps: 20,
            num_draws: 1000,
            num_warmup: 500,
            target_accept: 0.65,
        }
    }
}

impl HmcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_leapfrog_steps == 0 {
            return Err(Error::InvalidConfig {
                field: "hmc.num_leapfrog_steps",
                reason: "must be positive".to_string(),
            });
        }
        validate_step_and_target(
            ("hmc.step_size", self.step_size),
            ("hmc.target_accept", self.target_accept),
        )
    }
}

pub(crate) fn validate_step_and_target(
    (step_field, step_size): (&'static str, f64),
    (target_field, target): (&'static str, f64),
) -> Result<()> {
    if !(step_size >= 0.0 && step_size.is_finite()) {
        return Err(Error::InvalidConfig {
            field: step_field,
            reason: format!("must be finite and non-negative, got {}", step_size),
        });
    }
    if !(target > 0.0 && target < 1.0) {
        return Err(Error::InvalidConfig {
            field: target_field,
            reason: format!("must lie in (0, 1), got {}", target),
        });
    }
    Ok(())
}

/// Result of a single chain run.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub samples: Vec<Vec<f64>>,
    pub accept_rate: f64,
    pub step_size: f64,
    /// Divergent transitions after warmup.
    pub divergences: usize,
    /// Divergent transitions while the step size was still adapting.
    pub warmup_divergences: usize,
    /// Number of gradient evaluations, warmup included.
    pub grad_evals: usize,
    /// Diagonal of the inverse mass matrix used for the draws.
    pub inv_mass: Vec<f64>,
}

/// A point on the Hamiltonian trajectory: (position, momentum, gradient, log-probability).
#[derive(Debug, Clone)]
pub(crate) struct PhasePoint {
    pub q: Vec<f64>,
    pub p: Vec<f64>,
    pub grad: Vec<f64>,
    pub logp: f64,
}

impl PhasePoint {
    pub fn at<D: LogDensity>(density: &D, q: &[f64]) -> Result<Self> {
        let (logp, grad) = density.logp_and_grad(q)?;
        Ok(Self {
            q: q.to_vec(),
            p: vec![0.0; q.len()],
            grad,
            logp,
        })
    }

    pub fn energy(&self, metric: &DiagonalMetric) -> f64 {
        -self.logp + metric.kinetic_energy(&self.p)
    }
}

/// Single leapfrog step (half-step momentum, full-step position, half-step momentum).
pub(crate) fn leapfrog<D: LogDensity>(
    density: &D,
    point: &PhasePoint,
    eps: f64,
    metric: &DiagonalMetric,
) -> Result<PhasePoint> {
    let dim = point.q.len();
    let mut p_new: Vec<f64> = (0..dim)
        .map(|i| point.p[i] + 0.5 * eps * point.grad[i])
        .collect();
    let mut vel = vec![0.0; dim];
    metric.velocity(&p_new, &mut vel);
    let q_new: Vec<f64> = (0..dim).map(|i| point.q[i] + eps * vel[i]).collect();

    let (logp_new, grad_new) = density.logp_and_grad(&q_new)?;
    for i in 0..dim {
        p_new[i] += 0.5 * eps * grad_new[i];
    }

    Ok(PhasePoint {
        q: q_new,
        p: p_new,
        grad: grad_new,
        logp: logp_new,
    })
}

/// Nesterov dual averaging of the log step size (Hoffman & Gelman 2014).
#[derive(Debug, Clone)]
pub(crate) struct DualAveraging {
    mu: f64,
    target: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    h_bar: f64,
    log_eps_bar: f64,
    count: u64,
}

impl DualAveraging {
    pub fn new(step_size: f64, target: f64) -> Self {
        Self {
            mu: (10.0 * step_size).ln(),
            target,
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            h_bar: 0.0,
            log_eps_bar: step_size.ln(),
            count: 0,
        }
    }

    /// Feed one acceptance statistic and return the next step size.
    pub fn update(&mut self, accept_stat: f64) -> f64 {
        self.count += 1;
        let m = self.count as f64;
        let w = 1.0 / (m + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target - accept_stat);
        let log_eps = self.mu - (m.sqrt() / self.gamma) * self.h_bar;
        let m_pow = m.powf(-self.kappa);
        self.log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * self.log_eps_bar;
        log_eps.exp()
    }

    /// Averaged step size, used once warmup ends.
    pub fn final_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Heuristic initial step size: double or halve until the acceptance
/// probability of one leapfrog step crosses 0.5. Returns the step size and
/// the number of gradient evaluations spent.
pub(crate) fn find_initial_step_size<D: LogDensity>(
    density: &D,
    q: &[f64],
    metric: &DiagonalMetric,
    rng: &mut ChaCha8Rng,
) -> Result<(f64, usize)> {
    let mut start = PhasePoint::at(density, q)?;
    metric.sample_momentum(rng, &mut start.p);
    let h0 = start.energy(metric);
    let threshold = (0.5_f64).ln();

    let mut eps = 1.0;
    let mut evals = 2;
    let mut lr = h0 - leapfrog(density, &start, eps, metric)?.energy(metric);
    let direction = if lr > threshold { 1.0 } else { -1.0 };

    for _ in 0..50 {
        if !lr.is_finite() {
            eps *= 0.5;
            break;
        }
        if (direction > 0.0 && lr < threshold) || (direction < 0.0 && lr > threshold) {
            break;
        }
        eps *= 2.0_f64.powf(direction);
        lr = h0 - leapfrog(density, &start, eps, metric)?.energy(metric);
        evals += 1;
    }

    Ok((eps.clamp(1e-10, 1e3), evals))
}

/// Run a single HMC chain with a fixed number of leapfrog steps and a
/// diagonal metric.
pub fn run_chain<D: LogDensity>(
    density: &D,
    config: &HmcConfig,
    metric: &DiagonalMetric,
    rng: &mut ChaCha8Rng,
    init: &[f64],
    progress: Option<&ProgressState>,
) -> Result<ChainResult> {
    config.validate()?;
    check_dim(init, density.dim())?;
    check_dim(metric.variance(), density.dim())?;
    let total_iters = config.num_warmup + config.num_draws;

    let mut current = PhasePoint::at(density, init)?;
    let mut samples = Vec::with_capacity(config.num_draws);
    let mut accepted = 0usize;
    let mut divergences = 0usize;
    let mut warmup_divergences = 0usize;
    let mut grad_evals = 1usize;

    let mut step_size = if config.step_size > 0.0 {
        config.step_size
    } else {
        let (eps, evals) = find_initial_step_size(density, init, metric, rng)?;
        grad_evals += evals;
        eps
    };
    let mut adapt = DualAveraging::new(step_size, config.target_accept);
    debug!("hmc: initial step size {:.4}", step_size);

    for iter in 0..total_iters {
        let is_warmup = iter < config.num_warmup;

        metric.sample_momentum(rng, &mut current.p);
        let h_current = current.energy(metric);

        let mut proposal = current.clone();
        for _ in 0..config.num_leapfrog_steps {
            proposal = leapfrog(density, &proposal, step_size, metric)?;
        }
        grad_evals += config.num_leapfrog_steps;

        let log_accept_ratio = h_current - proposal.energy(metric);
        let accept_prob = if log_accept_ratio.is_finite() {
            log_accept_ratio.min(0.0).exp()
        } else if is_warmup {
            warmup_divergences += 1;
            0.0
        } else {
            divergences += 1;
            0.0
        };

        if log_accept_ratio.is_finite() && rng.gen::<f64>().ln() < log_accept_ratio {
            current = proposal;
            accepted += 1;
        }

        if let Some(p) = progress {
            p.increment();
            p.add_evals(config.num_leapfrog_steps);
            if !log_accept_ratio.is_finite() {
                p.add_divergence();
            }
        }

        if is_warmup {
            step_size = adapt.update(accept_prob);
            if iter + 1 == config.num_warmup {
                step_size = adapt.final_step_size();
                debug!("hmc: warmup done, step size {:.4}", step_size);
            }
        } else {
            samples.push(current.q.clone());
        }
    }

    Ok(ChainResult {
        samples,
        accept_rate: accepted as f64 / total_iters.max(1) as f64,
        step_size,
        divergences,
        warmup_divergences,
        grad_evals,
        inv_mass: metric.variance().to_vec(),
    })
}
