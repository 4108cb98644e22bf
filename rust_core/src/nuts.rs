//! No-U-Turn Sampler with multinomial trajectory sampling.
//!
//! Each transition grows a trajectory by repeated doubling in a random
//! direction. A doubling stops on a U-turn, checked with the summed momentum
//! of every balanced subtree, or when the energy error of a leapfrog step
//! exceeds `MAX_DELTA_H`. Candidates are drawn in proportion to `exp(-H)`.
use log::{debug, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{check_dim, Error, Result};
use crate::hmc::{
    find_initial_step_size, leapfrog, validate_step_and_target, ChainResult, DualAveraging,
    PhasePoint,
};
use crate::metric::{DiagonalMetric, WelfordVariance};
use crate::model::LogDensity;
use crate::progress::ProgressState;

const MAX_DELTA_H: f64 = 1000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NutsConfig {
    /// Initial step size; 0 means search for one.
    pub step_size: f64,
    pub max_tree_depth: usize,
    pub num_draws: usize,
    pub num_warmup: usize,
    pub target_accept: f64,
    /// Adapt the diagonal metric during warmup.
    pub adapt_metric: bool,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            max_tree_depth: 10,
            num_draws: 1000,
            num_warmup: 500,
            target_accept: 0.8,
            adapt_metric: true,
        }
    }
}

impl NutsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tree_depth == 0 || self.max_tree_depth > 30 {
            return Err(Error::InvalidConfig {
                field: "nuts.max_tree_depth",
                reason: format!("must lie in 1..=30, got {}", self.max_tree_depth),
            });
        }
        validate_step_and_target(
            ("nuts.step_size", self.step_size),
            ("nuts.target_accept", self.target_accept),
        )
    }
}

/// Outcome of growing a trajectory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Open,
    Turned,
    Diverged,
}

/// How a new segment competes with the existing one for the candidate.
#[derive(Debug, Clone, Copy)]
enum Pick {
    /// Within a subtree: proportional to the summed weights.
    Uniform,
    /// Across doublings: favours the newer half.
    Biased,
}

/// A contiguous run of leapfrog states.
struct Subtree {
    left: PhasePoint,
    right: PhasePoint,
    candidate: PhasePoint,
    /// log of the summed `exp(h0 - H)` over the states.
    log_weight: f64,
    /// Sum of the momenta of the states.
    rho: Vec<f64>,
    accept_sum: f64,
    steps: usize,
    growth: Growth,
}

impl Subtree {
    /// The starting state of a transition. It carries weight `exp(0)` but
    /// no leapfrog step.
    fn origin(point: &PhasePoint) -> Self {
        Self {
            left: point.clone(),
            right: point.clone(),
            candidate: point.clone(),
            log_weight: 0.0,
            rho: point.p.clone(),
            accept_sum: 0.0,
            steps: 0,
            growth: Growth::Open,
        }
    }

    fn leaf(point: PhasePoint, metric: &DiagonalMetric, h0: f64) -> Self {
        let delta_h = point.energy(metric) - h0;
        let diverged = !delta_h.is_finite() || delta_h > MAX_DELTA_H;
        let (log_weight, accept_sum, growth) = if diverged {
            (f64::NEG_INFINITY, 0.0, Growth::Diverged)
        } else {
            (-delta_h, (-delta_h).exp().min(1.0), Growth::Open)
        };
        Self {
            left: point.clone(),
            right: point.clone(),
            rho: point.p.clone(),
            candidate: point,
            log_weight,
            accept_sum,
            steps: 1,
            growth,
        }
    }

    /// The end of the segment that the next extension starts from.
    fn edge(&self, forward: bool) -> &PhasePoint {
        if forward {
            &self.right
        } else {
            &self.left
        }
    }

    /// Append `ext`, which was integrated outward from `self.edge(forward)`.
    fn join(self, ext: Subtree, forward: bool, pick: Pick, rng: &mut ChaCha8Rng) -> Self {
        let total = log_add_exp(self.log_weight, ext.log_weight);
        let take_ext = match pick {
            Pick::Uniform => ext.log_weight - total,
            Pick::Biased => (ext.log_weight - self.log_weight).min(0.0),
        }
        .exp();
        let rho = self.rho.iter().zip(&ext.rho).map(|(a, b)| a + b).collect();
        let candidate = if rng.gen::<f64>() < take_ext {
            ext.candidate
        } else {
            self.candidate
        };
        let (left, right) = if forward {
            (self.left, ext.right)
        } else {
            (ext.left, self.right)
        };
        Self {
            left,
            right,
            candidate,
            log_weight: total,
            rho,
            accept_sum: self.accept_sum + ext.accept_sum,
            steps: self.steps + ext.steps,
            growth: Growth::Open,
        }
    }

    /// Generalized criterion: the velocity at either end points against
    /// the summed momentum.
    fn is_turning(&self, metric: &DiagonalMetric) -> bool {
        let dim = self.rho.len();
        let mut v = vec![0.0; dim];
        [&self.left, &self.right].iter().any(|end| {
            metric.velocity(&end.p, &mut v);
            v.iter().zip(&self.rho).map(|(a, b)| a * b).sum::<f64>() <= 0.0
        })
    }
}

struct Transition {
    diverged: bool,
    mean_accept: f64,
    steps: usize,
    depth: usize,
}

/// Warmup windows as fractions of `num_warmup`: step size only for the
/// first 15%, metric estimation until 90%, then step size again.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    metric_start: usize,
    metric_end: usize,
    warmup: usize,
}

impl Schedule {
    fn new(num_warmup: usize) -> Self {
        Self {
            metric_start: num_warmup * 15 / 100,
            metric_end: num_warmup * 90 / 100,
            warmup: num_warmup,
        }
    }

    fn collects_metric(&self, iter: usize) -> bool {
        (self.metric_start..self.metric_end).contains(&iter)
    }
}

/// Run one chain of `num_warmup + num_draws` transitions from `init` and
/// keep the post-warmup states. `metric` is the starting metric; it is
/// re-estimated during warmup when `adapt_metric` is set.
pub fn run_chain<D: LogDensity>(
    density: &D,
    config: &NutsConfig,
    mut metric: DiagonalMetric,
    rng: &mut ChaCha8Rng,
    init: &[f64],
    progress: Option<&ProgressState>,
) -> Result<ChainResult> {
    config.validate()?;
    let dim = density.dim();
    check_dim(init, dim)?;
    check_dim(metric.variance(), dim)?;

    let schedule = Schedule::new(config.num_warmup);
    let iterations = config.num_warmup + config.num_draws;
    let mut draws = Vec::with_capacity(config.num_draws);
    let mut divergences = 0usize;
    let mut warmup_divergences = 0usize;
    let mut accept_total = 0.0f64;
    let mut grad_evals = 1usize;
    let mut variance = WelfordVariance::new(dim);

    let mut eps = config.step_size;
    if eps <= 0.0 {
        let (found, evals) = find_initial_step_size(density, init, &metric, rng)?;
        grad_evals += evals;
        eps = found;
    }
    debug!("nuts: initial step size {:.4}", eps);
    let mut adapt = DualAveraging::new(eps, config.target_accept);
    let mut state = PhasePoint::at(density, init)?;

    for iter in 0..iterations {
        metric.sample_momentum(rng, &mut state.p);
        let h0 = state.energy(&metric);
        let (next, info) = transition(
            density,
            &state,
            eps,
            &metric,
            h0,
            config.max_tree_depth,
            rng,
        )?;
        // Momentum is redrawn next iteration, so only position matters.
        state.q = next.q;
        state.grad = next.grad;
        state.logp = next.logp;

        grad_evals += info.steps;
        accept_total += info.mean_accept;
        if let Some(bar) = progress {
            bar.increment();
            bar.add_evals(info.steps);
            if info.diverged {
                bar.add_divergence();
            }
        }

        if iter >= schedule.warmup {
            if info.diverged {
                divergences += 1;
                debug!("nuts: divergence at draw {}", iter - schedule.warmup);
            }
            draws.push(state.q.clone());
            continue;
        }
        if info.diverged {
            warmup_divergences += 1;
        }

        eps = adapt.update(info.mean_accept);
        if config.adapt_metric {
            if schedule.collects_metric(iter) {
                variance.add(&state.q);
            }
            if iter + 1 == schedule.metric_end && variance.count() > 10 {
                metric.set_variance(&variance.regularized_variance());
                variance.reset();
                let (found, evals) = find_initial_step_size(density, &state.q, &metric, rng)?;
                grad_evals += evals;
                eps = found;
                adapt = DualAveraging::new(found, config.target_accept);
                debug!(
                    "nuts: metric variance {:?}, step size restarted at {:.4}",
                    metric.variance(),
                    found
                );
            }
        }
        if iter + 1 == schedule.warmup {
            eps = adapt.final_step_size();
            debug!("nuts: warmup finished, step size {:.4}, last depth {}", eps, info.depth);
        }
    }

    if divergences > 0 {
        warn!("nuts: {} divergent transitions after warmup", divergences);
    }
    if warmup_divergences > 0 {
        debug!("nuts: {} divergent transitions during warmup", warmup_divergences);
    }

    Ok(ChainResult {
        samples: draws,
        accept_rate: accept_total / iterations.max(1) as f64,
        step_size: eps,
        divergences,
        warmup_divergences,
        grad_evals,
        inv_mass: metric.variance().to_vec(),
    })
}

/// One NUTS transition from `start`, whose momentum is already drawn.
/// Returns the selected state.
fn transition<D: LogDensity>(
    density: &D,
    start: &PhasePoint,
    eps: f64,
    metric: &DiagonalMetric,
    h0: f64,
    max_depth: usize,
    rng: &mut ChaCha8Rng,
) -> Result<(PhasePoint, Transition)> {
    let mut tree = Subtree::origin(start);
    let mut steps = 0;
    let mut accept_sum = 0.0;
    let mut diverged = false;
    let mut depth = 0;

    while depth < max_depth {
        let forward = rng.gen::<bool>();
        let signed = if forward { eps } else { -eps };
        let ext = grow(density, tree.edge(forward), signed, metric, h0, depth, rng)?;
        steps += ext.steps;
        accept_sum += ext.accept_sum;
        depth += 1;
        match ext.growth {
            Growth::Diverged => {
                diverged = true;
                break;
            }
            Growth::Turned => break,
            Growth::Open => {}
        }
        tree = tree.join(ext, forward, Pick::Biased, rng);
        if tree.is_turning(metric) {
            break;
        }
    }

    let mean_accept = if steps == 0 {
        0.0
    } else {
        (accept_sum / steps as f64).min(1.0)
    };
    let stats = Transition {
        diverged,
        mean_accept,
        steps,
        depth,
    };
    Ok((tree.candidate, stats))
}

/// Integrate `2^depth` steps of signed size `eps` outward from `from`.
/// A segment that turned or diverged is returned with its flag set and
/// must not contribute a candidate.
fn grow<D: LogDensity>(
    density: &D,
    from: &PhasePoint,
    eps: f64,
    metric: &DiagonalMetric,
    h0: f64,
    depth: usize,
    rng: &mut ChaCha8Rng,
) -> Result<Subtree> {
    if depth == 0 {
        let next = leapfrog(density, from, eps, metric)?;
        return Ok(Subtree::leaf(next, metric, h0));
    }

    let forward = eps > 0.0;
    let mut near = grow(density, from, eps, metric, h0, depth - 1, rng)?;
    if near.growth != Growth::Open {
        return Ok(near);
    }
    let far = grow(density, near.edge(forward), eps, metric, h0, depth - 1, rng)?;
    if far.growth != Growth::Open {
        near.steps += far.steps;
        near.accept_sum += far.accept_sum;
        near.growth = far.growth;
        return Ok(near);
    }

    let mut merged = near.join(far, forward, Pick::Uniform, rng);
    if merged.is_turning(metric) {
        merged.growth = Growth::Turned;
    }
    Ok(merged)
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    let hi = a.max(b);
    if hi == f64::NEG_INFINITY {
        return hi;
    }
    hi + ((a - hi).exp() + (b - hi).exp()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::model::Model;
    use rand::SeedableRng;

    /// Independent normals N(1, 0.5^2) and N(-2, 4^2).
    fn gaussian() -> Model {
        let mut g = Graph::new();
        let a = g.add_param("a", 0.0);
        let b = g.add_param("b", 0.0);
        let mu_a = g.add_constant(1.0);
        let sd_a = g.add_constant(0.5);
        let mu_b = g.add_constant(-2.0);
        let sd_b = g.add_constant(4.0);
        let la = g.normal_logp(a, mu_a, sd_a);
        let lb = g.normal_logp(b, mu_b, sd_b);
        g.add_logp_term(la);
        g.add_logp_term(lb);
        Model::from_logp_terms(g).unwrap()
    }

    #[test]
    fn recovers_moments_and_adapts_metric() {
        let model = gaussian();
        let config = NutsConfig {
            num_draws: 2000,
            num_warmup: 1000,
            ..NutsConfig::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let res = run_chain(
            &model,
            &config,
            DiagonalMetric::identity(2),
            &mut rng,
            &[0.0, 0.0],
            None,
        )
        .unwrap();

        let n = res.samples.len() as f64;
        let mean_a = res.samples.iter().map(|s| s[0]).sum::<f64>() / n;
        let mean_b = res.samples.iter().map(|s| s[1]).sum::<f64>() / n;
        assert!((mean_a - 1.0).abs() < 0.1, "mean_a = {}", mean_a);
        assert!((mean_b + 2.0).abs() < 0.6, "mean_b = {}", mean_b);
        // Adapted inverse mass tracks the variances 0.25 and 16.
        assert!(res.inv_mass[1] / res.inv_mass[0] > 10.0, "{:?}", res.inv_mass);
        assert_eq!(res.divergences, 0);
        assert!(res.accept_rate > 0.6);
        assert!(res.grad_evals > config.num_draws);
    }

    #[test]
    fn warmup_divergences_are_counted_apart() {
        let model = gaussian();
        let run = |num_warmup, num_draws| {
            let config = NutsConfig {
                step_size: 100.0,
                num_warmup,
                num_draws,
                adapt_metric: false,
                ..NutsConfig::default()
            };
            let mut rng = ChaCha8Rng::seed_from_u64(3);
            run_chain(&model, &config, DiagonalMetric::identity(2), &mut rng, &[0.0, 0.0], None)
                .unwrap()
        };

        let warm = run(5, 0);
        assert!(warm.warmup_divergences >= 1);
        assert_eq!(warm.divergences, 0);

        let cold = run(0, 5);
        assert_eq!(cold.divergences, 5);
        assert_eq!(cold.warmup_divergences, 0);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let model = gaussian();
        let config = NutsConfig {
            num_draws: 50,
            num_warmup: 50,
            ..NutsConfig::default()
        };
        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            run_chain(&model, &config, DiagonalMetric::identity(2), &mut rng, &[0.0, 0.0], None)
                .unwrap()
                .samples
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn rejects_bad_tree_depth() {
        let cfg = NutsConfig {
            max_tree_depth: 0,
            ..NutsConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    fn point(q: f64, p: f64) -> PhasePoint {
        PhasePoint {
            q: vec![q],
            p: vec![p],
            grad: vec![0.0],
            logp: 0.0,
        }
    }

    #[test]
    fn turning_follows_summed_momentum() {
        let metric = DiagonalMetric::identity(1);
        let mut tree = Subtree::origin(&point(0.0, 1.0));
        tree.right = point(1.0, 0.5);
        tree.rho = vec![1.5];
        assert!(!tree.is_turning(&metric));
        tree.right = point(1.0, -0.5);
        assert!(tree.is_turning(&metric));
    }

    #[test]
    fn diverging_leaf_has_no_weight() {
        let metric = DiagonalMetric::identity(1);
        let mut far = point(0.0, 0.0);
        far.logp = -2.0 * MAX_DELTA_H;
        let leaf = Subtree::leaf(far, &metric, 0.0);
        assert_eq!(leaf.growth, Growth::Diverged);
        assert_eq!(leaf.log_weight, f64::NEG_INFINITY);
        assert_eq!(leaf.steps, 1);
    }

    #[test]
    fn log_add_exp_handles_empty_weights() {
        assert_eq!(log_add_exp(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert!(log_add_exp(0.0, f64::NEG_INFINITY).abs() < 1e-15);
        assert!((log_add_exp(0.0, 0.0) - 2f64.ln()).abs() < 1e-15);
    }
}
