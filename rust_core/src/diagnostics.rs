//! Convergence and efficiency summaries of a sampling run.
//!
//! R-hat and ESS follow Vehtari et al. (2021), "Rank-normalization, folding,
//! and localization: An improved R-hat for assessing convergence of MCMC".
//! The efficiency comparison follows the ensemble-sampler literature:
//! effective samples are `n_total / τ` with τ from [`crate::autocorr`].
use crate::autocorr;
use crate::error::Result;
use crate::sampler::SampleResult;

/// Per-parameter diagnostic summary.
#[derive(Debug, Clone)]
pub struct ParamDiagnostics {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub q3: f64,
    pub q97: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub r_hat: f64,
    pub mcse_mean: f64,
}

/// Full diagnostic report for a sampling run.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub method: String,
    pub params: Vec<ParamDiagnostics>,
    pub num_chains: usize,
    pub num_draws: usize,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
}

impl DiagnosticsReport {
    pub fn summarize(method: &str, result: &SampleResult) -> Self {
        let n_params = result.param_names.len();
        let params = (0..n_params)
            .map(|p| param_diagnostics(&result.param_names[p], &traces(result, p)))
            .collect();
        DiagnosticsReport {
            method: method.to_string(),
            params,
            num_chains: result.num_chains(),
            num_draws: result.num_draws(),
            accept_rates: result.accept_rates.clone(),
            divergences: result.divergences,
        }
    }

    pub fn converged(&self) -> bool {
        self.params
            .iter()
            .all(|p| p.r_hat.is_finite() && p.r_hat <= 1.05)
    }

    /// Render the diagnostics as a formatted table string.
    pub fn to_table(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "{}: {} chains × {} draws per chain",
            self.method, self.num_chains, self.num_draws
        ));
        lines.push(String::new());
        lines.push(format!(
            "{:<10} {:>9} {:>8} {:>9} {:>9} {:>9} {:>9} {:>7} {:>10}",
            "param", "mean", "std", "q3%", "q97%", "ess_bulk", "ess_tail", "r_hat", "mcse_mean"
        ));
        lines.push("─".repeat(88));

        for p in &self.params {
            lines.push(format!(
                "{:<10} {:>9.4} {:>8.4} {:>9.4} {:>9.4} {:>9} {:>9} {:>7.3} {:>10.6}",
                p.name,
                p.mean,
                p.std,
                p.q3,
                p.q97,
                fmt_ess(p.ess_bulk),
                fmt_ess(p.ess_tail),
                p.r_hat,
                p.mcse_mean,
            ));
        }

        lines.push("─".repeat(88));

        let avg_accept = if self.accept_rates.is_empty() {
            f64::NAN
        } else {
            self.accept_rates.iter().sum::<f64>() / self.accept_rates.len() as f64
        };
        lines.push(format!(
            "Mean accept rate: {:.2}  │  Divergences: {}",
            avg_accept, self.divergences
        ));

        if !self.converged() {
            lines.push("⚠  Some R-hat values > 1.05; chains may not have converged.".to_string());
        }
        if self.params.iter().any(|p| p.ess_bulk < 400.0 || p.ess_tail < 400.0) {
            lines.push("⚠  Some ESS values < 400; consider more draws.".to_string());
        }
        if self.divergences > 0 {
            lines.push(format!(
                "⚠  {} divergent transitions; results may be biased.",
                self.divergences
            ));
        }

        lines.join("\n")
    }
}

fn fmt_ess(ess: f64) -> String {
    if ess.is_finite() {
        format!("{:.0}", ess)
    } else {
        "NaN".to_string()
    }
}

/// Sampling efficiency of one method, measured through the integrated
/// autocorrelation time.
#[derive(Debug, Clone)]
pub struct Efficiency {
    pub method: String,
    pub tau: Vec<f64>,
    /// Draws over all chains or walkers.
    pub n_total: usize,
    /// `n_total / τ` per parameter.
    pub n_effective: Vec<f64>,
    /// Log-probability (ensemble) or gradient (HMC/NUTS) evaluations.
    pub evals: usize,
}

impl Efficiency {
    pub fn from_tau(method: &str, result: &SampleResult, tau: Vec<f64>) -> Self {
        let n_total = result.num_chains() * result.num_draws();
        let n_effective = tau.iter().map(|t| n_total as f64 / t).collect();
        Efficiency {
            method: method.to_string(),
            tau,
            n_total,
            n_effective,
            evals: result.evals,
        }
    }

    /// Estimate τ with the default window and tolerance.
    pub fn measure(method: &str, result: &SampleResult, quiet: bool) -> Result<Self> {
        let tau = autocorr::integrated_time(
            &result.samples,
            autocorr::DEFAULT_WINDOW_C,
            autocorr::DEFAULT_TOL,
            quiet,
        )?;
        Ok(Self::from_tau(method, result, tau))
    }

    /// Effective samples per model evaluation.
    pub fn per_eval(&self) -> Vec<f64> {
        self.n_effective
            .iter()
            .map(|n| n / self.evals.max(1) as f64)
            .collect()
    }

    /// The worst-mixing parameter decides the comparison. NaN if any
    /// parameter has no usable τ.
    pub fn min_per_eval(&self) -> f64 {
        self.per_eval().into_iter().fold(f64::INFINITY, |worst, v| {
            if v.is_nan() || worst.is_nan() {
                f64::NAN
            } else {
                worst.min(v)
            }
        })
    }
}

/// Side-by-side table of several methods.
pub fn efficiency_table(param_names: &[String], rows: &[Efficiency]) -> String {
    let mut lines = vec![format!(
        "{:<10} {:<10} {:>9} {:>10} {:>10} {:>12}",
        "method", "param", "tau", "n_eff", "evals", "n_eff/eval"
    )];
    lines.push("─".repeat(66));
    for row in rows {
        let per_eval = row.per_eval();
        for (p, name) in param_names.iter().enumerate() {
            lines.push(format!(
                "{:<10} {:<10} {:>9.2} {:>10.0} {:>10} {:>12.3e}",
                row.method, name, row.tau[p], row.n_effective[p], row.evals, per_eval[p]
            ));
        }
    }
    lines.join("\n")
}

/// Trace of parameter `p` in every chain.
fn traces(result: &SampleResult, p: usize) -> Vec<Vec<f64>> {
    result
        .samples
        .iter()
        .map(|chain| chain.iter().map(|draw| draw[p]).collect())
        .collect()
}

fn param_diagnostics(name: &str, chains: &[Vec<f64>]) -> ParamDiagnostics {
    let mut all: Vec<f64> = chains.iter().flatten().copied().collect();
    let mean = mean(&all);
    let std = (all.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / (all.len().max(2) - 1) as f64)
        .sqrt();
    sort(&mut all);
    let ess_bulk = ess_bulk(chains);
    ParamDiagnostics {
        name: name.to_string(),
        mean,
        std,
        q3: quantile_sorted(&all, 0.03),
        q97: quantile_sorted(&all, 0.97),
        ess_bulk,
        ess_tail: ess_tail(chains, &all),
        r_hat: split_r_hat(chains),
        mcse_mean: if ess_bulk > 0.0 {
            std / ess_bulk.sqrt()
        } else {
            f64::NAN
        },
    }
}

fn sort(v: &mut [f64]) {
    v.sort_unstable_by(|a, b| a.total_cmp(b));
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = (idx.ceil() as usize).min(sorted.len() - 1);
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Split R-hat: each chain is cut in half and the halves are compared.
pub fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len() as f64;
    let n = split.first().map_or(0, |c| c.len()) as f64;
    if m < 2.0 || n < 2.0 {
        return f64::NAN;
    }

    let means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let grand = means.iter().sum::<f64>() / m;
    let between = n / (m - 1.0) * means.iter().map(|cm| (cm - grand).powi(2)).sum::<f64>();
    let within = within_variance(&split, &means);
    if within < 1e-30 {
        return f64::NAN;
    }

    let var_plus = (n - 1.0) / n * within + between / n;
    (var_plus / within).sqrt()
}

/// Bulk ESS on rank-normalized draws.
pub fn ess_bulk(chains: &[Vec<f64>]) -> f64 {
    ess_split(&rank_normalize(chains))
}

/// Tail ESS: the smaller ESS of the 5% and 95% exceedance indicators.
fn ess_tail(chains: &[Vec<f64>], sorted: &[f64]) -> f64 {
    let q05 = quantile_sorted(sorted, 0.05);
    let q95 = quantile_sorted(sorted, 0.95);
    let indicator = |pred: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if pred(x) { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    let lower = ess_split(&indicator(&|x| x <= q05));
    let upper = ess_split(&indicator(&|x| x >= q95));
    lower.min(upper)
}

/// Replace draws with normal scores of their pooled ranks (ties averaged).
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut indexed: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, chain)| chain.iter().enumerate().map(move |(d, &v)| (v, c, d)))
        .collect();
    indexed.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
    let total = indexed.len() as f64;

    let mut result: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut i = 0;
    while i < indexed.len() {
        let mut j = i;
        while j < indexed.len() && indexed[j].0 == indexed[i].0 {
            j += 1;
        }
        let rank = (i + j + 1) as f64 / 2.0;
        let score = inv_normal_cdf((rank - 0.375) / (total + 0.25));
        for &(_, c, d) in &indexed[i..j] {
            result[c][d] = score;
        }
        i = j;
    }
    result
}

/// ESS of split chains with Geyer's initial positive sequence. Lags are
/// computed only until the paired sum turns negative.
fn ess_split(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    let m = split.len() as f64;
    let n = split.first().map_or(0, |c| c.len());
    if split.is_empty() || n < 4 {
        return f64::NAN;
    }
    let n_f = n as f64;

    let means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let within = within_variance(&split, &means);
    if within < 1e-30 {
        return f64::NAN;
    }
    let grand = mean(&means);
    let between_over_n =
        means.iter().map(|cm| (cm - grand).powi(2)).sum::<f64>() / (m - 1.0).max(1.0);
    let var_plus = (n_f - 1.0) / n_f * within + between_over_n;

    let rho = |lag: usize| -> f64 {
        let autocov = split
            .iter()
            .zip(&means)
            .map(|(c, cm)| {
                c.iter()
                    .zip(&c[lag..])
                    .map(|(a, b)| (a - cm) * (b - cm))
                    .sum::<f64>()
                    / n_f
            })
            .sum::<f64>()
            / m;
        1.0 - (within - autocov) / var_plus
    };

    let mut tau = -1.0;
    let mut t = 0;
    let mut prev_pair = f64::INFINITY;
    while t + 1 < n {
        // Pairs are forced monotone so noise in the tail cannot inflate τ.
        let pair = (rho(t) + rho(t + 1)).min(prev_pair);
        if pair < 0.0 {
            break;
        }
        tau += 2.0 * pair;
        prev_pair = pair;
        t += 2;
    }
    let total = m * n_f;
    total / tau.max(1.0 / total.log10().max(1.0))
}

fn within_variance(split: &[Vec<f64>], means: &[f64]) -> f64 {
    split
        .iter()
        .zip(means)
        .map(|(c, cm)| c.iter().map(|x| (x - cm).powi(2)).sum::<f64>() / (c.len() as f64 - 1.0))
        .sum::<f64>()
        / split.len() as f64
}

fn split_chains(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    chains
        .iter()
        .flat_map(|chain| {
            let mid = chain.len() / 2;
            // An odd draw count drops the middle draw so halves match.
            [chain[..mid].to_vec(), chain[chain.len() - mid..].to_vec()]
        })
        .collect()
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// Inverse standard normal CDF (Acklam's rational approximation,
/// relative error below 1.2e-9).
fn inv_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838,
        -2.549732539343734,
        4.374664141464968,
        2.938163982698783,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996,
        3.754408661907416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };
    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p > 1.0 - P_LOW {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    } else {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn iid_chains(n_chains: usize, n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n_chains)
            .map(|_| (0..n).map(|_| StandardNormal.sample(&mut rng)).collect())
            .collect()
    }

    fn result_from(chains: Vec<Vec<f64>>, evals: usize) -> SampleResult {
        SampleResult {
            accept_rates: vec![0.8; chains.len()],
            samples: chains
                .into_iter()
                .map(|c| c.into_iter().map(|v| vec![v]).collect())
                .collect(),
            divergences: 0,
            evals,
            param_names: vec!["x".to_string()],
        }
    }

    #[test]
    fn r_hat_is_one_for_iid_chains() {
        let rh = split_r_hat(&iid_chains(4, 1000, 1));
        assert!((rh - 1.0).abs() < 0.02, "R-hat = {}", rh);
    }

    #[test]
    fn r_hat_flags_separated_chains() {
        let mut chains = iid_chains(2, 500, 2);
        chains[1].iter_mut().for_each(|v| *v += 100.0);
        assert!(split_r_hat(&chains) > 1.5);
    }

    #[test]
    fn ess_of_iid_draws_is_close_to_the_draw_count() {
        let ess = ess_bulk(&iid_chains(4, 1000, 3));
        assert!(ess > 3000.0 && ess < 5000.0, "ESS = {}", ess);
    }

    #[test]
    fn inverse_normal_cdf_is_accurate() {
        assert_abs_diff_eq!(inv_normal_cdf(0.5), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(inv_normal_cdf(0.975), 1.959963985, epsilon = 1e-6);
        assert_abs_diff_eq!(inv_normal_cdf(0.01), -2.326347874, epsilon = 1e-6);
    }

    #[test]
    fn summary_table_lists_every_parameter() {
        let res = result_from(iid_chains(4, 500, 4), 1000);
        let report = DiagnosticsReport::summarize("NUTS", &res);
        assert!(report.converged());
        let table = report.to_table();
        assert!(table.contains("NUTS: 4 chains"));
        assert!(table.lines().any(|l| l.starts_with("x ")));
    }

    #[test]
    fn efficiency_divides_by_tau_and_evals() {
        let res = result_from(iid_chains(2, 100, 5), 400);
        let eff = Efficiency::from_tau("ensemble", &res, vec![2.0]);
        assert_eq!(eff.n_total, 200);
        assert_abs_diff_eq!(eff.n_effective[0], 100.0);
        assert_abs_diff_eq!(eff.min_per_eval(), 0.25);
        let table = efficiency_table(&res.param_names, &[eff]);
        assert!(table.contains("ensemble"));
    }

    #[test]
    fn unusable_tau_poisons_the_comparison() {
        let res = result_from(iid_chains(2, 100, 6), 400);
        let eff = Efficiency::from_tau("NUTS", &res, vec![2.0, f64::NAN]);
        assert!(eff.min_per_eval().is_nan());
        let eff = Efficiency::from_tau("NUTS", &res, vec![f64::NAN, 2.0]);
        assert!(eff.min_per_eval().is_nan());
    }
}
