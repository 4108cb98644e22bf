use linfit_core::data::{simulate, TrueParams};
use linfit_core::diagnostics::{DiagnosticsReport, Efficiency};
use linfit_core::ensemble::{run_ensemble, EnsembleConfig};
use linfit_core::metric::DiagonalMetric;
use linfit_core::nuts::NutsConfig;
use linfit_core::optimize::{maximize, OptimOptions};
use linfit_core::regression;
use linfit_core::sampler::{sample_nuts, SampleResult, SamplerConfig};
use linfit_core::{LogDensity, Model};

fn posterior() -> (Model, Vec<f64>) {
    let data = simulate(&TrueParams::default(), 50, 42);
    let model = regression::posterior_model(&data, [0.0, 0.0, 1.0]).unwrap();
    let map = maximize(&model, &model.current_vector(), &OptimOptions::default()).unwrap();
    (model, map.params)
}

/// The truth lies within four posterior standard deviations of the mean.
fn assert_covers_truth(result: &SampleResult) {
    let truth = TrueParams::default().unconstrained();
    let mean = result.mean();
    let std = result.std();
    for i in 0..3 {
        assert!(std[i] > 0.0 && std[i] < 0.5, "std = {:?}", std);
        assert!(
            (mean[i] - truth[i]).abs() < 4.0 * std[i],
            "param {}: mean {} sd {} truth {}",
            result.param_names[i],
            mean[i],
            std[i],
            truth[i]
        );
    }
}

#[test]
fn ensemble_recovers_the_line() {
    let (model, map) = posterior();
    let config = EnsembleConfig {
        n_steps: 1500,
        n_burn: 300,
        ..EnsembleConfig::default()
    };
    let result = run_ensemble(&model, &config, &map).unwrap();
    assert_eq!(result.param_names, vec!["m", "b", "log_s"]);
    assert_covers_truth(&result);
    let eff = Efficiency::measure("ensemble", &result, true).unwrap();
    assert!(eff.tau.iter().all(|t| *t > 1.0 && t.is_finite()));
}

#[test]
fn nuts_recovers_the_line_and_converges() {
    let (model, map) = posterior();
    let nuts = NutsConfig {
        num_draws: 600,
        num_warmup: 400,
        ..NutsConfig::default()
    };
    let sampler = SamplerConfig {
        num_chains: 2,
        ..SamplerConfig::default()
    };
    let result = sample_nuts(
        &model,
        &map,
        &DiagonalMetric::identity(model.dim()),
        &nuts,
        &sampler,
    )
    .unwrap();
    assert_covers_truth(&result);
    let report = DiagnosticsReport::summarize("NUTS", &result);
    assert!(report.converged(), "{}", report.to_table());
}

#[test]
fn nuts_draws_are_nearly_independent() {
    // Each draw costs several gradients but the chain barely autocorrelates.
    let (model, map) = posterior();
    let nuts = NutsConfig {
        num_draws: 1000,
        num_warmup: 500,
        ..NutsConfig::default()
    };
    let sampler = SamplerConfig {
        num_chains: 2,
        ..SamplerConfig::default()
    };
    let result = sample_nuts(
        &model,
        &map,
        &DiagonalMetric::identity(3),
        &nuts,
        &sampler,
    )
    .unwrap();
    let eff = Efficiency::measure("NUTS", &result, true).unwrap();
    assert!(eff.tau.iter().all(|t| *t < 5.0), "tau = {:?}", eff.tau);
    assert!(eff.evals > result.num_chains() * result.num_draws());
}
