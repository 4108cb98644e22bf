//! linfit CLI

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};

use linfit_core::autodiff::{Feed, Value};
use linfit_core::config::RunConfig;
use linfit_core::corner::corner_plot;
use linfit_core::data::{simulate, Dataset};
use linfit_core::diagnostics::{efficiency_table, DiagnosticsReport, Efficiency};
use linfit_core::ensemble::run_ensemble;
use linfit_core::graph::Graph;
use linfit_core::metric::DiagonalMetric;
use linfit_core::optimize::{maximize, OptimOutcome};
use linfit_core::regression::{self, NoiseParam};
use linfit_core::sampler::{sample_nuts, SampleResult};
use linfit_core::session::Session;
use linfit_core::{LogDensity, Model};

#[derive(Parser)]
#[command(name = "linfit")]
#[command(about = "Probabilistic linear regression: autodiff, L-BFGS, ensemble MCMC and NUTS")]
#[command(version)]
struct Cli {
    /// JSON run configuration; missing fields keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show live progress bars while sampling.
    #[arg(long, global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole tutorial, step by step
    Walkthrough {
        /// Directory for the corner plots
        #[arg(long)]
        plot_dir: Option<PathBuf>,
    },

    /// Simulate a dataset and write it as CSV
    Simulate {
        #[arg(long)]
        n: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Output CSV. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Maximum-likelihood and maximum-a-posteriori points
    Fit {
        /// Input CSV with `x,y` columns. Simulated when omitted.
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sample the posterior
    Sample {
        #[arg(long, value_enum, default_value = "nuts")]
        method: Method,

        /// Input CSV with `x,y` columns. Simulated when omitted.
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Output CSV of the draws
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Corner plot (SVG)
        #[arg(long)]
        plot: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Method {
    Ensemble,
    Nuts,
}

impl Method {
    fn label(self) -> &'static str {
        match self {
            Method::Ensemble => "ensemble",
            Method::Nuts => "NUTS",
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.as_deref())?;
    cfg.sampler.progress |= cli.progress;
    cfg.ensemble.progress |= cli.progress;

    match cli.command {
        Commands::Walkthrough { plot_dir } => cmd_walkthrough(&cfg, plot_dir.as_deref()),
        Commands::Simulate { n, seed, output } => {
            if let Some(n) = n {
                cfg.data.n_points = n;
            }
            if let Some(seed) = seed {
                cfg.data.seed = seed;
            }
            cfg.validate()?;
            cmd_simulate(&cfg, output.as_deref())
        }
        Commands::Fit { data, output } => cmd_fit(&cfg, data.as_deref(), output.as_deref()),
        Commands::Sample {
            method,
            data,
            output,
            plot,
        } => cmd_sample(&cfg, method, data.as_deref(), output.as_deref(), plot.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(p) => RunConfig::from_json_file(p)
            .with_context(|| format!("failed to load configuration {}", p.display())),
        None => Ok(RunConfig::default()),
    }
}

fn load_data(cfg: &RunConfig, path: Option<&Path>) -> Result<Dataset> {
    match path {
        Some(p) => {
            Dataset::read_csv(p).with_context(|| format!("failed to read data {}", p.display()))
        }
        None => Ok(simulate(&cfg.data.truth, cfg.data.n_points, cfg.data.seed)),
    }
}

fn write_json(output: Option<&Path>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

/// Starting point `[m, b, s]` that only looks at the data: a flat line
/// through the mean with the spread of `y` as noise.
fn initial_guess(data: &Dataset) -> [f64; 3] {
    let n = data.len() as f64;
    let mean = data.y.iter().sum::<f64>() / n;
    let var = data.y.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n;
    [0.0, mean, var.sqrt().max(1e-3)]
}

fn fit_both(cfg: &RunConfig, data: &Dataset) -> Result<(OptimOutcome, OptimOutcome, Model)> {
    let init = initial_guess(data);
    let likelihood = regression::likelihood_model(data, init)?;
    let ml = maximize(&likelihood, &likelihood.current_vector(), &cfg.optim)
        .context("maximum-likelihood fit failed")?;
    let posterior = regression::posterior_model(data, init)?;
    let map = maximize(&posterior, &posterior.current_vector(), &cfg.optim)
        .context("maximum-a-posteriori fit failed")?;
    Ok((ml, map, posterior))
}

fn point_json(model: &Model, outcome: &OptimOutcome) -> serde_json::Value {
    let c = model.constrain(&outcome.params);
    serde_json::json!({
        "m": c[0],
        "b": c[1],
        "s": c[2],
        "logp": outcome.logp,
        "iterations": outcome.iterations,
        "termination": outcome.termination,
    })
}

fn run_method(cfg: &RunConfig, method: Method, model: &Model, start: &[f64]) -> Result<SampleResult> {
    let result = match method {
        Method::Ensemble => run_ensemble(model, &cfg.ensemble, start)?,
        Method::Nuts => sample_nuts(
            model,
            start,
            &DiagonalMetric::identity(model.dim()),
            &cfg.nuts,
            &cfg.sampler,
        )?,
    };
    if result.divergences > 0 {
        warn!("{}: {} divergent transitions", method.label(), result.divergences);
    }
    Ok(result)
}

fn cmd_simulate(cfg: &RunConfig, output: Option<&Path>) -> Result<()> {
    let data = simulate(&cfg.data.truth, cfg.data.n_points, cfg.data.seed);
    match output {
        Some(path) => {
            data.write_csv(path)?;
            info!("wrote {} points to {}", data.len(), path.display());
        }
        None => {
            println!("x,y");
            for (x, y) in data.x.iter().zip(&data.y) {
                println!("{},{}", x, y);
            }
        }
    }
    Ok(())
}

fn cmd_fit(cfg: &RunConfig, data: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let data = load_data(cfg, data)?;
    let (ml, map, posterior) = fit_both(cfg, &data)?;
    write_json(
        output,
        serde_json::json!({
            "n_points": data.len(),
            "max_likelihood": point_json(&posterior, &ml),
            "max_posterior": point_json(&posterior, &map),
        }),
    )
}

fn cmd_sample(
    cfg: &RunConfig,
    method: Method,
    data: Option<&Path>,
    output: Option<&Path>,
    plot: Option<&Path>,
) -> Result<()> {
    let data = load_data(cfg, data)?;
    let (_, map, posterior) = fit_both(cfg, &data)?;
    let result = run_method(cfg, method, &posterior, &map.params)?;

    println!("{}", DiagnosticsReport::summarize(method.label(), &result).to_table());
    let eff = Efficiency::measure(method.label(), &result, true)?;
    println!();
    println!("{}", efficiency_table(&result.param_names, &[eff]));

    if let Some(path) = output {
        result.write_csv(path)?;
        info!("draws written to {}", path.display());
    }
    if let Some(path) = plot {
        let truths = cfg.data.truth.unconstrained();
        corner_plot(path, &result.flatten(), &result.param_names, Some(truths.as_slice()))?;
        info!("corner plot written to {}", path.display());
    }
    Ok(())
}

fn cmd_walkthrough(cfg: &RunConfig, plot_dir: Option<&Path>) -> Result<()> {
    let truth = cfg.data.truth;

    println!("== 1. Synthetic data");
    let data = simulate(&truth, cfg.data.n_points, cfg.data.seed);
    println!(
        "{} points on y = {} x + {} with noise s = {} (seed {})",
        data.len(),
        truth.m,
        truth.b,
        truth.s,
        cfg.data.seed
    );

    println!("\n== 2. Closed-form log-likelihood");
    let ll_true = regression::log_likelihood(&data, truth.m, truth.b, truth.s);
    println!("log L(m, b, s) at the truth = {:.6}", ll_true);

    println!("\n== 3. The same quantity as a graph");
    let mut graph = Graph::new();
    let nodes = regression::build_likelihood(
        &mut graph,
        &data,
        NoiseParam::Scale,
        [truth.m, truth.b, truth.s],
    );
    let mut session = Session::new(&graph);
    let ll_graph = session.run_scalar(nodes.log_likelihood)?;
    println!("graph evaluation = {:.6} (difference {:.2e})", ll_graph, ll_graph - ll_true);

    println!("\n== 4. Substituting values without rebuilding");
    session.assign("m", 0.0)?;
    println!("with m = 0: {:.6}", session.run_scalar(nodes.log_likelihood)?);
    session.assign("m", truth.m)?;
    let other = simulate(&truth, cfg.data.n_points, cfg.data.seed + 1);
    let feed = Feed::new()
        .with(nodes.x, Value::Vector(other.x.clone()))
        .with(nodes.y, Value::Vector(other.y.clone()));
    let fed = session
        .run_with(nodes.log_likelihood, &feed)?
        .as_scalar()
        .context("log-likelihood is not a scalar")?;
    println!("on a fresh dataset (seed {}): {:.6}", cfg.data.seed + 1, fed);

    println!("\n== 5. Gradients");
    let grad = session.gradients(nodes.log_likelihood)?;
    for (name, g) in graph.param_names().iter().zip(&grad) {
        println!("d log L / d {:<5} = {:>12.6}", name, g);
    }

    println!("\n== 6. Log-scale reparameterization");
    let likelihood = regression::likelihood_model(&data, [truth.m, truth.b, truth.s])?;
    let (_, grad_log) = likelihood.value_and_gradient(&truth.unconstrained())?;
    println!(
        "d log L / d log_s = {:.6} (= s * d log L / d s = {:.6})",
        grad_log[2],
        truth.s * grad[2]
    );

    println!("\n== 7. Maximum likelihood with L-BFGS");
    let (ml, map, posterior) = fit_both(cfg, &data)?;
    let ml_c = posterior.constrain(&ml.params);
    println!(
        "m = {:.4}, b = {:.4}, s = {:.4} after {} iterations; rms residual {:.4}",
        ml_c[0],
        ml_c[1],
        ml_c[2],
        ml.iterations,
        regression::rms_residual(&data, ml_c[0], ml_c[1])
    );

    println!("\n== 8. Prior and posterior");
    let map_c = posterior.constrain(&map.params);
    println!(
        "log prior at the truth = {:.4}; MAP m = {:.4}, b = {:.4}, s = {:.4}",
        regression::log_prior(truth.m, truth.b, truth.s.ln()),
        map_c[0],
        map_c[1],
        map_c[2]
    );

    println!("\n== 9. Value/gradient adapter");
    let (value, gradient) = posterior.value_and_gradient(&map.params)?;
    println!(
        "parameters {:?}: log p = {:.4}, |grad| = {:.2e}",
        posterior.param_names(),
        value,
        gradient.iter().map(|g| g * g).sum::<f64>().sqrt()
    );

    println!("\n== 10. Sampling");
    let mut results = Vec::new();
    for method in [Method::Ensemble, Method::Nuts] {
        let result = run_method(cfg, method, &posterior, &map.params)?;
        println!("{}\n", DiagnosticsReport::summarize(method.label(), &result).to_table());
        results.push((method, result));
    }

    println!("== 11. Corner plots and efficiency");
    if let Some(dir) = plot_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let truths = truth.unconstrained();
        for (method, result) in &results {
            let path = dir.join(format!("corner_{}.svg", method.label().to_lowercase()));
            corner_plot(&path, &result.flatten(), &result.param_names, Some(truths.as_slice()))?;
            println!("corner plot: {}", path.display());
        }
    }
    let rows = results
        .iter()
        .map(|(method, result)| Efficiency::measure(method.label(), result, true))
        .collect::<linfit_core::Result<Vec<_>>>()?;
    println!("{}", efficiency_table(&posterior.param_names(), &rows));
    if let [a, b] = rows.as_slice() {
        if a.min_per_eval().is_nan() || b.min_per_eval().is_nan() {
            warn!("no usable autocorrelation time for some parameter; skipping the comparison");
        } else {
            let (best, other) = if a.min_per_eval() >= b.min_per_eval() {
                (a, b)
            } else {
                (b, a)
            };
            println!(
                "\n{} yields {:.1}x the effective samples per evaluation of {}",
                best.method,
                best.min_per_eval() / other.min_per_eval(),
                other.method
            );
        }
    }
    Ok(())
}
