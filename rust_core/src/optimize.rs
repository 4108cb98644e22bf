//! Maximum-likelihood / MAP point estimates through argmin's L-BFGS.
//!
//! Maximizing `logp` is expressed as minimizing the cost `c(q) = -logp(q)`;
//! the analytic gradient from the model is negated accordingly.

use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, info};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::LogDensity;

type Theta = Array1<f64>;
type Grad = Array1<f64>;
type Lbfgs = LBFGS<MoreThuenteLineSearch<Theta, Grad, f64>, Theta, Grad, f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimOptions {
    /// L-BFGS history size.
    pub lbfgs_mem: usize,
    pub tol_grad: Option<f64>,
    pub tol_cost: Option<f64>,
    pub max_iters: u64,
}

impl Default for OptimOptions {
    fn default() -> Self {
        Self {
            lbfgs_mem: 7,
            tol_grad: Some(1e-8),
            tol_cost: Some(1e-12),
            max_iters: 500,
        }
    }
}

impl OptimOptions {
    pub fn validate(&self) -> Result<()> {
        if self.lbfgs_mem == 0 {
            return Err(Error::InvalidConfig {
                field: "optim.lbfgs_mem",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_iters == 0 {
            return Err(Error::InvalidConfig {
                field: "optim.max_iters",
                reason: "must be positive".to_string(),
            });
        }
        for (field, tol) in [("optim.tol_grad", self.tol_grad), ("optim.tol_cost", self.tol_cost)] {
            if let Some(t) = tol {
                if !(t.is_finite() && t > 0.0) {
                    return Err(Error::InvalidConfig {
                        field,
                        reason: format!("tolerance must be positive and finite, got {}", t),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Result of a maximization.
#[derive(Debug, Clone)]
pub struct OptimOutcome {
    pub params: Vec<f64>,
    pub logp: f64,
    pub iterations: u64,
    pub termination: String,
}

/// Exposes a [`LogDensity`] to argmin as a cost to minimize.
struct NegLogDensity<'a, D: LogDensity> {
    density: &'a D,
}

impl<'a, D: LogDensity> CostFunction for NegLogDensity<'a, D> {
    type Param = Theta;
    type Output = f64;

    fn cost(&self, theta: &Theta) -> std::result::Result<f64, argmin::core::Error> {
        let q = theta.as_slice().unwrap_or(&[]);
        let value = self.density.logp(q)?;
        if !value.is_finite() {
            return Err(Error::NonFinite {
                what: "log-probability",
                value,
            }
            .into());
        }
        Ok(-value)
    }
}

impl<'a, D: LogDensity> Gradient for NegLogDensity<'a, D> {
    type Param = Theta;
    type Gradient = Grad;

    fn gradient(&self, theta: &Theta) -> std::result::Result<Grad, argmin::core::Error> {
        let q = theta.as_slice().unwrap_or(&[]);
        let (_, grad) = self.density.logp_and_grad(q)?;
        if let Some(&bad) = grad.iter().find(|g| !g.is_finite()) {
            return Err(Error::NonFinite {
                what: "gradient",
                value: bad,
            }
            .into());
        }
        Ok(grad.iter().map(|g| -g).collect())
    }
}

fn build_solver(opts: &OptimOptions) -> Result<Lbfgs> {
    let mut solver = Lbfgs::new(MoreThuenteLineSearch::new(), opts.lbfgs_mem);
    if let Some(tol) = opts.tol_grad {
        solver = solver.with_tolerance_grad(tol)?;
    }
    if let Some(tol) = opts.tol_cost {
        solver = solver.with_tolerance_cost(tol)?;
    }
    Ok(solver)
}

/// Find the maximum of `density` starting from `init`.
pub fn maximize<D: LogDensity>(
    density: &D,
    init: &[f64],
    opts: &OptimOptions,
) -> Result<OptimOutcome> {
    opts.validate()?;
    crate::error::check_dim(init, density.dim())?;
    debug!("L-BFGS from {:?} (mem {})", init, opts.lbfgs_mem);

    let problem = NegLogDensity { density };
    let solver = build_solver(opts)?;
    let theta0 = Array1::from(init.to_vec());
    let max_iters = opts.max_iters;

    let result = Executor::new(problem, solver)
        .configure(|state| state.param(theta0).max_iters(max_iters))
        .run()?;
    let state = result.state();

    let params = state
        .get_best_param()
        .map(|p| p.to_vec())
        .ok_or_else(|| Error::Optimizer("solver returned no parameters".to_string()))?;
    let outcome = OptimOutcome {
        params,
        logp: -state.get_best_cost(),
        iterations: state.get_iter(),
        termination: format!("{:?}", state.get_termination_status()),
    };
    info!(
        "optimizer finished after {} iterations: logp = {:.6} ({})",
        outcome.iterations, outcome.logp, outcome.termination
    );
    Ok(outcome)
}
