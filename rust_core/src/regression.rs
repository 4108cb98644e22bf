//! Straight-line model with Gaussian noise.
//!
//! Closed-form log-likelihood, log-prior and log-posterior, plus builders
//! that express the same quantities as computation graphs.

use std::f64::consts::TAU;

use crate::data::Dataset;
use crate::error::Result;
use crate::graph::{Graph, NodeId, ParamTransform};
use crate::model::Model;

/// `-0.5 * Σ ((y - m x - b)^2 / s^2 + ln(2π s^2))`.
///
/// Returns `-inf` for `s <= 0`.
pub fn log_likelihood(data: &Dataset, m: f64, b: f64, s: f64) -> f64 {
    if !(s > 0.0) {
        return f64::NEG_INFINITY;
    }
    let s2 = s * s;
    let log_norm = (TAU * s2).ln();
    -0.5 * data
        .x
        .iter()
        .zip(&data.y)
        .map(|(&x, &y)| {
            let r = y - m * x - b;
            r * r / s2 + log_norm
        })
        .sum::<f64>()
}

/// Slope/intercept prior `p(m, b) ∝ (1 + m^2)^(-3/2)`, flat in `b` and in
/// `log_s`.
pub fn log_prior(m: f64, _b: f64, _log_s: f64) -> f64 {
    -1.5 * (1.0 + m * m).ln()
}

pub fn log_posterior(data: &Dataset, m: f64, b: f64, log_s: f64) -> f64 {
    log_likelihood(data, m, b, log_s.exp()) + log_prior(m, b, log_s)
}

/// Root-mean-square residual: the noise scale maximizing the likelihood for
/// fixed `m` and `b`.
pub fn rms_residual(data: &Dataset, m: f64, b: f64) -> f64 {
    let ss: f64 = data
        .x
        .iter()
        .zip(&data.y)
        .map(|(&x, &y)| (y - m * x - b).powi(2))
        .sum();
    (ss / data.len() as f64).sqrt()
}

/// How the noise scale enters the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseParam {
    /// `s` itself is the parameter.
    Scale,
    /// `log_s` is the parameter and `s = exp(log_s)`.
    LogScale,
}

/// Handles into a line-model graph.
#[derive(Debug, Clone, Copy)]
pub struct LineNodes {
    pub m: NodeId,
    pub b: NodeId,
    /// The noise parameter node (`s` or `log_s`).
    pub noise: NodeId,
    /// The noise scale `s` (same node as `noise` for `NoiseParam::Scale`).
    pub s: NodeId,
    pub x: NodeId,
    pub y: NodeId,
    pub log_likelihood: NodeId,
}

/// Build the log-likelihood out of elementary ops, mirroring the formula.
/// Like [`log_likelihood`] it is `-inf` for `s <= 0`.
///
/// `init` is `[m, b, s]`; for `NoiseParam::LogScale` the initial `log_s` is
/// `ln(init[2])`.
pub fn build_likelihood(
    graph: &mut Graph,
    data: &Dataset,
    noise: NoiseParam,
    init: [f64; 3],
) -> LineNodes {
    let (m, b, noise_node, s) = line_params(graph, noise, init);
    let x = graph.add_data("x", data.x.clone());
    let y = graph.add_data("y", data.y.clone());

    let mx = graph.mul(m, x);
    let pred = graph.add(mx, b);
    let resid = graph.sub(y, pred);
    let r2 = graph.square(resid);
    let s2 = graph.square(s);
    let scaled = graph.div(r2, s2);
    let tau = graph.add_constant(TAU);
    let two_pi_s2 = graph.mul(tau, s2);
    let log_norm = graph.log(two_pi_s2);
    let terms = graph.add(scaled, log_norm);
    let total = graph.sum(terms);
    let half = graph.add_constant(-0.5);
    let mut log_likelihood = graph.mul(half, total);
    if noise == NoiseParam::Scale {
        log_likelihood = graph.require_positive(log_likelihood, s);
    }
    graph.set_name(log_likelihood, "log_likelihood");

    LineNodes {
        m,
        b,
        noise: noise_node,
        s,
        x,
        y,
        log_likelihood,
    }
}

/// Same log-likelihood through the fused Gaussian observation op.
pub fn build_likelihood_fused(
    graph: &mut Graph,
    data: &Dataset,
    noise: NoiseParam,
    init: [f64; 3],
) -> LineNodes {
    let (m, b, noise_node, s) = line_params(graph, noise, init);
    let x = graph.add_data("x", data.x.clone());
    let y = graph.add_data("y", data.y.clone());
    let mx = graph.mul(m, x);
    let pred = graph.add(mx, b);
    let log_likelihood = graph.normal_obs_logp(pred, s, y);
    graph.set_name(log_likelihood, "log_likelihood");

    LineNodes {
        m,
        b,
        noise: noise_node,
        s,
        x,
        y,
        log_likelihood,
    }
}

fn line_params(
    graph: &mut Graph,
    noise: NoiseParam,
    init: [f64; 3],
) -> (NodeId, NodeId, NodeId, NodeId) {
    let m = graph.add_param("m", init[0]);
    let b = graph.add_param("b", init[1]);
    match noise {
        NoiseParam::Scale => {
            let s = graph.add_param("s", init[2]);
            (m, b, s, s)
        }
        NoiseParam::LogScale => {
            let log_s = graph.add_param_with_transform("log_s", init[2].ln(), ParamTransform::Exp);
            let s = graph.exp(log_s);
            graph.set_name(s, "s");
            (m, b, log_s, s)
        }
    }
}

/// Add `-1.5 * ln(1 + m^2)` to the graph.
pub fn build_prior(graph: &mut Graph, m: NodeId) -> NodeId {
    let one = graph.add_constant(1.0);
    let m2 = graph.square(m);
    let arg = graph.add(one, m2);
    let log_arg = graph.log(arg);
    let coef = graph.add_constant(-1.5);
    let lp = graph.mul(coef, log_arg);
    graph.set_name(lp, "log_prior");
    lp
}

#[derive(Debug, Clone, Copy)]
pub struct PosteriorNodes {
    pub line: LineNodes,
    pub log_prior: NodeId,
    pub log_posterior: NodeId,
}

/// Log-posterior in `[m, b, log_s]`. Both terms are registered as
/// log-probability terms of the graph.
pub fn build_posterior(graph: &mut Graph, data: &Dataset, init: [f64; 3]) -> PosteriorNodes {
    let line = build_likelihood_fused(graph, data, NoiseParam::LogScale, init);
    let log_prior = build_prior(graph, line.m);
    graph.add_logp_term(line.log_likelihood);
    graph.add_logp_term(log_prior);
    let log_posterior = graph.add(line.log_likelihood, log_prior);
    graph.set_name(log_posterior, "log_posterior");
    PosteriorNodes {
        line,
        log_prior,
        log_posterior,
    }
}

/// The log-posterior wrapped as a [`Model`] over `[m, b, log_s]`.
pub fn posterior_model(data: &Dataset, init: [f64; 3]) -> Result<Model> {
    let mut graph = Graph::new();
    let nodes = build_posterior(&mut graph, data, init);
    let vars = [nodes.line.m, nodes.line.b, nodes.line.noise];
    Model::new(graph, nodes.log_posterior, &vars)
}

/// The log-likelihood alone as a [`Model`] over `[m, b, log_s]`.
pub fn likelihood_model(data: &Dataset, init: [f64; 3]) -> Result<Model> {
    let mut graph = Graph::new();
    let nodes = build_likelihood(&mut graph, data, NoiseParam::LogScale, init);
    let vars = [nodes.m, nodes.b, nodes.noise];
    Model::new(graph, nodes.log_likelihood, &vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{simulate, TrueParams};
    use crate::model::LogDensity;
    use crate::session::Session;
    use approx::assert_relative_eq;

    fn dataset() -> Dataset {
        simulate(&TrueParams::default(), 50, 42)
    }

    #[test]
    fn graph_matches_closed_form_at_truth() {
        let data = dataset();
        let t = TrueParams::default();
        let mut g = Graph::new();
        let nodes = build_likelihood(&mut g, &data, NoiseParam::Scale, [t.m, t.b, t.s]);
        let sess = Session::new(&g);
        let from_graph = sess.run_scalar(nodes.log_likelihood).unwrap();
        assert_relative_eq!(
            from_graph,
            log_likelihood(&data, t.m, t.b, t.s),
            max_relative = 1e-12
        );
    }

    #[test]
    fn fused_and_elementary_graphs_agree() {
        let data = dataset();
        let init = [-0.3, 0.1, 0.2];
        let mut g1 = Graph::new();
        let n1 = build_likelihood(&mut g1, &data, NoiseParam::LogScale, init);
        let mut g2 = Graph::new();
        let n2 = build_likelihood_fused(&mut g2, &data, NoiseParam::LogScale, init);
        let s1 = Session::new(&g1);
        let s2 = Session::new(&g2);
        assert_relative_eq!(
            s1.run_scalar(n1.log_likelihood).unwrap(),
            s2.run_scalar(n2.log_likelihood).unwrap(),
            max_relative = 1e-12
        );
        let g1 = s1.gradients(n1.log_likelihood).unwrap();
        let g2 = s2.gradients(n2.log_likelihood).unwrap();
        for (a, b) in g1.iter().zip(&g2) {
            assert_relative_eq!(a, b, max_relative = 1e-9);
        }
    }

    #[test]
    fn non_positive_scale_gives_negative_infinity() {
        let data = dataset();
        assert_eq!(log_likelihood(&data, 0.0, 0.0, 0.0), f64::NEG_INFINITY);
        assert_eq!(log_likelihood(&data, 0.0, 0.0, -1.0), f64::NEG_INFINITY);
    }

    #[test]
    fn graph_agrees_with_closed_form_outside_the_support() {
        let data = dataset();
        let mut g = Graph::new();
        let nodes = build_likelihood(&mut g, &data, NoiseParam::Scale, [-0.4, 0.03, 0.1]);
        let mut fused = Graph::new();
        let fused_nodes = build_likelihood_fused(&mut fused, &data, NoiseParam::Scale, [-0.4, 0.03, 0.1]);
        for s in [-0.1, 0.0] {
            let mut sess = Session::new(&g);
            sess.assign("s", s).unwrap();
            assert_eq!(sess.run_scalar(nodes.log_likelihood).unwrap(), f64::NEG_INFINITY);
            let mut sess = Session::new(&fused);
            sess.assign("s", s).unwrap();
            assert_eq!(sess.run_scalar(fused_nodes.log_likelihood).unwrap(), f64::NEG_INFINITY);
            assert_eq!(log_likelihood(&data, -0.4, 0.03, s), f64::NEG_INFINITY);
        }

        let mut sess = Session::new(&g);
        sess.assign("s", 0.1).unwrap();
        assert!(sess.run_scalar(nodes.log_likelihood).unwrap().is_finite());
        assert!(sess.gradients(nodes.log_likelihood).unwrap().iter().all(|d| d.is_finite()));
    }

    #[test]
    fn prior_is_symmetric_and_peaks_at_zero_slope() {
        assert_eq!(log_prior(0.0, 5.0, -3.0), 0.0);
        assert_relative_eq!(log_prior(2.0, 0.0, 0.0), log_prior(-2.0, 1.0, 1.0));
        assert!(log_prior(0.5, 0.0, 0.0) < 0.0);
    }

    #[test]
    fn posterior_model_matches_closed_form() {
        let data = dataset();
        let t = TrueParams::default();
        let model = posterior_model(&data, [t.m, t.b, t.s]).unwrap();
        assert_eq!(model.param_names(), vec!["m", "b", "log_s"]);
        let q = [-0.35, 0.0, (0.12f64).ln()];
        assert_relative_eq!(
            model.logp(&q).unwrap(),
            log_posterior(&data, q[0], q[1], q[2]),
            max_relative = 1e-12
        );
        assert_relative_eq!(model.current_vector()[2], t.s.ln(), max_relative = 1e-12);
        assert_relative_eq!(model.constrain(&q)[2], 0.12, max_relative = 1e-12);
    }

    #[test]
    fn rms_residual_is_zero_on_a_perfect_line() {
        let data = Dataset::new(vec![0.0, 1.0, 2.0], vec![1.0, 3.0, 5.0]).unwrap();
        assert_eq!(rms_residual(&data, 2.0, 1.0), 0.0);
    }
}
