use std::collections::HashMap;

use crate::error::{check_dim, Error, Result};
use crate::graph::{Graph, NodeId, Op};

/// Value produced by evaluating a node. Scalars and vectors are tracked
/// separately so the graph can mix element-wise data operations with
/// scalar parameter operations without heap allocation for the common
/// scalar case.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Vector(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Value::Vector(v) => Some(v),
            Value::Scalar(_) => None,
        }
    }

    /// Number of elements; scalars count as one.
    pub fn len(&self) -> usize {
        match self {
            Value::Scalar(_) => 1,
            Value::Vector(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Broadcasting element access: a scalar answers every index.
    #[inline]
    fn at(&self, i: usize) -> f64 {
        match self {
            Value::Scalar(v) => *v,
            Value::Vector(v) => v[i],
        }
    }

    fn is_vector(&self) -> bool {
        matches!(self, Value::Vector(_))
    }
}

/// Values substituted for nodes at evaluation time.
///
/// A fed node behaves like a constant: its inputs are not evaluated for it
/// and no gradient flows through it. This is how data and parameters are
/// swapped without rebuilding the graph.
#[derive(Debug, Clone, Default)]
pub struct Feed {
    values: HashMap<NodeId, Value>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, node: NodeId, value: Value) -> Self {
        self.values.insert(node, value);
        self
    }

    pub fn insert(&mut self, node: NodeId, value: Value) {
        self.values.insert(node, value);
    }

    pub fn get(&self, node: NodeId) -> Option<&Value> {
        self.values.get(&node)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Length of the broadcast result of `inputs`, or a shape error.
fn broadcast_len(node: usize, inputs: &[&Value]) -> Result<Option<usize>> {
    let mut len: Option<usize> = None;
    for v in inputs {
        if let Value::Vector(vec) = v {
            match len {
                None => len = Some(vec.len()),
                Some(l) if l != vec.len() => {
                    return Err(Error::Shape {
                        node,
                        reason: format!("cannot broadcast vectors of length {} and {}", l, vec.len()),
                    })
                }
                Some(_) => {}
            }
        }
    }
    Ok(len)
}

fn map2(node: usize, a: &Value, b: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
    Ok(match broadcast_len(node, &[a, b])? {
        None => Value::Scalar(f(a.at(0), b.at(0))),
        Some(n) => Value::Vector((0..n).map(|i| f(a.at(i), b.at(i))).collect()),
    })
}

fn map1(a: &Value, f: impl Fn(f64) -> f64) -> Value {
    match a {
        Value::Scalar(v) => Value::Scalar(f(*v)),
        Value::Vector(v) => Value::Vector(v.iter().map(|&x| f(x)).collect()),
    }
}

/// Forward-evaluate every node in the graph and return the per-node values.
pub fn forward(graph: &Graph, params: &[f64], feed: &Feed) -> Result<Vec<Value>> {
    check_dim(params, graph.param_count())?;
    let mut values: Vec<Value> = Vec::with_capacity(graph.nodes.len());

    for node in &graph.nodes {
        if let Some(fed) = feed.get(node.id) {
            values.push(fed.clone());
            continue;
        }
        let idx = node.id.0;
        let val = match &node.op {
            Op::Param(p) => Value::Scalar(params[*p]),
            Op::Constant(c) => Value::Scalar(*c),
            Op::Data(d) => Value::Vector(graph.data_vectors[*d].clone()),
            Op::Add(a, b) => map2(idx, &values[a.0], &values[b.0], |x, y| x + y)?,
            Op::Sub(a, b) => map2(idx, &values[a.0], &values[b.0], |x, y| x - y)?,
            Op::Mul(a, b) => map2(idx, &values[a.0], &values[b.0], |x, y| x * y)?,
            Op::Div(a, b) => map2(idx, &values[a.0], &values[b.0], |x, y| x / y)?,
            Op::Neg(a) => map1(&values[a.0], |x| -x),
            Op::Exp(a) => map1(&values[a.0], f64::exp),
            Op::Log(a) => map1(&values[a.0], f64::ln),
            Op::Square(a) => map1(&values[a.0], |x| x * x),
            Op::RequirePositive { value, scale } => {
                map2(idx, &values[value.0], &values[scale.0], |v, s| {
                    if s > 0.0 {
                        v
                    } else {
                        f64::NEG_INFINITY
                    }
                })?
            }
            Op::Sum(a) => match &values[a.0] {
                Value::Scalar(v) => Value::Scalar(*v),
                Value::Vector(v) => Value::Scalar(v.iter().sum()),
            },
            Op::NormalLogP { x, mu, sigma } => {
                let (xv, mv, sv) = (&values[x.0], &values[mu.0], &values[sigma.0]);
                match broadcast_len(idx, &[xv, mv, sv])? {
                    None => Value::Scalar(normal_logp_scalar(xv.at(0), mv.at(0), sv.at(0))),
                    Some(n) => Value::Vector(
                        (0..n)
                            .map(|i| normal_logp_scalar(xv.at(i), mv.at(i), sv.at(i)))
                            .collect(),
                    ),
                }
            }
            Op::NormalObsLogP { mu_vec, sigma, obs } => {
                let (mv, sv, ov) = (&values[mu_vec.0], &values[sigma.0], &values[obs.0]);
                let n = broadcast_len(idx, &[mv, sv, ov])?.unwrap_or(1);
                Value::Scalar(normal_obs_logp_sum(mv, sv, ov, n))
            }
        };
        values.push(val);
    }

    Ok(values)
}

fn scalar_at(values: &[Value], id: NodeId) -> Result<f64> {
    values[id.0].as_scalar().ok_or_else(|| Error::Shape {
        node: id.0,
        reason: "expected a scalar".to_string(),
    })
}

fn total_of_terms(graph: &Graph, values: &[Value]) -> Result<f64> {
    graph
        .logp_terms
        .iter()
        .map(|&id| scalar_at(values, id))
        .sum()
}

/// Evaluate a single node.
pub fn eval_node(graph: &Graph, params: &[f64], feed: &Feed, target: NodeId) -> Result<Value> {
    let values = forward(graph, params, feed)?;
    values.into_iter().nth(target.0).ok_or_else(|| Error::Shape {
        node: target.0,
        reason: "node is not part of this graph".to_string(),
    })
}

/// Compute the total log-probability (sum of all logp_terms).
pub fn eval_logp(graph: &Graph, params: &[f64]) -> Result<f64> {
    let values = forward(graph, params, &Feed::new())?;
    total_of_terms(graph, &values)
}

/// Reverse-mode autodiff of the total log-probability w.r.t. params.
pub fn grad_logp(graph: &Graph, params: &[f64]) -> Result<(f64, Vec<f64>)> {
    let values = forward(graph, params, &Feed::new())?;
    let total = total_of_terms(graph, &values)?;
    let grad = backward(graph, &values, &Feed::new(), &graph.logp_terms)?;
    Ok((total, grad))
}

/// Reverse-mode autodiff of one scalar node w.r.t. every parameter.
pub fn grad_node(
    graph: &Graph,
    params: &[f64],
    feed: &Feed,
    target: NodeId,
) -> Result<(f64, Vec<f64>)> {
    let values = forward(graph, params, feed)?;
    let value = scalar_at(&values, target)?;
    let grad = backward(graph, &values, feed, &[target])?;
    Ok((value, grad))
}

/// Adjoint storage. Scalar nodes and vector nodes keep separate tables.
struct Adjoints {
    scalar: Vec<f64>,
    vector: Vec<Option<Vec<f64>>>,
}

impl Adjoints {
    fn new(n: usize) -> Self {
        Self {
            scalar: vec![0.0; n],
            vector: vec![None; n],
        }
    }

    /// Upstream adjoint of a node, one entry per element of its value.
    fn take(&mut self, id: usize, value: &Value) -> Option<Vec<f64>> {
        match value {
            Value::Scalar(_) => {
                let a = self.scalar[id];
                if a == 0.0 {
                    None
                } else {
                    Some(vec![a])
                }
            }
            Value::Vector(_) => self.vector[id].take(),
        }
    }

    /// Add `contrib` into the adjoint of `id`. Broadcast scalars absorb the
    /// sum of the contributions.
    fn push(&mut self, id: NodeId, shape: &Value, contrib: Vec<f64>) {
        match shape {
            Value::Scalar(_) => self.scalar[id.0] += contrib.iter().sum::<f64>(),
            Value::Vector(_) => merge_vec_adj(&mut self.vector[id.0], &contrib),
        }
    }
}

fn backward(graph: &Graph, values: &[Value], feed: &Feed, seeds: &[NodeId]) -> Result<Vec<f64>> {
    let n = graph.nodes.len();
    let mut adj = Adjoints::new(n);

    for &id in seeds {
        scalar_at(values, id)?;
        adj.scalar[id.0] += 1.0;
    }

    for node in graph.nodes.iter().rev() {
        let idx = node.id.0;
        // Fed nodes are leaves.
        if feed.get(node.id).is_some() {
            continue;
        }
        let out = &values[idx];
        let upstream = match &node.op {
            Op::Param(_) | Op::Constant(_) | Op::Data(_) => continue,
            _ => match adj.take(idx, out) {
                Some(u) => u,
                None => continue,
            },
        };
        let len = upstream.len();

        match &node.op {
            Op::Param(_) | Op::Constant(_) | Op::Data(_) => {}
            Op::Add(a, b) => {
                adj.push(*a, &values[a.0], upstream.clone());
                adj.push(*b, &values[b.0], upstream);
            }
            Op::Sub(a, b) => {
                adj.push(*a, &values[a.0], upstream.clone());
                adj.push(*b, &values[b.0], upstream.iter().map(|u| -u).collect());
            }
            Op::Mul(a, b) => {
                let (va, vb) = (&values[a.0], &values[b.0]);
                let da = (0..len).map(|i| upstream[i] * vb.at(i)).collect();
                let db = (0..len).map(|i| upstream[i] * va.at(i)).collect();
                adj.push(*a, va, da);
                adj.push(*b, vb, db);
            }
            Op::Div(a, b) => {
                let (va, vb) = (&values[a.0], &values[b.0]);
                let da = (0..len).map(|i| upstream[i] / vb.at(i)).collect();
                let db = (0..len)
                    .map(|i| {
                        let d = vb.at(i);
                        -upstream[i] * va.at(i) / (d * d)
                    })
                    .collect();
                adj.push(*a, va, da);
                adj.push(*b, vb, db);
            }
            Op::Neg(a) => {
                adj.push(*a, &values[a.0], upstream.iter().map(|u| -u).collect());
            }
            Op::Exp(a) => {
                let d = (0..len).map(|i| upstream[i] * out.at(i)).collect();
                adj.push(*a, &values[a.0], d);
            }
            Op::Log(a) => {
                let va = &values[a.0];
                let d = (0..len).map(|i| upstream[i] / va.at(i)).collect();
                adj.push(*a, va, d);
            }
            Op::Square(a) => {
                let va = &values[a.0];
                let d = (0..len).map(|i| upstream[i] * 2.0 * va.at(i)).collect();
                adj.push(*a, va, d);
            }
            Op::Sum(a) => {
                let va = &values[a.0];
                adj.push(*a, va, vec![upstream[0]; va.len()]);
            }
            Op::RequirePositive { value, scale } => {
                let sv = &values[scale.0];
                let d = (0..len)
                    .map(|i| if sv.at(i) > 0.0 { upstream[i] } else { 0.0 })
                    .collect();
                adj.push(*value, &values[value.0], d);
            }
            Op::NormalLogP { x, mu, sigma } => {
                let (xv, mv, sv) = (&values[x.0], &values[mu.0], &values[sigma.0]);
                let mut dx = Vec::with_capacity(len);
                let mut dsigma = Vec::with_capacity(len);
                for i in 0..len {
                    let diff = xv.at(i) - mv.at(i);
                    let s = sv.at(i);
                    let s2 = s * s;
                    // d logp / d x = -(x - mu) / sigma^2
                    dx.push(upstream[i] * (-diff / s2));
                    // d logp / d sigma = (x - mu)^2 / sigma^3 - 1/sigma
                    dsigma.push(upstream[i] * (diff * diff / (s2 * s) - 1.0 / s));
                }
                let dmu = dx.iter().map(|d| -d).collect();
                adj.push(*x, xv, dx);
                adj.push(*mu, mv, dmu);
                adj.push(*sigma, sv, dsigma);
            }
            Op::NormalObsLogP { mu_vec, sigma, obs } => {
                let (mv, sv, ov) = (&values[mu_vec.0], &values[sigma.0], &values[obs.0]);
                let u = upstream[0];
                let n_obs = [mv, sv, ov]
                    .iter()
                    .filter(|v| v.is_vector())
                    .map(|v| v.len())
                    .next()
                    .unwrap_or(1);
                let mut dmu = Vec::with_capacity(n_obs);
                let mut dsigma = Vec::with_capacity(n_obs);
                for i in 0..n_obs {
                    let diff = ov.at(i) - mv.at(i);
                    let s = sv.at(i);
                    let s2 = s * s;
                    dmu.push(u * diff / s2);
                    dsigma.push(u * (diff * diff / (s2 * s) - 1.0 / s));
                }
                let dobs = dmu.iter().map(|d| -d).collect();
                adj.push(*mu_vec, mv, dmu);
                adj.push(*sigma, sv, dsigma);
                adj.push(*obs, ov, dobs);
            }
        }
    }

    Ok(graph
        .params
        .iter()
        .map(|p| {
            if feed.get(p.node).is_some() {
                0.0
            } else {
                adj.scalar[p.node.0]
            }
        })
        .collect())
}

fn merge_vec_adj(slot: &mut Option<Vec<f64>>, incoming: &[f64]) {
    match slot {
        Some(ref mut existing) => {
            for (e, i) in existing.iter_mut().zip(incoming.iter()) {
                *e += i;
            }
        }
        None => {
            *slot = Some(incoming.to_vec());
        }
    }
}

fn normal_logp_scalar(x: f64, mu: f64, sigma: f64) -> f64 {
    if !(sigma > 0.0) {
        return f64::NEG_INFINITY;
    }
    let diff = x - mu;
    -0.5 * (diff * diff) / (sigma * sigma) - sigma.ln() - 0.5 * std::f64::consts::TAU.ln()
}

fn normal_obs_logp_sum(mu: &Value, sigma: &Value, obs: &Value, n: usize) -> f64 {
    (0..n)
        .map(|i| normal_logp_scalar(obs.at(i), mu.at(i), sigma.at(i)))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use approx::assert_abs_diff_eq;

    fn central_diff(graph: &Graph, params: &[f64], target: NodeId) -> Vec<f64> {
        let eps = 1e-6;
        (0..params.len())
            .map(|i| {
                let mut hi = params.to_vec();
                let mut lo = params.to_vec();
                hi[i] += eps;
                lo[i] -= eps;
                let f = |p: &[f64]| {
                    eval_node(graph, p, &Feed::new(), target)
                        .unwrap()
                        .as_scalar()
                        .unwrap()
                };
                (f(&hi) - f(&lo)) / (2.0 * eps)
            })
            .collect()
    }

    #[test]
    fn test_normal_logp_gradient() {
        let mut g = Graph::new();
        let x = g.add_param("x", 0.0);
        let mu = g.add_constant(0.0);
        let sigma = g.add_constant(1.0);
        let lp = g.normal_logp(x, mu, sigma);
        g.add_logp_term(lp);

        let (logp, grad) = grad_logp(&g, &[1.5]).unwrap();

        assert_abs_diff_eq!(
            logp,
            -0.5 * 1.5_f64.powi(2) - 0.5 * std::f64::consts::TAU.ln(),
            epsilon = 1e-10
        );
        assert_abs_diff_eq!(grad[0], -1.5, epsilon = 1e-10);
    }

    #[test]
    fn test_gradient_finite_diff() {
        let mut g = Graph::new();
        let beta = g.add_param("beta", 0.0);
        let zero = g.add_constant(0.0);
        let one = g.add_constant(1.0);
        let prior = g.normal_logp(beta, zero, one);
        g.add_logp_term(prior);

        let x = g.add_data("x", vec![1.0, 2.0, 3.0]);
        let mu = g.mul(beta, x);
        let y = g.add_data("y", vec![2.5, 5.0, 7.5]);
        let lik = g.normal_obs_logp(mu, one, y);
        g.add_logp_term(lik);

        let params = vec![2.4];
        let (_, grad) = grad_logp(&g, &params).unwrap();

        let eps = 1e-6;
        let plus = eval_logp(&g, &[params[0] + eps]).unwrap();
        let minus = eval_logp(&g, &[params[0] - eps]).unwrap();
        let numerical = (plus - minus) / (2.0 * eps);

        assert!(
            (grad[0] - numerical).abs() < 1e-4,
            "analytic={}, numerical={}",
            grad[0],
            numerical
        );
    }

    #[test]
    fn broadcast_chain_matches_finite_differences() {
        // sum(exp(a * x) / (b + x^2)) - log(b)
        let mut g = Graph::new();
        let a = g.add_param("a", 0.0);
        let b = g.add_param("b", 0.0);
        let x = g.add_data("x", vec![-0.7, 0.1, 0.4, 1.3]);
        let ax = g.mul(a, x);
        let e = g.exp(ax);
        let x2 = g.square(x);
        let denom = g.add(b, x2);
        let ratio = g.div(e, denom);
        let total = g.sum(ratio);
        let lb = g.log(b);
        let nlb = g.neg(lb);
        let target = g.add(total, nlb);

        let params = [0.3, 1.7];
        let (_, grad) = grad_node(&g, &params, &Feed::new(), target).unwrap();
        let fd = central_diff(&g, &params, target);
        for (an, nu) in grad.iter().zip(fd.iter()) {
            assert_abs_diff_eq!(an, nu, epsilon = 1e-6);
        }
    }

    #[test]
    fn feed_replaces_data_without_rebuilding() {
        let mut g = Graph::new();
        let m = g.add_param("m", 0.0);
        let x = g.add_data("x", vec![1.0, 2.0]);
        let mx = g.mul(m, x);
        let s = g.sum(mx);

        let base = eval_node(&g, &[2.0], &Feed::new(), s).unwrap();
        assert_eq!(base, Value::Scalar(6.0));

        let feed = Feed::new().with(x, Value::Vector(vec![10.0, 20.0, 30.0]));
        let fed = eval_node(&g, &[2.0], &feed, s).unwrap();
        assert_eq!(fed, Value::Scalar(120.0));
    }

    #[test]
    fn fed_parameter_gets_no_gradient() {
        let mut g = Graph::new();
        let m = g.add_param("m", 0.0);
        let b = g.add_param("b", 0.0);
        let mb = g.mul(m, b);

        let feed = Feed::new().with(m, Value::Scalar(3.0));
        let (value, grad) = grad_node(&g, &[1.0, 2.0], &feed, mb).unwrap();
        assert_abs_diff_eq!(value, 6.0);
        assert_abs_diff_eq!(grad[0], 0.0);
        assert_abs_diff_eq!(grad[1], 3.0);
    }

    #[test]
    fn mismatched_vectors_are_a_shape_error() {
        let mut g = Graph::new();
        let a = g.add_data("a", vec![1.0, 2.0]);
        let b = g.add_data("b", vec![1.0, 2.0, 3.0]);
        let c = g.add(a, b);
        let err = eval_node(&g, &[], &Feed::new(), c).unwrap_err();
        assert!(matches!(err, Error::Shape { node, .. } if node == c.0));
    }

    #[test]
    fn wrong_parameter_count_is_rejected() {
        let mut g = Graph::new();
        g.add_param("m", 0.0);
        assert!(matches!(
            eval_logp(&g, &[1.0, 2.0]),
            Err(Error::Dimension { expected: 1, found: 2 })
        ));
    }
}
