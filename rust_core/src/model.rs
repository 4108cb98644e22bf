use crate::autodiff::{self, Feed};
use crate::error::{check_dim, Error, Result};
use crate::graph::{Graph, NodeId};
use crate::session::Session;

/// A differentiable log-density on an unconstrained parameter vector.
///
/// This is the seam between models and algorithms: the optimizer and every
/// sampler only ever see this trait.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    fn param_names(&self) -> Vec<String>;

    fn logp(&self, q: &[f64]) -> Result<f64>;

    fn logp_and_grad(&self, q: &[f64]) -> Result<(f64, Vec<f64>)>;
}

/// Wraps a scalar graph node and a list of parameter nodes, exposing value
/// and gradient queries on a flat vector of just those parameters.
///
/// Parameters of the graph that are not in `vars` stay pinned at the values
/// captured by [`Model::setup`] (or their initial values).
#[derive(Debug, Clone)]
pub struct Model {
    graph: Graph,
    target: NodeId,
    var_indices: Vec<usize>,
    base: Vec<f64>,
}

impl Model {
    pub fn new(graph: Graph, target: NodeId, vars: &[NodeId]) -> Result<Self> {
        let var_indices = vars
            .iter()
            .map(|&v| {
                graph.param_index(v).ok_or_else(|| Error::Unknown {
                    kind: "parameter node",
                    name: format!("#{}", v.0),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let base = graph.initial_values();
        Ok(Self {
            graph,
            target,
            var_indices,
            base,
        })
    }

    /// Model over every parameter of the graph, targeting the summed
    /// log-probability terms.
    pub fn from_logp_terms(mut graph: Graph) -> Result<Self> {
        let terms = graph.logp_terms.clone();
        let target = match terms.split_first() {
            Some((&first, rest)) => rest.iter().fold(first, |acc, &t| graph.add(acc, t)),
            None => {
                return Err(Error::InvalidConfig {
                    field: "logp_terms",
                    reason: "graph has no log-probability terms".to_string(),
                })
            }
        };
        let vars: Vec<NodeId> = graph.params.iter().map(|p| p.node).collect();
        Self::new(graph, target, &vars)
    }

    /// Capture the session's current parameter values as the base point.
    pub fn setup(&mut self, session: &Session<'_>) -> Result<()> {
        check_dim(session.values(), self.base.len())?;
        self.base.copy_from_slice(session.values());
        Ok(())
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Values of the wrapped parameters at the base point.
    pub fn current_vector(&self) -> Vec<f64> {
        self.var_indices.iter().map(|&i| self.base[i]).collect()
    }

    fn full_params(&self, vector: &[f64]) -> Result<Vec<f64>> {
        check_dim(vector, self.var_indices.len())?;
        let mut full = self.base.clone();
        for (&i, &v) in self.var_indices.iter().zip(vector) {
            full[i] = v;
        }
        Ok(full)
    }

    pub fn value(&self, vector: &[f64]) -> Result<f64> {
        let full = self.full_params(vector)?;
        let v = autodiff::eval_node(&self.graph, &full, &Feed::new(), self.target)?;
        v.as_scalar().ok_or_else(|| Error::Shape {
            node: self.target.0,
            reason: "model target must be a scalar".to_string(),
        })
    }

    pub fn gradient(&self, vector: &[f64]) -> Result<Vec<f64>> {
        Ok(self.value_and_gradient(vector)?.1)
    }

    pub fn value_and_gradient(&self, vector: &[f64]) -> Result<(f64, Vec<f64>)> {
        let full = self.full_params(vector)?;
        let (value, grad) =
            autodiff::grad_node(&self.graph, &full, &Feed::new(), self.target)?;
        Ok((value, self.var_indices.iter().map(|&i| grad[i]).collect()))
    }

    /// Map a wrapped-parameter vector to constrained values (e.g. `exp` of
    /// a log-scale parameter).
    pub fn constrain(&self, vector: &[f64]) -> Vec<f64> {
        self.var_indices
            .iter()
            .zip(vector)
            .map(|(&i, &v)| self.graph.params[i].transform.constrain(v))
            .collect()
    }
}

impl LogDensity for Model {
    fn dim(&self) -> usize {
        self.var_indices.len()
    }

    fn param_names(&self) -> Vec<String> {
        self.var_indices
            .iter()
            .map(|&i| self.graph.params[i].name.clone())
            .collect()
    }

    fn logp(&self, q: &[f64]) -> Result<f64> {
        self.value(q)
    }

    fn logp_and_grad(&self, q: &[f64]) -> Result<(f64, Vec<f64>)> {
        self.value_and_gradient(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// logp(a, b) = -(a - 1)^2 - 3 (b + 2)^2
    fn quadratic() -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let a = g.add_param("a", 0.0);
        let b = g.add_param("b", 0.0);
        let one = g.add_constant(1.0);
        let two = g.add_constant(2.0);
        let three = g.add_constant(3.0);
        let da = g.sub(a, one);
        let da2 = g.square(da);
        let db = g.add(b, two);
        let db2 = g.square(db);
        let sdb2 = g.mul(three, db2);
        let s = g.add(da2, sdb2);
        let target = g.neg(s);
        (g, target, a, b)
    }

    #[test]
    fn value_and_gradient_on_all_vars() {
        let (g, target, a, b) = quadratic();
        let model = Model::new(g, target, &[a, b]).unwrap();
        assert_eq!(model.dim(), 2);
        assert_eq!(model.value(&[1.0, -2.0]).unwrap(), 0.0);
        let grad = model.gradient(&[0.0, 0.0]).unwrap();
        assert_eq!(grad, vec![2.0, -12.0]);
    }

    #[test]
    fn pinned_vars_come_from_setup() {
        let (g, target, _a, b) = quadratic();
        let sess_graph = g.clone();
        let mut model = Model::new(g, target, &[b]).unwrap();
        assert_eq!(model.current_vector(), vec![0.0]);

        let mut sess = Session::new(&sess_graph);
        sess.assign("a", 3.0).unwrap();
        sess.assign("b", 5.0).unwrap();
        model.setup(&sess).unwrap();
        assert_eq!(model.current_vector(), vec![5.0]);
        // a pinned at 3: -(2)^2 - 3 * 0
        assert_eq!(model.value(&[-2.0]).unwrap(), -4.0);
    }

    #[test]
    fn wrong_vector_length_is_rejected() {
        let (g, target, a, b) = quadratic();
        let model = Model::new(g, target, &[a, b]).unwrap();
        assert!(matches!(
            model.value(&[1.0]),
            Err(Error::Dimension { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn non_parameter_vars_are_rejected() {
        let (g, target, _, _) = quadratic();
        assert!(Model::new(g, target, &[target]).is_err());
    }
}
