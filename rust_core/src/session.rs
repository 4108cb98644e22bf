//! Evaluation context for a graph.
//!
//! A `Session` owns the current value of every parameter, so the same graph
//! can be evaluated at many points, with or without substituted data, and
//! never needs to be rebuilt.

use crate::autodiff::{self, Feed, Value};
use crate::error::{check_dim, Error, Result};
use crate::graph::{Graph, NodeId};

pub struct Session<'g> {
    graph: &'g Graph,
    values: Vec<f64>,
}

impl<'g> Session<'g> {
    /// Open a session with every parameter at its initial value.
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            values: graph.initial_values(),
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Current parameter values, in parameter order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn run(&self, node: NodeId) -> Result<Value> {
        autodiff::eval_node(self.graph, &self.values, &Feed::new(), node)
    }

    /// Evaluate `node` with some nodes' values substituted.
    pub fn run_with(&self, node: NodeId, feed: &Feed) -> Result<Value> {
        autodiff::eval_node(self.graph, &self.values, feed, node)
    }

    /// Evaluate a node that must be scalar.
    pub fn run_scalar(&self, node: NodeId) -> Result<f64> {
        self.run(node)?.as_scalar().ok_or_else(|| Error::Shape {
            node: node.0,
            reason: "expected a scalar".to_string(),
        })
    }

    /// Gradient of a scalar node w.r.t. every parameter at the current values.
    pub fn gradients(&self, node: NodeId) -> Result<Vec<f64>> {
        let (_, grad) = autodiff::grad_node(self.graph, &self.values, &Feed::new(), node)?;
        Ok(grad)
    }

    /// Set one parameter by name.
    pub fn assign(&mut self, name: &str, value: f64) -> Result<()> {
        let idx = self
            .graph
            .params
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| Error::Unknown {
                kind: "parameter",
                name: name.to_string(),
            })?;
        self.values[idx] = value;
        Ok(())
    }

    /// Set every parameter at once.
    pub fn assign_all(&mut self, values: &[f64]) -> Result<()> {
        check_dim(values, self.values.len())?;
        self.values.copy_from_slice(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_graph() -> (Graph, NodeId) {
        let mut g = Graph::new();
        let m = g.add_param("m", 2.0);
        let b = g.add_param("b", 1.0);
        let x = g.add_data("x", vec![0.0, 1.0, 2.0]);
        let mx = g.mul(m, x);
        let line = g.add(mx, b);
        let total = g.sum(line);
        (g, total)
    }

    #[test]
    fn starts_at_initial_values_and_assigns() {
        let (g, total) = line_graph();
        let mut sess = Session::new(&g);
        assert_eq!(sess.values(), &[2.0, 1.0]);
        assert_eq!(sess.run_scalar(total).unwrap(), 9.0);

        sess.assign("b", 0.0).unwrap();
        assert_eq!(sess.run_scalar(total).unwrap(), 6.0);
        assert_eq!(sess.gradients(total).unwrap(), vec![3.0, 3.0]);

        assert!(sess.assign("nope", 1.0).is_err());
        assert!(sess.assign_all(&[1.0]).is_err());
    }

    #[test]
    fn run_with_feed_leaves_session_untouched() {
        let (g, total) = line_graph();
        let sess = Session::new(&g);
        let x = g.node_by_name("x").unwrap();
        let feed = Feed::new().with(x, Value::Vector(vec![1.0]));
        assert_eq!(sess.run_with(total, &feed).unwrap(), Value::Scalar(3.0));
        assert_eq!(sess.run_scalar(total).unwrap(), 9.0);
    }
}
