use std::collections::HashMap;

/// Position of a node in [`Graph::nodes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// How a free parameter maps to the quantity the model talks about.
///
/// The sampler always works on the raw, unconstrained value; the transform
/// only matters when reporting results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamTransform {
    Identity,
    /// Raw value is the log of a positive quantity.
    Exp,
}

impl ParamTransform {
    pub fn constrain(&self, raw: f64) -> f64 {
        match self {
            ParamTransform::Identity => raw,
            ParamTransform::Exp => raw.exp(),
        }
    }
}

/// What a node computes.
///
/// Binary arithmetic broadcasts: scalar ⊕ scalar is a scalar, anything
/// involving a vector is a vector of the vector's length.
#[derive(Debug, Clone)]
pub enum Op {
    /// A free parameter (index into the parameter vector).
    Param(usize),
    /// A constant scalar value baked into the graph.
    Constant(f64),
    /// A data vector (index into the data table). Can be replaced through a
    /// feed or `Graph::set_data` without touching the graph structure.
    Data(usize),
    Add(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Div(NodeId, NodeId),
    Neg(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Square(NodeId),
    /// Sum of a vector's elements (identity on scalars).
    Sum(NodeId),
    /// Log-probability of a Normal distribution: logp(x | mu, sigma).
    NormalLogP {
        x: NodeId,
        mu: NodeId,
        sigma: NodeId,
    },
    /// `value` where `scale > 0`, `-inf` elsewhere. Marks the support of a
    /// density in a positive parameter.
    RequirePositive { value: NodeId, scale: NodeId },
    /// Sum-of-log-probabilities of an observed data vector under
    /// Normal(mu_vec, sigma).
    NormalObsLogP {
        mu_vec: NodeId,
        sigma: NodeId,
        obs: NodeId,
    },
}

impl Op {
    /// Nodes this op reads from.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Op::Param(_) | Op::Constant(_) | Op::Data(_) => Vec::new(),
            Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) | Op::Div(a, b) => vec![*a, *b],
            Op::Neg(a) | Op::Exp(a) | Op::Log(a) | Op::Square(a) | Op::Sum(a) => vec![*a],
            Op::NormalLogP { x, mu, sigma } => vec![*x, *mu, *sigma],
            Op::NormalObsLogP { mu_vec, sigma, obs } => vec![*mu_vec, *sigma, *obs],
            Op::RequirePositive { value, scale } => vec![*value, *scale],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub name: Option<String>,
}

/// Metadata for one free parameter.
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: String,
    pub node: NodeId,
    pub init: f64,
    pub transform: ParamTransform,
}

/// Symbolic log-density of a model.
///
/// A node may only refer to nodes pushed before it, so `nodes` is always in
/// evaluation order. Data vectors sit in their own table and can be replaced
/// without touching the node list.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub params: Vec<ParamInfo>,
    pub data_vectors: Vec<Vec<f64>>,
    pub logp_terms: Vec<NodeId>,
    names: HashMap<String, NodeId>,
}

macro_rules! binary_builders {
    ($($(#[$doc:meta])* $method:ident => $variant:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $method(&mut self, a: NodeId, b: NodeId) -> NodeId {
                self.push(Op::$variant(a, b), None)
            }
        )*
    };
}

macro_rules! unary_builders {
    ($($(#[$doc:meta])* $method:ident => $variant:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $method(&mut self, a: NodeId) -> NodeId {
                self.push(Op::$variant(a), None)
            }
        )*
    };
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            params: Vec::new(),
            data_vectors: Vec::new(),
            logp_terms: Vec::new(),
            names: HashMap::new(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn param_names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }

    /// Initial values of every parameter, in parameter order.
    pub fn initial_values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.init).collect()
    }

    /// Index of the parameter behind `node`, if it is a parameter node.
    pub fn param_index(&self, node: NodeId) -> Option<usize> {
        match self.nodes.get(node.0).map(|n| &n.op) {
            Some(Op::Param(idx)) => Some(*idx),
            _ => None,
        }
    }

    fn push(&mut self, op: Op, name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(label) = &name {
            self.names.insert(label.clone(), id);
        }
        self.nodes.push(Node { id, op, name });
        id
    }

    pub fn add_param(&mut self, name: &str, init: f64) -> NodeId {
        self.add_param_with_transform(name, init, ParamTransform::Identity)
    }

    pub fn add_param_with_transform(
        &mut self,
        name: &str,
        init: f64,
        transform: ParamTransform,
    ) -> NodeId {
        let idx = self.params.len();
        let node = self.push(Op::Param(idx), Some(name.to_string()));
        self.params.push(ParamInfo {
            name: name.to_string(),
            node,
            init,
            transform,
        });
        node
    }

    pub fn add_constant(&mut self, value: f64) -> NodeId {
        self.push(Op::Constant(value), None)
    }

    pub fn add_data(&mut self, name: &str, values: Vec<f64>) -> NodeId {
        let idx = self.data_vectors.len();
        self.data_vectors.push(values);
        self.push(Op::Data(idx), Some(name.to_string()))
    }

    /// Replace the contents of a data node in place.
    pub fn set_data(&mut self, node: NodeId, values: Vec<f64>) -> Option<Vec<f64>> {
        match self.nodes.get(node.0).map(|n| &n.op) {
            Some(Op::Data(idx)) => Some(std::mem::replace(&mut self.data_vectors[*idx], values)),
            _ => None,
        }
    }

    binary_builders! {
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
    }

    unary_builders! {
        neg => Neg,
        exp => Exp,
        log => Log,
        square => Square,
        /// Sum over the elements of a vector node.
        sum => Sum,
    }

    pub fn normal_logp(&mut self, x: NodeId, mu: NodeId, sigma: NodeId) -> NodeId {
        self.push(Op::NormalLogP { x, mu, sigma }, None)
    }

    pub fn normal_obs_logp(&mut self, mu_vec: NodeId, sigma: NodeId, obs: NodeId) -> NodeId {
        self.push(Op::NormalObsLogP { mu_vec, sigma, obs }, None)
    }

    pub fn require_positive(&mut self, value: NodeId, scale: NodeId) -> NodeId {
        self.push(Op::RequirePositive { value, scale }, None)
    }

    /// Mark an existing scalar node as a term of the total log-probability.
    pub fn add_logp_term(&mut self, node: NodeId) {
        self.logp_terms.push(node);
    }

    /// Attach a name to an existing node so it can be found later.
    pub fn set_name(&mut self, node: NodeId, name: &str) {
        self.names.insert(name.to_string(), node);
        if let Some(n) = self.nodes.get_mut(node.0) {
            n.name = Some(name.to_string());
        }
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_keep_order_and_metadata() {
        let mut g = Graph::new();
        let m = g.add_param("m", 0.5);
        let log_s = g.add_param_with_transform("log_s", -2.0, ParamTransform::Exp);
        assert_eq!(g.param_count(), 2);
        assert_eq!(g.param_names(), vec!["m".to_string(), "log_s".to_string()]);
        assert_eq!(g.initial_values(), vec![0.5, -2.0]);
        assert_eq!(g.param_index(m), Some(0));
        assert_eq!(g.param_index(log_s), Some(1));
        assert_eq!(g.node_by_name("log_s"), Some(log_s));
        assert!((g.params[1].transform.constrain(-2.0) - (-2.0f64).exp()).abs() < 1e-15);
    }

    #[test]
    fn set_data_only_touches_data_nodes() {
        let mut g = Graph::new();
        let x = g.add_data("x", vec![1.0, 2.0]);
        let c = g.add_constant(3.0);
        assert_eq!(g.set_data(x, vec![4.0]), Some(vec![1.0, 2.0]));
        assert_eq!(g.data_vectors[0], vec![4.0]);
        assert!(g.set_data(c, vec![0.0]).is_none());
    }
}
