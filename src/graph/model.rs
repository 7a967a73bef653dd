// Tensor graph seen by the tokenizer. Nodes live in an arena addressed by NodeId; a removed
// node leaves an empty slot so ids held elsewhere never alias a different node. Edges are
// stored on the consumer side only (each input names the producing output), consumers are
// found by scanning. Output shapes are inferred when a node is added through `add`, with
// partial shapes: a rank may be unknown and individual dimensions may be dynamic.

//! Graph model for tokenization.

use hashbrown::{HashMap, HashSet};

use crate::core::dims::{broadcast_merge_into, format_dims, DYNAMIC_DIMENSION};
use crate::core::{ElementType, Result, SnippetsError, VectorDims};
use crate::op::{EltwiseKind, ReduceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One output of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Output {
    pub node: NodeId,
    pub index: usize,
}

impl Output {
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialShape {
    DynamicRank,
    Ranked(VectorDims),
}

impl PartialShape {
    pub fn rank(&self) -> Option<usize> {
        self.dims().map(<[usize]>::len)
    }

    pub fn dims(&self) -> Option<&[usize]> {
        match self {
            PartialShape::DynamicRank => None,
            PartialShape::Ranked(dims) => Some(dims),
        }
    }

    /// Known rank and every dimension known.
    pub fn is_static(&self) -> bool {
        self.dims().is_some_and(|d| !crate::core::dims::is_dynamic_shape(d))
    }
}

impl From<VectorDims> for PartialShape {
    fn from(dims: VectorDims) -> Self {
        PartialShape::Ranked(dims)
    }
}

impl std::fmt::Display for PartialShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartialShape::DynamicRank => f.write_str("[...]"),
            PartialShape::Ranked(dims) => f.write_str(&format_dims(dims)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub shape: PartialShape,
    pub element_type: ElementType,
}

impl TensorDesc {
    pub fn new(shape: impl Into<PartialShape>, element_type: ElementType) -> Self {
        Self { shape: shape.into(), element_type }
    }
}

/// Broadcast rule of an element-wise node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoBroadcast {
    None,
    #[default]
    Numpy,
    Pdpd,
}

/// Marker the plugin and the tokenizer leave on nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnippetsNodeType {
    #[default]
    NotSet,
    /// The plugin executes this node itself; the element-wise tokenizer leaves it alone.
    SkippedByPlugin,
    /// Member of tokenized cluster `n`.
    SubgraphBody(usize),
}

#[derive(Debug, Clone)]
pub enum NodeOp {
    Parameter,
    Constant(Vec<f32>),
    Result,
    Eltwise(EltwiseKind),
    Select,
    /// Element type conversion to the node's output type.
    Convert,
    FakeQuantize { levels: usize },
    Softmax { axis: i64 },
    MatMul { transpose_a: bool, transpose_b: bool },
    Transpose { order: Vec<usize> },
    Reshape,
    Broadcast { numpy: bool },
    Reduce { kind: ReduceKind, axes: Vec<i64>, keep_dims: bool },
    Loop,
    /// Fused cluster; body parameters follow the node inputs, body results its outputs.
    Subgraph(Box<Model>),
    Other(String),
}

impl NodeOp {
    pub fn type_name(&self) -> &str {
        match self {
            NodeOp::Parameter => "Parameter",
            NodeOp::Constant(_) => "Constant",
            NodeOp::Result => "Result",
            NodeOp::Eltwise(kind) => kind.name(),
            NodeOp::Select => "Select",
            NodeOp::Convert => "Convert",
            NodeOp::FakeQuantize { .. } => "FakeQuantize",
            NodeOp::Softmax { .. } => "Softmax",
            NodeOp::MatMul { .. } => "MatMul",
            NodeOp::Transpose { .. } => "Transpose",
            NodeOp::Reshape => "Reshape",
            NodeOp::Broadcast { .. } => "Broadcast",
            NodeOp::Reduce { kind: ReduceKind::Max, .. } => "ReduceMax",
            NodeOp::Reduce { kind: ReduceKind::Sum, .. } => "ReduceSum",
            NodeOp::Loop => "Loop",
            NodeOp::Subgraph(_) => "Subgraph",
            NodeOp::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: NodeOp,
    pub inputs: Vec<Output>,
    pub outputs: Vec<TensorDesc>,
    pub control_deps: Vec<NodeId>,
    pub autob: AutoBroadcast,
    pub node_type: SnippetsNodeType,
}

/// Normalize a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&axis).then_some(axis as usize)
}

fn infer_error(op: &NodeOp, reason: impl std::fmt::Display) -> SnippetsError {
    SnippetsError::structure(format!("{}: {reason}", op.type_name()))
}

/// Output descriptors of `op` applied to `inputs`.
fn infer(op: &NodeOp, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>> {
    let first = inputs.first().ok_or_else(|| infer_error(op, "needs an input"))?;
    let same = || Ok(vec![first.clone()]);
    match op {
        NodeOp::Eltwise(_) | NodeOp::Select => {
            // Select takes its type from the value inputs.
            let et = if matches!(op, NodeOp::Select) && inputs.len() == 3 { inputs[1].element_type } else { first.element_type };
            let mut dims: VectorDims = Vec::new();
            for input in inputs {
                let Some(d) = input.shape.dims() else {
                    return Ok(vec![TensorDesc::new(PartialShape::DynamicRank, et)]);
                };
                if !broadcast_merge_into(&mut dims, d) {
                    return Err(infer_error(op, "inputs are not broadcastable"));
                }
            }
            Ok(vec![TensorDesc::new(dims, et)])
        }
        NodeOp::Convert | NodeOp::FakeQuantize { .. } | NodeOp::Softmax { .. } | NodeOp::Broadcast { .. } | NodeOp::Loop => same(),
        NodeOp::Transpose { order } => match first.shape.dims() {
            Some(d) if d.len() == order.len() && order.iter().all(|&o| o < d.len()) => {
                Ok(vec![TensorDesc::new(order.iter().map(|&o| d[o]).collect::<VectorDims>(), first.element_type)])
            }
            Some(_) => Err(infer_error(op, "order does not match the input rank")),
            None => same(),
        },
        NodeOp::Reduce { axes, keep_dims, .. } => match first.shape.dims() {
            Some(d) => {
                let mut reduced = Vec::new();
                for (i, &dim) in d.iter().enumerate() {
                    let hit = axes.iter().any(|&a| normalize_axis(a, d.len()) == Some(i));
                    match (hit, keep_dims) {
                        (true, true) => reduced.push(1),
                        (true, false) => {}
                        (false, _) => reduced.push(dim),
                    }
                }
                Ok(vec![TensorDesc::new(reduced, first.element_type)])
            }
            None => same(),
        },
        NodeOp::MatMul { transpose_a, transpose_b } => {
            let b = inputs.get(1).ok_or_else(|| infer_error(op, "needs two inputs"))?;
            let et = if first.element_type.is_real() { ElementType::F32 } else { ElementType::I32 };
            let (Some(a_dims), Some(b_dims)) = (first.shape.dims(), b.shape.dims()) else {
                return Ok(vec![TensorDesc::new(PartialShape::DynamicRank, et)]);
            };
            if a_dims.len() < 2 || b_dims.len() < 2 {
                return Err(infer_error(op, "inputs below rank 2"));
            }
            let (ra, rb) = (a_dims.len(), b_dims.len());
            let m = if *transpose_a { a_dims[ra - 1] } else { a_dims[ra - 2] };
            let n = if *transpose_b { b_dims[rb - 2] } else { b_dims[rb - 1] };
            let mut dims = a_dims[..ra - 2].to_vec();
            if !broadcast_merge_into(&mut dims, &b_dims[..rb - 2]) {
                return Err(infer_error(op, "batch dimensions are not broadcastable"));
            }
            dims.push(m);
            dims.push(n);
            Ok(vec![TensorDesc::new(dims, et)])
        }
        NodeOp::Parameter | NodeOp::Constant(_) | NodeOp::Result | NodeOp::Reshape | NodeOp::Subgraph(_) | NodeOp::Other(_) => {
            Err(infer_error(op, "output shape must be given explicitly"))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Model {
    nodes: Vec<Option<Node>>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node with explicit output descriptors.
    pub fn add_node(&mut self, name: impl Into<String>, op: NodeOp, inputs: Vec<Output>, outputs: Vec<TensorDesc>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(Node {
            name: name.into(),
            op,
            inputs,
            outputs,
            control_deps: Vec::new(),
            autob: AutoBroadcast::default(),
            node_type: SnippetsNodeType::default(),
        }));
        id
    }

    pub fn parameter(&mut self, shape: impl Into<PartialShape>, element_type: ElementType) -> Output {
        let name = format!("param{}", self.parameters().len());
        let id = self.add_node(name, NodeOp::Parameter, vec![], vec![TensorDesc::new(shape, element_type)]);
        Output::new(id, 0)
    }

    pub fn constant(&mut self, shape: VectorDims, values: Vec<f32>) -> Output {
        let name = format!("const{}", self.nodes.len());
        let id = self.add_node(name, NodeOp::Constant(values), vec![], vec![TensorDesc::new(shape, ElementType::F32)]);
        Output::new(id, 0)
    }

    /// Add a node whose outputs are inferred from its inputs.
    pub fn add(&mut self, op: NodeOp, inputs: &[Output]) -> Result<Output> {
        let descs = inputs.iter().map(|&o| self.output_desc(o).cloned()).collect::<Result<Vec<_>>>()?;
        let outputs = infer(&op, &descs)?;
        let name = format!("{}{}", op.type_name(), self.nodes.len());
        let id = self.add_node(name, op, inputs.to_vec(), outputs);
        Ok(Output::new(id, 0))
    }

    /// Element type conversion of `input`.
    pub fn convert(&mut self, input: Output, to: ElementType) -> Result<Output> {
        let out = self.add(NodeOp::Convert, &[input])?;
        self.node_mut(out.node)?.outputs[0].element_type = to;
        Ok(out)
    }

    /// Reshape to a target shape with the same number of elements.
    pub fn reshape(&mut self, input: Output, shape: VectorDims) -> Result<Output> {
        let desc = self.output_desc(input)?.clone();
        let id = self.add_node(
            format!("Reshape{}", self.nodes.len()),
            NodeOp::Reshape,
            vec![input],
            vec![TensorDesc::new(shape, desc.element_type)],
        );
        Ok(Output::new(id, 0))
    }

    pub fn result(&mut self, input: Output) -> Result<NodeId> {
        self.output_desc(input)?;
        let name = format!("result{}", self.results().len());
        Ok(self.add_node(name, NodeOp::Result, vec![input], vec![]))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).is_some_and(Option::is_some)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| SnippetsError::structure(format!("node #{} does not exist", id.0)))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| SnippetsError::structure(format!("node #{} does not exist", id.0)))
    }

    pub fn output_desc(&self, out: Output) -> Result<&TensorDesc> {
        let node = self.node(out.node)?;
        node.outputs
            .get(out.index)
            .ok_or_else(|| SnippetsError::structure(format!("{} has no output {}", node.name, out.index)))
    }

    /// Live nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i), n)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.nodes.get_mut(id.0).and_then(Option::take)
    }

    /// Consumers of `out` as (node, input index).
    pub fn consumers(&self, out: Output) -> Vec<(NodeId, usize)> {
        let mut found = Vec::new();
        for (id, node) in self.iter() {
            for (i, input) in node.inputs.iter().enumerate() {
                if *input == out {
                    found.push((id, i));
                }
            }
        }
        found
    }

    /// Distinct consumer nodes of any output of `id`.
    pub fn consumer_nodes(&self, id: NodeId) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| n.inputs.iter().any(|o| o.node == id))
            .map(|(c, _)| c)
            .collect()
    }

    fn nodes_of(&self, pred: impl Fn(&NodeOp) -> bool) -> Vec<NodeId> {
        self.iter().filter(|(_, n)| pred(&n.op)).map(|(id, _)| id).collect()
    }

    pub fn parameters(&self) -> Vec<NodeId> {
        self.nodes_of(|op| matches!(op, NodeOp::Parameter))
    }

    pub fn results(&self) -> Vec<NodeId> {
        self.nodes_of(|op| matches!(op, NodeOp::Result))
    }

    pub fn subgraphs(&self) -> Vec<NodeId> {
        self.nodes_of(|op| matches!(op, NodeOp::Subgraph(_)))
    }

    /// Producers before consumers; ties keep insertion order.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut pending: HashMap<NodeId, usize> = HashMap::new();
        let mut users: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (id, node) in self.iter() {
            let mut preds: Vec<NodeId> = node.inputs.iter().map(|o| o.node).chain(node.control_deps.iter().copied()).collect();
            preds.sort_unstable();
            preds.dedup();
            pending.insert(id, preds.len());
            for p in preds {
                users.entry(p).or_default().push(id);
            }
        }
        let mut ready: std::collections::BTreeSet<NodeId> =
            pending.iter().filter(|(_, &n)| n == 0).map(|(&id, _)| id).collect();
        let mut order = Vec::with_capacity(pending.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &user in users.get(&id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(count) = pending.get_mut(&user) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(user);
                    }
                }
            }
        }
        if order.len() != pending.len() {
            return Err(SnippetsError::structure("graph contains a cycle or a dangling input"));
        }
        Ok(order)
    }

    /// Whether `id` transitively consumes any node of `targets`.
    pub fn depends_on(&self, id: NodeId, targets: &HashSet<NodeId>) -> bool {
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if targets.contains(&current) {
                return true;
            }
            if let Ok(node) = self.node(current) {
                stack.extend(node.inputs.iter().map(|o| o.node));
                stack.extend(node.control_deps.iter().copied());
            }
        }
        false
    }

    /// Scalar constant value, if `out` is produced by a one-element constant.
    pub fn scalar_constant(&self, out: Output) -> Option<f32> {
        match &self.node(out.node).ok()?.op {
            NodeOp::Constant(values) if values.len() == 1 => Some(values[0]),
            _ => None,
        }
    }

    pub fn is_constant(&self, out: Output) -> bool {
        matches!(self.node(out.node).map(|n| &n.op), Ok(NodeOp::Constant(_)))
    }
}

/// Convenience for building shapes with unknown dimensions in tests and tools.
pub const DYNAMIC: usize = DYNAMIC_DIMENSION;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_and_topological_order() {
        let mut model = Model::new();
        let a = model.parameter(vec![2, 1, 16], ElementType::F32);
        let b = model.parameter(vec![3, 16], ElementType::F32);
        let add = model.add(NodeOp::Eltwise(EltwiseKind::Add), &[a, b]).unwrap();
        let t = model.add(NodeOp::Transpose { order: vec![0, 2, 1] }, &[add]).unwrap();
        let r = model.result(t).unwrap();
        assert_eq!(model.output_desc(add).unwrap().shape, PartialShape::Ranked(vec![2, 3, 16]));
        assert_eq!(model.output_desc(t).unwrap().shape, PartialShape::Ranked(vec![2, 16, 3]));

        let order = model.topological_order().unwrap();
        assert_eq!(order.first(), Some(&a.node));
        assert_eq!(order.last(), Some(&r));
        assert_eq!(model.consumers(add), vec![(t.node, 0)]);
    }

    #[test]
    fn test_matmul_and_reduce_inference() {
        let mut model = Model::new();
        let a = model.parameter(vec![1, 4, 8, 16], ElementType::I8);
        let b = model.parameter(vec![1, 4, 32, 16], ElementType::I8);
        let mm = model
            .add(NodeOp::MatMul { transpose_a: false, transpose_b: true }, &[a, b])
            .unwrap();
        let desc = model.output_desc(mm).unwrap();
        assert_eq!(desc.shape, PartialShape::Ranked(vec![1, 4, 8, 32]));
        assert_eq!(desc.element_type, ElementType::I32);

        let x = model.parameter(vec![2, 5], ElementType::F32);
        let keep = model
            .add(NodeOp::Reduce { kind: ReduceKind::Sum, axes: vec![-1], keep_dims: true }, &[x])
            .unwrap();
        assert_eq!(model.output_desc(keep).unwrap().shape, PartialShape::Ranked(vec![2, 1]));
    }

    #[test]
    fn test_depends_on_follows_inputs() {
        let mut model = Model::new();
        let a = model.parameter(vec![4], ElementType::F32);
        let relu = model.add(NodeOp::Eltwise(EltwiseKind::Relu), &[a]).unwrap();
        let abs = model.add(NodeOp::Eltwise(EltwiseKind::Abs), &[relu]).unwrap();
        let targets: HashSet<NodeId> = [relu.node].into_iter().collect();
        assert!(model.depends_on(abs.node, &targets));
        assert!(!model.depends_on(a.node, &targets));
        model.remove(abs.node);
        assert!(!model.contains(abs.node));
        assert!(model.node(abs.node).is_err());
    }

    #[test]
    fn test_unknown_rank_propagates() {
        let mut model = Model::new();
        let a = model.parameter(PartialShape::DynamicRank, ElementType::F32);
        let b = model.parameter(vec![DYNAMIC, 8], ElementType::F32);
        let add = model.add(NodeOp::Eltwise(EltwiseKind::Add), &[a, b]).unwrap();
        assert_eq!(model.output_desc(add).unwrap().shape.rank(), None);
        assert_eq!(model.output_desc(b).unwrap().shape.rank(), Some(2));
        assert!(!model.output_desc(b).unwrap().shape.is_static());
    }
}
