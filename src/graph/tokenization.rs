// Tokenization decides which graph nodes fuse into one compiled subgraph. The passes mark
// nodes as members of clusters instead of rewriting the graph as they go; `collapse` then
// replaces every cluster by a single Subgraph node whose body holds the member nodes, with
// one body parameter per distinct outside producer and one body result per member output
// used outside. Scalar constants are copied into the body instead of becoming parameters.
//
// The element-wise tokenizer visits nodes in topological order. An appropriate node joins
// the open clusters of its producers when the merged cluster stays acyclic and within the
// data-pointer budget of the kernel ABI, and starts a cluster of its own otherwise.
// Clusters created by the MHA tokenizer are completed and never grow.

//! Tokenization: node predicates, the element-wise tokenizer and cluster collapsing.

use hashbrown::{HashMap, HashSet};
use log::{debug, trace};

use crate::core::{Result, SUPPORTED_ELEMENT_TYPES};

use super::fc::TokenizeFCSnippets;
use super::mha::TokenizeMHASnippets;
use super::model::{normalize_axis, AutoBroadcast, Model, NodeId, NodeOp, Output, SnippetsNodeType};

/// Knobs of the tokenization pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizationConfig {
    /// Threads the compiled subgraphs will run on.
    pub concurrency: usize,
    /// General-purpose registers available for io and buffer pointers.
    pub data_ptr_gpr_count: usize,
    /// Allow MHA subgraphs whose batch is below the thread count when M can be split.
    pub split_m_dimension: bool,
    /// Accept Transpose3 after the second MHA matmul.
    pub enable_transpose_on_output: bool,
    pub fc_tokenization: bool,
}

impl Default for TokenizationConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            data_ptr_gpr_count: 12,
            split_m_dimension: true,
            enable_transpose_on_output: true,
            fc_tokenization: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cluster {
    pub nodes: Vec<NodeId>,
    /// Completed clusters accept no further members.
    pub completed: bool,
}

/// Cluster bookkeeping shared by the tokenization passes.
#[derive(Debug, Default)]
pub struct Clusters {
    clusters: Vec<Option<Cluster>>,
}

impl Clusters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, model: &mut Model, nodes: Vec<NodeId>, completed: bool) -> Result<usize> {
        let index = self.clusters.len();
        for &id in &nodes {
            model.node_mut(id)?.node_type = SnippetsNodeType::SubgraphBody(index);
        }
        self.clusters.push(Some(Cluster { nodes, completed }));
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Option<&Cluster> {
        self.clusters.get(index).and_then(Option::as_ref)
    }

    pub fn cluster_of(model: &Model, id: NodeId) -> Option<usize> {
        match model.node(id).ok()?.node_type {
            SnippetsNodeType::SubgraphBody(index) => Some(index),
            _ => None,
        }
    }

    /// Move every member of `from` into `into` and add `extra`.
    fn merge(&mut self, model: &mut Model, into: usize, from: &[usize], extra: NodeId) -> Result<()> {
        let mut moved = Vec::new();
        for &index in from {
            if let Some(cluster) = self.clusters.get_mut(index).and_then(Option::take) {
                moved.extend(cluster.nodes);
            }
        }
        moved.push(extra);
        for &id in &moved {
            model.node_mut(id)?.node_type = SnippetsNodeType::SubgraphBody(into);
        }
        if let Some(Some(cluster)) = self.clusters.get_mut(into) {
            cluster.nodes.extend(moved);
        }
        Ok(())
    }

    /// Live clusters with their index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Cluster)> {
        self.clusters
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i, c)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Graph-level pass over a model and the clusters found so far.
pub trait TokenizationPass {
    fn name(&self) -> &'static str;

    /// Returns whether any cluster was created or grown.
    fn run(&self, model: &mut Model, clusters: &mut Clusters) -> Result<bool>;
}

// ==== NODE PREDICATES ====

pub fn is_supported_matmul(model: &Model, id: NodeId) -> bool {
    let Ok(node) = model.node(id) else {
        return false;
    };
    if !matches!(node.op, NodeOp::MatMul { .. }) || node.inputs.len() != 2 {
        return false;
    }
    if node.outputs.first().and_then(|d| d.shape.rank()) != Some(4) {
        return false;
    }
    let types: Option<Vec<_>> = node
        .inputs
        .iter()
        .map(|&o| model.output_desc(o).ok().map(|d| d.element_type))
        .collect();
    use crate::core::ElementType::*;
    matches!(types.as_deref(), Some([F32, F32] | [Bf16, Bf16] | [U8 | I8, I8]))
}

/// Orders a standalone transpose is decomposed into loads for.
const DECOMPOSED_TRANSPOSE_ORDERS: [[usize; 4]; 1] = [[0, 2, 3, 1]];
/// Orders fused into the memory descriptors of an adjacent matmul.
const MATMUL_INPUT_TRANSPOSE_ORDERS: [[usize; 4]; 2] = [[0, 2, 1, 3], [0, 1, 3, 2]];
const MATMUL_OUTPUT_TRANSPOSE_ORDERS: [[usize; 4]; 1] = [[0, 2, 1, 3]];

pub fn is_supported_transpose(model: &Model, id: NodeId) -> bool {
    let Ok(node) = model.node(id) else {
        return false;
    };
    let NodeOp::Transpose { order } = &node.op else {
        return false;
    };
    let feeds_matmul = model
        .consumer_nodes(id)
        .iter()
        .any(|&c| matches!(model.node(c).map(|n| &n.op), Ok(NodeOp::MatMul { .. })));
    let after_matmul = node
        .inputs
        .first()
        .is_some_and(|o| matches!(model.node(o.node).map(|n| &n.op), Ok(NodeOp::MatMul { .. })));
    DECOMPOSED_TRANSPOSE_ORDERS.iter().any(|o| o[..] == order[..])
        || (feeds_matmul && MATMUL_INPUT_TRANSPOSE_ORDERS.iter().any(|o| o[..] == order[..]))
        || (after_matmul && MATMUL_OUTPUT_TRANSPOSE_ORDERS.iter().any(|o| o[..] == order[..]))
}

fn input_rank(model: &Model, id: NodeId, index: usize) -> Option<usize> {
    let node = model.node(id).ok()?;
    model.output_desc(*node.inputs.get(index)?).ok()?.shape.rank()
}

pub fn is_supported_op(model: &Model, id: NodeId) -> bool {
    let Ok(node) = model.node(id) else {
        return false;
    };
    match &node.op {
        NodeOp::Eltwise(kind) => node.inputs.len() == kind.arity(),
        NodeOp::Select => node.inputs.len() == 3,
        NodeOp::Convert => node.inputs.len() == 1,
        NodeOp::FakeQuantize { levels } => {
            *levels > 1 && node.inputs.len() == 5 && node.inputs[1..].iter().all(|&o| model.is_constant(o))
        }
        NodeOp::Softmax { axis } => {
            node.inputs.len() == 1
                && input_rank(model, id, 0).is_some_and(|rank| normalize_axis(*axis, rank) == Some(rank - 1))
        }
        NodeOp::MatMul { .. } => is_supported_matmul(model, id),
        NodeOp::Transpose { .. } => is_supported_transpose(model, id),
        NodeOp::Broadcast { numpy } => *numpy,
        NodeOp::Reduce { axes, keep_dims, .. } => {
            *keep_dims
                && axes.len() == 1
                && input_rank(model, id, 0).is_some_and(|rank| normalize_axis(axes[0], rank) == Some(rank - 1))
        }
        _ => false,
    }
}

/// Every input and output has a known rank and no output feeds a Loop.
pub fn has_supported_in_out(model: &Model, id: NodeId) -> bool {
    let Ok(node) = model.node(id) else {
        return false;
    };
    let feeds_loop = model
        .consumer_nodes(id)
        .iter()
        .any(|&c| matches!(model.node(c).map(|n| &n.op), Ok(NodeOp::Loop)));
    if feeds_loop {
        return false;
    }
    let inputs_ranked = node
        .inputs
        .iter()
        .all(|&o| model.output_desc(o).is_ok_and(|d| d.shape.rank().is_some()));
    inputs_ranked && node.outputs.iter().all(|d| d.shape.rank().is_some())
}

fn check_broadcast(model: &Model, id: NodeId) -> bool {
    model
        .node(id)
        .is_ok_and(|n| matches!(n.autob, AutoBroadcast::None | AutoBroadcast::Numpy))
}

pub fn appropriate_for_subgraph(model: &Model, id: NodeId) -> bool {
    is_supported_op(model, id)
        && has_supported_in_out(model, id)
        && model.node(id).is_ok_and(|n| n.control_deps.is_empty())
        && check_broadcast(model, id)
}

// ==== ELEMENT-WISE TOKENIZER ====

pub struct TokenizeSnippets<'a> {
    config: &'a TokenizationConfig,
}

impl<'a> TokenizeSnippets<'a> {
    pub fn new(config: &'a TokenizationConfig) -> Self {
        Self { config }
    }

    fn eligible(model: &Model, id: NodeId) -> bool {
        let Ok(node) = model.node(id) else {
            return false;
        };
        let skipped = match node.node_type {
            SnippetsNodeType::NotSet => false,
            SnippetsNodeType::SkippedByPlugin => !matches!(node.op, NodeOp::MatMul { .. } | NodeOp::Transpose { .. }),
            SnippetsNodeType::SubgraphBody(_) => true,
        };
        let types_ok = matches!(node.op, NodeOp::Convert)
            || node.outputs.iter().all(|d| SUPPORTED_ELEMENT_TYPES.contains(&d.element_type));
        !skipped && types_ok && appropriate_for_subgraph(model, id)
    }

    /// Pointer arguments a kernel for `members` would take.
    pub(crate) fn data_ptr_count(model: &Model, members: &HashSet<NodeId>) -> usize {
        let mut inputs: HashSet<Output> = HashSet::new();
        let mut outputs: HashSet<Output> = HashSet::new();
        for &id in members {
            let Ok(node) = model.node(id) else {
                continue;
            };
            for &input in &node.inputs {
                if !members.contains(&input.node) && model.scalar_constant(input).is_none() {
                    inputs.insert(input);
                }
            }
            for index in 0..node.outputs.len() {
                let out = Output::new(id, index);
                if model.consumers(out).iter().any(|(c, _)| !members.contains(c)) {
                    outputs.insert(out);
                }
            }
        }
        // A node without consumers yet still produces one subgraph output.
        inputs.len() + outputs.len().max(1)
    }

    /// Some outside producer of `members` depends on a member: merging would form a cycle.
    fn creates_cycle(model: &Model, members: &HashSet<NodeId>) -> bool {
        members.iter().any(|&id| {
            model.node(id).is_ok_and(|node| {
                node.inputs
                    .iter()
                    .filter(|o| !members.contains(&o.node))
                    .any(|o| model.depends_on(o.node, members))
            })
        })
    }
}

impl TokenizationPass for TokenizeSnippets<'_> {
    fn name(&self) -> &'static str {
        "TokenizeSnippets"
    }

    fn run(&self, model: &mut Model, clusters: &mut Clusters) -> Result<bool> {
        let mut changed = false;
        for id in model.topological_order()? {
            if !Self::eligible(model, id) {
                continue;
            }
            let node = model.node(id)?;
            let mut open: Vec<usize> = node
                .inputs
                .iter()
                .filter_map(|o| Clusters::cluster_of(model, o.node))
                .filter(|&c| clusters.get(c).is_some_and(|c| !c.completed))
                .collect();
            open.sort_unstable();
            open.dedup();

            if let Some((&into, others)) = open.split_first() {
                let mut members: HashSet<NodeId> = open
                    .iter()
                    .filter_map(|&c| clusters.get(c))
                    .flat_map(|c| c.nodes.iter().copied())
                    .collect();
                members.insert(id);
                let cyclic = Self::creates_cycle(model, &members);
                let budget = Self::data_ptr_count(model, &members) <= self.config.data_ptr_gpr_count;
                if !cyclic && budget {
                    trace!("{} joins cluster {into} (+{:?})", model.node(id)?.name, others);
                    clusters.merge(model, into, others, id)?;
                    changed = true;
                    continue;
                }
                debug!(
                    "{} starts a new cluster: {}",
                    model.node(id)?.name,
                    if cyclic { "merge would create a cycle" } else { "data pointer budget exceeded" }
                );
            }
            clusters.create(model, vec![id], false)?;
            changed = true;
        }
        Ok(changed)
    }
}

// ==== COLLAPSE ====

/// Replace every cluster by a Subgraph node and return the new nodes.
pub fn collapse(model: &mut Model, clusters: &Clusters) -> Result<Vec<NodeId>> {
    let order = model.topological_order()?;
    let position: HashMap<NodeId, usize> = order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let mut created = Vec::new();

    for (index, cluster) in clusters.iter() {
        let members: HashSet<NodeId> = cluster.nodes.iter().copied().collect();
        let mut sorted = cluster.nodes.clone();
        sorted.sort_unstable_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));

        let mut body = Model::new();
        let mut mapped: HashMap<Output, Output> = HashMap::new();
        let mut ext_inputs: Vec<Output> = Vec::new();
        let mut inlined: HashSet<NodeId> = HashSet::new();
        for &id in &sorted {
            let node = model.node(id)?.clone();
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for &input in &node.inputs {
                if let Some(&inner) = mapped.get(&input) {
                    inputs.push(inner);
                    continue;
                }
                let inner = match model.scalar_constant(input) {
                    Some(value) => {
                        inlined.insert(input.node);
                        let shape = model.output_desc(input)?.shape.dims().map(<[usize]>::to_vec).unwrap_or_default();
                        body.constant(shape, vec![value])
                    }
                    None => {
                        let desc = model.output_desc(input)?.clone();
                        ext_inputs.push(input);
                        body.parameter(desc.shape, desc.element_type)
                    }
                };
                mapped.insert(input, inner);
                inputs.push(inner);
            }
            let inner = body.add_node(node.name.clone(), node.op.clone(), inputs, node.outputs.clone());
            body.node_mut(inner)?.autob = node.autob;
            for i in 0..node.outputs.len() {
                mapped.insert(Output::new(id, i), Output::new(inner, i));
            }
        }

        let mut ext_outputs: Vec<Output> = Vec::new();
        for &id in &sorted {
            for i in 0..model.node(id)?.outputs.len() {
                let out = Output::new(id, i);
                if model.consumers(out).iter().any(|(c, _)| !members.contains(c)) {
                    body.result(mapped[&out])?;
                    ext_outputs.push(out);
                }
            }
        }

        let descs = ext_outputs.iter().map(|&o| model.output_desc(o).cloned()).collect::<Result<Vec<_>>>()?;
        let subgraph = model.add_node(format!("Subgraph{index}"), NodeOp::Subgraph(Box::new(body)), ext_inputs, descs);
        let outside: Vec<NodeId> = model.iter().map(|(id, _)| id).filter(|id| !members.contains(id)).collect();
        for id in outside {
            let node = model.node_mut(id)?;
            for input in node.inputs.iter_mut() {
                if let Some(k) = ext_outputs.iter().position(|o| o == input) {
                    *input = Output::new(subgraph, k);
                }
            }
        }
        for &id in &sorted {
            model.remove(id);
        }
        for id in inlined {
            if model.consumer_nodes(id).is_empty() {
                model.remove(id);
            }
        }
        debug!("cluster {index}: {} nodes collapsed into {}", sorted.len(), model.node(subgraph)?.name);
        created.push(subgraph);
    }
    Ok(created)
}

/// Full tokenization pipeline: MHA, optionally FC, then element-wise, then collapse.
pub struct SnippetsTokenization {
    config: TokenizationConfig,
}

impl SnippetsTokenization {
    pub fn new(config: TokenizationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TokenizationConfig {
        &self.config
    }

    pub fn run(&self, model: &mut Model) -> Result<Vec<NodeId>> {
        let mut clusters = Clusters::new();
        let mha = TokenizeMHASnippets::new(&self.config);
        let fc = TokenizeFCSnippets::new(&self.config);
        let eltwise = TokenizeSnippets::new(&self.config);
        let mut passes: Vec<&dyn TokenizationPass> = vec![&mha];
        if self.config.fc_tokenization {
            passes.push(&fc);
        }
        passes.push(&eltwise);
        for pass in passes {
            let changed = pass.run(model, &mut clusters)?;
            debug!("{}: changed = {changed}, {} clusters", pass.name(), clusters.len());
        }
        collapse(model, &clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::graph::model::{PartialShape, TensorDesc};
    use crate::op::{EltwiseKind, ReduceKind};

    fn eltwise(model: &mut Model, kind: EltwiseKind, inputs: &[Output]) -> Output {
        model.add(NodeOp::Eltwise(kind), inputs).unwrap()
    }

    #[test]
    fn test_matmul_rank_predicate() {
        let mut model = Model::new();
        let a = model.parameter(vec![1, 2, 8, 16], ElementType::F32);
        let b = model.parameter(vec![1, 2, 16, 8], ElementType::F32);
        let mm4 = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[a, b]).unwrap();
        assert!(is_supported_matmul(&model, mm4.node));

        let a3 = model.parameter(vec![2, 8, 16], ElementType::F32);
        let b3 = model.parameter(vec![2, 16, 8], ElementType::F32);
        let mm3 = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[a3, b3]).unwrap();
        assert!(!is_supported_matmul(&model, mm3.node));

        let ai = model.parameter(vec![1, 2, 8, 16], ElementType::U8);
        let bi = model.parameter(vec![1, 2, 16, 8], ElementType::I8);
        let mm_int = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[ai, bi]).unwrap();
        assert!(is_supported_matmul(&model, mm_int.node));
        let mixed = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[bi, ai]).unwrap();
        assert!(!is_supported_matmul(&model, mixed.node));
    }

    #[test]
    fn test_dynamic_rank_is_never_appropriate() {
        let mut model = Model::new();
        let a = model.parameter(PartialShape::DynamicRank, ElementType::F32);
        let relu = eltwise(&mut model, EltwiseKind::Relu, &[a]);
        assert!(is_supported_op(&model, relu.node));
        assert!(!has_supported_in_out(&model, relu.node));
        assert!(!appropriate_for_subgraph(&model, relu.node));
    }

    #[test]
    fn test_predicates_reject_unsupported_attributes() {
        let mut model = Model::new();
        let x = model.parameter(vec![2, 8, 16], ElementType::F32);
        let softmax_last = model.add(NodeOp::Softmax { axis: -1 }, &[x]).unwrap();
        let softmax_mid = model.add(NodeOp::Softmax { axis: 1 }, &[x]).unwrap();
        assert!(appropriate_for_subgraph(&model, softmax_last.node));
        assert!(!appropriate_for_subgraph(&model, softmax_mid.node));

        let drop_dims = model
            .add(NodeOp::Reduce { kind: ReduceKind::Max, axes: vec![2], keep_dims: false }, &[x])
            .unwrap();
        assert!(!appropriate_for_subgraph(&model, drop_dims.node));

        let y = model.parameter(vec![2, 8, 16], ElementType::F32);
        let pdpd = eltwise(&mut model, EltwiseKind::Add, &[x, y]);
        model.node_mut(pdpd.node).unwrap().autob = AutoBroadcast::Pdpd;
        assert!(!appropriate_for_subgraph(&model, pdpd.node));

        let controlled = eltwise(&mut model, EltwiseKind::Abs, &[x]);
        model.node_mut(controlled.node).unwrap().control_deps.push(y.node);
        assert!(!appropriate_for_subgraph(&model, controlled.node));

        let looped = eltwise(&mut model, EltwiseKind::Relu, &[x]);
        model.add_node("loop", NodeOp::Loop, vec![looped], vec![TensorDesc::new(vec![2, 8, 16], ElementType::F32)]);
        assert!(!appropriate_for_subgraph(&model, looped.node));
    }

    #[test]
    fn test_chain_collapses_into_one_subgraph() {
        let mut model = Model::new();
        let a = model.parameter(vec![1, 128], ElementType::F32);
        let b = model.parameter(vec![1, 128], ElementType::F32);
        let two = model.constant(vec![1], vec![2.0]);
        let add = eltwise(&mut model, EltwiseKind::Add, &[a, b]);
        let mul = eltwise(&mut model, EltwiseKind::Multiply, &[add, two]);
        let relu = eltwise(&mut model, EltwiseKind::Relu, &[mul]);
        let result = model.result(relu).unwrap();

        let created = SnippetsTokenization::new(TokenizationConfig::default()).run(&mut model).unwrap();
        assert_eq!(created.len(), 1);
        let subgraph = model.node(created[0]).unwrap();
        assert_eq!(subgraph.inputs, vec![a, b]);
        let NodeOp::Subgraph(body) = &subgraph.op else {
            panic!("expected a subgraph");
        };
        assert_eq!(body.parameters().len(), 2);
        assert_eq!(body.results().len(), 1);
        assert_eq!(model.node(result).unwrap().inputs, vec![Output::new(created[0], 0)]);
        // The scalar was copied into the body and the outer constant dropped.
        assert!(!model.contains(two.node));
        assert!(model.topological_order().is_ok());
    }

    #[test]
    fn test_skipped_nodes_split_clusters() {
        let mut model = Model::new();
        let a = model.parameter(vec![4, 16], ElementType::F32);
        let relu = eltwise(&mut model, EltwiseKind::Relu, &[a]);
        let abs = eltwise(&mut model, EltwiseKind::Abs, &[relu]);
        let neg = eltwise(&mut model, EltwiseKind::Negative, &[abs]);
        model.result(neg).unwrap();
        model.node_mut(abs.node).unwrap().node_type = SnippetsNodeType::SkippedByPlugin;

        let created = SnippetsTokenization::new(TokenizationConfig::default()).run(&mut model).unwrap();
        assert_eq!(created.len(), 2);
        assert!(model.contains(abs.node));
    }

    #[test]
    fn test_cycle_is_avoided() {
        // relu feeds both add and an outside node that also feeds add.
        let mut model = Model::new();
        let a = model.parameter(vec![4, 16], ElementType::F32);
        let relu = eltwise(&mut model, EltwiseKind::Relu, &[a]);
        let outside = eltwise(&mut model, EltwiseKind::Abs, &[relu]);
        model.node_mut(outside.node).unwrap().node_type = SnippetsNodeType::SkippedByPlugin;
        let add = eltwise(&mut model, EltwiseKind::Add, &[relu, outside]);
        model.result(add).unwrap();

        let mut clusters = Clusters::new();
        let config = TokenizationConfig::default();
        TokenizeSnippets::new(&config).run(&mut model, &mut clusters).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_ne!(Clusters::cluster_of(&model, relu.node), Clusters::cluster_of(&model, add.node));
        collapse(&mut model, &clusters).unwrap();
        assert!(model.topological_order().is_ok());
    }

    #[test]
    fn test_data_pointer_budget() {
        let mut model = Model::new();
        let params: Vec<Output> = (0..4).map(|_| model.parameter(vec![8], ElementType::F32)).collect();
        let mut acc = eltwise(&mut model, EltwiseKind::Add, &[params[0], params[1]]);
        for &p in &params[2..] {
            acc = eltwise(&mut model, EltwiseKind::Add, &[acc, p]);
        }
        model.result(acc).unwrap();

        let config = TokenizationConfig { data_ptr_gpr_count: 4, ..TokenizationConfig::default() };
        let created = SnippetsTokenization::new(config).run(&mut model).unwrap();
        assert_eq!(created.len(), 2);
        for id in created {
            let node = model.node(id).unwrap();
            assert!(node.inputs.len() + node.outputs.len() <= 4);
        }
    }
}
