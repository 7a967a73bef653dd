// Pattern tokenizer for multi-head attention. Starting from the first matmul it walks
// backwards over both inputs and forwards to the second matmul:
//
//   Transpose0 [0,2,1,3] -> MatMul0.in0
//   Transpose1 [0,2,3,1] -> eltwise* -> MatMul0.in1
//   MatMul0 -> eltwise* -> (Reshape) -> Softmax -> (Reshape) -> eltwise* -> MatMul1.in0
//   Transpose2 [0,2,1,3] -> MatMul1.in1
//   MatMul1 -> Transpose3 [0,2,1,3] | eltwise*
//
// Every transpose is optional. Each interior node must feed exactly one consumer so the
// fused subgraph never has to publish an intermediate tensor. A match becomes a completed
// cluster that the element-wise tokenizer will not extend.

//! Multi-head attention tokenizer.

use hashbrown::HashSet;
use log::{debug, trace};

use crate::core::Result;

use super::model::{Model, NodeId, NodeOp, Output, SnippetsNodeType};
use super::split_dimension_m::SplitDimensionM;
use super::tokenization::{
    has_supported_in_out, is_supported_matmul, is_supported_op, Clusters, TokenizationConfig, TokenizationPass,
    TokenizeSnippets,
};

const INPUT_TRANSPOSE: [usize; 4] = [0, 2, 1, 3];
const KEY_TRANSPOSE: [usize; 4] = [0, 2, 3, 1];

pub struct TokenizeMHASnippets<'a> {
    config: &'a TokenizationConfig,
}

/// Nodes matched so far, in no particular order.
#[derive(Default)]
struct Matched {
    nodes: Vec<NodeId>,
}

impl Matched {
    fn push(&mut self, id: NodeId) {
        self.nodes.push(id);
    }
}

fn free(model: &Model, id: NodeId) -> bool {
    model
        .node(id)
        .is_ok_and(|n| matches!(n.node_type, SnippetsNodeType::NotSet | SnippetsNodeType::SkippedByPlugin))
}

fn single_consumer(model: &Model, id: NodeId) -> Option<(NodeId, usize)> {
    match model.consumers(Output::new(id, 0)).as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

fn is_transpose(model: &Model, id: NodeId, expected: &[usize]) -> bool {
    matches!(model.node(id).map(|n| &n.op), Ok(NodeOp::Transpose { order }) if order[..] == expected[..])
}

/// Element-wise or select node the chains around the matmuls may contain.
fn is_chain_op(model: &Model, id: NodeId) -> bool {
    matches!(model.node(id).map(|n| &n.op), Ok(NodeOp::Eltwise(_) | NodeOp::Select))
        && is_supported_op(model, id)
        && has_supported_in_out(model, id)
        && free(model, id)
}

fn producer(model: &Model, id: NodeId, input: usize) -> Option<NodeId> {
    model.node(id).ok()?.inputs.get(input).map(|o| o.node)
}

impl<'a> TokenizeMHASnippets<'a> {
    pub fn new(config: &'a TokenizationConfig) -> Self {
        Self { config }
    }

    /// Enough parallel work, or a split of M can provide it.
    fn batch_allows(&self, model: &Model, matmul0: NodeId) -> bool {
        let Some(dims) = model.node(matmul0).ok().and_then(|n| n.outputs.first()).and_then(|d| d.shape.dims()) else {
            return false;
        };
        if !model.output_desc(Output::new(matmul0, 0)).is_ok_and(|d| d.shape.is_static()) {
            return true;
        }
        let batch: usize = dims[..dims.len().saturating_sub(2)].iter().product();
        batch >= self.config.concurrency
            || (self.config.split_m_dimension && SplitDimensionM::can_be_optimized(model, matmul0, self.config.concurrency))
    }

    /// Follow single-consumer element-wise nodes from `start`; returns the last node reached.
    fn forward_chain(model: &Model, start: NodeId, matched: &mut Matched) -> NodeId {
        let mut current = start;
        while let Some((next, _)) = single_consumer(model, current) {
            if !is_chain_op(model, next) {
                break;
            }
            matched.push(next);
            current = next;
        }
        current
    }

    fn match_pattern(&self, model: &Model, matmul0: NodeId) -> Option<Vec<NodeId>> {
        if !is_supported_matmul(model, matmul0) || !free(model, matmul0) {
            return None;
        }
        if !matches!(model.node(matmul0).ok()?.op, NodeOp::MatMul { transpose_a: false, .. }) {
            return None;
        }
        let mut matched = Matched::default();
        matched.push(matmul0);

        // Query side.
        if let Some(t0) = producer(model, matmul0, 0) {
            if is_transpose(model, t0, &INPUT_TRANSPOSE) && single_consumer(model, t0).is_some() && free(model, t0) {
                matched.push(t0);
            }
        }
        // Key side: optional element-wise nodes, then an optional transpose.
        let mut key = producer(model, matmul0, 1)?;
        while is_chain_op(model, key) && single_consumer(model, key).is_some() {
            matched.push(key);
            key = producer(model, key, 0)?;
        }
        if is_transpose(model, key, &KEY_TRANSPOSE) && single_consumer(model, key).is_some() && free(model, key) {
            matched.push(key);
        }

        // MatMul0 up to Softmax.
        single_consumer(model, matmul0)?;
        let mut current = Self::forward_chain(model, matmul0, &mut matched);
        let (mut next, _) = single_consumer(model, current)?;
        if matches!(model.node(next).ok()?.op, NodeOp::Reshape) {
            let (after, _) = single_consumer(model, next)?;
            if !matches!(model.node(after).ok()?.op, NodeOp::Softmax { .. }) {
                return None;
            }
            matched.push(next);
            next = after;
        }
        if !matches!(model.node(next).ok()?.op, NodeOp::Softmax { .. }) || !is_supported_op(model, next) {
            return None;
        }
        matched.push(next);
        current = next;

        // Softmax up to MatMul1.
        single_consumer(model, current)?;
        if let Some((reshape, _)) = single_consumer(model, current) {
            if matches!(model.node(reshape).ok()?.op, NodeOp::Reshape) && single_consumer(model, reshape).is_some() {
                matched.push(reshape);
                current = reshape;
            }
        }
        current = Self::forward_chain(model, current, &mut matched);
        let (matmul1, port) = single_consumer(model, current)?;
        if port != 0 || !is_supported_matmul(model, matmul1) || !free(model, matmul1) {
            return None;
        }
        matched.push(matmul1);
        if let Some(t2) = producer(model, matmul1, 1) {
            if is_transpose(model, t2, &INPUT_TRANSPOSE) && single_consumer(model, t2).is_some() && free(model, t2) {
                matched.push(t2);
            }
        }

        // Output side.
        match single_consumer(model, matmul1) {
            Some((t3, _)) if self.config.enable_transpose_on_output && is_transpose(model, t3, &INPUT_TRANSPOSE) => {
                matched.push(t3);
            }
            Some(_) => {
                Self::forward_chain(model, matmul1, &mut matched);
            }
            None => {}
        }
        Some(matched.nodes)
    }
}

impl TokenizationPass for TokenizeMHASnippets<'_> {
    fn name(&self) -> &'static str {
        "TokenizeMHASnippets"
    }

    fn run(&self, model: &mut Model, clusters: &mut Clusters) -> Result<bool> {
        let mut changed = false;
        for id in model.topological_order()? {
            if !matches!(model.node(id)?.op, NodeOp::MatMul { .. }) || !free(model, id) {
                continue;
            }
            let Some(nodes) = self.match_pattern(model, id) else {
                continue;
            };
            if !self.batch_allows(model, id) {
                debug!("{}: batch too small for {} threads", model.node(id)?.name, self.config.concurrency);
                continue;
            }
            let members: HashSet<NodeId> = nodes.iter().copied().collect();
            let pointers = TokenizeSnippets::data_ptr_count(model, &members);
            if pointers > self.config.data_ptr_gpr_count {
                trace!("{}: {pointers} data pointers exceed the budget", model.node(id)?.name);
                continue;
            }
            debug!("MHA matched at {} with {} nodes", model.node(id)?.name, nodes.len());
            clusters.create(model, nodes, true)?;
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::graph::tokenization::SnippetsTokenization;
    use crate::op::EltwiseKind;

    struct Mha {
        model: Model,
        matmul0: Output,
        matmul1: Output,
        nodes: usize,
    }

    fn mha() -> Mha {
        let mut model = Model::new();
        let q = model.parameter(vec![1, 64, 2, 16], ElementType::F32);
        let k = model.parameter(vec![1, 64, 2, 16], ElementType::F32);
        let mask = model.parameter(vec![1, 1, 1, 64], ElementType::F32);
        let v = model.parameter(vec![1, 64, 2, 16], ElementType::F32);
        let t0 = model.add(NodeOp::Transpose { order: INPUT_TRANSPOSE.to_vec() }, &[q]).unwrap();
        let t1 = model.add(NodeOp::Transpose { order: KEY_TRANSPOSE.to_vec() }, &[k]).unwrap();
        let matmul0 = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[t0, t1]).unwrap();
        let scale = model.constant(vec![1], vec![0.125]);
        let scaled = model.add(NodeOp::Eltwise(EltwiseKind::Multiply), &[matmul0, scale]).unwrap();
        let masked = model.add(NodeOp::Eltwise(EltwiseKind::Add), &[scaled, mask]).unwrap();
        let softmax = model.add(NodeOp::Softmax { axis: -1 }, &[masked]).unwrap();
        let t2 = model.add(NodeOp::Transpose { order: INPUT_TRANSPOSE.to_vec() }, &[v]).unwrap();
        let matmul1 = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[softmax, t2]).unwrap();
        let t3 = model.add(NodeOp::Transpose { order: INPUT_TRANSPOSE.to_vec() }, &[matmul1]).unwrap();
        model.result(t3).unwrap();
        Mha { model, matmul0, matmul1, nodes: 9 }
    }

    #[test]
    fn test_matches_full_pattern() {
        let Mha { mut model, matmul0, matmul1, nodes } = mha();
        let config = TokenizationConfig::default();
        let mut clusters = Clusters::new();
        assert!(TokenizeMHASnippets::new(&config).run(&mut model, &mut clusters).unwrap());
        let (_, cluster) = clusters.iter().next().unwrap();
        assert!(cluster.completed);
        assert_eq!(cluster.nodes.len(), nodes);
        assert_eq!(Clusters::cluster_of(&model, matmul0.node), Clusters::cluster_of(&model, matmul1.node));
    }

    #[test]
    fn test_collapses_into_four_input_subgraph() {
        let Mha { mut model, .. } = mha();
        let created = SnippetsTokenization::new(TokenizationConfig::default()).run(&mut model).unwrap();
        assert_eq!(created.len(), 1);
        let subgraph = model.node(created[0]).unwrap();
        assert_eq!(subgraph.inputs.len(), 4);
        assert_eq!(subgraph.outputs.len(), 1);
    }

    #[test]
    fn test_shared_intermediate_breaks_match() {
        let Mha { mut model, matmul0, .. } = mha();
        model.result(matmul0).unwrap();
        let config = TokenizationConfig::default();
        let mut clusters = Clusters::new();
        assert!(!TokenizeMHASnippets::new(&config).run(&mut model, &mut clusters).unwrap());
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_small_batch_needs_m_split() {
        // Batch 2 for 8 threads: M = 64 splits into 4 x 16.
        let Mha { mut model, .. } = mha();
        let config = TokenizationConfig { concurrency: 8, ..TokenizationConfig::default() };
        let mut clusters = Clusters::new();
        assert!(TokenizeMHASnippets::new(&config).run(&mut model, &mut clusters).unwrap());

        let Mha { mut model, .. } = mha();
        let config = TokenizationConfig { concurrency: 8, split_m_dimension: false, ..TokenizationConfig::default() };
        let mut clusters = Clusters::new();
        assert!(!TokenizeMHASnippets::new(&config).run(&mut model, &mut clusters).unwrap());
    }

    #[test]
    fn test_output_transpose_can_be_disabled() {
        let Mha { mut model, nodes, .. } = mha();
        let config = TokenizationConfig { enable_transpose_on_output: false, ..TokenizationConfig::default() };
        let mut clusters = Clusters::new();
        TokenizeMHASnippets::new(&config).run(&mut model, &mut clusters).unwrap();
        let (_, cluster) = clusters.iter().next().unwrap();
        assert_eq!(cluster.nodes.len(), nodes - 1);
    }
}
