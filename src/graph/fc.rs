//! Fully-connected tokenizer: a matmul with constant weights starts an open cluster that the
//! element-wise tokenizer may extend with post-operations.

use hashbrown::HashSet;
use log::debug;

use crate::core::{ElementType, Result};

use super::model::{Model, NodeId, NodeOp, SnippetsNodeType};
use super::tokenization::{has_supported_in_out, Clusters, TokenizationConfig, TokenizationPass, TokenizeSnippets};

pub struct TokenizeFCSnippets<'a> {
    config: &'a TokenizationConfig,
}

impl<'a> TokenizeFCSnippets<'a> {
    pub fn new(config: &'a TokenizationConfig) -> Self {
        Self { config }
    }

    /// Weights come from a constant, possibly through a conversion. Returns the
    /// conversion node when there is one.
    fn constant_weights(model: &Model, matmul: NodeId) -> Option<Option<NodeId>> {
        let weights = *model.node(matmul).ok()?.inputs.get(1)?;
        if model.is_constant(weights) {
            return Some(None);
        }
        let convert = model.node(weights.node).ok()?;
        match (&convert.op, convert.inputs.first()) {
            (NodeOp::Convert, Some(&source)) if model.is_constant(source) && model.consumers(weights).len() == 1 => {
                Some(Some(weights.node))
            }
            _ => None,
        }
    }

    fn is_fc(model: &Model, id: NodeId) -> bool {
        let Ok(node) = model.node(id) else {
            return false;
        };
        if !matches!(node.op, NodeOp::MatMul { transpose_a: false, .. }) || node.node_type != SnippetsNodeType::NotSet {
            return false;
        }
        let types: Option<Vec<_>> = node
            .inputs
            .iter()
            .map(|&o| model.output_desc(o).ok().map(|d| d.element_type))
            .collect();
        let types_ok = matches!(
            types.as_deref(),
            Some([ElementType::F32, ElementType::F32] | [ElementType::Bf16, ElementType::Bf16])
        );
        let rank_ok = node.outputs.first().and_then(|d| d.shape.rank()).is_some_and(|r| r >= 2);
        types_ok && rank_ok && has_supported_in_out(model, id)
    }
}

impl TokenizationPass for TokenizeFCSnippets<'_> {
    fn name(&self) -> &'static str {
        "TokenizeFCSnippets"
    }

    fn run(&self, model: &mut Model, clusters: &mut Clusters) -> Result<bool> {
        let mut changed = false;
        for id in model.topological_order()? {
            if !Self::is_fc(model, id) {
                continue;
            }
            let Some(convert) = Self::constant_weights(model, id) else {
                continue;
            };
            let mut nodes = vec![id];
            nodes.extend(convert);
            let members: HashSet<NodeId> = nodes.iter().copied().collect();
            if TokenizeSnippets::data_ptr_count(model, &members) > self.config.data_ptr_gpr_count {
                continue;
            }
            debug!("FC matched at {}", model.node(id)?.name);
            clusters.create(model, nodes, false)?;
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::Output;
    use crate::graph::tokenization::SnippetsTokenization;
    use crate::op::EltwiseKind;

    fn fc(weights_bf16: bool) -> (Model, Output) {
        let mut model = Model::new();
        let x = model.parameter(vec![4, 32], if weights_bf16 { ElementType::Bf16 } else { ElementType::F32 });
        let mut w = model.constant(vec![32, 16], vec![0.5; 32 * 16]);
        if weights_bf16 {
            w = model.convert(w, ElementType::Bf16).unwrap();
        }
        let mm = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[x, w]).unwrap();
        let relu = model.add(NodeOp::Eltwise(EltwiseKind::Relu), &[mm]).unwrap();
        model.result(relu).unwrap();
        (model, mm)
    }

    #[test]
    fn test_constant_weights_start_open_cluster() {
        let (mut model, mm) = fc(false);
        let config = TokenizationConfig { fc_tokenization: true, ..TokenizationConfig::default() };
        let mut clusters = Clusters::new();
        assert!(TokenizeFCSnippets::new(&config).run(&mut model, &mut clusters).unwrap());
        let (_, cluster) = clusters.iter().next().unwrap();
        assert!(!cluster.completed);
        assert_eq!(cluster.nodes, vec![mm.node]);
    }

    #[test]
    fn test_convert_joins_and_post_op_fuses() {
        let (mut model, _) = fc(true);
        let config = TokenizationConfig { fc_tokenization: true, ..TokenizationConfig::default() };
        let mut clusters = Clusters::new();
        TokenizeFCSnippets::new(&config).run(&mut model, &mut clusters).unwrap();
        assert_eq!(clusters.iter().next().unwrap().1.nodes.len(), 2);

        let (mut model, _) = fc(true);
        let created = SnippetsTokenization::new(config).run(&mut model).unwrap();
        assert_eq!(created.len(), 1);
        let NodeOp::Subgraph(body) = &model.node(created[0]).unwrap().op else {
            panic!("expected a subgraph");
        };
        // Matmul, conversion and relu; the weights stay an input.
        assert_eq!(body.iter().filter(|(_, n)| !matches!(n.op, NodeOp::Parameter | NodeOp::Result)).count(), 3);
        assert_eq!(model.node(created[0]).unwrap().inputs.len(), 2);
    }

    #[test]
    fn test_runtime_weights_are_not_fc() {
        let mut model = Model::new();
        let x = model.parameter(vec![4, 32], ElementType::F32);
        let w = model.parameter(vec![32, 16], ElementType::F32);
        let mm = model.add(NodeOp::MatMul { transpose_a: false, transpose_b: false }, &[x, w]).unwrap();
        model.result(mm).unwrap();
        let config = TokenizationConfig { fc_tokenization: true, ..TokenizationConfig::default() };
        let mut clusters = Clusters::new();
        assert!(!TokenizeFCSnippets::new(&config).run(&mut model, &mut clusters).unwrap());
    }
}
