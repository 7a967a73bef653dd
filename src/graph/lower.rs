// Lowering of a collapsed subgraph body into the linear IR. Nodes are replayed in
// topological order through the LinearIrBuilder; body parameters take the shapes the
// caller supplies, which may differ from the shapes seen at tokenization time (dynamic
// dimensions in particular). Softmax is decomposed into max, subtract, exp, sum and divide
// over the innermost axis. Reshape and Convert are accepted only when they do not change
// anything; layout changes reach the builder as transposed views of memory.

//! Subgraph body to linear IR.

use hashbrown::HashMap;
use log::trace;

use crate::core::{Result, SnippetsError, VectorDims};
use crate::lowered::{Config, LinearIR, LinearIrBuilder, ValueRef};
use crate::op::{EltwiseKind, ReduceKind};

use super::model::{Model, NodeId, NodeOp, Output};

fn unsupported(op: &NodeOp, reason: impl Into<String>) -> SnippetsError {
    SnippetsError::UnsupportedOp { op: op.type_name().to_string(), reason: reason.into() }
}

struct BodyLowering<'a> {
    body: &'a Model,
    builder: LinearIrBuilder,
    values: HashMap<Output, ValueRef>,
}

impl BodyLowering<'_> {
    fn input(&self, id: NodeId, index: usize) -> Result<ValueRef> {
        let node = self.body.node(id)?;
        let out = node
            .inputs
            .get(index)
            .ok_or_else(|| SnippetsError::structure(format!("{} has no input {index}", node.name)))?;
        self.values
            .get(out)
            .copied()
            .ok_or_else(|| SnippetsError::structure(format!("{}: input {index} was not lowered", node.name)))
    }

    fn inputs(&self, id: NodeId) -> Result<Vec<ValueRef>> {
        (0..self.body.node(id)?.inputs.len()).map(|i| self.input(id, i)).collect()
    }

    fn softmax(&mut self, x: ValueRef) -> Result<ValueRef> {
        let max = self.builder.reduce(ReduceKind::Max, x)?;
        let shifted = self.builder.eltwise(EltwiseKind::Subtract, &[x, max])?;
        let exp = self.builder.eltwise(EltwiseKind::Exp, &[shifted])?;
        let sum = self.builder.reduce(ReduceKind::Sum, exp)?;
        self.builder.eltwise(EltwiseKind::Divide, &[exp, sum])
    }

    /// Value produced by a non-result node.
    fn lower_node(&mut self, id: NodeId, param_shapes: &mut std::slice::Iter<'_, VectorDims>) -> Result<Option<ValueRef>> {
        let body = self.body;
        let node = body.node(id)?;
        let op = &node.op;
        let value = match op {
            NodeOp::Parameter => {
                let shape = param_shapes
                    .next()
                    .ok_or_else(|| SnippetsError::structure("fewer input shapes than body parameters"))?;
                let et = node
                    .outputs
                    .first()
                    .map(|d| d.element_type)
                    .ok_or_else(|| SnippetsError::structure(format!("{} has no output", node.name)))?;
                self.builder.parameter(shape.clone(), et)?
            }
            NodeOp::Constant(values) => match values.as_slice() {
                [value] => self.builder.scalar(*value)?,
                _ => return Err(unsupported(op, "only scalar constants are embedded in kernels")),
            },
            NodeOp::Eltwise(kind) => {
                let inputs = self.inputs(id)?;
                self.builder.eltwise(*kind, &inputs)?
            }
            NodeOp::Reduce { kind, .. } => {
                let input = self.input(id, 0)?;
                self.builder.reduce(*kind, input)?
            }
            NodeOp::Softmax { .. } => {
                let input = self.input(id, 0)?;
                self.softmax(input)?
            }
            NodeOp::MatMul { transpose_a, transpose_b } => {
                if *transpose_a {
                    return Err(unsupported(op, "transposed A input"));
                }
                let a = self.input(id, 0)?;
                let mut b = self.input(id, 1)?;
                if *transpose_b {
                    let rank = body
                        .output_desc(node.inputs[1])?
                        .shape
                        .rank()
                        .ok_or_else(|| unsupported(op, "B input of unknown rank"))?;
                    let mut order: Vec<usize> = (0..rank).collect();
                    order.swap(rank - 1, rank - 2);
                    b = self.builder.transpose(b, order)?;
                }
                self.builder.matmul(a, b)?
            }
            NodeOp::Transpose { order } => {
                let input = self.input(id, 0)?;
                self.builder.transpose(input, order.clone())?
            }
            NodeOp::Reshape | NodeOp::Convert => {
                let source = body.output_desc(node.inputs[0])?;
                let target = node.outputs.first().ok_or_else(|| SnippetsError::structure("node without output"))?;
                if source != target {
                    return Err(unsupported(op, format!("{} -> {} changes the tensor", source.shape, target.shape)));
                }
                self.input(id, 0)?
            }
            NodeOp::Result => return Ok(None),
            NodeOp::Select | NodeOp::FakeQuantize { .. } | NodeOp::Broadcast { .. } => {
                return Err(unsupported(op, "no lowering into the linear IR"));
            }
            NodeOp::Loop | NodeOp::Subgraph(_) | NodeOp::Other(_) => {
                return Err(unsupported(op, "not allowed inside a subgraph body"));
            }
        };
        trace!("lowered {} ({})", node.name, op.type_name());
        Ok(Some(value))
    }
}

/// Lower `body` for concrete or partially dynamic `input_shapes`, one per body parameter.
pub fn lower_subgraph(body: &Model, input_shapes: &[VectorDims], config: Config) -> Result<LinearIR> {
    let parameters = body.parameters();
    if parameters.len() != input_shapes.len() {
        return Err(SnippetsError::structure(format!(
            "body has {} parameters, got {} input shapes",
            parameters.len(),
            input_shapes.len()
        )));
    }
    let mut lowering = BodyLowering { body, builder: LinearIrBuilder::new(config), values: HashMap::new() };

    // Parameters first and in declaration order, so their indices follow the node inputs.
    let mut shapes = input_shapes.iter();
    for &id in &parameters {
        if let Some(value) = lowering.lower_node(id, &mut shapes)? {
            lowering.values.insert(Output::new(id, 0), value);
        }
    }
    for id in body.topological_order()? {
        if matches!(body.node(id)?.op, NodeOp::Parameter) {
            continue;
        }
        if let Some(value) = lowering.lower_node(id, &mut shapes)? {
            lowering.values.insert(Output::new(id, 0), value);
        }
    }
    for id in body.results() {
        let value = lowering.input(id, 0)?;
        lowering.builder.result(value)?;
    }
    lowering.builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ElementType, DYNAMIC_DIMENSION};
    use crate::op::OpKind;

    fn count(ir: &LinearIR, pred: impl Fn(&OpKind) -> bool) -> usize {
        ir.iter().filter(|&id| pred(ir.get(id).unwrap().op())).count()
    }

    #[test]
    fn test_eltwise_body() {
        let mut body = Model::new();
        let a = body.parameter(vec![2, 16], ElementType::F32);
        let b = body.parameter(vec![2, 16], ElementType::F32);
        let two = body.constant(vec![1], vec![2.0]);
        let add = body.add(NodeOp::Eltwise(EltwiseKind::Add), &[a, b]).unwrap();
        let mul = body.add(NodeOp::Eltwise(EltwiseKind::Multiply), &[add, two]).unwrap();
        body.result(mul).unwrap();

        let ir = lower_subgraph(&body, &[vec![2, 16], vec![2, 16]], Config::default()).unwrap();
        assert_eq!(ir.parameters().len(), 2);
        assert_eq!(ir.results().len(), 1);
        assert_eq!(count(&ir, |op| matches!(op, OpKind::Scalar { .. })), 1);
        assert_eq!(count(&ir, |op| matches!(op, OpKind::Eltwise(_))), 2);
    }

    #[test]
    fn test_softmax_is_decomposed() {
        let mut body = Model::new();
        let x = body.parameter(vec![DYNAMIC_DIMENSION, 19], ElementType::F32);
        let softmax = body.add(NodeOp::Softmax { axis: -1 }, &[x]).unwrap();
        body.result(softmax).unwrap();

        let ir = lower_subgraph(&body, &[vec![DYNAMIC_DIMENSION, 19]], Config::default()).unwrap();
        assert!(ir.is_dynamic());
        assert_eq!(count(&ir, |op| matches!(op, OpKind::HorizonReduce(_))), 2);
        assert_eq!(count(&ir, |op| matches!(op, OpKind::Eltwise(EltwiseKind::Exp))), 1);
        assert_eq!(count(&ir, |op| matches!(op, OpKind::Eltwise(EltwiseKind::Divide))), 1);
    }

    #[test]
    fn test_transposed_b_matmul() {
        let mut body = Model::new();
        let a = body.parameter(vec![1, 2, 32, 16], ElementType::F32);
        let b = body.parameter(vec![1, 2, 64, 16], ElementType::F32);
        let mm = body.add(NodeOp::MatMul { transpose_a: false, transpose_b: true }, &[a, b]).unwrap();
        body.result(mm).unwrap();

        let ir = lower_subgraph(&body, &[vec![1, 2, 32, 16], vec![1, 2, 64, 16]], Config::default()).unwrap();
        let brgemm = ir.iter().find(|&id| matches!(ir.get(id).unwrap().op(), OpKind::Brgemm(_))).unwrap();
        let expr = ir.get(brgemm).unwrap();
        assert_eq!(expr.output_descs()[0].shape, vec![1, 2, 32, 64]);
        assert!(matches!(expr.op(), OpKind::Brgemm(desc) if desc.transposed_b));
    }

    #[test]
    fn test_unsupported_nodes() {
        let mut body = Model::new();
        let x = body.parameter(vec![4, 8], ElementType::F32);
        let reshaped = body.reshape(x, vec![8, 4]).unwrap();
        body.result(reshaped).unwrap();
        let err = lower_subgraph(&body, &[vec![4, 8]], Config::default()).unwrap_err();
        assert!(matches!(err, SnippetsError::UnsupportedOp { .. }));

        let mut body = Model::new();
        let x = body.parameter(vec![4, 8], ElementType::F32);
        let table = body.constant(vec![8], vec![1.0; 8]);
        let add = body.add(NodeOp::Eltwise(EltwiseKind::Add), &[x, table]).unwrap();
        body.result(add).unwrap();
        let err = lower_subgraph(&body, &[vec![4, 8]], Config::default()).unwrap_err();
        assert!(matches!(err, SnippetsError::UnsupportedOp { .. }));
    }

    #[test]
    fn test_shape_count_must_match() {
        let mut body = Model::new();
        let x = body.parameter(vec![4], ElementType::F32);
        body.result(x).unwrap();
        assert!(lower_subgraph(&body, &[], Config::default()).is_err());
    }
}
