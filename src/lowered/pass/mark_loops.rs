//! Grouping of consecutive expressions into loop nests.

use log::trace;

use crate::core::dims::is_dynamic_value;
use crate::core::{Result, VectorDims};
use crate::lowered::expression::{ExprId, ExprPort, Expression, PortDescriptor};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::loop_manager::{LoopInfo, LoopPort};
use crate::op::OpKind;

use super::RangedPass;

/// Walks the IR left to right and closes a loop candidate whenever the next expression
/// iterates a different shape, works on whole tiles, or reads an in-loop value through
/// a port with a different subtensor or layout.
pub struct MarkLoops;

/// Expressions that never start or extend a loop.
pub(crate) fn is_loop_breaker(expr: &Expression) -> bool {
    matches!(
        expr.op(),
        OpKind::Parameter { .. }
            | OpKind::Result { .. }
            | OpKind::Buffer(_)
            | OpKind::Scalar { .. }
            | OpKind::LoopBegin { .. }
            | OpKind::LoopEnd { .. }
    ) || is_full_tile(expr)
}

/// Expressions consuming a whole tile per invocation.
pub(crate) fn is_full_tile(expr: &Expression) -> bool {
    expr.op().has_executor() || expr.input_descs().iter().any(PortDescriptor::is_full_dim_innermost)
}

fn loop_shape(expr: &Expression) -> Option<&VectorDims> {
    expr.output_descs().first().map(|d| &d.shape)
}

impl MarkLoops {
    fn can_extend(ir: &LinearIR, candidate: &[ExprId], next: &Expression, shape: &VectorDims) -> Result<bool> {
        if is_loop_breaker(next) || loop_shape(next) != Some(shape) {
            return Ok(false);
        }
        for (inp, source) in next.inputs().iter().enumerate() {
            let Some(src) = source else { continue };
            if !candidate.contains(&src.expr) {
                continue;
            }
            let produced = &ir.get(src.expr)?.output_descs()[src.index];
            if produced.conflicts_with(&next.input_descs()[inp]) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn mark(ir: &mut LinearIR, body: &[ExprId], shape: &VectorDims) -> Result<Vec<usize>> {
        let config = ir.config().clone();
        let rank = shape.len();
        let depth = config.loop_depth.min(rank).max(1);

        let mut input_ports = Vec::new();
        let mut output_ports = Vec::new();
        for &id in body {
            let expr = ir.get(id)?;
            if expr.op().is_load() {
                let desc = &expr.input_descs()[0];
                input_ports.push(LoopPort::new(ExprPort::input(id, 0), desc.element_type.size()));
            } else if matches!(expr.op(), OpKind::Store { .. }) {
                let desc = &expr.output_descs()[0];
                output_ports.push(LoopPort::new(ExprPort::output(id, 0), desc.element_type.size()));
            }
        }

        let mut loop_ids = Vec::with_capacity(depth);
        for dim_idx in (0..depth).rev() {
            let dim = shape[rank - 1 - dim_idx];
            let increment = if dim_idx == 0 {
                if is_dynamic_value(dim) {
                    config.vector_size
                } else {
                    config.vector_size.min(dim)
                }
            } else if dim == 1 {
                continue;
            } else {
                1
            };
            let mut info = LoopInfo::new(dim, increment, dim_idx);
            info.input_ports = input_ports.clone();
            info.output_ports = output_ports.clone();
            loop_ids.push(ir.loop_manager_mut().add_loop(info));
        }
        for &id in body {
            ir.get_mut(id)?.set_loop_ids(loop_ids.clone());
        }
        Ok(loop_ids)
    }
}

impl RangedPass for MarkLoops {
    fn name(&self) -> &'static str {
        "MarkLoops"
    }

    fn run(&mut self, ir: &mut LinearIR, begin: Option<ExprId>, end: Option<ExprId>) -> Result<bool> {
        let begin = begin.or_else(|| ir.first());
        let exprs = ir.range(begin, end)?;
        let mut modified = false;
        let mut i = 0;
        while i < exprs.len() {
            let first = ir.get(exprs[i])?;
            let Some(shape) = loop_shape(first).filter(|_| !is_loop_breaker(first)).cloned() else {
                i += 1;
                continue;
            };
            let mut j = i + 1;
            while j < exprs.len() && Self::can_extend(ir, &exprs[i..j], ir.get(exprs[j])?, &shape)? {
                j += 1;
            }
            let ids = Self::mark(ir, &exprs[i..j], &shape)?;
            trace!("marked {} expressions from {} with loops {ids:?}", j - i, exprs[i]);
            modified = true;
            i = j;
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::{EltwiseKind, ReduceKind};

    fn add_relu(shape: Vec<usize>) -> LinearIR {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(shape.clone(), ElementType::F32).unwrap();
        let y = b.parameter(shape, ElementType::F32).unwrap();
        let add = b.eltwise(EltwiseKind::Add, &[x, y]).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[add]).unwrap();
        b.result(relu).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_single_loop_over_chain() {
        let mut ir = add_relu(vec![1, 128]);
        assert!(MarkLoops.run(&mut ir, None, None).unwrap());
        assert_eq!(ir.loop_manager().len(), 1);
        let info = ir.loop_manager().get(0).unwrap();
        assert_eq!((info.work_amount, info.increment, info.dim_idx), (128, 8, 0));
        assert_eq!(info.input_ports.len(), 2);
        assert_eq!(info.output_ports.len(), 1);
        for id in ir.iter() {
            let expr = ir.get(id).unwrap();
            let expected: &[usize] = if is_loop_breaker(expr) { &[] } else { &[0] };
            assert_eq!(expr.loop_ids(), expected);
        }
    }

    #[test]
    fn test_marking_is_deterministic() {
        let mut a = add_relu(vec![3, 130]);
        let mut b = add_relu(vec![3, 130]);
        MarkLoops.run(&mut a, None, None).unwrap();
        MarkLoops.run(&mut b, None, None).unwrap();
        assert_eq!(a.debug_dump(), b.debug_dump());
    }

    #[test]
    fn test_unit_shape_gives_unit_loop() {
        let mut ir = add_relu(vec![1]);
        MarkLoops.run(&mut ir, None, None).unwrap();
        let info = ir.loop_manager().get(0).unwrap();
        assert_eq!((info.work_amount, info.increment), (1, 1));
    }

    #[test]
    fn test_outer_loops_follow_loop_depth() {
        let mut ir = add_relu(vec![4, 16]);
        ir.config_mut().loop_depth = 2;
        MarkLoops.run(&mut ir, None, None).unwrap();
        assert_eq!(ir.loop_manager().len(), 2);
        let outer = ir.loop_manager().get(0).unwrap();
        let inner = ir.loop_manager().get(1).unwrap();
        assert_eq!((outer.work_amount, outer.increment, outer.dim_idx), (4, 1, 1));
        assert_eq!((inner.work_amount, inner.increment, inner.dim_idx), (16, 8, 0));
    }

    #[test]
    fn test_horizon_reduce_closes_loop() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 20], ElementType::F32).unwrap();
        let max = b.reduce(ReduceKind::Max, x).unwrap();
        let scaled = b.eltwise(EltwiseKind::Relu, &[max]).unwrap();
        b.result(scaled).unwrap();
        let mut ir = b.build().unwrap();
        MarkLoops.run(&mut ir, None, None).unwrap();

        // Load/Fill/ReduceAccumulate over 20, then Relu/Store over 1.
        assert_eq!(ir.loop_manager().len(), 2);
        assert_eq!(ir.loop_manager().get(0).unwrap().work_amount, 20);
        assert_eq!(ir.loop_manager().get(1).unwrap().work_amount, 1);
        let horizon = ir
            .iter()
            .find(|&id| matches!(ir.get(id).unwrap().op(), OpKind::HorizonReduce(_)))
            .unwrap();
        assert!(ir.get(horizon).unwrap().loop_ids().is_empty());
    }
}
