//! Splitting of loops with a tail into main-body and last-iteration loops.

use log::debug;

use crate::core::dims::is_dynamic_value;
use crate::core::{Result, DYNAMIC_DIMENSION};
use crate::lowered::expression::ExprId;
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::loop_manager::{LoopInfo, LoopKind, SpecificIterType};
use crate::op::OpKind;

use super::RangedPass;

/// Unified loops stay registered with their original bounds; the emitted code is
/// made of the expanded loops derived from them.
pub struct InsertSpecificIterations;

impl InsertSpecificIterations {
    fn needs_tail(info: &LoopInfo) -> bool {
        matches!(info.kind, LoopKind::Unified) && info.increment > 1 && info.tail_increment() != 0
    }

    fn relabel(ir: &mut LinearIR, range: &[ExprId], from: usize, to: usize, tail: Option<usize>) -> Result<()> {
        for &id in range {
            let expr = ir.get_mut(id)?;
            let ids: Vec<usize> = expr.loop_ids().iter().map(|&l| if l == from { to } else { l }).collect();
            expr.set_loop_ids(ids);
            match expr.op_mut() {
                OpKind::LoopBegin { loop_id } | OpKind::LoopEnd { loop_id } if *loop_id == from => *loop_id = to,
                OpKind::Load { count, .. } | OpKind::LoadReorder { count, .. } | OpKind::Store { count, .. } => {
                    if let Some(tail) = tail {
                        *count = tail;
                    }
                }
                OpKind::Fill { offset, .. } => {
                    if let Some(tail) = tail {
                        *offset = tail;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn split(ir: &mut LinearIR, unified_id: usize) -> Result<()> {
        let unified = ir.loop_manager().get(unified_id)?.clone();
        let (begin, end) = ir.loop_bounds(unified_id)?;
        let range = ir.range(Some(begin), ir.next(end)?)?;
        let dynamic = unified.is_dynamic();
        let tail = unified.tail_increment();
        let main_work = if dynamic { DYNAMIC_DIMENSION } else { unified.work_amount - tail };

        let mut last = unified.clone();
        last.work_amount = tail;
        last.increment = if dynamic { 1 } else { tail };
        last.kind = LoopKind::Expanded { unified_id, iter_type: SpecificIterType::LastIter };

        if main_work == 0 {
            let last_id = ir.loop_manager_mut().add_loop(last);
            let increment = ir.loop_manager().get(last_id)?.increment;
            return Self::relabel(ir, &range, unified_id, last_id, Some(increment));
        }

        let after = ir.next(end)?;
        let mapping = ir.clone_range(begin, end, after)?;
        for port in last.ports_mut() {
            if let Some(&copy) = mapping.get(&port.port.expr) {
                port.port.expr = copy;
            }
        }
        let mut main = unified.clone();
        main.work_amount = main_work;
        main.kind = LoopKind::Expanded { unified_id, iter_type: SpecificIterType::MainBody };
        for port in main.ports_mut() {
            port.finalization_offset = 0;
        }

        let last_increment = last.increment;
        let main_id = ir.loop_manager_mut().add_loop(main);
        let last_id = ir.loop_manager_mut().add_loop(last);
        Self::relabel(ir, &range, unified_id, main_id, None)?;
        let copies: Vec<ExprId> = range.iter().filter_map(|id| mapping.get(id).copied()).collect();
        Self::relabel(ir, &copies, unified_id, last_id, Some(last_increment))?;
        debug!(
            "loop {unified_id} split into main {main_id} ({}) and last iteration {last_id} ({})",
            crate::core::dims::format_dims(&[main_work]),
            crate::core::dims::format_dims(&[tail])
        );
        Ok(())
    }
}

impl RangedPass for InsertSpecificIterations {
    fn name(&self) -> &'static str {
        "InsertSpecificIterations"
    }

    fn run(&mut self, ir: &mut LinearIR, _begin: Option<ExprId>, _end: Option<ExprId>) -> Result<bool> {
        let candidates: Vec<usize> = ir
            .loop_manager()
            .iter()
            .filter(|(_, info)| Self::needs_tail(info))
            .map(|(id, _)| id)
            .collect();
        for &loop_id in &candidates {
            Self::split(ir, loop_id)?;
        }
        Ok(!candidates.is_empty())
    }
}

/// Work amount of an expanded loop given its unified loop's resolved work amount.
pub(crate) fn expanded_work_amount(iter_type: SpecificIterType, work_amount: usize, increment: usize) -> usize {
    if is_dynamic_value(work_amount) || increment == 0 {
        return work_amount;
    }
    match iter_type {
        SpecificIterType::MainBody => work_amount - work_amount % increment,
        SpecificIterType::LastIter => work_amount % increment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::lowered::pass::{InitLoops, InsertLoops, MarkLoops};
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::{EltwiseKind, ReduceKind};

    fn relu_ir(shape: Vec<usize>) -> LinearIR {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(shape, ElementType::F32).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[x]).unwrap();
        b.result(relu).unwrap();
        let mut ir = b.build().unwrap();
        MarkLoops.run(&mut ir, None, None).unwrap();
        InitLoops.run(&mut ir, None, None).unwrap();
        InsertLoops.run(&mut ir, None, None).unwrap();
        ir
    }

    #[test]
    fn test_tail_split_shares_unified_id() {
        let mut ir = relu_ir(vec![1, 130]);
        assert!(InsertSpecificIterations.run(&mut ir, None, None).unwrap());

        let manager = ir.loop_manager();
        let expanded = manager.expanded_loops(0);
        assert_eq!(expanded.len(), 2);
        let main = manager.get(expanded[0]).unwrap();
        let last = manager.get(expanded[1]).unwrap();
        assert_eq!(main.iter_type(), Some(SpecificIterType::MainBody));
        assert_eq!((main.work_amount, main.increment), (128, 8));
        assert_eq!(main.output_ports[0].finalization_offset, 0);
        assert_eq!(last.iter_type(), Some(SpecificIterType::LastIter));
        assert_eq!((last.work_amount, last.increment), (2, 2));
        assert_eq!(last.output_ports[0].finalization_offset, -130);
        assert_eq!(last.unified_id(expanded[1]), 0);

        let counts: Vec<usize> = ir
            .iter()
            .filter_map(|id| match ir.get(id).unwrap().op() {
                OpKind::Load { count, .. } => Some(*count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![8, 2]);
        assert!(ir.loop_bounds(0).is_err());
    }

    #[test]
    fn test_zero_tail_is_untouched() {
        let mut ir = relu_ir(vec![1, 128]);
        assert!(!InsertSpecificIterations.run(&mut ir, None, None).unwrap());
        assert_eq!(ir.loop_manager().len(), 1);
        assert!(ir.loop_bounds(0).is_ok());
    }

    #[test]
    fn test_tail_fill_and_shared_accumulator() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 19], ElementType::F32).unwrap();
        let sum = b.reduce(ReduceKind::Sum, x).unwrap();
        b.result(sum).unwrap();
        let mut ir = b.build().unwrap();
        MarkLoops.run(&mut ir, None, None).unwrap();
        InitLoops.run(&mut ir, None, None).unwrap();
        InsertLoops.run(&mut ir, None, None).unwrap();
        InsertSpecificIterations.run(&mut ir, None, None).unwrap();

        let fills: Vec<usize> = ir
            .iter()
            .filter_map(|id| match ir.get(id).unwrap().op() {
                OpKind::Fill { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect();
        assert_eq!(fills, vec![8, 3]);

        // Both accumulators read the same init value.
        let accs: Vec<_> = ir
            .iter()
            .filter(|&id| matches!(ir.get(id).unwrap().op(), OpKind::ReduceAccumulate(_)))
            .map(|id| ir.source(id, 1).unwrap().unwrap().expr)
            .collect();
        assert_eq!(accs.len(), 2);
        assert_eq!(accs[0], accs[1]);
    }

    #[test]
    fn test_expanded_work_amounts() {
        assert_eq!(expanded_work_amount(SpecificIterType::MainBody, 130, 8), 128);
        assert_eq!(expanded_work_amount(SpecificIterType::LastIter, 130, 8), 2);
        assert_eq!(expanded_work_amount(SpecificIterType::LastIter, 128, 8), 0);
    }
}
