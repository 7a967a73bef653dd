//! Materialization of marked loops as `LoopBegin`/`LoopEnd` pairs.

use log::trace;

use crate::core::{ElementType, Result, SnippetsError};
use crate::lowered::expression::{ExprId, Expression, PortDescriptor};
use crate::lowered::linear_ir::LinearIR;
use crate::op::OpKind;

use super::RangedPass;

pub struct InsertLoops;

impl InsertLoops {
    /// Wrap `[first, last]` of one loop. The markers inherit the enclosing loop ids.
    pub(crate) fn insert_markers(
        ir: &mut LinearIR,
        loop_id: usize,
        first: ExprId,
        last: ExprId,
        enclosing: Vec<usize>,
    ) -> Result<(ExprId, ExprId)> {
        let counter = || PortDescriptor::new(vec![1], ElementType::I32);
        let mut begin = Expression::new(OpKind::LoopBegin { loop_id }, vec![], vec![counter()]);
        begin.set_loop_ids(enclosing.clone());
        let mut end = Expression::new(OpKind::LoopEnd { loop_id }, vec![counter()], vec![]);
        end.set_loop_ids(enclosing);
        let begin = ir.insert_before(Some(first), begin)?;
        let end = ir.insert_after(last, end)?;
        ir.connect(begin, 0, end, 0)?;
        Ok((begin, end))
    }
}

impl RangedPass for InsertLoops {
    fn name(&self) -> &'static str {
        "InsertLoops"
    }

    fn run(&mut self, ir: &mut LinearIR, begin: Option<ExprId>, end: Option<ExprId>) -> Result<bool> {
        let begin = begin.or_else(|| ir.first());
        let exprs = ir.range(begin, end)?;

        // (loop id, depth, first, last, enclosing ids)
        let mut loops: Vec<(usize, usize, ExprId, ExprId, Vec<usize>)> = Vec::new();
        for &id in &exprs {
            let expr = ir.get(id)?;
            for (depth, &loop_id) in expr.loop_ids().iter().enumerate() {
                match loops.iter_mut().find(|l| l.0 == loop_id) {
                    Some(entry) => {
                        if entry.1 != depth {
                            return Err(SnippetsError::loop_nesting(format!(
                                "loop {loop_id} appears at depths {} and {depth}",
                                entry.1
                            )));
                        }
                        entry.3 = id;
                    }
                    None => loops.push((loop_id, depth, id, id, expr.loop_ids()[..depth].to_vec())),
                }
            }
        }

        // Innermost first so outer markers land outside inner ones.
        loops.sort_by_key(|l| std::cmp::Reverse(l.1));
        for (loop_id, _, first, last, enclosing) in &loops {
            let first = outermost_marker_before(ir, *first, enclosing.len())?;
            let last = outermost_marker_after(ir, *last, enclosing.len())?;
            trace!("loop {loop_id}: {first}..={last}");
            Self::insert_markers(ir, *loop_id, first, last, enclosing.clone())?;
        }
        Ok(!loops.is_empty())
    }
}

/// Walk back over inner `LoopBegin`s directly preceding `id` whose depth exceeds `depth`.
fn outermost_marker_before(ir: &LinearIR, id: ExprId, depth: usize) -> Result<ExprId> {
    let mut cur = id;
    while let Some(prev) = ir.prev(cur)? {
        let expr = ir.get(prev)?;
        if matches!(expr.op(), OpKind::LoopBegin { .. }) && expr.loop_ids().len() > depth {
            cur = prev;
        } else {
            break;
        }
    }
    Ok(cur)
}

fn outermost_marker_after(ir: &LinearIR, id: ExprId, depth: usize) -> Result<ExprId> {
    let mut cur = id;
    while let Some(next) = ir.next(cur)? {
        let expr = ir.get(next)?;
        if matches!(expr.op(), OpKind::LoopEnd { .. }) && expr.loop_ids().len() > depth {
            cur = next;
        } else {
            break;
        }
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowered::pass::{InitLoops, MarkLoops};
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::EltwiseKind;

    fn lowered(shape: Vec<usize>, loop_depth: usize) -> LinearIR {
        let mut b = LinearIrBuilder::new(Config { loop_depth, ..Config::default() });
        let x = b.parameter(shape, ElementType::F32).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[x]).unwrap();
        b.result(relu).unwrap();
        let mut ir = b.build().unwrap();
        MarkLoops.run(&mut ir, None, None).unwrap();
        InitLoops.run(&mut ir, None, None).unwrap();
        InsertLoops.run(&mut ir, None, None).unwrap();
        ir
    }

    fn ops(ir: &LinearIR) -> Vec<String> {
        ir.iter().map(|id| ir.get(id).unwrap().op().to_string()).collect()
    }

    #[test]
    fn test_single_loop_markers() {
        let ir = lowered(vec![1, 64], 1);
        assert_eq!(
            ops(&ir),
            vec![
                "Parameter#0",
                "LoopBegin(0)",
                "Load(count=8, offset=0)",
                "Relu",
                "Store(count=8, offset=0)",
                "LoopEnd(0)",
                "Result#0"
            ]
        );
        let (begin, end) = ir.loop_bounds(0).unwrap();
        assert_eq!(ir.source(end, 0).unwrap().map(|p| p.expr), Some(begin));
    }

    #[test]
    fn test_nested_markers() {
        let ir = lowered(vec![4, 64], 2);
        let names = ops(&ir);
        assert_eq!(&names[1..3], &["LoopBegin(0)", "LoopBegin(1)"]);
        assert_eq!(&names[6..8], &["LoopEnd(1)", "LoopEnd(0)"]);
        let (inner_begin, _) = ir.loop_bounds(1).unwrap();
        assert_eq!(ir.get(inner_begin).unwrap().loop_ids(), &[0]);
    }
}
