//! Pointer arithmetic of loop ports and memory access counts.

use hashbrown::HashSet;

use crate::core::dims::is_dynamic_value;
use crate::core::Result;
use crate::lowered::expression::{ExprId, PortDescriptor, PortType};
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::loop_manager::{LoopPort, DYNAMIC_OFFSET};
use crate::op::OpKind;

use super::RangedPass;

pub struct InitLoops;

/// Element stride of planar dimension `dim` in the port's memory, `None` if a
/// dimension inside it is dynamic.
pub(crate) fn planar_stride(desc: &PortDescriptor, dim: usize) -> Option<usize> {
    let pos = desc.layout.iter().position(|&d| d == dim)?;
    let mut stride = 1usize;
    for &inner in &desc.layout[pos + 1..] {
        let size = desc.shape[inner];
        if is_dynamic_value(size) {
            return None;
        }
        stride *= size;
    }
    Some(stride)
}

/// Per-element pointer increment of a port along loop dimension `dim_idx`.
pub(crate) fn port_increment(desc: &PortDescriptor, dim_idx: usize) -> i64 {
    let rank = desc.rank();
    if dim_idx >= rank {
        return 0;
    }
    let dim = rank - 1 - dim_idx;
    match desc.shape[dim] {
        1 => 0,
        size if is_dynamic_value(size) => DYNAMIC_OFFSET,
        _ => planar_stride(desc, dim).map_or(DYNAMIC_OFFSET, |s| s as i64),
    }
}

impl InitLoops {
    fn init_port(ir: &LinearIR, port: &mut LoopPort, dim_idx: usize, work_amount: usize) -> Result<()> {
        let expr = ir.get(port.port.expr)?;
        let desc = match port.port.port_type {
            PortType::Input => &expr.input_descs()[port.port.index],
            PortType::Output => &expr.output_descs()[port.port.index],
        };
        port.ptr_increment = if port.is_incremented { port_increment(desc, dim_idx) } else { 0 };
        port.finalization_offset = match port.ptr_increment {
            DYNAMIC_OFFSET => DYNAMIC_OFFSET,
            _ if is_dynamic_value(work_amount) => DYNAMIC_OFFSET,
            inc => -inc * work_amount as i64,
        };
        Ok(())
    }
}

impl RangedPass for InitLoops {
    fn name(&self) -> &'static str {
        "InitLoops"
    }

    fn run(&mut self, ir: &mut LinearIR, _begin: Option<ExprId>, _end: Option<ExprId>) -> Result<bool> {
        let mut modified = false;
        for loop_id in ir.loop_manager().ids() {
            let mut info = ir.loop_manager().get(loop_id)?.clone();
            let (dim_idx, work_amount) = (info.dim_idx, info.work_amount);
            let mut seen_roots = HashSet::new();
            for port in info.ports_mut() {
                let root = match port.port.port_type {
                    PortType::Input => ir.memory_root_of_input(port.port.expr, port.port.index)?,
                    PortType::Output => ir.memory_root_of_output(port.port.expr, port.port.index)?,
                };
                // One pointer register per memory root, advanced once.
                port.is_incremented = root.map_or(true, |r| seen_roots.insert(r));
                Self::init_port(ir, port, dim_idx, work_amount)?;
            }
            *ir.loop_manager_mut().get_mut(loop_id)? = info;
            modified = true;
        }

        // Memory access counts follow the innermost loop increment.
        for id in ir.iter().collect::<Vec<_>>() {
            let Some(&inner) = ir.get(id)?.loop_ids().last() else { continue };
            let increment = ir.loop_manager().get(inner)?.increment;
            match ir.get_mut(id)?.op_mut() {
                OpKind::Load { count, .. } | OpKind::LoadReorder { count, .. } | OpKind::Store { count, .. } => {
                    *count = increment;
                }
                OpKind::Fill { offset, .. } => *offset = increment,
                _ => {}
            }
        }
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ElementType, DYNAMIC_DIMENSION};
    use crate::lowered::pass::MarkLoops;
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::EltwiseKind;

    #[test]
    fn test_port_increment_with_broadcast_and_layout() {
        let desc = PortDescriptor::new(vec![4, 16], ElementType::F32);
        assert_eq!(port_increment(&desc, 0), 1);
        assert_eq!(port_increment(&desc, 1), 16);

        let broadcast = PortDescriptor::new(vec![4, 1], ElementType::F32);
        assert_eq!(port_increment(&broadcast, 0), 0);

        // Transposed view: planar [16, 4] stored as [4, 16].
        let transposed = PortDescriptor::new(vec![16, 4], ElementType::F32).with_layout(vec![1, 0]);
        assert_eq!(port_increment(&transposed, 0), 16);
        assert_eq!(port_increment(&transposed, 1), 1);

        let dynamic = PortDescriptor::new(vec![DYNAMIC_DIMENSION, 16], ElementType::F32);
        assert_eq!(port_increment(&dynamic, 1), DYNAMIC_OFFSET);
    }

    #[test]
    fn test_repeated_root_advances_once() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![2, 16], ElementType::F32).unwrap();
        let sq = b.eltwise(EltwiseKind::Multiply, &[x, x]).unwrap();
        b.result(sq).unwrap();
        let mut ir = b.build().unwrap();
        ir.config_mut().loop_depth = 2;
        MarkLoops.run(&mut ir, None, None).unwrap();
        InitLoops.run(&mut ir, None, None).unwrap();

        let inner = ir.loop_manager().get(1).unwrap();
        let increments: Vec<_> = inner.input_ports.iter().map(|p| (p.is_incremented, p.ptr_increment)).collect();
        assert_eq!(increments, vec![(true, 1), (false, 0)]);
        assert_eq!(inner.output_ports[0].finalization_offset, -16);

        let outer = ir.loop_manager().get(0).unwrap();
        assert_eq!(outer.input_ports[0].ptr_increment, 16);
        assert_eq!(outer.input_ports[0].finalization_offset, -32);
    }

    #[test]
    fn test_counts_follow_increment() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 5], ElementType::F32).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[x]).unwrap();
        b.result(relu).unwrap();
        let mut ir = b.build().unwrap();
        MarkLoops.run(&mut ir, None, None).unwrap();
        InitLoops.run(&mut ir, None, None).unwrap();
        assert!(ir.has_op(|op| matches!(op, OpKind::Load { count: 5, .. })));
        assert!(ir.has_op(|op| matches!(op, OpKind::Store { count: 5, .. })));
    }
}
