//! Layout of the runtime-arguments table read by dynamic kernels.
//!
//! Every materialized loop of a dynamic kernel owns a contiguous run of `i64` slots:
//! the work amount, the per-iteration pointer increment of each port in bytes and the
//! finalization offset of each port in bytes. Dynamic buffer offsets follow the loops.
//! The runtime configurator writes the table, the emitters read it through the
//! runtime-args pointer.

use crate::core::dims::is_dynamic_value;
use crate::core::Result;
use crate::op::OpKind;

use super::linear_ir::LinearIR;

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopSlots {
    loop_id: usize,
    base: usize,
    ports: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeArgsLayout {
    loops: Vec<LoopSlots>,
    buffers: Vec<(usize, usize)>,
    len: usize,
}

impl RuntimeArgsLayout {
    /// Slots for every loop in `LoopBegin` order and every buffer with a dynamic offset.
    /// Static kernels have an empty table.
    pub fn from_ir(ir: &LinearIR) -> Result<Self> {
        let mut layout = Self::default();
        if !ir.is_dynamic() {
            return Ok(layout);
        }
        for id in ir.iter() {
            match ir.get(id)?.op() {
                OpKind::LoopBegin { loop_id } => {
                    let ports = ir.loop_manager().get(*loop_id)?.ports().count();
                    layout.loops.push(LoopSlots { loop_id: *loop_id, base: layout.len, ports });
                    layout.len += 1 + 2 * ports;
                }
                OpKind::Buffer(desc) if is_dynamic_value(desc.offset) => {
                    if !layout.buffers.iter().any(|(group, _)| *group == desc.reg_group) {
                        layout.buffers.push((desc.reg_group, layout.len));
                        layout.len += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(layout)
    }

    fn loop_slots(&self, loop_id: usize) -> Option<&LoopSlots> {
        self.loops.iter().find(|l| l.loop_id == loop_id)
    }

    pub fn work_amount_slot(&self, loop_id: usize) -> Option<usize> {
        self.loop_slots(loop_id).map(|l| l.base)
    }

    pub fn ptr_increment_slot(&self, loop_id: usize, port: usize) -> Option<usize> {
        self.loop_slots(loop_id)
            .filter(|l| port < l.ports)
            .map(|l| l.base + 1 + port)
    }

    pub fn finalization_slot(&self, loop_id: usize, port: usize) -> Option<usize> {
        self.loop_slots(loop_id)
            .filter(|l| port < l.ports)
            .map(|l| l.base + 1 + l.ports + port)
    }

    /// Slot of the scratchpad offset of a buffer register group.
    pub fn buffer_offset_slot(&self, reg_group: usize) -> Option<usize> {
        self.buffers
            .iter()
            .find(|(group, _)| *group == reg_group)
            .map(|(_, slot)| *slot)
    }

    pub fn loop_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.loops.iter().map(|l| l.loop_id)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte displacement of a slot from the table start.
    pub fn byte_offset(slot: usize) -> i32 {
        (slot * std::mem::size_of::<i64>()) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ElementType, DYNAMIC_DIMENSION};
    use crate::lowered::pass::{InitLoops, InsertLoops, MarkLoops, RangedPass};
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::EltwiseKind;

    #[test]
    fn test_static_kernel_has_no_table() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 16], ElementType::F32).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[x]).unwrap();
        b.result(relu).unwrap();
        let ir = b.build().unwrap();
        assert!(RuntimeArgsLayout::from_ir(&ir).unwrap().is_empty());
    }

    #[test]
    fn test_dynamic_loop_slots() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, DYNAMIC_DIMENSION], ElementType::F32).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[x]).unwrap();
        b.result(relu).unwrap();
        let mut ir = b.build().unwrap();
        MarkLoops.run(&mut ir, None, None).unwrap();
        InitLoops.run(&mut ir, None, None).unwrap();
        InsertLoops.run(&mut ir, None, None).unwrap();

        let layout = RuntimeArgsLayout::from_ir(&ir).unwrap();
        let loop_id = layout.loop_ids().next().unwrap();
        // Work amount, then one load and one store port.
        assert_eq!(layout.work_amount_slot(loop_id), Some(0));
        assert_eq!(layout.ptr_increment_slot(loop_id, 1), Some(2));
        assert_eq!(layout.finalization_slot(loop_id, 0), Some(3));
        assert_eq!(layout.len(), 5);
        assert_eq!(RuntimeArgsLayout::byte_offset(3), 24);
    }
}
