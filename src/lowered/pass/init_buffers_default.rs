//! Default buffer policy: every buffer gets its own scratchpad region and register group.

use log::debug;

use crate::core::dims::is_dynamic_value;
use crate::core::{Result, DYNAMIC_DIMENSION};
use crate::lowered::expression::ExprId;
use crate::lowered::linear_ir::LinearIR;
use crate::op::OpKind;

use super::RangedPass;

pub struct InitBuffersDefault;

impl InitBuffersDefault {
    /// Assign offsets and register groups and return the static scratchpad size in bytes.
    /// Buffers of dynamic size are placed by the runtime configurator after the static ones.
    pub fn assign(&self, ir: &mut LinearIR) -> Result<usize> {
        let mut scratchpad = 0usize;
        for (group, id) in ir.buffers().into_iter().enumerate() {
            if let OpKind::Buffer(desc) = ir.get_mut(id)?.op_mut() {
                desc.reg_group = group;
                if is_dynamic_value(desc.allocation_size) {
                    desc.offset = DYNAMIC_DIMENSION;
                } else {
                    desc.offset = scratchpad;
                    scratchpad += desc.allocation_size;
                }
            }
        }
        Ok(scratchpad)
    }
}

impl RangedPass for InitBuffersDefault {
    fn name(&self) -> &'static str {
        "InitBuffersDefault"
    }

    fn run(&mut self, ir: &mut LinearIR, _begin: Option<ExprId>, _end: Option<ExprId>) -> Result<bool> {
        let scratchpad = self.assign(ir)?;
        debug!("static buffer scratchpad: {scratchpad} bytes");
        ir.set_buffer_scratchpad_size(scratchpad);
        Ok(!ir.buffers().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::{BufferDesc, EltwiseKind, ReduceKind};

    fn buffer_descs(ir: &LinearIR) -> Vec<BufferDesc> {
        ir.buffers()
            .into_iter()
            .map(|id| match ir.get(id).unwrap().op() {
                OpKind::Buffer(desc) => desc.clone(),
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_offsets_are_running_sum() {
        // relu(x) is needed after two reductions, so two spills are created.
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 16], ElementType::F32).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[x]).unwrap();
        let max = b.reduce(ReduceKind::Max, relu).unwrap();
        let shifted = b.eltwise(EltwiseKind::Subtract, &[relu, max]).unwrap();
        let sum = b.reduce(ReduceKind::Sum, shifted).unwrap();
        let norm = b.eltwise(EltwiseKind::Divide, &[shifted, sum]).unwrap();
        b.result(norm).unwrap();
        let mut ir = b.build().unwrap();

        let scratchpad = InitBuffersDefault.assign(&mut ir).unwrap();
        let descs = buffer_descs(&ir);
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].offset, 0);
        assert_eq!(descs[1].offset, descs[0].allocation_size);
        assert_ne!(descs[0].reg_group, descs[1].reg_group);
        assert_eq!(scratchpad, 2 * 16 * 4);
    }

    #[test]
    fn test_dynamic_buffer_offset_is_deferred() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, DYNAMIC_DIMENSION], ElementType::F32).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[x]).unwrap();
        let max = b.reduce(ReduceKind::Max, relu).unwrap();
        let shifted = b.eltwise(EltwiseKind::Subtract, &[relu, max]).unwrap();
        b.result(shifted).unwrap();
        let mut ir = b.build().unwrap();

        assert_eq!(InitBuffersDefault.assign(&mut ir).unwrap(), 0);
        assert!(is_dynamic_value(buffer_descs(&ir)[0].offset));
    }
}
