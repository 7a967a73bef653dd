//! Structural checks of a fully lowered IR.

use hashbrown::{HashMap, HashSet};

use crate::core::dims::is_dynamic_value;
use crate::core::{Result, SnippetsError};
use crate::lowered::linear_ir::LinearIR;
use crate::op::OpKind;

use super::ConstPass;

/// Checks loop marker pairing and nesting, loop ids against the enclosing markers,
/// connected inputs and disjoint buffer regions.
pub struct Validate;

impl Validate {
    fn check_loops(ir: &LinearIR) -> Result<()> {
        let mut stack: Vec<usize> = Vec::new();
        let mut closed: HashSet<usize> = HashSet::new();
        for id in ir.iter() {
            let expr = ir.get(id)?;
            match expr.op() {
                OpKind::LoopBegin { loop_id } => {
                    if expr.loop_ids() != stack.as_slice() {
                        return Err(SnippetsError::loop_nesting(format!(
                            "LoopBegin({loop_id}) carries loops {:?} inside {stack:?}",
                            expr.loop_ids()
                        )));
                    }
                    if closed.contains(loop_id) || stack.contains(loop_id) {
                        return Err(SnippetsError::loop_nesting(format!("loop {loop_id} is opened twice")));
                    }
                    ir.loop_manager().get(*loop_id)?;
                    stack.push(*loop_id);
                }
                OpKind::LoopEnd { loop_id } => {
                    if stack.pop() != Some(*loop_id) {
                        return Err(SnippetsError::loop_nesting(format!(
                            "LoopEnd({loop_id}) does not close the innermost open loop"
                        )));
                    }
                    if expr.loop_ids() != stack.as_slice() {
                        return Err(SnippetsError::loop_nesting(format!(
                            "LoopEnd({loop_id}) carries loops {:?} inside {stack:?}",
                            expr.loop_ids()
                        )));
                    }
                    match ir.source(id, 0)? {
                        Some(src) if matches!(ir.get(src.expr)?.op(), OpKind::LoopBegin { loop_id: b } if b == loop_id) => {}
                        _ => {
                            return Err(SnippetsError::loop_nesting(format!(
                                "LoopEnd({loop_id}) is not connected to its LoopBegin"
                            )))
                        }
                    }
                    closed.insert(*loop_id);
                }
                _ => {
                    if expr.loop_ids() != stack.as_slice() {
                        return Err(SnippetsError::loop_nesting(format!(
                            "{id} ({}) has loops {:?} but is enclosed by {stack:?}",
                            expr.op(),
                            expr.loop_ids()
                        )));
                    }
                }
            }
        }
        if let Some(open) = stack.last() {
            return Err(SnippetsError::loop_nesting(format!("loop {open} is never closed")));
        }
        Ok(())
    }

    fn check_inputs(ir: &LinearIR) -> Result<()> {
        for id in ir.iter() {
            let expr = ir.get(id)?;
            for (inp, source) in expr.inputs().iter().enumerate() {
                match source {
                    Some(src) if ir.contains(src.expr) => {}
                    _ => {
                        return Err(SnippetsError::structure(format!(
                            "input {inp} of {id} ({}) is not connected",
                            expr.op()
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    fn check_buffers(ir: &LinearIR) -> Result<()> {
        let mut regions: Vec<(usize, usize, usize, usize)> = Vec::new();
        let mut groups: HashMap<usize, usize> = HashMap::new();
        for id in ir.buffers() {
            let OpKind::Buffer(desc) = ir.get(id)?.op() else { continue };
            if let Some(&other) = groups.get(&desc.reg_group) {
                return Err(SnippetsError::BufferOverlap { first: other, second: desc.id });
            }
            groups.insert(desc.reg_group, desc.id);
            if is_dynamic_value(desc.offset) || is_dynamic_value(desc.allocation_size) {
                continue;
            }
            let (start, end) = (desc.offset, desc.offset + desc.allocation_size);
            for &(other, o_start, o_end, _) in &regions {
                if start < o_end && o_start < end {
                    return Err(SnippetsError::BufferOverlap { first: other, second: desc.id });
                }
            }
            regions.push((desc.id, start, end, desc.reg_group));
        }
        Ok(())
    }
}

impl ConstPass for Validate {
    fn name(&self) -> &'static str {
        "Validate"
    }

    fn run(&self, ir: &LinearIR) -> Result<()> {
        Self::check_loops(ir)?;
        Self::check_inputs(ir)?;
        Self::check_buffers(ir)
    }
}
