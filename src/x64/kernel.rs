// Kernel entry and exit code. The prologue saves the callee-saved registers the body uses,
// unpacks the KernelCallArgs block into the registers chosen by register assignment
// (runtime-args table, one pointer per buffer register group, one pointer per parameter and
// result) and falls through into the body. The argument block pointer is moved to the
// scratch register first so RDI can be handed out as an ordinary pointer register. Buffer
// pointers are the scratchpad base plus the buffer's static offset, or plus the offset the
// runtime configurator stored in the runtime-args table for buffers sized at runtime.

//! Kernel prologue and epilogue.

use hashbrown::HashMap;

use crate::core::dims::is_dynamic_value;
use crate::core::{Reg, Result, SnippetsError};
use crate::lowered::pass::RegisterAssignment;
use crate::lowered::{LinearIR, RuntimeArgsLayout};
use crate::op::OpKind;
use crate::target_machine::KernelCallArgs;

use super::calling_convention::{SysV, RDI, SCRATCH_GP};
use super::encoder::X64Encoder;

pub struct KernelEmitter<'a> {
    ir: &'a LinearIR,
    registers: &'a RegisterAssignment,
    runtime_args: &'a RuntimeArgsLayout,
    saved: Vec<Reg>,
}

impl<'a> KernelEmitter<'a> {
    pub fn new(ir: &'a LinearIR, registers: &'a RegisterAssignment, runtime_args: &'a RuntimeArgsLayout, cc: &SysV) -> Self {
        Self {
            ir,
            registers,
            runtime_args,
            saved: cc.callee_saved_in(&registers.used_gp),
        }
    }

    /// Static scratchpad offset of each buffer register group, `None` when set at runtime.
    fn buffer_offsets(&self) -> Result<HashMap<usize, Option<usize>>> {
        let mut offsets = HashMap::new();
        for id in self.ir.buffers() {
            if let OpKind::Buffer(desc) = self.ir.get(id)?.op() {
                let offset = (!is_dynamic_value(desc.offset)).then_some(desc.offset);
                offsets.entry(desc.reg_group).or_insert(offset);
            }
        }
        Ok(offsets)
    }

    pub fn emit_prologue(&self, enc: &mut X64Encoder) -> Result<()> {
        for &reg in &self.saved {
            enc.push_reg(reg)?;
        }
        enc.mov_reg_reg(SCRATCH_GP, RDI)?;

        let rt = self.registers.runtime_args_reg;
        if let Some(rt) = rt {
            enc.mov_reg_mem(rt, SCRATCH_GP, KernelCallArgs::RUNTIME_ARGS_OFFSET)?;
        }

        let offsets = self.buffer_offsets()?;
        for &(group, reg) in &self.registers.buffer_regs {
            enc.mov_reg_mem(reg, SCRATCH_GP, KernelCallArgs::SCRATCHPAD_OFFSET)?;
            match offsets.get(&group).copied().flatten() {
                Some(offset) => {
                    // Wider immediates would be materialized through the scratch register.
                    let offset = i32::try_from(offset)
                        .map_err(|_| SnippetsError::unsupported_config(format!("buffer offset {offset} exceeds 2 GiB")))?;
                    enc.add_reg_imm(reg, offset as i64)?;
                }
                None => {
                    let slot = self.runtime_args.buffer_offset_slot(group).ok_or_else(|| {
                        SnippetsError::structure(format!("buffer group {group} has neither a static offset nor a runtime slot"))
                    })?;
                    let rt = rt.ok_or_else(|| SnippetsError::structure("runtime buffer offset in a static kernel"))?;
                    enc.add_reg_mem(reg, rt, RuntimeArgsLayout::byte_offset(slot) as i64)?;
                }
            }
        }

        enc.mov_reg_mem(SCRATCH_GP, SCRATCH_GP, KernelCallArgs::IO_PTRS_OFFSET)?;
        for (i, &reg) in self.registers.io_regs.iter().enumerate() {
            enc.mov_reg_mem(reg, SCRATCH_GP, 8 * i as i64)?;
        }
        Ok(())
    }

    pub fn emit_epilogue(&self, enc: &mut X64Encoder) -> Result<()> {
        for &reg in self.saved.iter().rev() {
            enc.pop_reg(reg)?;
        }
        enc.ret()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowered::Config;
    use crate::target_machine::Isa;

    #[test]
    fn test_callee_saved_registers_are_restored_in_reverse() {
        let ir = LinearIR::new(Config::default());
        let registers = RegisterAssignment {
            io_regs: vec![Reg::gpr(7), Reg::gpr(3)],
            used_gp: vec![Reg::gpr(3), Reg::gpr(7), Reg::gpr(12)],
            ..Default::default()
        };
        let layout = RuntimeArgsLayout::default();
        let cc = SysV::new(Isa::Avx2);
        let kernel = KernelEmitter::new(&ir, &registers, &layout, &cc);
        assert_eq!(kernel.saved, vec![Reg::gpr(3), Reg::gpr(12)]);

        let mut enc = X64Encoder::new(Isa::Avx2).unwrap();
        kernel.emit_prologue(&mut enc).unwrap();
        kernel.emit_epilogue(&mut enc).unwrap();
        let code = enc.finalize().unwrap();
        // push rbx; push r12 ... pop r12; pop rbx; ret
        assert_eq!(&code[..3], &[0x53, 0x41, 0x54]);
        assert_eq!(&code[code.len() - 4..], &[0x41, 0x5C, 0x5B, 0xC3]);
    }
}
