// This module wraps the iced-x86 code assembler for kernel emission. X64Encoder maps allocator
// registers (bank + id) onto iced register operands of the width the ISA needs (64/32-bit GP,
// XMM for SSE4.1, YMM for AVX2, ZMM for AVX-512), keeps one pair of labels per loop id so the
// LoopBegin and LoopEnd emitters can jump to each other, and collects a constant pool of
// vector-sized literals (splatted scalars, lane masks) that is appended after the code and
// addressed RIP-relative through the scratch GP register. The GP helpers mirror the handful
// of scalar instructions kernels need for pointer arithmetic, loop counters and helper calls.
// Every iced failure is reported as an Encoding error.

//! x86-64 instruction encoding using iced-x86.

use hashbrown::{HashMap, HashSet};
use iced_x86::code_asm::*;
use iced_x86::IcedError;

use crate::core::{Reg, RegType, Result, SnippetsError};
use crate::target_machine::Isa;

use super::calling_convention::SCRATCH_GP;

pub(crate) fn encoding(e: IcedError) -> SnippetsError {
    SnippetsError::Encoding { reason: e.to_string() }
}

/// Which side of a loop a label marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopLabel {
    Begin,
    End,
}

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const XMM_REGS: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
];

const YMM_REGS: [AsmRegisterYmm; 16] = [
    ymm0, ymm1, ymm2, ymm3, ymm4, ymm5, ymm6, ymm7, ymm8, ymm9, ymm10, ymm11, ymm12, ymm13, ymm14, ymm15,
];

const ZMM_REGS: [AsmRegisterZmm; 32] = [
    zmm0, zmm1, zmm2, zmm3, zmm4, zmm5, zmm6, zmm7, zmm8, zmm9, zmm10, zmm11, zmm12, zmm13, zmm14, zmm15,
    zmm16, zmm17, zmm18, zmm19, zmm20, zmm21, zmm22, zmm23, zmm24, zmm25, zmm26, zmm27, zmm28, zmm29, zmm30,
    zmm31,
];

fn invalid(reg: Reg, what: &str) -> SnippetsError {
    SnippetsError::Encoding { reason: format!("{reg} is not a valid {what} register") }
}

/// Kernel code buffer for one ISA.
pub struct X64Encoder {
    assembler: CodeAssembler,
    isa: Isa,
    loop_labels: HashMap<(usize, LoopLabel), CodeLabel>,
    placed_labels: HashSet<(usize, LoopLabel)>,
    constants: Vec<(Vec<u8>, CodeLabel)>,
}

impl X64Encoder {
    pub fn new(isa: Isa) -> Result<Self> {
        Ok(Self {
            assembler: CodeAssembler::new(64).map_err(encoding)?,
            isa,
            loop_labels: HashMap::new(),
            placed_labels: HashSet::new(),
            constants: Vec::new(),
        })
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    /// Raw assembler for vector instructions.
    pub fn asm(&mut self) -> &mut CodeAssembler {
        &mut self.assembler
    }

    pub fn gp(&self, reg: Reg) -> Result<AsmRegister64> {
        if reg.bank != RegType::Gpr {
            return Err(invalid(reg, "general purpose"));
        }
        GP64_REGS.get(reg.id as usize).copied().ok_or_else(|| invalid(reg, "general purpose"))
    }

    pub fn gp32(&self, reg: Reg) -> Result<AsmRegister32> {
        if reg.bank != RegType::Gpr {
            return Err(invalid(reg, "general purpose"));
        }
        GP32_REGS.get(reg.id as usize).copied().ok_or_else(|| invalid(reg, "general purpose"))
    }

    pub fn xmm(&self, reg: Reg) -> Result<AsmRegisterXmm> {
        if reg.bank != RegType::Vec {
            return Err(invalid(reg, "xmm"));
        }
        XMM_REGS.get(reg.id as usize).copied().ok_or_else(|| invalid(reg, "xmm"))
    }

    pub fn ymm(&self, reg: Reg) -> Result<AsmRegisterYmm> {
        if reg.bank != RegType::Vec {
            return Err(invalid(reg, "ymm"));
        }
        YMM_REGS.get(reg.id as usize).copied().ok_or_else(|| invalid(reg, "ymm"))
    }

    pub fn zmm(&self, reg: Reg) -> Result<AsmRegisterZmm> {
        if reg.bank != RegType::Vec {
            return Err(invalid(reg, "zmm"));
        }
        ZMM_REGS.get(reg.id as usize).copied().ok_or_else(|| invalid(reg, "zmm"))
    }

    pub fn scratch(&self) -> AsmRegister64 {
        GP64_REGS[SCRATCH_GP.id as usize]
    }

    /// Memory operand `[base + disp]`.
    pub fn mem(&self, base: Reg, disp: i64) -> Result<AsmMemoryOperand> {
        let disp = i32::try_from(disp)
            .map_err(|_| SnippetsError::Encoding { reason: format!("displacement {disp} does not fit 32 bits") })?;
        Ok(ptr(self.gp(base)? + disp))
    }

    // ==== LABELS ====

    pub fn loop_label(&mut self, loop_id: usize, side: LoopLabel) -> CodeLabel {
        if let Some(&label) = self.loop_labels.get(&(loop_id, side)) {
            return label;
        }
        let label = self.assembler.create_label();
        self.loop_labels.insert((loop_id, side), label);
        label
    }

    pub fn place_loop_label(&mut self, loop_id: usize, side: LoopLabel) -> Result<()> {
        let mut label = self.loop_label(loop_id, side);
        self.assembler.set_label(&mut label).map_err(encoding)?;
        self.placed_labels.insert((loop_id, side));
        Ok(())
    }

    // ==== CONSTANT POOL ====

    /// Load the address of a pooled constant into the scratch register.
    pub fn lea_constant(&mut self, bytes: Vec<u8>) -> Result<()> {
        let label = match self.constants.iter().find(|(data, _)| *data == bytes) {
            Some((_, label)) => *label,
            None => {
                let label = self.assembler.create_label();
                self.constants.push((bytes, label));
                label
            }
        };
        self.assembler.lea(r11, ptr(label)).map_err(encoding)
    }

    /// One vector of `value` in every lane.
    pub fn lea_splat(&mut self, bits: u32) -> Result<()> {
        let lanes = self.isa.lanes();
        self.lea_lanes(&vec![bits; lanes])
    }

    /// One vector with explicit lane values.
    pub fn lea_lanes(&mut self, lanes: &[u32]) -> Result<()> {
        self.lea_constant(lanes.iter().flat_map(|l| l.to_le_bytes()).collect())
    }

    // ==== GP INSTRUCTIONS ====

    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) -> Result<()> {
        if dst == src {
            return Ok(());
        }
        let (d, s) = (self.gp(dst)?, self.gp(src)?);
        self.assembler.mov(d, s).map_err(encoding)
    }

    pub fn mov_reg_imm(&mut self, dst: Reg, imm: i64) -> Result<()> {
        let d = self.gp(dst)?;
        self.assembler.mov(d, imm).map_err(encoding)
    }

    pub fn mov_reg_mem(&mut self, dst: Reg, base: Reg, disp: i64) -> Result<()> {
        let d = self.gp(dst)?;
        let mem = self.mem(base, disp)?;
        self.assembler.mov(d, qword_ptr(mem)).map_err(encoding)
    }

    pub fn add_reg_imm(&mut self, dst: Reg, imm: i64) -> Result<()> {
        if imm == 0 {
            return Ok(());
        }
        let d = self.gp(dst)?;
        match i32::try_from(imm) {
            Ok(imm) => self.assembler.add(d, imm).map_err(encoding),
            Err(_) => {
                self.assembler.mov(r11, imm).map_err(encoding)?;
                self.assembler.add(d, r11).map_err(encoding)
            }
        }
    }

    pub fn add_reg_mem(&mut self, dst: Reg, base: Reg, disp: i64) -> Result<()> {
        let d = self.gp(dst)?;
        let mem = self.mem(base, disp)?;
        self.assembler.add(d, qword_ptr(mem)).map_err(encoding)
    }

    pub fn sub_reg_imm(&mut self, dst: Reg, imm: i32) -> Result<()> {
        let d = self.gp(dst)?;
        self.assembler.sub(d, imm).map_err(encoding)
    }

    pub fn cmp_reg_imm(&mut self, reg: Reg, imm: i32) -> Result<()> {
        let r = self.gp(reg)?;
        self.assembler.cmp(r, imm).map_err(encoding)
    }

    pub fn push_reg(&mut self, reg: Reg) -> Result<()> {
        let r = self.gp(reg)?;
        self.assembler.push(r).map_err(encoding)
    }

    pub fn pop_reg(&mut self, reg: Reg) -> Result<()> {
        let r = self.gp(reg)?;
        self.assembler.pop(r).map_err(encoding)
    }

    pub fn jge_loop(&mut self, loop_id: usize, side: LoopLabel) -> Result<()> {
        let label = self.loop_label(loop_id, side);
        self.assembler.jge(label).map_err(encoding)
    }

    pub fn jl_loop(&mut self, loop_id: usize, side: LoopLabel) -> Result<()> {
        let label = self.loop_label(loop_id, side);
        self.assembler.jl(label).map_err(encoding)
    }

    pub fn ret(&mut self) -> Result<()> {
        self.assembler.ret().map_err(encoding)
    }

    /// Machine code followed by the constant pool.
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        let unplaced: Vec<_> = self
            .loop_labels
            .keys()
            .filter(|key| !self.placed_labels.contains(*key))
            .copied()
            .collect();
        if let Some((loop_id, side)) = unplaced.first() {
            return Err(SnippetsError::loop_nesting(format!("{side:?} label of loop {loop_id} was never placed")));
        }
        let constants = std::mem::take(&mut self.constants);
        for (bytes, mut label) in constants {
            self.assembler.set_label(&mut label).map_err(encoding)?;
            self.assembler.db(&bytes).map_err(encoding)?;
        }
        self.assembler.assemble(0).map_err(encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gp_sequence_assembles() {
        let mut enc = X64Encoder::new(Isa::Sse41).unwrap();
        enc.mov_reg_imm(Reg::gpr(0), 42).unwrap();
        enc.add_reg_imm(Reg::gpr(0), 1 << 40).unwrap();
        enc.mov_reg_mem(Reg::gpr(1), Reg::gpr(7), 16).unwrap();
        enc.ret().unwrap();
        let code = enc.finalize().unwrap();
        assert_eq!(*code.last().unwrap(), 0xC3);
    }

    #[test]
    fn test_constant_pool_is_appended_once() {
        let mut enc = X64Encoder::new(Isa::Sse41).unwrap();
        enc.lea_splat(1.0f32.to_bits()).unwrap();
        enc.lea_splat(1.0f32.to_bits()).unwrap();
        enc.ret().unwrap();
        let code = enc.finalize().unwrap();
        // One 16-byte literal after the code.
        let tail: Vec<u8> = 1.0f32.to_bits().to_le_bytes().repeat(4);
        assert!(code.ends_with(&tail));
        assert_eq!(code.windows(tail.len()).filter(|w| *w == tail.as_slice()).count(), 1);
    }

    #[test]
    fn test_unplaced_loop_label_is_rejected() {
        let mut enc = X64Encoder::new(Isa::Avx2).unwrap();
        enc.cmp_reg_imm(Reg::gpr(1), 8).unwrap();
        enc.jl_loop(3, LoopLabel::End).unwrap();
        enc.ret().unwrap();
        assert!(matches!(enc.finalize(), Err(SnippetsError::LoopNesting { .. })));
    }

    #[test]
    fn test_register_banks_are_checked() {
        let enc = X64Encoder::new(Isa::Avx512).unwrap();
        assert!(enc.gp(Reg::vec(0)).is_err());
        assert!(enc.zmm(Reg::vec(31)).is_ok());
        assert!(enc.ymm(Reg::vec(16)).is_err());
    }
}
