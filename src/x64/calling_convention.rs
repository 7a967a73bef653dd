// This module describes the System V AMD64 ABI as seen by snippet kernels. A kernel is entered
// through one pointer argument in RDI (the KernelCallArgs block) and returns nothing; it must
// preserve RBX, RBP and R12-R15. Kernels call back into the process for kernel executors
// (brgemm, weights repacking); those helper calls follow the same ABI, so every caller-saved
// register the kernel still needs and every live vector register is saved around the call and
// the stack is realigned to 16 bytes before it. RSP and RBP are never allocated; R11 and the
// last vector register of the bank are reserved as emitter scratch and are excluded from the
// allocator pools as well.

//! System V x86-64 conventions for kernel entry and helper calls.

use crate::core::{Reg, RegBitSet, RegType};
use crate::target_machine::Isa;

pub const RAX: Reg = Reg::gpr(0);
pub const RCX: Reg = Reg::gpr(1);
pub const RDX: Reg = Reg::gpr(2);
pub const RSP: Reg = Reg::gpr(4);
pub const RBP: Reg = Reg::gpr(5);
pub const RSI: Reg = Reg::gpr(6);
pub const RDI: Reg = Reg::gpr(7);
/// Emitter scratch register, never handed out by the allocator.
pub const SCRATCH_GP: Reg = Reg::gpr(11);

/// Register partition of the ABI for one vector ISA.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers available for allocation.
    pub allocatable_regs: RegBitSet,
    /// Registers that must be preserved by the kernel.
    pub callee_saved_regs: RegBitSet,
    /// Registers used for argument passing.
    pub arg_regs: RegBitSet,
}

/// System V conventions specialised for a vector ISA.
#[derive(Debug, Clone)]
pub struct SysV {
    isa: Isa,
    cc_info: CCInfo,
}

impl SysV {
    /// GP argument registers in order.
    pub const GP_ARG_REGS: [Reg; 6] = [RDI, RSI, RDX, RCX, Reg::gpr(8), Reg::gpr(9)];

    const CALLEE_SAVED: [Reg; 6] = [Reg::gpr(3), RBP, Reg::gpr(12), Reg::gpr(13), Reg::gpr(14), Reg::gpr(15)];

    pub fn new(isa: Isa) -> Self {
        let mut allocatable = RegBitSet::new();
        for i in 0..16u8 {
            let reg = Reg::gpr(i);
            if reg != RSP && reg != RBP && reg != SCRATCH_GP {
                allocatable.set(reg);
            }
        }
        for i in 0..isa.vec_register_count() as u8 - 1 {
            allocatable.set(Reg::vec(i));
        }
        let cc_info = CCInfo {
            allocatable_regs: allocatable,
            callee_saved_regs: RegBitSet::from_regs(&Self::CALLEE_SAVED),
            arg_regs: RegBitSet::from_regs(&Self::GP_ARG_REGS),
        };
        Self { isa, cc_info }
    }

    pub fn get_ccinfo(&self) -> &CCInfo {
        &self.cc_info
    }

    pub fn gp_pool(&self) -> Vec<Reg> {
        self.cc_info.allocatable_regs.iter_bank(RegType::Gpr).collect()
    }

    pub fn vec_pool(&self) -> Vec<Reg> {
        self.cc_info.allocatable_regs.iter_bank(RegType::Vec).collect()
    }

    /// Vector register reserved for emitters.
    pub fn scratch_vec(&self) -> Reg {
        Reg::vec(self.isa.vec_register_count() as u8 - 1)
    }

    /// Registers of `used` the kernel must restore before returning, in push order.
    pub fn callee_saved_in(&self, used: &[Reg]) -> Vec<Reg> {
        used.iter()
            .copied()
            .filter(|r| self.cc_info.callee_saved_regs.contains(*r))
            .collect()
    }

    /// GP registers of `used` a helper call may clobber, in push order.
    pub fn caller_saved_in(&self, used: &[Reg]) -> Vec<Reg> {
        used.iter()
            .copied()
            .filter(|r| r.bank == RegType::Gpr && !self.cc_info.callee_saved_regs.contains(*r))
            .collect()
    }

    /// Argument registers of a helper taking `count` pointer arguments.
    pub fn helper_args(count: usize) -> &'static [Reg] {
        &Self::GP_ARG_REGS[..count.min(Self::GP_ARG_REGS.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_exclude_reserved_registers() {
        let cc = SysV::new(Isa::Avx2);
        let gp = cc.gp_pool();
        assert_eq!(gp.len(), 13);
        assert!(!gp.contains(&RSP) && !gp.contains(&RBP) && !gp.contains(&SCRATCH_GP));
        let vec = cc.vec_pool();
        assert_eq!(vec.len(), 15);
        assert!(!vec.contains(&cc.scratch_vec()));
        assert_eq!(SysV::new(Isa::Avx512).vec_pool().len(), 31);
    }

    #[test]
    fn test_saved_register_partition() {
        let cc = SysV::new(Isa::Sse41);
        let used = [RAX, Reg::gpr(3), RDI, Reg::gpr(12)];
        assert_eq!(cc.callee_saved_in(&used), vec![Reg::gpr(3), Reg::gpr(12)]);
        assert_eq!(cc.caller_saved_in(&used), vec![RAX, RDI]);
        assert_eq!(SysV::helper_args(3), &[RDI, RSI, RDX]);
    }
}
