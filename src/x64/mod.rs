//! x86-64 target: System V conventions, iced-x86 encoding, emitters and JIT memory.

pub mod calling_convention;
pub mod elf;
pub mod emitters;
pub mod encoder;
pub mod jit;
pub mod kernel;

use std::sync::Arc;

use log::debug;

use crate::core::{ElementType, Reg, Result, SnippetsError};
use crate::lowered::{Expression, LinearIR};
use crate::op::OpType;
use crate::target_machine::{CompiledSnippet, EmissionContext, EmitterRegistry, Isa, TargetMachine};

pub use calling_convention::SysV;
pub use elf::write_elf;
pub use emitters::{EmitCtx, X64Emitter};
pub use encoder::X64Encoder;
pub use jit::JitSnippet;

use kernel::KernelEmitter;

/// Target machine emitting x86-64 code for one vector ISA.
#[derive(Clone)]
pub struct X64TargetMachine {
    isa: Isa,
    cc: SysV,
    registry: EmitterRegistry<dyn X64Emitter>,
}

impl X64TargetMachine {
    pub fn new(isa: Isa) -> Self {
        Self {
            isa,
            cc: SysV::new(isa),
            registry: emitters::x64_registry(),
        }
    }

    /// Target for the widest ISA of the running CPU.
    pub fn host() -> Result<Self> {
        Isa::host()
            .map(Self::new)
            .ok_or_else(|| SnippetsError::unsupported_config("host CPU lacks SSE4.1"))
    }

    pub fn registry(&self) -> &EmitterRegistry<dyn X64Emitter> {
        &self.registry
    }

    /// Machine code of `ir` without mapping it.
    pub fn emit_code(&self, ir: &LinearIR, ctx: &EmissionContext<'_>) -> Result<Vec<u8>> {
        let registers = ir
            .register_assignment()
            .ok_or_else(|| SnippetsError::structure("emission requires register assignment"))?;
        let kernel = KernelEmitter::new(ir, registers, ctx.runtime_args, &self.cc);
        let mut enc = X64Encoder::new(self.isa)?;
        kernel.emit_prologue(&mut enc)?;
        for id in ir.iter() {
            let expr = ir.get(id)?;
            let emitter = (self.registry.get(expr.op_type())?.factory)(expr)?;
            let emit_ctx = EmitCtx {
                ir,
                expr_id: id,
                runtime_args: ctx.runtime_args,
                registers,
                executors: ctx.executors,
                cc: &self.cc,
            };
            emitter.emit(&mut enc, expr, &emit_ctx)?;
        }
        kernel.emit_epilogue(&mut enc)?;
        enc.finalize()
    }
}

impl TargetMachine for X64TargetMachine {
    fn isa(&self) -> Isa {
        self.isa
    }

    fn is_supported(&self) -> bool {
        self.isa.is_supported_by_host()
    }

    fn get_abi_arg_regs(&self) -> Vec<Reg> {
        SysV::GP_ARG_REGS.to_vec()
    }

    fn get_gp_reg_pool(&self) -> Vec<Reg> {
        self.cc.gp_pool()
    }

    fn get_vec_reg_pool(&self) -> Vec<Reg> {
        self.cc.vec_pool()
    }

    fn has(&self, op_type: OpType) -> bool {
        self.registry.has(op_type)
    }

    fn get_supported_precisions(&self, expr: &Expression) -> Result<Vec<Vec<ElementType>>> {
        Ok((self.registry.get(expr.op_type())?.supported_precisions)(expr))
    }

    fn get_snippet(&self, ir: &LinearIR, ctx: &EmissionContext<'_>) -> Result<Arc<dyn CompiledSnippet>> {
        let code = self.emit_code(ir, ctx)?;
        debug!("{}: emitted {} bytes of {} code", ctx.kernel_name, code.len(), self.isa);
        Ok(Arc::new(JitSnippet::new(code)?))
    }

    fn clone_box(&self) -> Box<dyn TargetMachine> {
        Box::new(self.clone())
    }
}
