// The generator turns a linear IR fresh out of the builder into executable code for one
// target. It fixes the vector width to the target's lane count, runs the lowering pipeline
// with the target's register pools, then checks every remaining expression against the
// target: its operation type must have a registered emitter and its input precisions must be
// one of the combinations the emitter accepts. Expressions owning a kernel executor (brgemm
// and weights repacking) get one registered in the executor table; for static shapes the
// executors are configured immediately, for dynamic shapes the runtime configurator does it
// on the first update. Finally the runtime-args layout is derived and the target emits the
// kernel. The executor table must stay alive as long as the compiled snippet, whose code
// embeds the executors' addresses.

//! Lowering driver: pipeline, capability checks, executors and emission.

use std::sync::Arc;

use log::{debug, info};

use crate::core::{CompilationSession, Result, SnippetsError};
use crate::kernel_executor::brgemm::{BrgemmCompiler, BrgemmConfig, BrgemmStaticParams};
use crate::kernel_executor::brgemm_copy_b::{BrgemmCopyBCompiler, BrgemmCopyBConfig, CopyBStaticParams};
use crate::kernel_executor::{KernelCache, KernelExecutor, KernelExecutorBase, KernelExecutorTable};
use crate::lowered::pass::{default_pipeline, AssignRegisters, RegisterAssignment};
use crate::lowered::{ExprId, LinearIR, RuntimeArgsLayout};
use crate::op::OpKind;
use crate::target_machine::{CompiledSnippet, EmissionContext, TargetMachine};

/// Everything produced by lowering one subgraph.
#[derive(Debug)]
pub struct LoweringResult {
    pub compiled_snippet: Arc<dyn CompiledSnippet>,
    /// Static part of the per-thread scratchpad in bytes.
    pub buffer_scratchpad_size: usize,
    pub runtime_args: RuntimeArgsLayout,
    pub registers: RegisterAssignment,
    pub executors: KernelExecutorTable,
}

pub struct Generator {
    target: Box<dyn TargetMachine>,
    cache: Arc<KernelCache>,
}

impl Generator {
    pub fn new(target: Box<dyn TargetMachine>, cache: Arc<KernelCache>) -> Self {
        Self { target, cache }
    }

    pub fn target(&self) -> &dyn TargetMachine {
        self.target.as_ref()
    }

    /// Run the lowering pipeline only.
    pub fn lower(&self, ir: &mut LinearIR, session: &CompilationSession) -> Result<()> {
        ir.config_mut().vector_size = self.target.get_lanes();
        let registers = AssignRegisters::new(self.target.get_gp_reg_pool(), self.target.get_vec_reg_pool());
        default_pipeline(registers).run(ir, session)
    }

    fn check_support(&self, ir: &LinearIR) -> Result<()> {
        for id in ir.iter() {
            let expr = ir.get(id)?;
            let op_type = expr.op_type();
            if !self.target.has(op_type) {
                return Err(SnippetsError::UnsupportedOp {
                    op: expr.op().to_string(),
                    reason: format!("no emitter on {}", self.target.isa()),
                });
            }
            let precisions: Vec<_> = expr.input_descs().iter().map(|d| d.element_type).collect();
            if !self.target.get_supported_precisions(expr)?.contains(&precisions) {
                return Err(SnippetsError::unsupported_config(format!(
                    "{} does not accept inputs {precisions:?} on {}",
                    expr.op(),
                    self.target.isa()
                )));
            }
        }
        Ok(())
    }

    fn create_executors(&self, ir: &LinearIR) -> Result<KernelExecutorTable> {
        let mut table = KernelExecutorTable::new();
        for id in ir.iter() {
            let executor: Arc<dyn KernelExecutorBase> = match ir.get(id)?.op() {
                OpKind::Brgemm(desc) => {
                    let params = BrgemmStaticParams::new(desc.src_type, desc.wei_type, self.target.isa(), desc.transposed_b);
                    Arc::new(KernelExecutor::new(BrgemmCompiler, BrgemmConfig::new(params, desc.beta), &self.cache)?)
                }
                OpKind::BrgemmCopyB(desc) => {
                    let params = CopyBStaticParams::new(desc.src_type, desc.wei_type, desc.with_compensations);
                    Arc::new(KernelExecutor::new(BrgemmCopyBCompiler, BrgemmCopyBConfig::new(params), &self.cache)?)
                }
                _ => continue,
            };
            table.register(id, executor);
        }
        if !ir.is_dynamic() {
            table.update_state(|id: ExprId| {
                let expr = ir.get(id)?;
                Ok((expr.input_descs().to_vec(), expr.output_descs().to_vec()))
            })?;
        }
        Ok(table)
    }

    /// Lower, check and emit `ir` as kernel `name`.
    pub fn generate(&self, ir: &mut LinearIR, session: &CompilationSession, name: &str) -> Result<LoweringResult> {
        session.set_current_subgraph(name);
        self.lower(ir, session)?;
        self.check_support(ir)?;
        let registers = ir
            .register_assignment()
            .cloned()
            .ok_or_else(|| SnippetsError::structure("pipeline finished without register assignment"))?;
        session.record_registers(registers.used_gp.len() as u32, registers.used_vec.len() as u32);
        session.record_scratchpad(ir.buffer_scratchpad_size());

        let executors = self.create_executors(ir)?;
        let runtime_args = RuntimeArgsLayout::from_ir(ir)?;
        debug!("{name}: {} executors, {} runtime-arg slots", executors.len(), runtime_args.len());
        let ctx = EmissionContext { runtime_args: &runtime_args, executors: &executors, kernel_name: name };
        let compiled_snippet = self.target.get_snippet(ir, &ctx)?;
        session.record_kernel_compiled(compiled_snippet.get_code_size());
        info!("{name}: compiled {} bytes for {}", compiled_snippet.get_code_size(), self.target.isa());

        Ok(LoweringResult {
            compiled_snippet,
            buffer_scratchpad_size: ir.buffer_scratchpad_size(),
            runtime_args,
            registers,
            executors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::{EltwiseKind, ReduceKind};
    use crate::target_machine::Isa;
    use crate::x64::X64TargetMachine;

    fn generator(isa: Isa) -> Generator {
        Generator::new(Box::new(X64TargetMachine::new(isa)), Arc::new(KernelCache::new(8)))
    }

    #[test]
    fn test_static_eltwise_kernel() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![2, 130], ElementType::F32).unwrap();
        let y = b.parameter(vec![1, 130], ElementType::F32).unwrap();
        let add = b.eltwise(EltwiseKind::Add, &[x, y]).unwrap();
        let relu = b.eltwise(EltwiseKind::Relu, &[add]).unwrap();
        b.result(relu).unwrap();
        let mut ir = b.build().unwrap();

        let session = CompilationSession::new();
        let result = generator(Isa::Avx2).generate(&mut ir, &session, "add_relu").unwrap();
        assert!(!result.compiled_snippet.empty());
        assert!(result.runtime_args.is_empty());
        assert_eq!(result.registers.io_regs.len(), 3);
        assert_eq!(ir.config().vector_size, 8);
        assert_eq!(session.stats().kernels_compiled, 1);
    }

    #[test]
    fn test_unregistered_operation_fails_before_emission() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 16], ElementType::F32).unwrap();
        let exp = b.eltwise(EltwiseKind::Exp, &[x]).unwrap();
        b.result(exp).unwrap();
        let mut ir = b.build().unwrap();

        let session = CompilationSession::new();
        let err = generator(Isa::Sse41).generate(&mut ir, &session, "exp").unwrap_err();
        assert!(matches!(err, SnippetsError::UnsupportedOp { .. }));
        assert_eq!(session.stats().kernels_compiled, 0);
    }

    #[test]
    fn test_matmul_registers_executor() {
        let mut b = LinearIrBuilder::new(Config::default());
        let a = b.parameter(vec![2, 4, 8, 16], ElementType::F32).unwrap();
        let w = b.parameter(vec![2, 4, 16, 8], ElementType::F32).unwrap();
        let mm = b.matmul(a, w).unwrap();
        b.result(mm).unwrap();
        let mut ir = b.build().unwrap();

        let result = generator(Isa::Avx2).generate(&mut ir, &CompilationSession::new(), "mm").unwrap();
        assert_eq!(result.executors.len(), 1);
        assert!(result.executors.iter().all(|(_, e)| e.has_kernel()));
    }

    #[test]
    fn test_reduction_kernel_has_no_buffer() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![3, 21], ElementType::F32).unwrap();
        let max = b.reduce(ReduceKind::Max, x).unwrap();
        b.result(max).unwrap();
        let mut ir = b.build().unwrap();

        let result = generator(Isa::Sse41).generate(&mut ir, &CompilationSession::new(), "max").unwrap();
        assert_eq!(result.buffer_scratchpad_size, 0);
        assert!(result.executors.is_empty());
    }
}
