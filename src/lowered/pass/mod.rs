// This module defines the two pass families of the lowered pipeline and the pipeline itself.
// Ranged passes transform the expression list between two handles (a `None` bound means the
// list edge) and report whether they changed anything. Const passes only inspect the IR.
// PassPipeline runs its passes in registration order over the whole IR, records every run in
// the compilation session and stops at the first error.

//! Lowered pass families and the pass pipeline.

mod assign_registers;
mod init_buffers_default;
mod init_loops;
mod insert_loops;
mod insert_specific_iterations;
mod mark_loops;
mod validate;

pub use assign_registers::{AssignRegisters, RegisterAssignment};
pub use init_buffers_default::InitBuffersDefault;
pub use init_loops::InitLoops;
pub use insert_loops::InsertLoops;
pub use insert_specific_iterations::InsertSpecificIterations;
pub use mark_loops::MarkLoops;
pub use validate::Validate;

pub(crate) use init_loops::port_increment;
pub(crate) use insert_specific_iterations::expanded_work_amount;

use log::debug;

use crate::core::{CompilationSession, Result};

use super::expression::ExprId;
use super::linear_ir::LinearIR;

/// A pass transforming the expressions of `[begin, end)`.
pub trait RangedPass {
    fn name(&self) -> &'static str;

    /// Returns whether the IR was modified.
    fn run(&mut self, ir: &mut LinearIR, begin: Option<ExprId>, end: Option<ExprId>) -> Result<bool>;
}

/// A pass that only inspects the IR.
pub trait ConstPass {
    fn name(&self) -> &'static str;

    fn run(&self, ir: &LinearIR) -> Result<()>;
}

enum PassEntry {
    Ranged(Box<dyn RangedPass>),
    Const(Box<dyn ConstPass>),
}

/// Ordered list of passes applied to a whole linear IR.
#[derive(Default)]
pub struct PassPipeline {
    passes: Vec<PassEntry>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pass: impl RangedPass + 'static) -> &mut Self {
        self.passes.push(PassEntry::Ranged(Box::new(pass)));
        self
    }

    pub fn register_const(&mut self, pass: impl ConstPass + 'static) -> &mut Self {
        self.passes.push(PassEntry::Const(Box::new(pass)));
        self
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes
            .iter()
            .map(|p| match p {
                PassEntry::Ranged(p) => p.name(),
                PassEntry::Const(p) => p.name(),
            })
            .collect()
    }

    pub fn run(&mut self, ir: &mut LinearIR, session: &CompilationSession) -> Result<()> {
        for entry in &mut self.passes {
            match entry {
                PassEntry::Ranged(pass) => {
                    let modified = pass.run(ir, None, None)?;
                    debug!("pass {} modified={modified} expressions={}", pass.name(), ir.len());
                    session.record_pass(pass.name(), modified);
                }
                PassEntry::Const(pass) => {
                    pass.run(ir)?;
                    debug!("pass {} ok", pass.name());
                    session.record_pass(pass.name(), false);
                }
            }
        }
        session.record_ir_shape(ir.len(), ir.loop_manager().len(), ir.buffers().len());
        Ok(())
    }
}

/// The default lowering pipeline for a target with the given register pools.
pub fn default_pipeline(registers: AssignRegisters) -> PassPipeline {
    let mut pipeline = PassPipeline::new();
    pipeline
        .register(MarkLoops)
        .register(InitLoops)
        .register(InsertLoops)
        .register(InsertSpecificIterations)
        .register(InitBuffersDefault)
        .register(registers)
        .register_const(Validate);
    pipeline
}
