//! Runtime optimizers: policies that refine a runtime config after the generic derivation.

use std::fmt;

use log::debug;

use crate::core::Result;
use crate::graph::split_dimension_m::SplitDimensionM;
use crate::lowered::{ExprId, LinearIR};
use crate::op::OpKind;

use super::RuntimeConfig;

/// Registered once per configurator when applicable to its linear IR.
pub trait RuntimeOptimizer: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Refine `config` for the current shapes. Returns whether anything changed.
    fn optimize(&self, ir: &mut LinearIR, config: &mut RuntimeConfig) -> Result<bool>;
}

/// Splits the M dimension of a matmul kernel into an extra parallel dimension when the
/// batch alone cannot keep every thread busy.
#[derive(Debug)]
pub struct MHAParallelWAOptimizer {
    brgemm: ExprId,
    /// io index of the A input and of the output.
    a_io: usize,
    c_io: usize,
    concurrency: usize,
}

impl MHAParallelWAOptimizer {
    /// Applicable to dynamic kernels made of one brgemm (plus weights repacking) reading A
    /// from a parameter and writing a result, when more than one thread is available.
    pub fn new_if_applicable(ir: &LinearIR, io_exprs: &[ExprId]) -> Result<Option<Self>> {
        let concurrency = ir.config().concurrency;
        if !ir.is_dynamic() || concurrency <= 1 {
            return Ok(None);
        }
        let mut brgemm = None;
        for id in ir.iter() {
            match ir.get(id)?.op() {
                OpKind::Brgemm(_) if brgemm.is_none() => brgemm = Some(id),
                OpKind::Parameter { .. } | OpKind::Result { .. } | OpKind::BrgemmCopyB(_) | OpKind::Buffer(_) => {}
                _ => return Ok(None),
            }
        }
        let Some(brgemm) = brgemm else {
            return Ok(None);
        };
        let a_root = ir.memory_root_of_input(brgemm, 0)?;
        let c_root = ir.memory_root_of_output(brgemm, 0)?;
        let position = |root: Option<ExprId>| root.and_then(|r| io_exprs.iter().position(|&e| e == r));
        match (position(a_root), position(c_root)) {
            (Some(a_io), Some(c_io)) => Ok(Some(Self { brgemm, a_io, c_io, concurrency })),
            _ => Ok(None),
        }
    }
}

impl RuntimeOptimizer for MHAParallelWAOptimizer {
    fn name(&self) -> &'static str {
        "MHAParallelWAOptimizer"
    }

    fn optimize(&self, ir: &mut LinearIR, config: &mut RuntimeConfig) -> Result<bool> {
        let batch = config.work_amount();
        if batch >= self.concurrency {
            return Ok(false);
        }
        let expr = ir.get(self.brgemm)?;
        let (a, c) = (&expr.input_descs()[0], &expr.output_descs()[0]);
        let (a_rank, c_rank) = (a.rank(), c.rank());
        if a_rank < 2 || c_rank < 2 {
            return Ok(false);
        }
        let m = a.shape[a_rank - 2];
        let Some((outer, block)) = SplitDimensionM::split_dims(batch, m, self.concurrency) else {
            return Ok(false);
        };
        let a_row = a.planar_strides(&a.shape)[a_rank - 2] * a.element_type.size();
        let c_row = c.planar_strides(&c.shape)[c_rank - 2] * c.element_type.size();

        config.parallel_domain.push(outer);
        for (io, steps) in config.io_data_offsets.iter_mut().enumerate() {
            let step = match io {
                _ if io == self.a_io => block * a_row,
                _ if io == self.c_io => block * c_row,
                _ => 0,
            };
            steps.push(step);
        }
        let expr = ir.get_mut(self.brgemm)?;
        expr.input_descs_mut()[0].shape[a_rank - 2] = block;
        expr.output_descs_mut()[0].shape[c_rank - 2] = block;
        debug!("M = {m} split into {outer} x {block} for {} threads", self.concurrency);
        Ok(true)
    }
}
