// This module implements register assignment for snippet kernels. General purpose registers
// are handed out first and held for the whole kernel: one per parameter and result pointer,
// one per buffer register group and one for the runtime-arguments table of dynamic kernels.
// Loop counters are allocated at their LoopBegin and released after their LoopEnd, so
// sequential loops reuse the same counter. Vector registers are assigned with a linear scan
// over the live ranges computed by the liveness module; a range is released once the scan has
// moved past its last use. There is no spilling: running out of registers in either bank fails
// the compilation of the subgraph. Values that stay live across a kernel executor call are
// recorded so the call emitter can preserve them.

//! Register assignment over the linear IR.

use bumpalo::Bump;
use hashbrown::HashMap;
use log::debug;

use crate::core::{Reg, RegType, RegisterFile, Result, SnippetsError};
use crate::lowered::expression::ExprId;
use crate::lowered::linear_ir::LinearIR;
use crate::lowered::liveness::Liveness;
use crate::op::OpKind;

use super::RangedPass;

/// Kernel-wide register decisions the emitters and the prologue rely on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterAssignment {
    /// Pointer register of every parameter, then every result, in io order.
    pub io_regs: Vec<Reg>,
    /// Pointer register of each buffer register group.
    pub buffer_regs: Vec<(usize, Reg)>,
    pub runtime_args_reg: Option<Reg>,
    pub used_gp: Vec<Reg>,
    pub used_vec: Vec<Reg>,
    /// Vector registers holding live values across each executor call.
    pub live_across_calls: HashMap<ExprId, Vec<Reg>>,
}

impl RegisterAssignment {
    pub fn buffer_reg(&self, reg_group: usize) -> Option<Reg> {
        self.buffer_regs.iter().find(|(g, _)| *g == reg_group).map(|(_, r)| *r)
    }
}

pub struct AssignRegisters {
    gp_pool: Vec<Reg>,
    vec_pool: Vec<Reg>,
    arena: Bump,
}

impl AssignRegisters {
    pub fn new(gp_pool: Vec<Reg>, vec_pool: Vec<Reg>) -> Self {
        Self { gp_pool, vec_pool, arena: Bump::new() }
    }

    fn assign_gp(
        ir: &LinearIR,
        file: &mut RegisterFile,
        owner: &mut usize,
    ) -> Result<(RegisterAssignment, HashMap<ExprId, Reg>, HashMap<usize, Reg>)> {
        let mut next_owner = || {
            *owner += 1;
            *owner
        };
        let mut assignment = RegisterAssignment::default();
        let mut roots = HashMap::new();
        for id in ir.parameters().into_iter().chain(ir.results()) {
            let reg = file.allocate_reg(RegType::Gpr, next_owner())?;
            assignment.io_regs.push(reg);
            roots.insert(id, reg);
        }
        for id in ir.buffers() {
            let OpKind::Buffer(desc) = ir.get(id)?.op() else { continue };
            let reg = match assignment.buffer_reg(desc.reg_group) {
                Some(reg) => reg,
                None => {
                    let reg = file.allocate_reg(RegType::Gpr, next_owner())?;
                    assignment.buffer_regs.push((desc.reg_group, reg));
                    reg
                }
            };
            roots.insert(id, reg);
        }
        if ir.is_dynamic() {
            assignment.runtime_args_reg = Some(file.allocate_reg(RegType::Gpr, next_owner())?);
        }

        let mut counters = HashMap::new();
        for id in ir.iter() {
            match ir.get(id)?.op() {
                OpKind::LoopBegin { loop_id } => {
                    counters.insert(*loop_id, file.allocate_reg(RegType::Gpr, next_owner())?);
                }
                OpKind::LoopEnd { loop_id } => {
                    let reg = counters.get(loop_id).copied().ok_or_else(|| {
                        SnippetsError::loop_nesting(format!("LoopEnd({loop_id}) before its LoopBegin"))
                    })?;
                    file.free_register(reg)?;
                }
                _ => {}
            }
        }
        Ok((assignment, roots, counters))
    }

    fn root_reg(roots: &HashMap<ExprId, Reg>, root: Option<ExprId>, id: ExprId) -> Result<Reg> {
        root.and_then(|r| roots.get(&r).copied())
            .ok_or_else(|| SnippetsError::structure(format!("{id} does not access a memory root")))
    }
}

impl RangedPass for AssignRegisters {
    fn name(&self) -> &'static str {
        "AssignRegisters"
    }

    fn run(&mut self, ir: &mut LinearIR, _begin: Option<ExprId>, _end: Option<ExprId>) -> Result<bool> {
        self.arena.reset();
        let mut file = RegisterFile::new(&self.gp_pool, &self.vec_pool);
        let mut owner = 0usize;
        let (mut assignment, roots, counters) = Self::assign_gp(ir, &mut file, &mut owner)?;

        let liveness = Liveness::compute(ir, &self.arena)?;
        let mut group_regs: Vec<Option<Reg>> = vec![None; liveness.groups().len()];
        let mut active: Vec<(usize, Reg)> = Vec::new();
        for g in liveness.by_start() {
            let info = liveness.groups()[g].info;
            let mut still_active = Vec::with_capacity(active.len());
            for (last, reg) in active.drain(..) {
                if last < info.first {
                    file.free_register(reg)?;
                } else {
                    still_active.push((last, reg));
                }
            }
            active = still_active;
            owner += 1;
            let reg = file.allocate_reg(RegType::Vec, owner)?;
            group_regs[g] = Some(reg);
            active.push((info.last, reg));
        }

        let calls: Vec<(ExprId, usize)> = ir
            .iter()
            .filter(|&id| ir.get(id).map(|e| e.op().has_executor()).unwrap_or(false))
            .filter_map(|id| liveness.position(id).map(|pos| (id, pos)))
            .collect();
        for (call, pos) in calls {
            let live: Vec<Reg> = liveness
                .groups()
                .iter()
                .zip(&group_regs)
                .filter(|(group, _)| group.info.contains(pos))
                .filter_map(|(_, reg)| *reg)
                .collect();
            if !live.is_empty() {
                assignment.live_across_calls.insert(call, live);
            }
        }

        let vec_reg = |id: ExprId| liveness.group_of(id).and_then(|g| group_regs[g]);
        for id in ir.iter().collect::<Vec<_>>() {
            let expr = ir.get(id)?;
            let op = expr.op().clone();
            let out_vec = if op.defines_vector() { vec_reg(id) } else { None };
            let mut in_regs: Vec<Option<Reg>> = expr
                .inputs()
                .iter()
                .map(|src| src.and_then(|s| vec_reg(s.expr)))
                .collect();
            let mut out_regs: Vec<Option<Reg>> = vec![out_vec; expr.output_count()];

            match &op {
                OpKind::Load { .. } | OpKind::LoadReorder { .. } | OpKind::BroadcastLoad { .. } => {
                    in_regs[0] = Some(Self::root_reg(&roots, ir.memory_root_of_input(id, 0)?, id)?);
                }
                OpKind::Store { .. } => {
                    out_regs[0] = Some(Self::root_reg(&roots, ir.memory_root_of_output(id, 0)?, id)?);
                }
                OpKind::Brgemm(_) | OpKind::BrgemmCopyB(_) => {
                    for (inp, reg) in in_regs.iter_mut().enumerate() {
                        *reg = Some(Self::root_reg(&roots, ir.memory_root_of_input(id, inp)?, id)?);
                    }
                    out_regs[0] = Some(Self::root_reg(&roots, ir.memory_root_of_output(id, 0)?, id)?);
                }
                OpKind::Parameter { .. } | OpKind::Result { .. } | OpKind::Buffer(_) => {
                    let reg = roots.get(&id).copied();
                    in_regs.iter_mut().chain(out_regs.iter_mut()).for_each(|r| *r = reg);
                }
                OpKind::LoopBegin { loop_id } | OpKind::LoopEnd { loop_id } => {
                    let reg = counters.get(loop_id).copied();
                    in_regs.iter_mut().chain(out_regs.iter_mut()).for_each(|r| *r = reg);
                }
                _ => {}
            }

            let expr = ir.get_mut(id)?;
            for (desc, reg) in expr.input_descs_mut().iter_mut().zip(in_regs) {
                desc.reg = reg;
            }
            for (desc, reg) in expr.output_descs_mut().iter_mut().zip(out_regs) {
                desc.reg = reg;
            }
        }

        let clobbered = file.clobbered();
        assignment.used_gp = clobbered.iter_bank(RegType::Gpr).collect();
        assignment.used_vec = clobbered.iter_bank(RegType::Vec).collect();
        debug!(
            "assigned {} gp and {} vector registers",
            assignment.used_gp.len(),
            assignment.used_vec.len()
        );
        ir.set_register_assignment(assignment);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use crate::lowered::pass::{InitBuffersDefault, InitLoops, InsertLoops, InsertSpecificIterations, MarkLoops};
    use crate::lowered::{Config, LinearIrBuilder};
    use crate::op::{EltwiseKind, ReduceKind};

    fn gp_pool() -> Vec<Reg> {
        [0u8, 1, 2, 3, 6, 7, 8, 9, 10, 12, 13, 14, 15].iter().map(|&i| Reg::gpr(i)).collect()
    }

    fn vec_pool(n: u8) -> Vec<Reg> {
        (0..n).map(Reg::vec).collect()
    }

    fn prepare(ir: &mut LinearIR) {
        MarkLoops.run(ir, None, None).unwrap();
        InitLoops.run(ir, None, None).unwrap();
        InsertLoops.run(ir, None, None).unwrap();
        InsertSpecificIterations.run(ir, None, None).unwrap();
        InitBuffersDefault.run(ir, None, None).unwrap();
    }

    fn add_mul(shape: Vec<usize>) -> LinearIR {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(shape.clone(), ElementType::F32).unwrap();
        let y = b.parameter(shape, ElementType::F32).unwrap();
        let add = b.eltwise(EltwiseKind::Add, &[x, y]).unwrap();
        let mul = b.eltwise(EltwiseKind::Multiply, &[add, y]).unwrap();
        b.result(mul).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn test_memory_ports_get_root_registers() {
        let mut ir = add_mul(vec![1, 64]);
        prepare(&mut ir);
        AssignRegisters::new(gp_pool(), vec_pool(15)).run(&mut ir, None, None).unwrap();

        let assignment = ir.register_assignment().unwrap().clone();
        assert_eq!(assignment.io_regs.len(), 3);
        assert!(assignment.runtime_args_reg.is_none());
        let params = ir.parameters();
        for id in ir.iter() {
            let expr = ir.get(id).unwrap();
            if let OpKind::Load { .. } = expr.op() {
                let root = ir.memory_root_of_input(id, 0).unwrap().unwrap();
                let index = params.iter().position(|&p| p == root).unwrap();
                assert_eq!(expr.input_descs()[0].reg, Some(assignment.io_regs[index]));
                assert_eq!(expr.output_descs()[0].reg.map(|r| r.bank), Some(RegType::Vec));
            }
            // Every vector operand is the register its producer wrote.
            for (inp, src) in expr.inputs().iter().enumerate() {
                let Some(src) = src else { continue };
                let producer = ir.get(src.expr).unwrap();
                if producer.op().defines_vector() {
                    assert_eq!(expr.input_descs()[inp].reg, producer.output_descs()[0].reg);
                }
            }
        }
    }

    #[test]
    fn test_loop_counters_are_reused() {
        let mut ir = add_mul(vec![1, 20]);
        prepare(&mut ir);
        AssignRegisters::new(gp_pool(), vec_pool(15)).run(&mut ir, None, None).unwrap();
        let counters: Vec<Reg> = ir
            .iter()
            .filter(|&id| matches!(ir.get(id).unwrap().op(), OpKind::LoopBegin { .. }))
            .map(|id| ir.get(id).unwrap().output_descs()[0].reg.unwrap())
            .collect();
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0], counters[1]);
    }

    #[test]
    fn test_accumulator_register_spans_main_and_tail() {
        let mut b = LinearIrBuilder::new(Config::default());
        let x = b.parameter(vec![1, 21], ElementType::F32).unwrap();
        let max = b.reduce(ReduceKind::Max, x).unwrap();
        b.result(max).unwrap();
        let mut ir = b.build().unwrap();
        prepare(&mut ir);
        AssignRegisters::new(gp_pool(), vec_pool(15)).run(&mut ir, None, None).unwrap();

        let acc_regs: Vec<Reg> = ir
            .iter()
            .filter(|&id| matches!(ir.get(id).unwrap().op(), OpKind::ReduceAccumulate(_)))
            .map(|id| ir.get(id).unwrap().output_descs()[0].reg.unwrap())
            .collect();
        assert_eq!(acc_regs.len(), 2);
        assert_eq!(acc_regs[0], acc_regs[1]);
        // No other value may reuse the accumulator while it is live.
        let fill_regs: Vec<Reg> = ir
            .iter()
            .filter(|&id| matches!(ir.get(id).unwrap().op(), OpKind::Fill { .. } | OpKind::Load { .. }))
            .map(|id| ir.get(id).unwrap().output_descs()[0].reg.unwrap())
            .collect();
        assert!(!fill_regs.contains(&acc_regs[0]));
    }

    #[test]
    fn test_vector_pool_exhaustion() {
        let mut ir = add_mul(vec![1, 64]);
        prepare(&mut ir);
        let err = AssignRegisters::new(gp_pool(), vec_pool(1)).run(&mut ir, None, None).unwrap_err();
        assert!(matches!(err, SnippetsError::RegisterAllocation { .. }));
    }
}
