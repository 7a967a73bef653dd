// This module implements the x86-64 emitters, one per operation type of the lowered IR. An
// emitter is built from an expression by its registered factory, capturing the attributes it
// needs (element counts, offsets, constants, loop ids), and later writes the instructions of
// that expression into the kernel encoder. Registers come from the port descriptors filled in
// by register assignment: memory ops read their pointer from the root GP register, vector ops
// their operands from the vector registers of their ports, loop markers their counter.
//
// Vector code is written once per primitive (move, load, store, lane-wise binary op) and
// dispatched on the ISA: SSE4.1 uses two-operand XMM forms and handles operand aliasing
// through the scratch register, AVX2 uses three-operand YMM forms and masked moves for tails,
// AVX-512 uses ZMM forms with the k1 opmask for tails and lane filling. The last vector
// register and R11 are scratch and never carry a value between emitters. Loops count the
// remaining work down from the work amount and advance the pointers of incremented ports by
// bytes per iteration; dynamic kernels read every loop argument from the runtime-args table.
// Kernel executor calls save live vector registers and caller-saved GP registers, realign the
// stack and call the executor entry point with the executor address as first argument.

//! x86-64 emitters for lowered expressions.

use std::fmt;
use std::sync::Arc;

use iced_x86::code_asm::*;

use crate::core::{ElementType, Reg, Result, SnippetsError};
use crate::kernel_executor::brgemm::brgemm_call;
use crate::kernel_executor::brgemm_copy_b::brgemm_copy_b_call;
use crate::kernel_executor::KernelExecutorTable;
use crate::lowered::pass::RegisterAssignment;
use crate::lowered::{ExprId, Expression, LinearIR, LoopPort, PortType, RuntimeArgsLayout, DYNAMIC_OFFSET};
use crate::op::{EltwiseKind, OpKind, OpType, ReduceKind};
use crate::target_machine::{EmitterEntry, EmitterRegistry, Isa};

use super::calling_convention::{SysV, RDI, RSP};
use super::encoder::{encoding, LoopLabel, X64Encoder};

const F32_SIZE: i64 = 4;

/// State shared by every emitter of one kernel.
pub struct EmitCtx<'a> {
    pub ir: &'a LinearIR,
    pub expr_id: ExprId,
    pub runtime_args: &'a RuntimeArgsLayout,
    pub registers: &'a RegisterAssignment,
    pub executors: &'a KernelExecutorTable,
    pub cc: &'a SysV,
}

/// Code generator of one expression.
pub trait X64Emitter: fmt::Debug + Send + Sync {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, ctx: &EmitCtx<'_>) -> Result<()>;
}

fn in_reg(expr: &Expression, index: usize) -> Result<Reg> {
    expr.input_descs()
        .get(index)
        .and_then(|d| d.reg)
        .ok_or_else(|| SnippetsError::RegisterAllocation { reason: format!("{} input {index} has no register", expr.op()) })
}

fn out_reg(expr: &Expression, index: usize) -> Result<Reg> {
    expr.output_descs()
        .get(index)
        .and_then(|d| d.reg)
        .ok_or_else(|| SnippetsError::RegisterAllocation { reason: format!("{} output {index} has no register", expr.op()) })
}

fn scratch_vec(enc: &X64Encoder) -> Reg {
    Reg::vec(enc.isa().vec_register_count() as u8 - 1)
}

fn check_count(enc: &X64Encoder, count: usize, what: &str) -> Result<()> {
    if count == 0 || count > enc.isa().lanes() {
        return Err(SnippetsError::Encoding {
            reason: format!("{what} of {count} elements does not fit {} lanes", enc.isa().lanes()),
        });
    }
    Ok(())
}

/// All-ones in the first `count` lanes.
fn head_mask(lanes: usize, count: usize) -> Vec<u32> {
    (0..lanes).map(|i| if i < count { u32::MAX } else { 0 }).collect()
}

// ==== VECTOR PRIMITIVES ====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    And,
    Or,
    Xor,
}

impl LaneOp {
    fn from_eltwise(kind: EltwiseKind) -> Option<Self> {
        match kind {
            EltwiseKind::Add => Some(LaneOp::Add),
            EltwiseKind::Subtract => Some(LaneOp::Sub),
            EltwiseKind::Multiply => Some(LaneOp::Mul),
            EltwiseKind::Divide => Some(LaneOp::Div),
            EltwiseKind::Maximum => Some(LaneOp::Max),
            EltwiseKind::Minimum => Some(LaneOp::Min),
            _ => None,
        }
    }

    fn commutative(self) -> bool {
        !matches!(self, LaneOp::Sub | LaneOp::Div)
    }
}

fn sse_op(asm: &mut CodeAssembler, op: LaneOp, dst: AsmRegisterXmm, src: AsmRegisterXmm) -> Result<()> {
    match op {
        LaneOp::Add => asm.addps(dst, src),
        LaneOp::Sub => asm.subps(dst, src),
        LaneOp::Mul => asm.mulps(dst, src),
        LaneOp::Div => asm.divps(dst, src),
        LaneOp::Max => asm.maxps(dst, src),
        LaneOp::Min => asm.minps(dst, src),
        LaneOp::And => asm.andps(dst, src),
        LaneOp::Or => asm.orps(dst, src),
        LaneOp::Xor => asm.xorps(dst, src),
    }
    .map_err(encoding)
}

fn avx_op(asm: &mut CodeAssembler, op: LaneOp, dst: AsmRegisterYmm, lhs: AsmRegisterYmm, rhs: AsmRegisterYmm) -> Result<()> {
    match op {
        LaneOp::Add => asm.vaddps(dst, lhs, rhs),
        LaneOp::Sub => asm.vsubps(dst, lhs, rhs),
        LaneOp::Mul => asm.vmulps(dst, lhs, rhs),
        LaneOp::Div => asm.vdivps(dst, lhs, rhs),
        LaneOp::Max => asm.vmaxps(dst, lhs, rhs),
        LaneOp::Min => asm.vminps(dst, lhs, rhs),
        LaneOp::And => asm.vandps(dst, lhs, rhs),
        LaneOp::Or => asm.vorps(dst, lhs, rhs),
        LaneOp::Xor => asm.vxorps(dst, lhs, rhs),
    }
    .map_err(encoding)
}

fn avx512_op(asm: &mut CodeAssembler, op: LaneOp, dst: AsmRegisterZmm, lhs: AsmRegisterZmm, rhs: AsmRegisterZmm) -> Result<()> {
    match op {
        LaneOp::Add => asm.vaddps(dst, lhs, rhs),
        LaneOp::Sub => asm.vsubps(dst, lhs, rhs),
        LaneOp::Mul => asm.vmulps(dst, lhs, rhs),
        LaneOp::Div => asm.vdivps(dst, lhs, rhs),
        LaneOp::Max => asm.vmaxps(dst, lhs, rhs),
        LaneOp::Min => asm.vminps(dst, lhs, rhs),
        // Float bitwise forms need AVX512DQ, the integer ones only AVX512F.
        LaneOp::And => asm.vpandd(dst, lhs, rhs),
        LaneOp::Or => asm.vpord(dst, lhs, rhs),
        LaneOp::Xor => asm.vpxord(dst, lhs, rhs),
    }
    .map_err(encoding)
}

fn vmov(enc: &mut X64Encoder, dst: Reg, src: Reg) -> Result<()> {
    if dst == src {
        return Ok(());
    }
    match enc.isa() {
        Isa::Sse41 => {
            let (d, s) = (enc.xmm(dst)?, enc.xmm(src)?);
            enc.asm().movaps(d, s).map_err(encoding)
        }
        Isa::Avx2 => {
            let (d, s) = (enc.ymm(dst)?, enc.ymm(src)?);
            enc.asm().vmovaps(d, s).map_err(encoding)
        }
        Isa::Avx512 => {
            let (d, s) = (enc.zmm(dst)?, enc.zmm(src)?);
            enc.asm().vmovaps(d, s).map_err(encoding)
        }
    }
}

fn vzero(enc: &mut X64Encoder, dst: Reg) -> Result<()> {
    match enc.isa() {
        Isa::Sse41 => {
            let d = enc.xmm(dst)?;
            enc.asm().xorps(d, d).map_err(encoding)
        }
        Isa::Avx2 => {
            let d = enc.ymm(dst)?;
            enc.asm().vxorps(d, d, d).map_err(encoding)
        }
        Isa::Avx512 => {
            let d = enc.zmm(dst)?;
            enc.asm().vpxord(d, d, d).map_err(encoding)
        }
    }
}

/// Full-width unaligned load.
fn vload(enc: &mut X64Encoder, dst: Reg, mem: AsmMemoryOperand) -> Result<()> {
    match enc.isa() {
        Isa::Sse41 => {
            let d = enc.xmm(dst)?;
            enc.asm().movups(d, xmmword_ptr(mem)).map_err(encoding)
        }
        Isa::Avx2 => {
            let d = enc.ymm(dst)?;
            enc.asm().vmovups(d, ymmword_ptr(mem)).map_err(encoding)
        }
        Isa::Avx512 => {
            let d = enc.zmm(dst)?;
            enc.asm().vmovups(d, zmmword_ptr(mem)).map_err(encoding)
        }
    }
}

/// Full-width unaligned store.
fn vstore(enc: &mut X64Encoder, mem: AsmMemoryOperand, src: Reg) -> Result<()> {
    match enc.isa() {
        Isa::Sse41 => {
            let s = enc.xmm(src)?;
            enc.asm().movups(xmmword_ptr(mem), s).map_err(encoding)
        }
        Isa::Avx2 => {
            let s = enc.ymm(src)?;
            enc.asm().vmovups(ymmword_ptr(mem), s).map_err(encoding)
        }
        Isa::Avx512 => {
            let s = enc.zmm(src)?;
            enc.asm().vmovups(zmmword_ptr(mem), s).map_err(encoding)
        }
    }
}

/// `dst = lhs op rhs` for any aliasing between the three registers.
fn vbinary(enc: &mut X64Encoder, op: LaneOp, dst: Reg, lhs: Reg, rhs: Reg) -> Result<()> {
    match enc.isa() {
        Isa::Sse41 => {
            let (d, l, r) = (enc.xmm(dst)?, enc.xmm(lhs)?, enc.xmm(rhs)?);
            if dst == lhs {
                sse_op(enc.asm(), op, d, r)
            } else if dst == rhs {
                if op.commutative() {
                    sse_op(enc.asm(), op, d, l)
                } else {
                    let s = enc.xmm(scratch_vec(enc))?;
                    enc.asm().movaps(s, l).map_err(encoding)?;
                    sse_op(enc.asm(), op, s, r)?;
                    enc.asm().movaps(d, s).map_err(encoding)
                }
            } else {
                enc.asm().movaps(d, l).map_err(encoding)?;
                sse_op(enc.asm(), op, d, r)
            }
        }
        Isa::Avx2 => {
            let (d, l, r) = (enc.ymm(dst)?, enc.ymm(lhs)?, enc.ymm(rhs)?);
            avx_op(enc.asm(), op, d, l, r)
        }
        Isa::Avx512 => {
            let (d, l, r) = (enc.zmm(dst)?, enc.zmm(lhs)?, enc.zmm(rhs)?);
            avx512_op(enc.asm(), op, d, l, r)
        }
    }
}

/// Load a pooled constant vector into `dst`.
fn vconst(enc: &mut X64Encoder, dst: Reg, lanes: &[u32]) -> Result<()> {
    enc.lea_lanes(lanes)?;
    vload(enc, dst, ptr(enc.scratch()))
}

fn vsplat(enc: &mut X64Encoder, dst: Reg, bits: u32) -> Result<()> {
    let lanes = vec![bits; enc.isa().lanes()];
    vconst(enc, dst, &lanes)
}

/// k1 = `bits`.
fn set_opmask(enc: &mut X64Encoder, bits: u32) -> Result<()> {
    enc.asm().mov(r11d, bits as i32).map_err(encoding)?;
    enc.asm().kmovw(k1, r11d).map_err(encoding)
}

// ==== MEMORY ACCESS ====

/// Parameters, results and buffers: their pointers are set up by the kernel prologue.
#[derive(Debug)]
pub struct NopEmitter;

impl X64Emitter for NopEmitter {
    fn emit(&self, _enc: &mut X64Encoder, _expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct LoadEmitter {
    count: usize,
    offset: usize,
}

impl X64Emitter for LoadEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        let (base, dst) = (in_reg(expr, 0)?, out_reg(expr, 0)?);
        check_count(enc, self.count, "load")?;
        let lanes = enc.isa().lanes();
        let offset = self.offset as i64;
        let mem = enc.mem(base, offset)?;
        if self.count == lanes {
            return vload(enc, dst, mem);
        }
        match enc.isa() {
            Isa::Sse41 => {
                let d = enc.xmm(dst)?;
                enc.asm().xorps(d, d).map_err(encoding)?;
                for i in 0..self.count {
                    let lane = enc.mem(base, offset + i as i64 * F32_SIZE)?;
                    enc.asm().insertps(d, dword_ptr(lane), (i << 4) as i32).map_err(encoding)?;
                }
                Ok(())
            }
            Isa::Avx2 => {
                let mask = scratch_vec(enc);
                vconst(enc, mask, &head_mask(lanes, self.count))?;
                let (d, m) = (enc.ymm(dst)?, enc.ymm(mask)?);
                enc.asm().vmaskmovps(d, m, ymmword_ptr(mem)).map_err(encoding)
            }
            Isa::Avx512 => {
                set_opmask(enc, (1u32 << self.count) - 1)?;
                let d = enc.zmm(dst)?;
                enc.asm().vmovups(d.k1().z(), zmmword_ptr(mem)).map_err(encoding)
            }
        }
    }
}

/// Load through a transposed layout: lanes are gathered element by element.
#[derive(Debug)]
pub struct LoadReorderEmitter {
    count: usize,
    offset: usize,
}

impl X64Emitter for LoadReorderEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        let (base, dst) = (in_reg(expr, 0)?, out_reg(expr, 0)?);
        check_count(enc, self.count, "reordered load")?;
        let desc = &expr.input_descs()[0];
        if crate::core::dims::is_dynamic_shape(&desc.shape) || desc.rank() == 0 {
            return Err(SnippetsError::unsupported_config("reordered load from a dynamic shape"));
        }
        let stride = desc.planar_strides(&desc.shape)[desc.rank() - 1] as i64 * F32_SIZE;
        let lanes = enc.isa().lanes();
        let bytes = enc.isa().vec_bytes() as i32;
        enc.asm().sub(rsp, bytes).map_err(encoding)?;
        for i in 0..lanes {
            let slot = enc.mem(RSP, i as i64 * F32_SIZE)?;
            if i < self.count {
                let src = enc.mem(base, self.offset as i64 + i as i64 * stride)?;
                enc.asm().mov(r11d, dword_ptr(src)).map_err(encoding)?;
                enc.asm().mov(dword_ptr(slot), r11d).map_err(encoding)?;
            } else {
                enc.asm().mov(dword_ptr(slot), 0).map_err(encoding)?;
            }
        }
        let top = enc.mem(RSP, 0)?;
        vload(enc, dst, top)?;
        enc.asm().add(rsp, bytes).map_err(encoding)
    }
}

#[derive(Debug)]
pub struct BroadcastLoadEmitter {
    offset: usize,
}

impl X64Emitter for BroadcastLoadEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        let (base, dst) = (in_reg(expr, 0)?, out_reg(expr, 0)?);
        let mem = enc.mem(base, self.offset as i64)?;
        match enc.isa() {
            Isa::Sse41 => {
                let d = enc.xmm(dst)?;
                enc.asm().movss(d, dword_ptr(mem)).map_err(encoding)?;
                enc.asm().shufps(d, d, 0).map_err(encoding)
            }
            Isa::Avx2 => {
                let d = enc.ymm(dst)?;
                enc.asm().vbroadcastss(d, dword_ptr(mem)).map_err(encoding)
            }
            Isa::Avx512 => {
                let d = enc.zmm(dst)?;
                enc.asm().vbroadcastss(d, dword_ptr(mem)).map_err(encoding)
            }
        }
    }
}

#[derive(Debug)]
pub struct StoreEmitter {
    count: usize,
    offset: usize,
}

impl X64Emitter for StoreEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        let (src, base) = (in_reg(expr, 0)?, out_reg(expr, 0)?);
        check_count(enc, self.count, "store")?;
        let lanes = enc.isa().lanes();
        let offset = self.offset as i64;
        let mem = enc.mem(base, offset)?;
        if self.count == lanes {
            return vstore(enc, mem, src);
        }
        match enc.isa() {
            Isa::Sse41 => {
                let s = enc.xmm(src)?;
                for i in 0..self.count {
                    let lane = enc.mem(base, offset + i as i64 * F32_SIZE)?;
                    enc.asm().extractps(dword_ptr(lane), s, i as i32).map_err(encoding)?;
                }
                Ok(())
            }
            Isa::Avx2 => {
                let mask = scratch_vec(enc);
                vconst(enc, mask, &head_mask(lanes, self.count))?;
                let (s, m) = (enc.ymm(src)?, enc.ymm(mask)?);
                enc.asm().vmaskmovps(ymmword_ptr(mem), m, s).map_err(encoding)
            }
            Isa::Avx512 => {
                set_opmask(enc, (1u32 << self.count) - 1)?;
                let s = enc.zmm(src)?;
                enc.asm().vmovups(zmmword_ptr(mem).k1(), s).map_err(encoding)
            }
        }
    }
}

// ==== VECTOR ARITHMETIC ====

#[derive(Debug)]
pub struct ScalarEmitter {
    bits: u32,
}

impl X64Emitter for ScalarEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        vsplat(enc, out_reg(expr, 0)?, self.bits)
    }
}

/// Overwrites lanes `offset..` with a constant so a partial vector can join a reduction.
#[derive(Debug)]
pub struct FillEmitter {
    offset: usize,
    bits: u32,
}

impl X64Emitter for FillEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        let (src, dst) = (in_reg(expr, 0)?, out_reg(expr, 0)?);
        let lanes = enc.isa().lanes();
        if self.offset >= lanes {
            return vmov(enc, dst, src);
        }
        let scratch = scratch_vec(enc);
        match enc.isa() {
            Isa::Sse41 | Isa::Avx2 => {
                let fill: Vec<u32> = (0..lanes).map(|i| if i < self.offset { 0 } else { self.bits }).collect();
                vconst(enc, scratch, &head_mask(lanes, self.offset))?;
                vbinary(enc, LaneOp::And, scratch, scratch, src)?;
                vconst(enc, dst, &fill)?;
                vbinary(enc, LaneOp::Or, dst, dst, scratch)
            }
            Isa::Avx512 => {
                let keep = (1u32 << self.offset) - 1;
                let all = (1u32 << lanes) - 1;
                set_opmask(enc, all & !keep)?;
                vmov(enc, dst, src)?;
                enc.lea_splat(self.bits)?;
                let d = enc.zmm(dst)?;
                enc.asm().vmovups(d.k1(), zmmword_ptr(r11)).map_err(encoding)
            }
        }
    }
}

#[derive(Debug)]
pub struct EltwiseEmitter {
    kind: EltwiseKind,
}

impl X64Emitter for EltwiseEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        let dst = out_reg(expr, 0)?;
        let src = in_reg(expr, 0)?;
        if let Some(op) = LaneOp::from_eltwise(self.kind) {
            return vbinary(enc, op, dst, src, in_reg(expr, 1)?);
        }
        let scratch = scratch_vec(enc);
        match self.kind {
            EltwiseKind::SquaredDifference => {
                vbinary(enc, LaneOp::Sub, dst, src, in_reg(expr, 1)?)?;
                vbinary(enc, LaneOp::Mul, dst, dst, dst)
            }
            EltwiseKind::Relu => {
                vzero(enc, scratch)?;
                vbinary(enc, LaneOp::Max, dst, src, scratch)
            }
            EltwiseKind::Negative => {
                vsplat(enc, scratch, 0x8000_0000)?;
                vbinary(enc, LaneOp::Xor, dst, src, scratch)
            }
            EltwiseKind::Abs => {
                vsplat(enc, scratch, 0x7fff_ffff)?;
                vbinary(enc, LaneOp::And, dst, src, scratch)
            }
            EltwiseKind::Sqrt => match enc.isa() {
                Isa::Sse41 => {
                    let (d, s) = (enc.xmm(dst)?, enc.xmm(src)?);
                    enc.asm().sqrtps(d, s).map_err(encoding)
                }
                Isa::Avx2 => {
                    let (d, s) = (enc.ymm(dst)?, enc.ymm(src)?);
                    enc.asm().vsqrtps(d, s).map_err(encoding)
                }
                Isa::Avx512 => {
                    let (d, s) = (enc.zmm(dst)?, enc.zmm(src)?);
                    enc.asm().vsqrtps(d, s).map_err(encoding)
                }
            },
            other => Err(SnippetsError::UnsupportedOp {
                op: other.name().into(),
                reason: "no x86-64 lowering".into(),
            }),
        }
    }
}

/// `acc = acc op x`, the accumulator being input 1 and the output.
#[derive(Debug)]
pub struct ReduceAccumulateEmitter {
    kind: ReduceKind,
}

impl X64Emitter for ReduceAccumulateEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        let op = LaneOp::from_eltwise(self.kind.lane_op())
            .ok_or_else(|| SnippetsError::invalid_expr("reduction without a lane operation"))?;
        vbinary(enc, op, out_reg(expr, 0)?, in_reg(expr, 1)?, in_reg(expr, 0)?)
    }
}

/// Butterfly reduction across all lanes; every lane ends with the result.
#[derive(Debug)]
pub struct HorizonReduceEmitter {
    kind: ReduceKind,
}

impl X64Emitter for HorizonReduceEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, _ctx: &EmitCtx<'_>) -> Result<()> {
        let op = LaneOp::from_eltwise(self.kind.lane_op())
            .ok_or_else(|| SnippetsError::invalid_expr("reduction without a lane operation"))?;
        let (src, dst) = (in_reg(expr, 0)?, out_reg(expr, 0)?);
        let scratch = scratch_vec(enc);
        vmov(enc, dst, src)?;
        match enc.isa() {
            Isa::Sse41 => {
                let (d, s) = (enc.xmm(dst)?, enc.xmm(scratch)?);
                for imm in [0x4E, 0xB1] {
                    enc.asm().movaps(s, d).map_err(encoding)?;
                    enc.asm().shufps(s, s, imm).map_err(encoding)?;
                    sse_op(enc.asm(), op, d, s)?;
                }
                Ok(())
            }
            Isa::Avx2 => {
                let (d, s) = (enc.ymm(dst)?, enc.ymm(scratch)?);
                enc.asm().vperm2f128(s, d, d, 0x01).map_err(encoding)?;
                avx_op(enc.asm(), op, d, d, s)?;
                for imm in [0x4E, 0xB1] {
                    enc.asm().vshufps(s, d, d, imm).map_err(encoding)?;
                    avx_op(enc.asm(), op, d, d, s)?;
                }
                Ok(())
            }
            Isa::Avx512 => {
                let (d, s) = (enc.zmm(dst)?, enc.zmm(scratch)?);
                for imm in [0x4E, 0xB1] {
                    enc.asm().vshuff32x4(s, d, d, imm).map_err(encoding)?;
                    avx512_op(enc.asm(), op, d, d, s)?;
                }
                for imm in [0x4E, 0xB1] {
                    enc.asm().vshufps(s, d, d, imm).map_err(encoding)?;
                    avx512_op(enc.asm(), op, d, d, s)?;
                }
                Ok(())
            }
        }
    }
}

// ==== LOOPS ====

fn runtime_args_reg(ctx: &EmitCtx<'_>) -> Result<Reg> {
    ctx.registers
        .runtime_args_reg
        .ok_or_else(|| SnippetsError::RegisterAllocation { reason: "dynamic kernel without a runtime-args register".into() })
}

fn slot_disp(slot: usize) -> i64 {
    RuntimeArgsLayout::byte_offset(slot) as i64
}

/// Pointer register advanced through a loop port.
fn port_reg(ir: &LinearIR, port: &LoopPort) -> Result<Reg> {
    let expr = ir.get(port.port.expr)?;
    match port.port.port_type {
        PortType::Input => in_reg(expr, port.port.index),
        PortType::Output => out_reg(expr, port.port.index),
    }
}

fn static_bytes(elements: i64, data_size: usize, loop_id: usize) -> Result<i64> {
    if elements == DYNAMIC_OFFSET {
        return Err(SnippetsError::loop_nesting(format!("loop {loop_id} has dynamic pointer arithmetic in a static kernel")));
    }
    Ok(elements * data_size as i64)
}

#[derive(Debug)]
pub struct LoopBeginEmitter {
    loop_id: usize,
}

impl X64Emitter for LoopBeginEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, ctx: &EmitCtx<'_>) -> Result<()> {
        let counter = out_reg(expr, 0)?;
        let info = ctx.ir.loop_manager().get(self.loop_id)?;
        let increment = i32::try_from(info.increment)
            .map_err(|_| SnippetsError::loop_nesting(format!("loop {} increment overflows", self.loop_id)))?;
        let guard = match ctx.runtime_args.work_amount_slot(self.loop_id) {
            Some(slot) => {
                enc.mov_reg_mem(counter, runtime_args_reg(ctx)?, slot_disp(slot))?;
                true
            }
            None => {
                if info.is_dynamic() {
                    return Err(SnippetsError::loop_nesting(format!(
                        "loop {} has a dynamic work amount in a static kernel",
                        self.loop_id
                    )));
                }
                enc.mov_reg_imm(counter, info.work_amount as i64)?;
                info.work_amount < info.increment
            }
        };
        if guard {
            enc.cmp_reg_imm(counter, increment)?;
            enc.jl_loop(self.loop_id, LoopLabel::End)?;
        }
        enc.place_loop_label(self.loop_id, LoopLabel::Begin)
    }
}

#[derive(Debug)]
pub struct LoopEndEmitter {
    loop_id: usize,
}

impl X64Emitter for LoopEndEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, ctx: &EmitCtx<'_>) -> Result<()> {
        let counter = in_reg(expr, 0)?;
        let info = ctx.ir.loop_manager().get(self.loop_id)?;
        let increment = i32::try_from(info.increment)
            .map_err(|_| SnippetsError::loop_nesting(format!("loop {} increment overflows", self.loop_id)))?;
        let dynamic = ctx.runtime_args.work_amount_slot(self.loop_id).is_some();

        enc.sub_reg_imm(counter, increment)?;
        for (index, port) in info.ports().enumerate() {
            if !port.is_incremented {
                continue;
            }
            let reg = port_reg(ctx.ir, port)?;
            match ctx.runtime_args.ptr_increment_slot(self.loop_id, index).filter(|_| dynamic) {
                Some(slot) => enc.add_reg_mem(reg, runtime_args_reg(ctx)?, slot_disp(slot))?,
                None => {
                    let bytes = static_bytes(port.ptr_increment, port.data_size, self.loop_id)?;
                    enc.add_reg_imm(reg, bytes * info.increment as i64)?;
                }
            }
        }
        enc.cmp_reg_imm(counter, increment)?;
        enc.jge_loop(self.loop_id, LoopLabel::Begin)?;
        enc.place_loop_label(self.loop_id, LoopLabel::End)?;

        for (index, port) in info.ports().enumerate() {
            if !port.is_incremented {
                continue;
            }
            let reg = port_reg(ctx.ir, port)?;
            match ctx.runtime_args.finalization_slot(self.loop_id, index).filter(|_| dynamic) {
                Some(slot) => enc.add_reg_mem(reg, runtime_args_reg(ctx)?, slot_disp(slot))?,
                None => enc.add_reg_imm(reg, static_bytes(port.finalization_offset, port.data_size, self.loop_id)?)?,
            }
        }
        Ok(())
    }
}

// ==== KERNEL EXECUTOR CALLS ====

/// Save live state, pass `args` plus the executor address and call `entry`.
fn emit_executor_call(enc: &mut X64Encoder, ctx: &EmitCtx<'_>, args: &[Reg], entry: u64) -> Result<()> {
    let executor = ctx
        .executors
        .get(ctx.expr_id)
        .ok_or_else(|| SnippetsError::structure(format!("{} has no kernel executor", ctx.expr_id)))?;
    let executor_addr = Arc::as_ptr(executor) as *const () as u64;
    let live_vec: Vec<Reg> = ctx.registers.live_across_calls.get(&ctx.expr_id).cloned().unwrap_or_default();
    let saved_gp = ctx.cc.caller_saved_in(&ctx.registers.used_gp);
    let vec_bytes = enc.isa().vec_bytes() as i64;
    let save_area = i32::try_from(live_vec.len() as i64 * vec_bytes)
        .map_err(|_| SnippetsError::Encoding { reason: "vector save area overflows".into() })?;

    if save_area > 0 {
        enc.asm().sub(rsp, save_area).map_err(encoding)?;
        for (i, &reg) in live_vec.iter().enumerate() {
            let slot = enc.mem(RSP, i as i64 * vec_bytes)?;
            vstore(enc, slot, reg)?;
        }
    }
    for &reg in &saved_gp {
        enc.push_reg(reg)?;
    }
    enc.asm().mov(r11, rsp).map_err(encoding)?;
    enc.asm().and(rsp, -16).map_err(encoding)?;
    enc.asm().sub(rsp, 8).map_err(encoding)?;
    enc.asm().push(r11).map_err(encoding)?;

    let targets = &SysV::helper_args(args.len() + 1)[1..];
    for &reg in args {
        enc.push_reg(reg)?;
    }
    for &target in targets.iter().rev() {
        enc.pop_reg(target)?;
    }
    enc.mov_reg_imm(RDI, executor_addr as i64)?;
    enc.asm().mov(rax, entry as i64).map_err(encoding)?;
    enc.asm().call(rax).map_err(encoding)?;
    enc.asm().pop(rsp).map_err(encoding)?;

    for &reg in saved_gp.iter().rev() {
        enc.pop_reg(reg)?;
    }
    if save_area > 0 {
        for (i, &reg) in live_vec.iter().enumerate() {
            let slot = enc.mem(RSP, i as i64 * vec_bytes)?;
            vload(enc, reg, slot)?;
        }
        enc.asm().add(rsp, save_area).map_err(encoding)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct BrgemmEmitter;

impl X64Emitter for BrgemmEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, ctx: &EmitCtx<'_>) -> Result<()> {
        let args = [in_reg(expr, 0)?, in_reg(expr, 1)?, out_reg(expr, 0)?];
        emit_executor_call(enc, ctx, &args, brgemm_call as usize as u64)
    }
}

#[derive(Debug)]
pub struct BrgemmCopyBEmitter;

impl X64Emitter for BrgemmCopyBEmitter {
    fn emit(&self, enc: &mut X64Encoder, expr: &Expression, ctx: &EmitCtx<'_>) -> Result<()> {
        let args = [in_reg(expr, 0)?, out_reg(expr, 0)?];
        emit_executor_call(enc, ctx, &args, brgemm_copy_b_call as usize as u64)
    }
}

// ==== REGISTRY ====

fn f32_inputs(expr: &Expression) -> Vec<Vec<ElementType>> {
    vec![vec![ElementType::F32; expr.input_count()]]
}

/// Control and memory-root expressions accept whatever they are connected to.
fn any_inputs(expr: &Expression) -> Vec<Vec<ElementType>> {
    vec![expr.input_descs().iter().map(|d| d.element_type).collect()]
}

fn brgemm_inputs(_expr: &Expression) -> Vec<Vec<ElementType>> {
    use ElementType::*;
    vec![vec![F32, F32], vec![U8, I8], vec![I8, I8], vec![Bf16, Bf16]]
}

fn copy_b_inputs(_expr: &Expression) -> Vec<Vec<ElementType>> {
    vec![vec![ElementType::I8], vec![ElementType::Bf16]]
}

fn unexpected(expr: &Expression) -> SnippetsError {
    SnippetsError::invalid_expr(format!("emitter factory applied to {}", expr.op()))
}

fn make_nop(_expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    Ok(Box::new(NopEmitter))
}

fn make_load(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::Load { count, offset } => Ok(Box::new(LoadEmitter { count: *count, offset: *offset })),
        _ => Err(unexpected(expr)),
    }
}

fn make_load_reorder(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::LoadReorder { count, offset, .. } => Ok(Box::new(LoadReorderEmitter { count: *count, offset: *offset })),
        _ => Err(unexpected(expr)),
    }
}

fn make_broadcast_load(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::BroadcastLoad { offset } => Ok(Box::new(BroadcastLoadEmitter { offset: *offset })),
        _ => Err(unexpected(expr)),
    }
}

fn make_store(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::Store { count, offset } => Ok(Box::new(StoreEmitter { count: *count, offset: *offset })),
        _ => Err(unexpected(expr)),
    }
}

fn make_scalar(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::Scalar { value } => Ok(Box::new(ScalarEmitter { bits: value.to_bits() })),
        _ => Err(unexpected(expr)),
    }
}

fn make_fill(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::Fill { offset, value } => Ok(Box::new(FillEmitter { offset: *offset, bits: value.to_bits() })),
        _ => Err(unexpected(expr)),
    }
}

fn make_eltwise(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::Eltwise(kind) => Ok(Box::new(EltwiseEmitter { kind: *kind })),
        _ => Err(unexpected(expr)),
    }
}

fn make_reduce_accumulate(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::ReduceAccumulate(kind) => Ok(Box::new(ReduceAccumulateEmitter { kind: *kind })),
        _ => Err(unexpected(expr)),
    }
}

fn make_horizon_reduce(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::HorizonReduce(kind) => Ok(Box::new(HorizonReduceEmitter { kind: *kind })),
        _ => Err(unexpected(expr)),
    }
}

fn make_loop_begin(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::LoopBegin { loop_id } => Ok(Box::new(LoopBeginEmitter { loop_id: *loop_id })),
        _ => Err(unexpected(expr)),
    }
}

fn make_loop_end(expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    match expr.op() {
        OpKind::LoopEnd { loop_id } => Ok(Box::new(LoopEndEmitter { loop_id: *loop_id })),
        _ => Err(unexpected(expr)),
    }
}

fn make_brgemm(_expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    Ok(Box::new(BrgemmEmitter))
}

fn make_brgemm_copy_b(_expr: &Expression) -> Result<Box<dyn X64Emitter>> {
    Ok(Box::new(BrgemmCopyBEmitter))
}

/// Emitters of every operation type the x86-64 target lowers. `Exp` has no vector
/// lowering and stays unregistered.
pub fn x64_registry() -> EmitterRegistry<dyn X64Emitter> {
    let mut registry = EmitterRegistry::new();
    let mut add = |op_type: OpType, factory: fn(&Expression) -> Result<Box<dyn X64Emitter>>, supported_precisions| {
        registry.register(op_type, EmitterEntry { factory, supported_precisions });
    };
    add(OpType::Parameter, make_nop, any_inputs);
    add(OpType::Result, make_nop, any_inputs);
    add(OpType::Buffer, make_nop, any_inputs);
    add(OpType::Load, make_load, f32_inputs);
    add(OpType::LoadReorder, make_load_reorder, f32_inputs);
    add(OpType::BroadcastLoad, make_broadcast_load, f32_inputs);
    add(OpType::Store, make_store, f32_inputs);
    add(OpType::Scalar, make_scalar, f32_inputs);
    add(OpType::Fill, make_fill, f32_inputs);
    for kind in [
        EltwiseKind::Add,
        EltwiseKind::Subtract,
        EltwiseKind::Multiply,
        EltwiseKind::Divide,
        EltwiseKind::Maximum,
        EltwiseKind::Minimum,
        EltwiseKind::SquaredDifference,
        EltwiseKind::Relu,
        EltwiseKind::Negative,
        EltwiseKind::Abs,
        EltwiseKind::Sqrt,
    ] {
        add(OpType::Eltwise(kind), make_eltwise, f32_inputs);
    }
    for kind in [ReduceKind::Max, ReduceKind::Sum] {
        add(OpType::ReduceAccumulate(kind), make_reduce_accumulate, f32_inputs);
        add(OpType::HorizonReduce(kind), make_horizon_reduce, f32_inputs);
    }
    add(OpType::LoopBegin, make_loop_begin, any_inputs);
    add(OpType::LoopEnd, make_loop_end, any_inputs);
    add(OpType::Brgemm, make_brgemm, brgemm_inputs);
    add(OpType::BrgemmCopyB, make_brgemm_copy_b, copy_b_inputs);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowered::PortDescriptor;

    fn vector_expr(op: OpKind, inputs: &[Reg], output: Option<Reg>) -> Expression {
        let desc = |reg: Reg| {
            let mut d = PortDescriptor::new(vec![1, 16], ElementType::F32);
            d.reg = Some(reg);
            d
        };
        Expression::new(op, inputs.iter().map(|&r| desc(r)).collect(), output.map(desc).into_iter().collect())
    }

    fn emit_one(isa: Isa, expr: &Expression) -> Result<Vec<u8>> {
        let ir = LinearIR::new(Default::default());
        let layout = RuntimeArgsLayout::default();
        let registers = RegisterAssignment::default();
        let executors = KernelExecutorTable::new();
        let cc = SysV::new(isa);
        let ctx = EmitCtx {
            ir: &ir,
            expr_id: ExprId { index: 0, generation: 0 },
            runtime_args: &layout,
            registers: &registers,
            executors: &executors,
            cc: &cc,
        };
        let registry = x64_registry();
        let emitter = (registry.get(expr.op_type())?.factory)(expr)?;
        let mut enc = X64Encoder::new(isa)?;
        emitter.emit(&mut enc, expr, &ctx)?;
        enc.ret()?;
        enc.finalize()
    }

    #[test]
    fn test_exp_is_not_registered() {
        let registry = x64_registry();
        assert!(!registry.has(OpType::Eltwise(EltwiseKind::Exp)));
        assert!(registry.has(OpType::Eltwise(EltwiseKind::Relu)));
        assert!(registry.has(OpType::Brgemm));
    }

    #[test]
    fn test_tail_memory_ops_encode_on_every_isa() {
        for isa in [Isa::Sse41, Isa::Avx2, Isa::Avx512] {
            let load = vector_expr(OpKind::Load { count: 3, offset: 8 }, &[Reg::gpr(6)], Some(Reg::vec(1)));
            assert!(emit_one(isa, &load).unwrap().len() > 1);
            let store = vector_expr(OpKind::Store { count: 3, offset: 0 }, &[Reg::vec(1)], Some(Reg::gpr(2)));
            assert!(emit_one(isa, &store).is_ok());
            let fill = vector_expr(OpKind::Fill { offset: 2, value: f32::NEG_INFINITY }, &[Reg::vec(1)], Some(Reg::vec(2)));
            assert!(emit_one(isa, &fill).is_ok());
        }
    }

    #[test]
    fn test_arithmetic_with_aliased_operands() {
        for isa in [Isa::Sse41, Isa::Avx2, Isa::Avx512] {
            let sub = vector_expr(OpKind::Eltwise(EltwiseKind::Subtract), &[Reg::vec(0), Reg::vec(1)], Some(Reg::vec(1)));
            assert!(emit_one(isa, &sub).is_ok());
            let reduce = vector_expr(OpKind::HorizonReduce(ReduceKind::Sum), &[Reg::vec(3)], Some(Reg::vec(3)));
            assert!(emit_one(isa, &reduce).is_ok());
        }
    }

    #[test]
    fn test_oversized_load_is_rejected() {
        let load = vector_expr(OpKind::Load { count: 8, offset: 0 }, &[Reg::gpr(6)], Some(Reg::vec(1)));
        assert!(matches!(emit_one(Isa::Sse41, &load), Err(SnippetsError::Encoding { .. })));
        assert!(emit_one(Isa::Avx2, &load).is_ok());
    }

    #[test]
    fn test_brgemm_precisions() {
        let expr = vector_expr(OpKind::Brgemm(crate::op::BrgemmDesc {
            src_type: ElementType::U8,
            wei_type: ElementType::I8,
            beta: 0.0,
            transposed_b: false,
        }), &[Reg::gpr(0), Reg::gpr(1)], Some(Reg::gpr(2)));
        let precisions = (x64_registry().get(OpType::Brgemm).unwrap().supported_precisions)(&expr);
        assert!(precisions.contains(&vec![ElementType::U8, ElementType::I8]));
        assert!(!precisions.contains(&vec![ElementType::F32, ElementType::I8]));
    }
}
