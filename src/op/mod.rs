// This module defines the closed set of abstract operations a lowered expression can wrap.
// OpKind is the sum type carried by every Expression: memory access (Parameter, Result, Load,
// LoadReorder, BroadcastLoad, Store, Buffer), register-level compute (Scalar, Fill, element-wise
// and reduction ops), loop markers (LoopBegin, LoopEnd) and the matmul-like ops that delegate to
// kernel executors (Brgemm, BrgemmCopyB). OpType is the stable registry key derived from an
// OpKind; the target machine maps OpType to emitter factories, so two expressions share an
// emitter implementation exactly when their OpType compares equal.

//! Abstract operations of the lowered IR.

use std::fmt;

use crate::core::ElementType;

/// Element-wise operations understood by the lowered IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EltwiseKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    SquaredDifference,
    Relu,
    Negative,
    Abs,
    Sqrt,
    Exp,
}

impl EltwiseKind {
    pub fn arity(self) -> usize {
        match self {
            EltwiseKind::Relu
            | EltwiseKind::Negative
            | EltwiseKind::Abs
            | EltwiseKind::Sqrt
            | EltwiseKind::Exp => 1,
            _ => 2,
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            EltwiseKind::Add
                | EltwiseKind::Multiply
                | EltwiseKind::Maximum
                | EltwiseKind::Minimum
                | EltwiseKind::SquaredDifference
        )
    }

    /// Scalar semantics, used by reference execution and tests.
    pub fn evaluate(self, a: f32, b: f32) -> f32 {
        match self {
            EltwiseKind::Add => a + b,
            EltwiseKind::Subtract => a - b,
            EltwiseKind::Multiply => a * b,
            EltwiseKind::Divide => a / b,
            EltwiseKind::Maximum => a.max(b),
            EltwiseKind::Minimum => a.min(b),
            EltwiseKind::SquaredDifference => (a - b) * (a - b),
            EltwiseKind::Relu => a.max(0.0),
            EltwiseKind::Negative => -a,
            EltwiseKind::Abs => a.abs(),
            EltwiseKind::Sqrt => a.sqrt(),
            EltwiseKind::Exp => a.exp(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EltwiseKind::Add => "Add",
            EltwiseKind::Subtract => "Subtract",
            EltwiseKind::Multiply => "Multiply",
            EltwiseKind::Divide => "Divide",
            EltwiseKind::Maximum => "Maximum",
            EltwiseKind::Minimum => "Minimum",
            EltwiseKind::SquaredDifference => "SquaredDifference",
            EltwiseKind::Relu => "Relu",
            EltwiseKind::Negative => "Negative",
            EltwiseKind::Abs => "Abs",
            EltwiseKind::Sqrt => "Sqrt",
            EltwiseKind::Exp => "Exp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [EltwiseKind; 12] = [
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
            EltwiseKind::Exp,
        ];
        ALL.into_iter().find(|k| k.name().eq_ignore_ascii_case(name))
    }
}

/// Reductions over the innermost dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReduceKind {
    Max,
    Sum,
}

impl ReduceKind {
    /// Neutral element the accumulator starts from.
    pub fn init_value(self) -> f32 {
        match self {
            ReduceKind::Max => f32::NEG_INFINITY,
            ReduceKind::Sum => 0.0,
        }
    }

    pub fn combine(self, acc: f32, x: f32) -> f32 {
        match self {
            ReduceKind::Max => acc.max(x),
            ReduceKind::Sum => acc + x,
        }
    }

    /// Element-wise op used to combine vector lanes.
    pub fn lane_op(self) -> EltwiseKind {
        match self {
            ReduceKind::Max => EltwiseKind::Maximum,
            ReduceKind::Sum => EltwiseKind::Add,
        }
    }
}

/// Attributes of a scratch buffer expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub id: usize,
    /// Size in bytes, `DYNAMIC_DIMENSION` if only known at runtime.
    pub allocation_size: usize,
    /// Byte offset into the scratchpad, `DYNAMIC_DIMENSION` until resolved.
    pub offset: usize,
    pub reg_group: usize,
}

/// Attributes of a batch-reduce GEMM expression.
#[derive(Debug, Clone, PartialEq)]
pub struct BrgemmDesc {
    pub src_type: ElementType,
    pub wei_type: ElementType,
    pub beta: f32,
    pub transposed_b: bool,
}

/// Attributes of a weights repacking expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrgemmCopyBDesc {
    pub src_type: ElementType,
    pub wei_type: ElementType,
    pub with_compensations: bool,
}

/// Operation wrapped by an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Parameter { index: usize },
    Result { index: usize },
    /// Loads `count` consecutive elements starting `offset` bytes past the pointer.
    Load { count: usize, offset: usize },
    LoadReorder { count: usize, offset: usize, order: Vec<usize> },
    /// Loads one element and broadcasts it to every lane.
    BroadcastLoad { offset: usize },
    Store { count: usize, offset: usize },
    Scalar { value: f32 },
    /// Overwrites lanes starting at `offset` with `value`.
    Fill { offset: usize, value: f32 },
    Eltwise(EltwiseKind),
    /// In-place accumulation into the register of input 1.
    ReduceAccumulate(ReduceKind),
    /// Reduces all lanes and broadcasts the result to every lane.
    HorizonReduce(ReduceKind),
    LoopBegin { loop_id: usize },
    LoopEnd { loop_id: usize },
    Buffer(BufferDesc),
    Brgemm(BrgemmDesc),
    BrgemmCopyB(BrgemmCopyBDesc),
}

/// Registry key identifying an operation type independently of its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpType {
    Parameter,
    Result,
    Load,
    LoadReorder,
    BroadcastLoad,
    Store,
    Scalar,
    Fill,
    Eltwise(EltwiseKind),
    ReduceAccumulate(ReduceKind),
    HorizonReduce(ReduceKind),
    LoopBegin,
    LoopEnd,
    Buffer,
    Brgemm,
    BrgemmCopyB,
}

impl OpKind {
    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::Parameter { .. } => OpType::Parameter,
            OpKind::Result { .. } => OpType::Result,
            OpKind::Load { .. } => OpType::Load,
            OpKind::LoadReorder { .. } => OpType::LoadReorder,
            OpKind::BroadcastLoad { .. } => OpType::BroadcastLoad,
            OpKind::Store { .. } => OpType::Store,
            OpKind::Scalar { .. } => OpType::Scalar,
            OpKind::Fill { .. } => OpType::Fill,
            OpKind::Eltwise(kind) => OpType::Eltwise(*kind),
            OpKind::ReduceAccumulate(kind) => OpType::ReduceAccumulate(*kind),
            OpKind::HorizonReduce(kind) => OpType::HorizonReduce(*kind),
            OpKind::LoopBegin { .. } => OpType::LoopBegin,
            OpKind::LoopEnd { .. } => OpType::LoopEnd,
            OpKind::Buffer(_) => OpType::Buffer,
            OpKind::Brgemm(_) => OpType::Brgemm,
            OpKind::BrgemmCopyB(_) => OpType::BrgemmCopyB,
        }
    }

    pub fn is_memory_access(&self) -> bool {
        matches!(
            self,
            OpKind::Load { .. }
                | OpKind::LoadReorder { .. }
                | OpKind::BroadcastLoad { .. }
                | OpKind::Store { .. }
        )
    }

    pub fn is_load(&self) -> bool {
        matches!(
            self,
            OpKind::Load { .. } | OpKind::LoadReorder { .. } | OpKind::BroadcastLoad { .. }
        )
    }

    /// Parameters, results and buffers own a pointer for the whole kernel.
    pub fn is_memory_root(&self) -> bool {
        matches!(
            self,
            OpKind::Parameter { .. } | OpKind::Result { .. } | OpKind::Buffer(_)
        )
    }

    pub fn is_loop_marker(&self) -> bool {
        matches!(self, OpKind::LoopBegin { .. } | OpKind::LoopEnd { .. })
    }

    /// Ops that own a kernel executor and run outside the vector loops.
    pub fn has_executor(&self) -> bool {
        matches!(self, OpKind::Brgemm(_) | OpKind::BrgemmCopyB(_))
    }

    /// Whether the expression produces a value held in a vector register.
    pub fn defines_vector(&self) -> bool {
        matches!(
            self,
            OpKind::Load { .. }
                | OpKind::LoadReorder { .. }
                | OpKind::BroadcastLoad { .. }
                | OpKind::Scalar { .. }
                | OpKind::Fill { .. }
                | OpKind::Eltwise(_)
                | OpKind::ReduceAccumulate(_)
                | OpKind::HorizonReduce(_)
        )
    }

    pub fn loop_id(&self) -> Option<usize> {
        match self {
            OpKind::LoopBegin { loop_id } | OpKind::LoopEnd { loop_id } => Some(*loop_id),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Parameter { index } => write!(f, "Parameter#{index}"),
            OpKind::Result { index } => write!(f, "Result#{index}"),
            OpKind::Load { count, offset } => write!(f, "Load(count={count}, offset={offset})"),
            OpKind::LoadReorder { count, order, .. } => {
                write!(f, "LoadReorder(count={count}, order={order:?})")
            }
            OpKind::BroadcastLoad { offset } => write!(f, "BroadcastLoad(offset={offset})"),
            OpKind::Store { count, offset } => write!(f, "Store(count={count}, offset={offset})"),
            OpKind::Scalar { value } => write!(f, "Scalar({value})"),
            OpKind::Fill { offset, value } => write!(f, "Fill(offset={offset}, value={value})"),
            OpKind::Eltwise(kind) => f.write_str(kind.name()),
            OpKind::ReduceAccumulate(kind) => write!(f, "ReduceAccumulate({kind:?})"),
            OpKind::HorizonReduce(kind) => write!(f, "HorizonReduce({kind:?})"),
            OpKind::LoopBegin { loop_id } => write!(f, "LoopBegin({loop_id})"),
            OpKind::LoopEnd { loop_id } => write!(f, "LoopEnd({loop_id})"),
            OpKind::Buffer(b) => write!(
                f,
                "Buffer#{}(size={}, offset={}, group={})",
                b.id,
                crate::core::dims::format_dims(&[b.allocation_size]),
                crate::core::dims::format_dims(&[b.offset]),
                b.reg_group
            ),
            OpKind::Brgemm(b) => write!(f, "Brgemm({}x{}, beta={})", b.src_type, b.wei_type, b.beta),
            OpKind::BrgemmCopyB(b) => write!(f, "BrgemmCopyB({}x{})", b.src_type, b.wei_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_type_keys() {
        let load = OpKind::Load { count: 8, offset: 0 };
        let tail_load = OpKind::Load { count: 2, offset: 0 };
        assert_eq!(load.op_type(), tail_load.op_type());
        assert_ne!(
            OpKind::Eltwise(EltwiseKind::Add).op_type(),
            OpKind::Eltwise(EltwiseKind::Multiply).op_type()
        );
        assert!(load.defines_vector());
        assert!(!OpKind::Store { count: 8, offset: 0 }.defines_vector());
    }

    #[test]
    fn test_reduce_semantics() {
        assert_eq!(ReduceKind::Max.combine(ReduceKind::Max.init_value(), -3.0), -3.0);
        assert_eq!(ReduceKind::Sum.lane_op(), EltwiseKind::Add);
        assert_eq!(EltwiseKind::from_name("relu"), Some(EltwiseKind::Relu));
        assert_eq!(EltwiseKind::SquaredDifference.evaluate(1.0, 3.0), 4.0);
    }
}
