//! Construction of a linear IR from tensor-level operations.
//!
//! The builder lowers element-wise ops, innermost-axis reductions, transposed reads and
//! matmuls into memory access and register-level expressions. Parameters and scalar
//! constants are kept in front of the body so loop marking sees an uninterrupted chain.
//! A vector register only carries one block of a tensor, so a non-uniform value consumed
//! outside the loop that produced it is routed through a scratch buffer.

use crate::core::dims::{broadcast_merge_into, is_dynamic_shape, is_dynamic_value, pshape_to_rank};
use crate::core::{ElementType, Result, SnippetsError, VectorDims, DYNAMIC_DIMENSION, FULL_DIM};
use crate::kernel_executor::brgemm_copy_b::repacked_size;
use crate::op::{BrgemmCopyBDesc, BrgemmDesc, BufferDesc, EltwiseKind, OpKind, ReduceKind};

use super::expression::{ExprId, Expression, PortDescriptor};
use super::linear_ir::{Config, LinearIR};

/// Handle of a tensor value produced while building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRef(usize);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Storage {
    /// Pointer-backed tensor: a parameter or a buffer.
    Memory(ExprId),
    /// Vector register produced by an expression output. Uniform values hold the
    /// same element in every lane and stay valid across loops.
    Register { expr: ExprId, uniform: bool, segment: usize },
    /// Brgemm output not yet bound to memory; `bound` is the result it writes.
    PendingBrgemm { expr: ExprId, bound: Option<ExprId> },
}

#[derive(Debug, Clone)]
struct ValueInfo {
    storage: Storage,
    shape: VectorDims,
    element_type: ElementType,
    /// Transposed view: `shape[i]` is dimension `order[i]` of the stored tensor.
    order: Option<Vec<usize>>,
}

/// Incremental lowering of tensor operations into a [`LinearIR`].
pub struct LinearIrBuilder {
    ir: LinearIR,
    values: Vec<ValueInfo>,
    body_anchor: Option<ExprId>,
    params: usize,
    results: usize,
    buffers: usize,
    has_reduce: bool,
    has_brgemm: bool,
    /// Counter of loop candidates as loop marking will see them.
    segment: usize,
    segment_shape: Option<VectorDims>,
}

impl LinearIrBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            ir: LinearIR::new(config),
            values: Vec::new(),
            body_anchor: None,
            params: 0,
            results: 0,
            buffers: 0,
            has_reduce: false,
            has_brgemm: false,
            segment: 0,
            segment_shape: None,
        }
    }

    fn vector_size(&self) -> usize {
        self.ir.config().vector_size
    }

    fn value(&self, v: ValueRef) -> Result<&ValueInfo> {
        self.values
            .get(v.0)
            .ok_or_else(|| SnippetsError::structure(format!("unknown value #{}", v.0)))
    }

    fn add_value(&mut self, info: ValueInfo) -> ValueRef {
        self.values.push(info);
        ValueRef(self.values.len() - 1)
    }

    fn register_value(&mut self, expr: ExprId, uniform: bool, shape: VectorDims, et: ElementType) -> ValueRef {
        let segment = self.segment;
        self.add_value(ValueInfo {
            storage: Storage::Register { expr, uniform, segment },
            shape,
            element_type: et,
            order: None,
        })
    }

    /// Insert an expression in front of the body.
    fn push_prologue(&mut self, expr: Expression) -> Result<ExprId> {
        self.ir.insert_before(self.body_anchor, expr)
    }

    fn push_body(&mut self, expr: Expression) -> ExprId {
        let op = expr.op();
        let breaks = op.is_memory_root()
            || op.has_executor()
            || expr.input_descs().iter().any(PortDescriptor::is_full_dim_innermost);
        if breaks {
            self.segment += 1;
            self.segment_shape = None;
        } else {
            let shape = expr.output_descs().first().map(|d| d.shape.clone());
            if shape != self.segment_shape {
                self.segment += 1;
                self.segment_shape = shape;
            }
        }
        let id = self.ir.push_back(expr);
        if self.body_anchor.is_none() {
            self.body_anchor = Some(id);
        }
        id
    }

    pub fn parameter(&mut self, shape: VectorDims, element_type: ElementType) -> Result<ValueRef> {
        let index = self.params;
        self.params += 1;
        let expr = Expression::new(
            OpKind::Parameter { index },
            vec![],
            vec![PortDescriptor::new(shape.clone(), element_type)],
        );
        let id = self.push_prologue(expr)?;
        Ok(self.add_value(ValueInfo {
            storage: Storage::Memory(id),
            shape,
            element_type,
            order: None,
        }))
    }

    pub fn scalar(&mut self, value: f32) -> Result<ValueRef> {
        let expr = Expression::new(
            OpKind::Scalar { value },
            vec![],
            vec![PortDescriptor::new(vec![1], ElementType::F32)],
        );
        let id = self.push_prologue(expr)?;
        Ok(self.register_value(id, true, vec![1], ElementType::F32))
    }

    /// Read `input` through a transposed view: `out.shape[i] = in.shape[order[i]]`.
    pub fn transpose(&mut self, input: ValueRef, order: Vec<usize>) -> Result<ValueRef> {
        let info = self.value(input)?.clone();
        if !matches!(info.storage, Storage::Memory(_)) || info.order.is_some() {
            return Err(SnippetsError::UnsupportedOp {
                op: "Transpose".into(),
                reason: "only tensors read directly from memory can be transposed".into(),
            });
        }
        let mut sorted = order.clone();
        sorted.sort_unstable();
        if order.len() != info.shape.len() || sorted != (0..order.len()).collect::<Vec<_>>() {
            return Err(SnippetsError::structure(format!(
                "order {order:?} is not a permutation of rank {}",
                info.shape.len()
            )));
        }
        let shape = order.iter().map(|&d| info.shape[d]).collect();
        Ok(self.add_value(ValueInfo { shape, order: Some(order), ..info }))
    }

    /// Layout of a transposed view padded to `rank`.
    fn view_layout(order: &[usize], rank: usize) -> Vec<usize> {
        let mut inverse = vec![0; order.len()];
        for (i, &d) in order.iter().enumerate() {
            inverse[d] = i;
        }
        let pad = rank - order.len();
        let mut layout: Vec<usize> = (0..pad).collect();
        layout.extend(inverse.iter().map(|&d| d + pad));
        layout
    }

    /// Materialize a value into a vector register for a consumer working on `out_shape`.
    fn to_register(&mut self, v: ValueRef, out_shape: &[usize]) -> Result<(ExprId, VectorDims)> {
        let info = self.value(v)?.clone();
        let rank = out_shape.len();
        let shape = pshape_to_rank(&info.shape, rank);
        match info.storage {
            Storage::Register { expr, uniform, segment } => {
                let same_loop = segment == self.segment && shape == out_shape;
                if uniform || same_loop {
                    return Ok((expr, shape));
                }
                let buffered = self.spill_to_buffer(v)?;
                self.to_register(buffered, out_shape)
            }
            Storage::PendingBrgemm { .. } => {
                let buffered = self.spill_to_buffer(v)?;
                self.to_register(buffered, out_shape)
            }
            Storage::Memory(root) => {
                let et = info.element_type;
                let mut in_desc = PortDescriptor::new(shape.clone(), et);
                let op = if let Some(order) = &info.order {
                    in_desc = in_desc.with_layout(Self::view_layout(order, rank));
                    OpKind::LoadReorder { count: self.vector_size(), offset: 0, order: order.clone() }
                } else if shape.last() == Some(&1) && out_shape.last() != Some(&1) {
                    OpKind::BroadcastLoad { offset: 0 }
                } else {
                    OpKind::Load { count: self.vector_size(), offset: 0 }
                };
                let load = Expression::new(op, vec![in_desc], vec![PortDescriptor::new(out_shape.to_vec(), et)]);
                let id = self.push_body(load);
                self.ir.connect(root, 0, id, 0)?;
                Ok((id, out_shape.to_vec()))
            }
        }
    }

    /// Write a value into a fresh scratch buffer and return the buffer-backed value.
    fn spill_to_buffer(&mut self, v: ValueRef) -> Result<ValueRef> {
        let info = self.value(v)?.clone();
        let et = info.element_type;
        let buffer = self.new_buffer(&info.shape, et);
        match info.storage {
            Storage::PendingBrgemm { expr, bound } => {
                if bound.is_some() {
                    return Err(SnippetsError::structure("brgemm output is already bound to a result"));
                }
                let buffer_id = self.push_body(buffer);
                self.ir.connect(expr, 0, buffer_id, 0)?;
                self.values[v.0].storage = Storage::Memory(buffer_id);
                Ok(v)
            }
            Storage::Register { expr, .. } => {
                // The store joins the producer's loop, the buffer closes the body.
                let store = Expression::new(
                    OpKind::Store { count: self.vector_size(), offset: 0 },
                    vec![PortDescriptor::new(info.shape.clone(), et)],
                    vec![PortDescriptor::new(info.shape.clone(), et)],
                );
                let store_id = self.ir.insert_after(expr, store)?;
                let buffer_id = self.push_body(buffer);
                self.ir.connect(expr, 0, store_id, 0)?;
                self.ir.connect(store_id, 0, buffer_id, 0)?;
                self.values[v.0].storage = Storage::Memory(buffer_id);
                Ok(v)
            }
            Storage::Memory(_) => Ok(v),
        }
    }

    fn tile_rank(&self) -> usize {
        self.ir.config().loop_depth.max(if self.has_brgemm { 2 } else { 1 })
    }

    fn new_buffer(&mut self, shape: &[usize], et: ElementType) -> Expression {
        let id = self.buffers;
        self.buffers += 1;
        let tile = &shape[shape.len().saturating_sub(self.tile_rank())..];
        let allocation_size = if is_dynamic_shape(tile) {
            DYNAMIC_DIMENSION
        } else {
            tile.iter().product::<usize>() * et.size()
        };
        Expression::new(
            OpKind::Buffer(BufferDesc {
                id,
                allocation_size,
                offset: DYNAMIC_DIMENSION,
                reg_group: id,
            }),
            vec![PortDescriptor::new(shape.to_vec(), et)],
            vec![PortDescriptor::new(shape.to_vec(), et)],
        )
    }

    pub fn eltwise(&mut self, kind: EltwiseKind, inputs: &[ValueRef]) -> Result<ValueRef> {
        if inputs.len() != kind.arity() {
            return Err(SnippetsError::structure(format!(
                "{} expects {} inputs, got {}",
                kind.name(),
                kind.arity(),
                inputs.len()
            )));
        }
        let mut out_shape: VectorDims = Vec::new();
        let mut uniform = true;
        let mut et = ElementType::F32;
        for &input in inputs {
            let info = self.value(input)?;
            if !broadcast_merge_into(&mut out_shape, &info.shape) {
                return Err(SnippetsError::structure(format!(
                    "{} inputs are not broadcastable",
                    kind.name()
                )));
            }
            let input_uniform = matches!(info.storage, Storage::Register { uniform: true, .. });
            uniform &= input_uniform;
            if !input_uniform {
                et = info.element_type;
            }
        }
        let mut sources = Vec::with_capacity(inputs.len());
        for &input in inputs {
            sources.push(self.to_register(input, &out_shape)?);
        }
        let in_descs = sources
            .iter()
            .map(|(_, shape)| PortDescriptor::new(shape.clone(), et))
            .collect();
        let id = self.push_body(Expression::new(
            OpKind::Eltwise(kind),
            in_descs,
            vec![PortDescriptor::new(out_shape.clone(), et)],
        ));
        for (i, (src, _)) in sources.into_iter().enumerate() {
            self.ir.connect(src, 0, id, i)?;
        }
        Ok(self.register_value(id, uniform, out_shape, et))
    }

    /// Reduce over the innermost axis keeping the dimension.
    pub fn reduce(&mut self, kind: ReduceKind, input: ValueRef) -> Result<ValueRef> {
        self.has_reduce = true;
        let info = self.value(input)?.clone();
        let shape = info.shape.clone();
        let et = info.element_type;
        let init = self.scalar(kind.init_value())?;
        let (init_expr, _) = self.to_register(init, &shape)?;
        let (src, _) = self.to_register(input, &shape)?;

        let fill = self.push_body(Expression::new(
            OpKind::Fill { offset: self.vector_size(), value: kind.init_value() },
            vec![PortDescriptor::new(shape.clone(), et)],
            vec![PortDescriptor::new(shape.clone(), et)],
        ));
        self.ir.connect(src, 0, fill, 0)?;

        let accumulate = self.push_body(Expression::new(
            OpKind::ReduceAccumulate(kind),
            vec![
                PortDescriptor::new(shape.clone(), et),
                PortDescriptor::new(vec![1], et),
            ],
            vec![PortDescriptor::new(shape.clone(), et)],
        ));
        self.ir.connect(fill, 0, accumulate, 0)?;
        self.ir.connect(init_expr, 0, accumulate, 1)?;

        let mut reduced = shape.clone();
        if let Some(last) = reduced.last_mut() {
            *last = 1;
        }
        let horizon = self.push_body(Expression::new(
            OpKind::HorizonReduce(kind),
            vec![PortDescriptor::new(shape, et).with_subtensor(vec![FULL_DIM])],
            vec![PortDescriptor::new(reduced.clone(), et)],
        ));
        self.ir.connect(accumulate, 0, horizon, 0)?;
        Ok(self.register_value(horizon, true, reduced, et))
    }

    fn to_memory(&mut self, v: ValueRef) -> Result<(ExprId, ValueInfo)> {
        let v = self.spill_to_buffer(v)?;
        let info = self.value(v)?.clone();
        match info.storage {
            Storage::Memory(root) => Ok((root, info)),
            _ => Err(SnippetsError::structure("value could not be placed in memory")),
        }
    }

    fn memory_desc(info: &ValueInfo, rank: usize) -> PortDescriptor {
        let mut desc = PortDescriptor::new(pshape_to_rank(&info.shape, rank), info.element_type)
            .with_subtensor(vec![FULL_DIM, FULL_DIM]);
        if let Some(order) = &info.order {
            desc = desc.with_layout(Self::view_layout(order, rank));
        }
        desc
    }

    /// `A[..., M, K] x B[..., K, N]` through a brgemm kernel executor.
    pub fn matmul(&mut self, a: ValueRef, b: ValueRef) -> Result<ValueRef> {
        self.has_brgemm = true;
        let (a_root, a_info) = self.to_memory(a)?;
        let (mut b_root, b_info) = self.to_memory(b)?;
        let (a_shape, b_shape) = (a_info.shape.clone(), b_info.shape.clone());
        if a_shape.len() < 2 || b_shape.len() < 2 {
            return Err(SnippetsError::structure("matmul inputs must have rank >= 2"));
        }
        let k = a_shape[a_shape.len() - 1];
        let (kb, n) = (b_shape[b_shape.len() - 2], b_shape[b_shape.len() - 1]);
        if k != kb && !is_dynamic_value(k) && !is_dynamic_value(kb) {
            return Err(SnippetsError::structure(format!("matmul K mismatch: {k} vs {kb}")));
        }
        let mut out_shape: VectorDims = a_shape[..a_shape.len() - 2].to_vec();
        if !broadcast_merge_into(&mut out_shape, &b_shape[..b_shape.len() - 2]) {
            return Err(SnippetsError::structure("matmul batch dimensions are not broadcastable"));
        }
        out_shape.push(a_shape[a_shape.len() - 2]);
        out_shape.push(n);
        let rank = out_shape.len();
        let src_type = a_info.element_type;
        let wei_type = b_info.element_type;
        let out_type = if src_type.is_real() { ElementType::F32 } else { ElementType::I32 };
        let transposed_b = b_info.order.is_some();

        let mut b_desc = Self::memory_desc(&b_info, rank);
        if wei_type != ElementType::F32 {
            let with_compensations = src_type == ElementType::I8;
            let copy = self.push_body(Expression::new(
                OpKind::BrgemmCopyB(BrgemmCopyBDesc { src_type, wei_type, with_compensations }),
                vec![b_desc.clone()],
                vec![PortDescriptor::new(b_desc.shape.clone(), wei_type).with_subtensor(vec![FULL_DIM, FULL_DIM])],
            ));
            self.ir.connect(b_root, 0, copy, 0)?;
            let mut repacked = self.new_buffer(&b_shape, wei_type);
            if let OpKind::Buffer(desc) = repacked.op_mut() {
                if !is_dynamic_value(desc.allocation_size) {
                    let comp = if with_compensations { n * ElementType::I32.size() } else { 0 };
                    desc.allocation_size = repacked_size(k, n, wei_type) + comp;
                }
            }
            let buffer = self.push_body(repacked);
            self.ir.connect(copy, 0, buffer, 0)?;
            b_root = buffer;
            b_desc = PortDescriptor::new(b_desc.shape, wei_type).with_subtensor(vec![FULL_DIM, FULL_DIM]);
        }

        let brgemm = self.push_body(Expression::new(
            OpKind::Brgemm(BrgemmDesc { src_type, wei_type, beta: 0.0, transposed_b }),
            vec![Self::memory_desc(&a_info, rank), b_desc],
            vec![PortDescriptor::new(out_shape.clone(), out_type).with_subtensor(vec![FULL_DIM, FULL_DIM])],
        ));
        self.ir.connect(a_root, 0, brgemm, 0)?;
        self.ir.connect(b_root, 0, brgemm, 1)?;
        let config = self.ir.config_mut();
        config.loop_depth = config.loop_depth.max(2);
        Ok(self.add_value(ValueInfo {
            storage: Storage::PendingBrgemm { expr: brgemm, bound: None },
            shape: out_shape,
            element_type: out_type,
            order: None,
        }))
    }

    /// Bind a value to the next subgraph output and return the output index.
    pub fn result(&mut self, v: ValueRef) -> Result<usize> {
        let index = self.results;
        self.results += 1;
        let info = self.value(v)?.clone();
        let et = info.element_type;
        let result = Expression::new(
            OpKind::Result { index },
            vec![PortDescriptor::new(info.shape.clone(), et)],
            vec![],
        );
        match info.storage {
            Storage::PendingBrgemm { expr, bound: None } => {
                let id = self.push_body(result);
                self.ir.connect(expr, 0, id, 0)?;
                self.values[v.0].storage = Storage::PendingBrgemm { expr, bound: Some(id) };
            }
            _ => {
                let (src, shape) = self.to_register(v, &info.shape)?;
                let store = self.push_body(Expression::new(
                    OpKind::Store { count: self.vector_size(), offset: 0 },
                    vec![PortDescriptor::new(shape.clone(), et)],
                    vec![PortDescriptor::new(shape, et)],
                ));
                self.ir.connect(src, 0, store, 0)?;
                let id = self.push_body(result);
                self.ir.connect(store, 0, id, 0)?;
            }
        }
        Ok(index)
    }

    pub fn build(self) -> Result<LinearIR> {
        if self.has_reduce && self.has_brgemm {
            return Err(SnippetsError::UnsupportedOp {
                op: "Reduce".into(),
                reason: "reductions are only lowered for single-dimension tiles".into(),
            });
        }
        if self.results == 0 {
            return Err(SnippetsError::structure("subgraph has no results"));
        }
        let mut ir = self.ir;
        let dynamic = ir.iter().any(|id| {
            ir.get(id)
                .map(|e| {
                    e.output_descs()
                        .iter()
                        .chain(e.input_descs())
                        .any(|d| is_dynamic_shape(&d.shape))
                })
                .unwrap_or(false)
        });
        ir.config_mut().is_dynamic = dynamic;
        Ok(ir)
    }
}
