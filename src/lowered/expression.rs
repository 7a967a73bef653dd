//! Expressions: one instruction of the linear IR with its port connectors and descriptors.

use std::fmt;

use crate::core::dims::format_dims;
use crate::core::{ElementType, Reg, VectorDims};
use crate::op::{OpKind, OpType};

/// Stable handle of an expression inside a [`super::LinearIR`].
///
/// Handles survive insertion and removal of other expressions. A handle to an
/// erased expression is detected through the slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ExprId {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortType {
    Input,
    Output,
}

/// One input or output port of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprPort {
    pub expr: ExprId,
    pub port_type: PortType,
    pub index: usize,
}

impl ExprPort {
    pub fn input(expr: ExprId, index: usize) -> Self {
        Self { expr, port_type: PortType::Input, index }
    }

    pub fn output(expr: ExprId, index: usize) -> Self {
        Self { expr, port_type: PortType::Output, index }
    }
}

impl fmt::Display for ExprPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port_type {
            PortType::Input => write!(f, "{}.in{}", self.expr, self.index),
            PortType::Output => write!(f, "{}.out{}", self.expr, self.index),
        }
    }
}

/// Shape, subtensor, layout and register of a port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortDescriptor {
    /// Planar shape of the tensor seen through this port.
    pub shape: VectorDims,
    /// Per-iteration block processed through the port. Empty means one vector of
    /// the innermost dimension; `FULL_DIM` entries cover the whole dimension.
    pub subtensor: VectorDims,
    /// Memory order of the planar dimensions, outermost first.
    pub layout: Vec<usize>,
    pub element_type: ElementType,
    pub reg: Option<Reg>,
}

impl PortDescriptor {
    pub fn new(shape: VectorDims, element_type: ElementType) -> Self {
        let layout = (0..shape.len()).collect();
        Self {
            shape,
            subtensor: Vec::new(),
            layout,
            element_type,
            reg: None,
        }
    }

    pub fn with_subtensor(mut self, subtensor: VectorDims) -> Self {
        self.subtensor = subtensor;
        self
    }

    pub fn with_layout(mut self, layout: Vec<usize>) -> Self {
        self.layout = layout;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Whether a producer/consumer pair cannot live in the same loop body.
    pub fn conflicts_with(&self, other: &PortDescriptor) -> bool {
        self.shape != other.shape || self.subtensor != other.subtensor || self.layout != other.layout
    }

    /// The innermost subtensor entry covers the whole dimension.
    pub fn is_full_dim_innermost(&self) -> bool {
        self.subtensor.last() == Some(&crate::core::FULL_DIM)
    }

    /// Element strides of the planar dimensions given the memory layout.
    pub fn planar_strides(&self, shape: &[usize]) -> VectorDims {
        let memory_shape: VectorDims = self.layout.iter().map(|&d| shape[d]).collect();
        let memory_strides = crate::core::dims::dense_strides(&memory_shape);
        let mut strides = vec![0; shape.len()];
        for (pos, &dim) in self.layout.iter().enumerate() {
            strides[dim] = memory_strides[pos];
        }
        strides
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", format_dims(&self.shape), self.element_type)?;
        if !self.subtensor.is_empty() {
            write!(f, " sub{}", format_dims(&self.subtensor))?;
        }
        if self.layout.iter().enumerate().any(|(i, &d)| i != d) {
            write!(f, " layout{:?}", self.layout)?;
        }
        if let Some(reg) = self.reg {
            write!(f, " @{reg}")?;
        }
        Ok(())
    }
}

/// One instruction of the linear IR.
#[derive(Debug, Clone)]
pub struct Expression {
    pub(crate) op: OpKind,
    /// Source output port of every input.
    pub(crate) inputs: Vec<Option<ExprPort>>,
    /// Consumer input ports of every output.
    pub(crate) outputs: Vec<Vec<ExprPort>>,
    pub(crate) input_descs: Vec<PortDescriptor>,
    pub(crate) output_descs: Vec<PortDescriptor>,
    /// Loop ids, outermost first.
    pub(crate) loop_ids: Vec<usize>,
}

impl Expression {
    pub fn new(op: OpKind, input_descs: Vec<PortDescriptor>, output_descs: Vec<PortDescriptor>) -> Self {
        Self {
            op,
            inputs: vec![None; input_descs.len()],
            outputs: vec![Vec::new(); output_descs.len()],
            input_descs,
            output_descs,
            loop_ids: Vec::new(),
        }
    }

    pub fn op(&self) -> &OpKind {
        &self.op
    }

    pub fn op_mut(&mut self) -> &mut OpKind {
        &mut self.op
    }

    pub fn op_type(&self) -> OpType {
        self.op.op_type()
    }

    pub fn input_count(&self) -> usize {
        self.input_descs.len()
    }

    pub fn output_count(&self) -> usize {
        self.output_descs.len()
    }

    pub fn input_descs(&self) -> &[PortDescriptor] {
        &self.input_descs
    }

    pub fn output_descs(&self) -> &[PortDescriptor] {
        &self.output_descs
    }

    pub fn input_descs_mut(&mut self) -> &mut [PortDescriptor] {
        &mut self.input_descs
    }

    pub fn output_descs_mut(&mut self) -> &mut [PortDescriptor] {
        &mut self.output_descs
    }

    pub fn input_source(&self, index: usize) -> Option<ExprPort> {
        self.inputs.get(index).copied().flatten()
    }

    pub fn inputs(&self) -> &[Option<ExprPort>] {
        &self.inputs
    }

    /// Consumers of an output, including forward-only edges of cloned stores.
    pub fn consumers(&self, index: usize) -> &[ExprPort] {
        self.outputs.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn loop_ids(&self) -> &[usize] {
        &self.loop_ids
    }

    pub fn set_loop_ids(&mut self, loop_ids: Vec<usize>) {
        self.loop_ids = loop_ids;
    }

    /// Registers of the input ports, in port order.
    pub fn in_regs(&self) -> Vec<Reg> {
        self.input_descs.iter().filter_map(|d| d.reg).collect()
    }

    pub fn out_regs(&self) -> Vec<Reg> {
        self.output_descs.iter().filter_map(|d| d.reg).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_strides_with_layout() {
        let desc = PortDescriptor::new(vec![2, 3, 4], ElementType::F32);
        assert_eq!(desc.planar_strides(&desc.shape), vec![12, 4, 1]);

        // Memory holds [4, 3, 2] with dim 2 outermost.
        let desc = desc.with_layout(vec![2, 1, 0]);
        assert_eq!(desc.planar_strides(&[2, 3, 4]), vec![1, 2, 6]);
    }

    #[test]
    fn test_descriptor_conflicts() {
        let a = PortDescriptor::new(vec![1, 130], ElementType::F32);
        let b = a.clone().with_subtensor(vec![crate::core::FULL_DIM]);
        assert!(!a.conflicts_with(&a.clone()));
        assert!(a.conflicts_with(&b));
        assert!(b.is_full_dim_innermost());
    }
}
