// This module hosts the lowered representation of a subgraph: the linear IR, its expressions
// and port descriptors, the loop manager, the builder that lowers tensor operations into
// expressions, the liveness analysis and the pass pipeline that turns a flat expression list
// into a loop-structured, register-assigned kernel body ready for emission.

//! Linear IR and the lowering pass pipeline.

pub mod builder;
pub mod expression;
pub mod linear_ir;
pub mod liveness;
pub mod loop_manager;
pub mod pass;
pub mod runtime_args;

pub use builder::{LinearIrBuilder, ValueRef};
pub use expression::{ExprId, ExprPort, Expression, PortDescriptor, PortType};
pub use linear_ir::{Config, LinearIR};
pub use liveness::{LivenessInfo, Liveness};
pub use loop_manager::{LoopInfo, LoopKind, LoopManager, LoopPort, SpecificIterType, DYNAMIC_OFFSET};
pub use runtime_args::RuntimeArgsLayout;
