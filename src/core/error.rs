// This module defines the error type shared by every stage of the snippets pipeline using the
// thiserror crate. SnippetsError covers the taxonomy the compiler exposes upward: structural
// contract violations (stale expression handles, malformed loop nesting, overlapping buffers,
// lookups of unregistered emitters), register allocation failures, unsupported kernel
// configurations (ISA or dtype combinations no emitter implements), dynamic-shape update
// failures that force a new configuration, and encoding/JIT failures from the x86-64 backend.
// Each variant carries the context needed to report which subgraph failed and why. Callers
// treat every variant as fatal for the current compilation unit and fall back to reference
// execution; nothing here is retried with the same configuration.

//! Error types for the snippets compiler.

use thiserror::Error;

use crate::op::OpType;

/// Main error type for lowering, compilation and runtime configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnippetsError {
    #[error("Invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("Malformed loop structure: {reason}")]
    LoopNesting { reason: String },

    #[error("Buffers {first} and {second} overlap in memory while both are live")]
    BufferOverlap { first: usize, second: usize },

    #[error("No emitter registered for {op_type:?}")]
    UnregisteredEmitter { op_type: OpType },

    #[error("Structural error: {reason}")]
    Structure { reason: String },

    #[error("Register allocation failed: {reason}")]
    RegisterAllocation { reason: String },

    #[error("Unsupported kernel configuration: {reason}")]
    UnsupportedConfig { reason: String },

    #[error("Unsupported operation {op}: {reason}")]
    UnsupportedOp { op: String, reason: String },

    #[error("Dynamic shape update failed: {reason}")]
    DynamicShapeUpdate { reason: String },

    #[error("Instruction encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("JIT memory error: {reason}")]
    Jit { reason: String },
}

impl SnippetsError {
    pub(crate) fn structure(reason: impl Into<String>) -> Self {
        Self::Structure { reason: reason.into() }
    }

    pub(crate) fn invalid_expr(reason: impl Into<String>) -> Self {
        Self::InvalidExpression { reason: reason.into() }
    }

    pub(crate) fn loop_nesting(reason: impl Into<String>) -> Self {
        Self::LoopNesting { reason: reason.into() }
    }

    pub(crate) fn unsupported_config(reason: impl Into<String>) -> Self {
        Self::UnsupportedConfig { reason: reason.into() }
    }

    pub(crate) fn shape_update(reason: impl Into<String>) -> Self {
        Self::DynamicShapeUpdate { reason: reason.into() }
    }

    /// Whether the failure means a new configuration must be generated
    /// instead of reusing the compiled kernel.
    pub fn requires_recompilation(&self) -> bool {
        matches!(self, Self::DynamicShapeUpdate { .. })
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SnippetsError>;
