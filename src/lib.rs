//! Snippets - a tensor-subgraph compiler backend.
//!
//! Fusible clusters of element-wise, reduction and matmul operations are carved out of a
//! tensor graph by the tokenizer, lowered into a linear IR of expressions, structured into
//! loops, buffers and registers by a pass pipeline, and JIT-compiled into one kernel per
//! target configuration. Kernels compiled for dynamic shapes are configured per invocation
//! by a runtime configurator and executed in parallel over their outer dimensions.
//!
//! # Primary Usage
//!
//! ```ignore
//! use snippets::graph::{Model, NodeOp, SnippetsTokenization, TokenizationConfig};
//! use snippets::{CompilationSession, KernelCache, Snippet, X64TargetMachine};
//!
//! let subgraphs = SnippetsTokenization::new(TokenizationConfig::default()).run(&mut model)?;
//! let NodeOp::Subgraph(body) = &model.node(subgraphs[0])?.op else { unreachable!() };
//! let snippet = Snippet::compile("sg0", body, &shapes, Box::new(X64TargetMachine::host()?),
//!     Default::default(), &cache, &CompilationSession::new())?;
//! snippet.execute_static(&inputs, &mut outputs)?;
//! ```
//!
//! # Architecture
//!
//! - [`graph`] - Graph model, tokenization and subgraph lowering
//! - [`lowered`] - Linear IR, builder and the lowering pass pipeline
//! - [`generator`] - Pipeline driver, capability checks and emission
//! - [`x64`] - x86-64 target machine (encoder, emitters, JIT memory, ELF export)
//! - [`kernel_executor`] - Brgemm executors and the compiled-kernel cache
//! - [`runtime`] - Runtime configurator and optimizers for dynamic shapes
//! - [`snippet`] - Compiled subgraphs and parallel execution
//! - [`core`] - Shared infrastructure (errors, element types, registers, session)

pub mod core;
pub mod generator;
pub mod graph;
pub mod kernel_executor;
pub mod lowered;
pub mod op;
pub mod runtime;
pub mod snippet;
pub mod target_machine;
pub mod x64;

pub use core::{CompilationSession, ElementType, Result, SessionStats, SnippetsError, VectorDims, DYNAMIC_DIMENSION};
pub use generator::{Generator, LoweringResult};
pub use kernel_executor::KernelCache;
pub use lowered::{Config, LinearIR, LinearIrBuilder};
pub use runtime::{RuntimeConfig, RuntimeConfigurator};
pub use snippet::{ExecutionStatus, Snippet, SnippetKernelConfig};
pub use target_machine::{CompiledSnippet, Isa, TargetMachine};
pub use x64::X64TargetMachine;
