// This module serves as the hub for the infrastructure shared by every stage of the
// compiler: the error taxonomy, tensor element types, dimension helpers, the register file
// used by register assignment, and the compilation session that collects statistics.
// Nothing here knows about a particular target or about the graph the subgraph came from.

//! Core infrastructure shared across the compiler.

pub mod error;
pub mod element_type;
pub mod dims;
pub mod register_file;
pub mod session;

pub use error::{Result, SnippetsError};
pub use element_type::{ElementType, SUPPORTED_ELEMENT_TYPES};
pub use dims::{VectorDims, DYNAMIC_DIMENSION, FULL_DIM};
pub use register_file::{Reg, RegBitSet, RegType, RegisterFile};
pub use session::{CompilationSession, SessionStats};
