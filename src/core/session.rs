// This module provides compilation session bookkeeping for one subgraph compilation.
// CompilationSession tracks which subgraph is being lowered and accumulates SessionStats:
// how many passes ran and which of them changed the IR, how many expressions, loops and
// buffers the final IR holds, register pressure per bank, emitted code size and how many
// kernels were compiled versus served from the kernel cache. The generator and the pass
// pipeline record into the session as they go; the CLI and the logs read the snapshot.
// Interior mutability keeps the recording API usable through shared references while the
// session is borrowed by the pipeline.

//! Compilation session statistics.

use std::cell::RefCell;
use std::fmt;

use hashbrown::HashMap;

/// Per-compilation bookkeeping shared by the pass pipeline and the generator.
#[derive(Default)]
pub struct CompilationSession {
    stats: RefCell<SessionStats>,
    current_subgraph: RefCell<Option<String>>,
}

impl CompilationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_subgraph(&self, name: &str) {
        *self.current_subgraph.borrow_mut() = Some(name.to_string());
    }

    pub fn current_subgraph(&self) -> Option<String> {
        self.current_subgraph.borrow().clone()
    }

    /// Record that a pass ran and whether it modified the IR.
    pub fn record_pass(&self, name: &str, modified: bool) {
        let mut stats = self.stats.borrow_mut();
        stats.passes_run += 1;
        if modified {
            *stats.modifying_passes.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_ir_shape(&self, expressions: usize, loops: usize, buffers: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.expressions = expressions;
        stats.loops = loops;
        stats.buffers = buffers;
    }

    pub fn record_registers(&self, gp_used: u32, vec_used: u32) {
        let mut stats = self.stats.borrow_mut();
        stats.gp_registers_used = gp_used;
        stats.vec_registers_used = vec_used;
    }

    pub fn record_kernel_compiled(&self, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.kernels_compiled += 1;
        stats.total_code_size += code_size;
    }

    pub fn record_scratchpad(&self, size: usize) {
        self.stats.borrow_mut().buffer_scratchpad_size = size;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub passes_run: usize,
    /// Passes that reported a modification, with the number of times they did.
    pub modifying_passes: HashMap<String, usize>,
    pub expressions: usize,
    pub loops: usize,
    pub buffers: usize,
    pub buffer_scratchpad_size: usize,
    pub gp_registers_used: u32,
    pub vec_registers_used: u32,
    pub kernels_compiled: usize,
    pub total_code_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "passes run:        {}", self.passes_run)?;
        writeln!(f, "expressions:       {}", self.expressions)?;
        writeln!(f, "loops:             {}", self.loops)?;
        writeln!(f, "buffers:           {} ({} bytes)", self.buffers, self.buffer_scratchpad_size)?;
        writeln!(f, "registers:         {} gpr, {} vec", self.gp_registers_used, self.vec_registers_used)?;
        write!(f, "code size:         {} bytes in {} kernel(s)", self.total_code_size, self.kernels_compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_records() {
        let session = CompilationSession::new();
        session.set_current_subgraph("add_relu");
        session.record_pass("MarkLoops", true);
        session.record_pass("Validate", false);
        session.record_kernel_compiled(64);

        let stats = session.stats();
        assert_eq!(stats.passes_run, 2);
        assert_eq!(stats.modifying_passes.get("MarkLoops"), Some(&1));
        assert!(stats.modifying_passes.get("Validate").is_none());
        assert_eq!(stats.total_code_size, 64);
        assert_eq!(session.current_subgraph().as_deref(), Some("add_relu"));
    }
}
