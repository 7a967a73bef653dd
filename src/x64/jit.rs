//! Executable memory for emitted kernels.

use memmap2::{Mmap, MmapMut};

use crate::core::{Result, SnippetsError};
use crate::target_machine::CompiledSnippet;

/// Machine code mapped read+execute, plus a copy of the bytes for export.
pub struct JitSnippet {
    mmap: Option<Mmap>,
    bytes: Vec<u8>,
}

impl JitSnippet {
    pub fn new(code: Vec<u8>) -> Result<Self> {
        if code.is_empty() {
            return Ok(Self { mmap: None, bytes: code });
        }
        let mut map = MmapMut::map_anon(code.len())
            .map_err(|e| SnippetsError::Jit { reason: format!("map {} bytes: {e}", code.len()) })?;
        map.copy_from_slice(&code);
        let mmap = map
            .make_exec()
            .map_err(|e| SnippetsError::Jit { reason: format!("make executable: {e}") })?;
        Ok(Self { mmap: Some(mmap), bytes: code })
    }
}

impl std::fmt::Debug for JitSnippet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitSnippet")
            .field("code", &self.get_code())
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl CompiledSnippet for JitSnippet {
    fn get_code(&self) -> *const u8 {
        self.mmap.as_ref().map_or(std::ptr::null(), |m| m.as_ptr())
    }

    fn get_code_size(&self) -> usize {
        self.bytes.len()
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
