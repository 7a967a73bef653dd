// This module defines the target-independent face of code generation. A TargetMachine owns an
// emitter registry keyed by OpType: each entry pairs a factory building the emitter for one
// expression with a function listing the operand precision combinations the emitter accepts.
// Callers check `has` before `get`; asking for an unregistered type is a structural error. The
// target also answers the ISA questions lowering depends on: vector lanes, the GP and vector
// register pools the allocator may hand out (stack, frame and emitter scratch registers are
// never part of them) and the ABI argument registers of the kernel entry point. Emission of a
// fully lowered IR ends in a CompiledSnippet, an immutable block of executable code shared by
// every holder of an equal kernel configuration.

//! Target machine interface and emitter registry.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::core::{ElementType, Reg, Result, SnippetsError};
use crate::kernel_executor::KernelExecutorTable;
use crate::lowered::{Expression, LinearIR, RuntimeArgsLayout};
use crate::op::OpType;

/// Vector instruction set flavour of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Isa {
    Sse41,
    Avx2,
    Avx512,
}

impl Isa {
    /// f32 lanes of one vector register.
    pub const fn lanes(self) -> usize {
        match self {
            Isa::Sse41 => 4,
            Isa::Avx2 => 8,
            Isa::Avx512 => 16,
        }
    }

    pub const fn vec_register_count(self) -> usize {
        match self {
            Isa::Sse41 | Isa::Avx2 => 16,
            Isa::Avx512 => 32,
        }
    }

    /// Bytes of one vector register.
    pub const fn vec_bytes(self) -> usize {
        self.lanes() * 4
    }

    pub fn name(self) -> &'static str {
        match self {
            Isa::Sse41 => "sse41",
            Isa::Avx2 => "avx2",
            Isa::Avx512 => "avx512",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [Isa::Sse41, Isa::Avx2, Isa::Avx512]
            .into_iter()
            .find(|isa| isa.name().eq_ignore_ascii_case(name))
    }

    /// Whether the running CPU can execute code for this ISA.
    pub fn is_supported_by_host(self) -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            match self {
                Isa::Sse41 => std::arch::is_x86_feature_detected!("sse4.1"),
                Isa::Avx2 => std::arch::is_x86_feature_detected!("avx2"),
                Isa::Avx512 => std::arch::is_x86_feature_detected!("avx512f"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    /// Widest ISA the running CPU supports.
    pub fn host() -> Option<Self> {
        [Isa::Avx512, Isa::Avx2, Isa::Sse41]
            .into_iter()
            .find(|isa| isa.is_supported_by_host())
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Argument block passed to a kernel entry point in the first argument register.
///
/// `io_ptrs` lists the parameter pointers followed by the result pointers, already offset to
/// the tile of the current parallel iteration. `runtime_args` is null for static kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelCallArgs {
    pub io_ptrs: *const *mut u8,
    pub scratchpad: *mut u8,
    pub runtime_args: *const i64,
}

impl KernelCallArgs {
    pub const IO_PTRS_OFFSET: i64 = 0;
    pub const SCRATCHPAD_OFFSET: i64 = 8;
    pub const RUNTIME_ARGS_OFFSET: i64 = 16;
}

/// Kernel entry point.
pub type KernelFn = unsafe extern "C" fn(args: *const KernelCallArgs);

/// Executable code of one lowered kernel.
pub trait CompiledSnippet: Send + Sync + fmt::Debug {
    fn get_code(&self) -> *const u8;
    fn get_code_size(&self) -> usize;
    /// Machine code bytes, for export and inspection.
    fn bytes(&self) -> &[u8];

    fn empty(&self) -> bool {
        self.get_code_size() == 0
    }
}

/// Precision combinations an emitter accepts, one entry per combination of input types.
pub type SupportedPrecisions = fn(&Expression) -> Vec<Vec<ElementType>>;

/// Factory and precision query registered for one operation type.
pub struct EmitterEntry<E: ?Sized> {
    pub factory: fn(&Expression) -> Result<Box<E>>,
    pub supported_precisions: SupportedPrecisions,
}

impl<E: ?Sized> Clone for EmitterEntry<E> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory,
            supported_precisions: self.supported_precisions,
        }
    }
}

/// Map from operation type to emitter entry.
pub struct EmitterRegistry<E: ?Sized> {
    entries: HashMap<OpType, EmitterEntry<E>>,
}

impl<E: ?Sized> EmitterRegistry<E> {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn register(&mut self, op_type: OpType, entry: EmitterEntry<E>) {
        self.entries.insert(op_type, entry);
    }

    pub fn has(&self, op_type: OpType) -> bool {
        self.entries.contains_key(&op_type)
    }

    pub fn get(&self, op_type: OpType) -> Result<&EmitterEntry<E>> {
        self.entries
            .get(&op_type)
            .ok_or(SnippetsError::UnregisteredEmitter { op_type })
    }

    pub fn op_types(&self) -> impl Iterator<Item = OpType> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E: ?Sized> Default for EmitterRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ?Sized> Clone for EmitterRegistry<E> {
    fn clone(&self) -> Self {
        Self { entries: self.entries.clone() }
    }
}

/// Everything emission needs besides the IR itself.
pub struct EmissionContext<'a> {
    pub runtime_args: &'a RuntimeArgsLayout,
    pub executors: &'a KernelExecutorTable,
    pub kernel_name: &'a str,
}

/// ISA queries and code emission for one target.
pub trait TargetMachine: Send + Sync {
    fn isa(&self) -> Isa;

    /// Whether the host can run code produced by this target.
    fn is_supported(&self) -> bool;

    fn get_lanes(&self) -> usize {
        self.isa().lanes()
    }

    /// Registers carrying the kernel entry point arguments.
    fn get_abi_arg_regs(&self) -> Vec<Reg>;
    fn get_gp_reg_pool(&self) -> Vec<Reg>;
    fn get_vec_reg_pool(&self) -> Vec<Reg>;

    fn has(&self, op_type: OpType) -> bool;

    /// Input precision combinations accepted for `expr`; fails for unregistered types.
    fn get_supported_precisions(&self, expr: &Expression) -> Result<Vec<Vec<ElementType>>>;

    /// Emit a fully lowered and register-assigned IR.
    fn get_snippet(&self, ir: &LinearIR, ctx: &EmissionContext<'_>) -> Result<Arc<dyn CompiledSnippet>>;

    /// Independent copy with the same ISA and registry.
    fn clone_box(&self) -> Box<dyn TargetMachine>;
}

impl Clone for Box<dyn TargetMachine> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isa_geometry() {
        assert_eq!(Isa::Sse41.lanes(), 4);
        assert_eq!(Isa::Avx512.vec_bytes(), 64);
        assert_eq!(Isa::from_name("AVX2"), Some(Isa::Avx2));
        assert_eq!(Isa::from_name("neon"), None);
    }

    #[test]
    fn test_call_args_layout() {
        assert_eq!(std::mem::offset_of!(KernelCallArgs, io_ptrs) as i64, KernelCallArgs::IO_PTRS_OFFSET);
        assert_eq!(std::mem::offset_of!(KernelCallArgs, scratchpad) as i64, KernelCallArgs::SCRATCHPAD_OFFSET);
        assert_eq!(std::mem::offset_of!(KernelCallArgs, runtime_args) as i64, KernelCallArgs::RUNTIME_ARGS_OFFSET);
    }

    #[test]
    fn test_registry_lookup_requires_registration() {
        #[derive(Debug)]
        struct Nop;

        fn factory(_: &Expression) -> Result<Box<Nop>> {
            Ok(Box::new(Nop))
        }
        fn precisions(_: &Expression) -> Vec<Vec<ElementType>> {
            vec![vec![ElementType::F32]]
        }

        let mut registry: EmitterRegistry<Nop> = EmitterRegistry::new();
        registry.register(OpType::Load, EmitterEntry { factory, supported_precisions: precisions });
        assert!(registry.has(OpType::Load));
        assert!(registry.get(OpType::Load).is_ok());
        assert!(matches!(
            registry.get(OpType::Store),
            Err(SnippetsError::UnregisteredEmitter { op_type: OpType::Store })
        ));
    }
}
