// A Snippet is one tokenized subgraph compiled for one target. Compilation lowers the
// subgraph body for the given input shapes, runs the generator and initializes a runtime
// configurator; the result is cached in the process-wide kernel cache keyed by the body's
// structure, the input shapes and element types, the target ISA and the lowering config,
// so equal subgraphs share one kernel. The runtime state (linear IR, configurator, executor
// table) belongs to the cached kernel because the emitted code references its executors.
//
// Execution first updates the runtime configuration under the state's write lock, then
// downgrades to a read lock and dispatches one kernel call per work unit of the parallel
// domain on the rayon pool. Each worker owns a scratchpad and builds its own argument
// block, so concurrent calls never share mutable memory except the disjoint output tiles.

//! Compiled subgraphs and their parallel execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::{RwLock, RwLockWriteGuard};
use rayon::prelude::*;

use crate::core::dims::{format_dims, is_dynamic_shape, volume};
use crate::core::{CompilationSession, ElementType, Result, SnippetsError, VectorDims};
use crate::generator::{Generator, LoweringResult};
use crate::graph::{lower_subgraph, Model, NodeOp};
use crate::kernel_executor::{hash_combine, GenericConfig, KernelCache};
use crate::lowered::{Config, LinearIR};
use crate::runtime::{RuntimeConfig, RuntimeConfigurator};
use crate::target_machine::{CompiledSnippet, Isa, KernelCallArgs, KernelFn, TargetMachine};

/// Cache key of a compiled subgraph.
#[derive(Debug, Clone, PartialEq)]
pub struct SnippetKernelConfig {
    /// Structural fingerprint of the body: ops, wiring, shapes and types.
    signature: String,
    input_shapes: Vec<VectorDims>,
    isa: Isa,
    config: Config,
}

impl SnippetKernelConfig {
    pub fn new(body: &Model, input_shapes: &[VectorDims], isa: Isa, config: Config) -> Self {
        let mut signature = String::new();
        for (id, node) in body.iter() {
            let op = match &node.op {
                NodeOp::Subgraph(_) => "Subgraph".to_string(),
                op => format!("{op:?}"),
            };
            signature.push_str(&format!("{}:{op}{:?}{:?};", id.index(), node.inputs, node.outputs));
        }
        Self { signature, input_shapes: input_shapes.to_vec(), isa, config }
    }
}

impl GenericConfig for SnippetKernelConfig {
    fn is_completed(&self) -> bool {
        !self.input_shapes.iter().any(|s| is_dynamic_shape(s))
    }

    fn is_empty(&self) -> bool {
        self.input_shapes.iter().any(|s| s.contains(&0))
    }

    fn hash(&self) -> u64 {
        let mut seed = hash_combine(0, &self.signature);
        seed = hash_combine(seed, &self.input_shapes);
        seed = hash_combine(seed, &self.isa);
        let c = &self.config;
        for value in [c.vector_size, c.loop_depth, c.concurrency] {
            seed = hash_combine(seed, &value);
        }
        hash_combine(seed, &(c.is_dynamic, c.enable_domain_optimization))
    }
}

struct RuntimeState {
    ir: LinearIR,
    configurator: RuntimeConfigurator,
}

/// Kernel and runtime state shared by every Snippet with an equal configuration.
pub struct CompiledKernel {
    name: String,
    code: Arc<dyn CompiledSnippet>,
    target: Box<dyn TargetMachine>,
    dynamic: bool,
    state: RwLock<RuntimeState>,
}

impl std::fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("name", &self.name)
            .field("isa", &self.target.isa())
            .field("code_size", &self.code.get_code_size())
            .field("dynamic", &self.dynamic)
            .finish()
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    /// The cancel flag was raised; some work units were skipped.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Snippet {
    kernel: Arc<CompiledKernel>,
}

impl Snippet {
    /// Compile `body` for `input_shapes` (dynamic dimensions allowed) on `target`.
    pub fn compile(
        name: &str,
        body: &Model,
        input_shapes: &[VectorDims],
        target: Box<dyn TargetMachine>,
        config: Config,
        cache: &Arc<KernelCache>,
        session: &CompilationSession,
    ) -> Result<Self> {
        let key = SnippetKernelConfig::new(body, input_shapes, target.isa(), config.clone());
        if key.is_empty() {
            return Err(SnippetsError::unsupported_config(format!("{name}: empty input tensor")));
        }
        // The cache folds failures into UnsupportedConfig; the caller that lowered
        // gets the original error back.
        let mut lowering_error = None;
        let compiled = cache.get_or_compile(&key, |_| {
            let mut ir = match lower_subgraph(body, input_shapes, config) {
                Ok(ir) => ir,
                Err(err) => {
                    let reason = err.to_string();
                    lowering_error = Some(err);
                    return Err(SnippetsError::unsupported_config(reason));
                }
            };
            let generator = Generator::new(target.clone(), cache.clone());
            let LoweringResult { compiled_snippet, runtime_args, executors, .. } =
                generator.generate(&mut ir, session, name)?;
            let mut configurator = RuntimeConfigurator::new();
            configurator.initialize(&mut ir, runtime_args, executors)?;
            Ok(CompiledKernel {
                name: name.to_string(),
                code: compiled_snippet,
                target,
                dynamic: ir.is_dynamic(),
                state: RwLock::new(RuntimeState { ir, configurator }),
            })
        });
        let kernel = match compiled {
            Ok(kernel) => kernel,
            Err(err) => return Err(lowering_error.unwrap_or(err)),
        };
        debug!("{name}: kernel {:?}", kernel);
        Ok(Self { kernel })
    }

    pub fn name(&self) -> &str {
        &self.kernel.name
    }

    pub fn is_dynamic(&self) -> bool {
        self.kernel.dynamic
    }

    pub fn compiled_snippet(&self) -> &Arc<dyn CompiledSnippet> {
        &self.kernel.code
    }

    /// Shapes the kernel was compiled for, parameters then results.
    pub fn compiled_shapes(&self) -> Vec<VectorDims> {
        self.kernel.state.read().configurator.compiled_shapes().to_vec()
    }

    /// Element types of the parameters followed by the results.
    pub fn io_types(&self) -> Vec<ElementType> {
        self.kernel.state.read().configurator.io_types().to_vec()
    }

    /// Runtime configuration for `io_shapes` without executing.
    pub fn configure(&self, io_shapes: &[VectorDims]) -> Result<RuntimeConfig> {
        let mut guard = self.kernel.state.write();
        let RuntimeState { ir, configurator } = &mut *guard;
        configurator.update(ir, io_shapes).cloned()
    }

    /// Run on tensors of the compiled (static) shapes.
    pub fn execute_static(&self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<ExecutionStatus> {
        let shapes = self.compiled_shapes();
        self.execute(inputs, outputs, &shapes, None)
    }

    /// Run the kernel over the whole parallel domain. `io_shapes` lists the parameter shapes
    /// followed by the result shapes. Raising `cancel` stops dispatching further work units.
    pub fn execute(
        &self,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
        io_shapes: &[VectorDims],
        cancel: Option<&AtomicBool>,
    ) -> Result<ExecutionStatus> {
        let kernel = &self.kernel;
        if !kernel.target.is_supported() {
            return Err(SnippetsError::unsupported_config(format!(
                "{}: host cannot run {} code",
                kernel.name,
                kernel.target.isa()
            )));
        }
        let mut guard = kernel.state.write();
        {
            let RuntimeState { ir, configurator } = &mut *guard;
            configurator.update(ir, io_shapes)?;
        }
        let guard = RwLockWriteGuard::downgrade(guard);
        let configurator = &guard.configurator;
        let config = configurator.config();

        let params = configurator.param_count();
        let types = configurator.io_types();
        if inputs.len() != params || inputs.len() + outputs.len() != types.len() {
            return Err(SnippetsError::structure(format!(
                "{}: expected {params} inputs and {} outputs, got {} and {}",
                kernel.name,
                types.len() - params,
                inputs.len(),
                outputs.len()
            )));
        }
        let sizes = io_shapes.iter().zip(types);
        let lens = inputs.iter().map(|b| b.len()).chain(outputs.iter().map(|b| b.len()));
        for (io, ((shape, et), len)) in sizes.zip(lens).enumerate() {
            let needed = volume(shape).unwrap_or(0) * et.size();
            if len < needed {
                return Err(SnippetsError::structure(format!(
                    "{}: io {io} of shape {} needs {needed} bytes, got {len}",
                    kernel.name,
                    format_dims(shape)
                )));
            }
        }

        // Raw addresses cross the rayon boundary as integers.
        let bases: Vec<usize> = inputs
            .iter()
            .map(|b| b.as_ptr() as usize)
            .chain(outputs.iter_mut().map(|b| b.as_mut_ptr() as usize))
            .collect();
        let entry = kernel.code.get_code() as usize;
        if entry == 0 {
            return Err(SnippetsError::Jit { reason: format!("{} has no executable code", kernel.name) });
        }
        let runtime_args = if config.loop_args.is_empty() { 0 } else { config.loop_args.as_ptr() as usize };
        let work = config.work_amount();
        let scratchpad = config.buffer_scratchpad_size;
        let cancelled = AtomicBool::new(false);
        trace!("{}: {work} work units, {scratchpad} scratchpad bytes", kernel.name);

        (0..work).into_par_iter().for_each_init(
            || vec![0u8; scratchpad.max(1)],
            |scratch, unit| {
                if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                    cancelled.store(true, Ordering::Relaxed);
                    return;
                }
                let coords = config.domain_coords(unit);
                let io_ptrs: Vec<*mut u8> = bases
                    .iter()
                    .enumerate()
                    .map(|(io, &base)| (base + config.io_offset(io, &coords)) as *mut u8)
                    .collect();
                let args = KernelCallArgs {
                    io_ptrs: io_ptrs.as_ptr(),
                    scratchpad: scratch.as_mut_ptr(),
                    runtime_args: runtime_args as *const i64,
                };
                // SAFETY: `entry` is the start of the mapped kernel, which follows the
                // KernelCallArgs ABI. The io buffers were checked to cover the shapes the
                // configuration was derived from, and work units write disjoint tiles.
                unsafe {
                    let f: KernelFn = std::mem::transmute::<usize, KernelFn>(entry);
                    f(&args);
                }
            },
        );
        if cancelled.load(Ordering::Relaxed) {
            info!("{}: execution cancelled", kernel.name);
            return Ok(ExecutionStatus::Cancelled);
        }
        Ok(ExecutionStatus::Completed)
    }
}

/// Reinterpret an f32 slice as bytes.
pub fn as_bytes(data: &[f32]) -> &[u8] {
    // SAFETY: f32 has no padding and u8 has alignment 1.
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), std::mem::size_of_val(data)) }
}

pub fn as_bytes_mut(data: &mut [f32]) -> &mut [u8] {
    // SAFETY: every byte pattern is a valid f32.
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr().cast::<u8>(), std::mem::size_of_val(data)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::EltwiseKind;
    use crate::x64::X64TargetMachine;

    fn add_relu(shape: VectorDims) -> Model {
        let mut body = Model::new();
        let a = body.parameter(shape.clone(), ElementType::F32);
        let b = body.parameter(shape, ElementType::F32);
        let add = body.add(NodeOp::Eltwise(EltwiseKind::Add), &[a, b]).unwrap();
        let relu = body.add(NodeOp::Eltwise(EltwiseKind::Relu), &[add]).unwrap();
        body.result(relu).unwrap();
        body
    }

    fn compile(body: &Model, shapes: &[VectorDims], cache: &Arc<KernelCache>) -> Result<Snippet> {
        let target = Box::new(X64TargetMachine::new(Isa::Avx2));
        Snippet::compile("add_relu", body, shapes, target, Config::default(), cache, &CompilationSession::new())
    }

    #[test]
    fn test_equal_configs_share_code() {
        let cache = Arc::new(KernelCache::new(8));
        let shape = vec![2, 20];
        let first = compile(&add_relu(shape.clone()), &[shape.clone(), shape.clone()], &cache).unwrap();
        let second = compile(&add_relu(shape.clone()), &[shape.clone(), shape.clone()], &cache).unwrap();
        assert!(Arc::ptr_eq(first.compiled_snippet(), second.compiled_snippet()));

        let other = vec![3, 20];
        let third = compile(&add_relu(other.clone()), &[other.clone(), other], &cache).unwrap();
        assert!(!Arc::ptr_eq(first.compiled_snippet(), third.compiled_snippet()));
        assert_eq!(first.compiled_shapes(), vec![vec![2, 20]; 3]);
    }

    #[test]
    fn test_key_distinguishes_isa_and_shapes() {
        let body = add_relu(vec![4, 8]);
        let shapes = vec![vec![4, 8], vec![4, 8]];
        let avx2 = SnippetKernelConfig::new(&body, &shapes, Isa::Avx2, Config::default());
        let sse = SnippetKernelConfig::new(&body, &shapes, Isa::Sse41, Config::default());
        assert_ne!(avx2, sse);
        assert_eq!(avx2, SnippetKernelConfig::new(&add_relu(vec![4, 8]), &shapes, Isa::Avx2, Config::default()));
        assert!(avx2.is_completed());
        let empty = SnippetKernelConfig::new(&body, &[vec![0, 8], vec![4, 8]], Isa::Avx2, Config::default());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_lowering_errors_keep_their_kind() {
        let mut body = Model::new();
        let x = body.parameter(vec![4, 8], ElementType::F32);
        let y = body.reshape(x, vec![8, 4]).unwrap();
        body.result(y).unwrap();
        let err = compile(&body, &[vec![4, 8]], &Arc::new(KernelCache::new(4))).unwrap_err();
        assert!(matches!(err, SnippetsError::UnsupportedOp { .. }));
    }

    #[test]
    fn test_cache_hit_skips_lowering() {
        let cache = Arc::new(KernelCache::new(4));
        let shape = vec![2, 20];
        compile(&add_relu(shape.clone()), &[shape.clone(), shape.clone()], &cache).unwrap();
        compile(&add_relu(shape.clone()), &[shape.clone(), shape], &cache).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.compiled, stats.hits), (1, 1));

        // A remembered lowering failure is answered from the cache as well.
        let mut body = Model::new();
        let x = body.parameter(vec![4, 8], ElementType::F32);
        let y = body.reshape(x, vec![8, 4]).unwrap();
        body.result(y).unwrap();
        let first = compile(&body, &[vec![4, 8]], &cache).unwrap_err();
        assert!(matches!(first, SnippetsError::UnsupportedOp { .. }));
        let second = compile(&body, &[vec![4, 8]], &cache).unwrap_err();
        assert!(matches!(second, SnippetsError::UnsupportedConfig { .. }));
        assert_eq!(cache.stats().compiled, 2);
    }

    #[test]
    fn test_wrong_buffer_sizes_are_rejected() {
        if !Isa::Avx2.is_supported_by_host() {
            return;
        }
        let shape = vec![2, 20];
        let snippet = compile(&add_relu(shape.clone()), &[shape.clone(), shape], &Arc::new(KernelCache::new(4))).unwrap();
        let a = vec![1.0f32; 40];
        let short = vec![1.0f32; 10];
        let mut out = vec![0.0f32; 40];
        let err = snippet
            .execute_static(&[as_bytes(&a), as_bytes(&short)], &mut [as_bytes_mut(&mut out)])
            .unwrap_err();
        assert!(matches!(err, SnippetsError::Structure { .. }));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_static_execution_matches_reference() {
        if !Isa::Avx2.is_supported_by_host() {
            return;
        }
        let shape = vec![3, 21];
        let snippet = compile(&add_relu(shape.clone()), &[shape.clone(), shape], &Arc::new(KernelCache::new(4))).unwrap();
        let a: Vec<f32> = (0..63).map(|i| i as f32 - 30.0).collect();
        let b: Vec<f32> = (0..63).map(|i| (i % 7) as f32 * 0.5).collect();
        let mut out = vec![0.0f32; 63];
        let status = snippet
            .execute_static(&[as_bytes(&a), as_bytes(&b)], &mut [as_bytes_mut(&mut out)])
            .unwrap();
        assert_eq!(status, ExecutionStatus::Completed);
        for i in 0..63 {
            assert_eq!(out[i], (a[i] + b[i]).max(0.0), "element {i}");
        }
    }

    #[test]
    fn test_cancel_flag_skips_work() {
        if !Isa::Avx2.is_supported_by_host() {
            return;
        }
        let shape = vec![4, 8];
        let snippet = compile(&add_relu(shape.clone()), &[shape.clone(), shape], &Arc::new(KernelCache::new(4))).unwrap();
        let a = vec![1.0f32; 32];
        let mut out = vec![0.0f32; 32];
        let cancel = AtomicBool::new(true);
        let shapes = snippet.compiled_shapes();
        let status = snippet
            .execute(&[as_bytes(&a), as_bytes(&a)], &mut [as_bytes_mut(&mut out)], &shapes, Some(&cancel))
            .unwrap();
        assert_eq!(status, ExecutionStatus::Cancelled);
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
