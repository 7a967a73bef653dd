// This module holds the kernel executors: runtime objects owned by expressions such as Brgemm
// that compile their own specialized kernel from a configuration instead of being emitted
// inline. A configuration captures everything that affects the generated kernel; two equal
// configurations always map to the same compiled kernel, which is shared through the
// process-wide KernelCache. Executors keep a weak handle on the cache and compile directly
// if the cache has been dropped. An empty configuration (a zero-sized problem) has no kernel,
// which is different from a configuration that failed to compile.
//
// KernelExecutor is generic over a KernelCompiler; KernelExecutorBase erases the type so the
// KernelExecutorTable can update every executor of a subgraph from resolved port shapes and
// snapshot or restore their configurations around speculative updates.

//! Configuration-keyed kernel executors.

pub mod brgemm;
pub mod brgemm_copy_b;
pub mod cache;

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::RwLock;

use crate::core::{Result, SnippetsError};
use crate::lowered::{ExprId, PortDescriptor};

pub use cache::KernelCache;

/// Immutable snapshot of every parameter that affects a compiled kernel.
pub trait GenericConfig: fmt::Debug + Clone + PartialEq + Send + Sync + 'static {
    /// All dimensions are known.
    fn is_completed(&self) -> bool;
    /// The problem is empty and needs no kernel.
    fn is_empty(&self) -> bool;
    fn hash(&self) -> u64;
}

/// Seeded hash of a configuration field, chained through `seed`.
pub(crate) fn hash_combine<T: Hash + ?Sized>(seed: u64, value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Pure compilation of kernels from configurations.
pub trait KernelCompiler: Send + Sync + 'static {
    type Config: GenericConfig;
    type Kernel: Send + Sync + 'static;

    fn compile_kernel(&self, config: &Self::Config) -> Result<Self::Kernel>;

    /// Refresh the dynamic part of `config` from resolved port descriptors.
    fn update_config(
        &self,
        inputs: &[PortDescriptor],
        outputs: &[PortDescriptor],
        config: &mut Self::Config,
    ) -> Result<()>;
}

/// Type-erased executor interface used by the executor table.
pub trait KernelExecutorBase: Send + Sync {
    fn update_by_descs(&self, inputs: &[PortDescriptor], outputs: &[PortDescriptor]) -> Result<()>;
    /// Copy of the current configuration.
    fn snapshot(&self) -> Box<dyn Any + Send + Sync>;
    fn restore(&self, state: &(dyn Any + Send + Sync)) -> Result<()>;
    fn has_kernel(&self) -> bool;
    fn describe(&self) -> String;
}

/// Executor owning one configuration and the kernel compiled for it.
pub struct KernelExecutor<C: KernelCompiler> {
    compiler: C,
    config: RwLock<C::Config>,
    kernel: RwLock<Option<Arc<C::Kernel>>>,
    cache: Weak<KernelCache>,
}

impl<C: KernelCompiler> KernelExecutor<C> {
    pub fn new(compiler: C, config: C::Config, cache: &Arc<KernelCache>) -> Result<Self> {
        let executor = Self {
            compiler,
            config: RwLock::new(config.clone()),
            kernel: RwLock::new(None),
            cache: Arc::downgrade(cache),
        };
        if config.is_completed() {
            executor.set_config(config)?;
        }
        Ok(executor)
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn config(&self) -> C::Config {
        self.config.read().clone()
    }

    /// Compiled kernel; `None` for empty configurations and for configurations
    /// waiting for their dynamic dimensions.
    pub fn kernel(&self) -> Option<Arc<C::Kernel>> {
        self.kernel.read().clone()
    }

    pub fn set_config(&self, config: C::Config) -> Result<()> {
        let kernel = if config.is_empty() || !config.is_completed() {
            None
        } else {
            let compiled = match self.cache.upgrade() {
                Some(cache) => cache.get_or_compile(&config, |c| self.compiler.compile_kernel(c))?,
                None => Arc::new(self.compiler.compile_kernel(&config)?),
            };
            Some(compiled)
        };
        trace!("executor config updated: {config:?}");
        *self.config.write() = config;
        *self.kernel.write() = kernel;
        Ok(())
    }
}

impl<C: KernelCompiler> KernelExecutorBase for KernelExecutor<C> {
    fn update_by_descs(&self, inputs: &[PortDescriptor], outputs: &[PortDescriptor]) -> Result<()> {
        let mut config = self.config();
        self.compiler.update_config(inputs, outputs, &mut config)?;
        if config == self.config() && (self.kernel.read().is_some() || config.is_empty()) {
            return Ok(());
        }
        self.set_config(config)
    }

    fn snapshot(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.config())
    }

    fn restore(&self, state: &(dyn Any + Send + Sync)) -> Result<()> {
        let config = state
            .downcast_ref::<C::Config>()
            .ok_or_else(|| SnippetsError::structure("executor state of a different config type"))?;
        self.set_config(config.clone())
    }

    fn has_kernel(&self) -> bool {
        self.kernel.read().is_some()
    }

    fn describe(&self) -> String {
        format!("{:?}", self.config.read())
    }
}

/// Saved configurations of every executor of a table.
pub struct TableState(Vec<(ExprId, Box<dyn Any + Send + Sync>)>);

/// Executors of one subgraph keyed by the expression that owns them.
#[derive(Default, Clone)]
pub struct KernelExecutorTable {
    entries: Vec<(ExprId, Arc<dyn KernelExecutorBase>)>,
}

impl KernelExecutorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, expr: ExprId, executor: Arc<dyn KernelExecutorBase>) {
        self.entries.retain(|(id, _)| *id != expr);
        self.entries.push((expr, executor));
    }

    pub fn get(&self, expr: ExprId) -> Option<&Arc<dyn KernelExecutorBase>> {
        self.entries.iter().find(|(id, _)| *id == expr).map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ExprId, Arc<dyn KernelExecutorBase>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Update every executor from the resolved descriptors of its expression.
    pub fn update_state(
        &self,
        mut descs: impl FnMut(ExprId) -> Result<(Vec<PortDescriptor>, Vec<PortDescriptor>)>,
    ) -> Result<()> {
        for (expr, executor) in &self.entries {
            let (inputs, outputs) = descs(*expr)?;
            executor.update_by_descs(&inputs, &outputs)?;
        }
        Ok(())
    }

    pub fn get_state(&self) -> TableState {
        TableState(self.entries.iter().map(|(id, e)| (*id, e.snapshot())).collect())
    }

    pub fn reset_state(&self, state: &TableState) -> Result<()> {
        for (id, config) in &state.0 {
            let executor = self
                .get(*id)
                .ok_or_else(|| SnippetsError::structure(format!("no executor registered for {id}")))?;
            executor.restore(config.as_ref())?;
        }
        Ok(())
    }
}

impl fmt::Debug for KernelExecutorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(id, e)| (id, e.describe())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ElementType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct SizeConfig(usize);

    impl GenericConfig for SizeConfig {
        fn is_completed(&self) -> bool {
            !crate::core::dims::is_dynamic_value(self.0)
        }
        fn is_empty(&self) -> bool {
            self.0 == 0
        }
        fn hash(&self) -> u64 {
            self.0 as u64
        }
    }

    struct SizeCompiler(Arc<AtomicUsize>);

    impl KernelCompiler for SizeCompiler {
        type Config = SizeConfig;
        type Kernel = usize;

        fn compile_kernel(&self, config: &SizeConfig) -> Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(config.0 * 2)
        }

        fn update_config(&self, inputs: &[PortDescriptor], _: &[PortDescriptor], config: &mut SizeConfig) -> Result<()> {
            config.0 = inputs[0].shape.iter().product();
            Ok(())
        }
    }

    #[test]
    fn test_empty_config_has_no_kernel() {
        let cache = Arc::new(KernelCache::new(8));
        let compiles = Arc::new(AtomicUsize::new(0));
        let executor = KernelExecutor::new(SizeCompiler(compiles.clone()), SizeConfig(0), &cache).unwrap();
        assert!(executor.kernel().is_none());
        assert_eq!(compiles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_table_update_and_restore() {
        let cache = Arc::new(KernelCache::new(8));
        let compiles = Arc::new(AtomicUsize::new(0));
        let executor: Arc<dyn KernelExecutorBase> = Arc::new(
            KernelExecutor::new(SizeCompiler(compiles.clone()), SizeConfig(crate::core::DYNAMIC_DIMENSION), &cache).unwrap(),
        );
        let expr = ExprId { index: 3, generation: 0 };
        let mut table = KernelExecutorTable::new();
        table.register(expr, executor.clone());

        let saved = table.get_state();
        table
            .update_state(|_| Ok((vec![PortDescriptor::new(vec![4, 4], ElementType::F32)], vec![])))
            .unwrap();
        assert!(executor.has_kernel());
        assert_eq!(compiles.load(Ordering::SeqCst), 1);

        table.reset_state(&saved).unwrap();
        assert!(!executor.has_kernel());
        assert_eq!(compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_executor_without_cache_compiles_directly() {
        let cache = Arc::new(KernelCache::new(8));
        let compiles = Arc::new(AtomicUsize::new(0));
        let executor = KernelExecutor::new(SizeCompiler(compiles.clone()), SizeConfig(1), &cache).unwrap();
        drop(cache);
        executor.set_config(SizeConfig(5)).unwrap();
        assert_eq!(executor.kernel().as_deref(), Some(&10));
        assert_eq!(compiles.load(Ordering::SeqCst), 2);
    }
}
