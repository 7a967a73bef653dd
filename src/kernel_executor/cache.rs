//! Process-wide cache of compiled kernels keyed by configuration.
//!
//! Lookups hash the configuration and confirm hits with equality, so colliding
//! configurations never share a kernel. Concurrent requests for the same
//! configuration wait for a single compilation. Failed compilations are remembered
//! and reported as unsupported configurations without retrying.

use std::any::{Any, TypeId};
use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::core::{Result, SnippetsError};

use super::GenericConfig;

enum Slot {
    InFlight,
    Ready(Arc<dyn Any + Send + Sync>),
    Failed(SnippetsError),
}

struct Entry {
    config: Box<dyn Any + Send + Sync>,
    slot: Slot,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<(TypeId, u64), Vec<Entry>>,
    tick: u64,
    compiled: usize,
    hits: usize,
}

impl CacheState {
    fn find<C: GenericConfig>(&mut self, key: (TypeId, u64), config: &C) -> Option<&mut Entry> {
        self.entries
            .get_mut(&key)?
            .iter_mut()
            .find(|e| e.config.downcast_ref::<C>() == Some(config))
    }

    /// Entries holding a kernel or a remembered failure.
    fn settled_count(&self) -> usize {
        self.entries
            .values()
            .flatten()
            .filter(|e| !matches!(e.slot, Slot::InFlight))
            .count()
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .flat_map(|(key, list)| list.iter().enumerate().map(move |(i, e)| (*key, i, e)))
            .filter(|(_, _, e)| !matches!(e.slot, Slot::InFlight))
            .min_by_key(|(_, _, e)| e.last_used)
            .map(|(key, i, _)| (key, i));
        if let Some((key, index)) = victim {
            if let Some(list) = self.entries.get_mut(&key) {
                list.remove(index);
                if list.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

/// Settles an in-flight entry as failed if the compile closure unwinds.
struct InFlightGuard<'a, C: GenericConfig> {
    cache: &'a KernelCache,
    key: (TypeId, u64),
    config: &'a C,
    armed: bool,
}

impl<C: GenericConfig> Drop for InFlightGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let reason = format!("compilation of {:?} panicked", self.config);
            self.cache.settle(self.key, self.config, Slot::Failed(SnippetsError::unsupported_config(reason)));
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub compiled: usize,
    pub hits: usize,
}

pub struct KernelCache {
    state: Mutex<CacheState>,
    ready: Condvar,
    capacity: usize,
}

impl KernelCache {
    /// Cache keeping at most `capacity` compiled kernels and remembered failures.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Kernel compiled for `config`, compiling it on a miss.
    pub fn get_or_compile<C, K>(&self, config: &C, compile: impl FnOnce(&C) -> Result<K>) -> Result<Arc<K>>
    where
        C: GenericConfig,
        K: Send + Sync + 'static,
    {
        let key = (TypeId::of::<C>(), config.hash());
        let mut state = self.state.lock();
        loop {
            state.tick += 1;
            let tick = state.tick;
            match state.find(key, config) {
                Some(entry) => match &entry.slot {
                    Slot::Ready(kernel) => {
                        entry.last_used = tick;
                        let kernel = kernel.clone();
                        state.hits += 1;
                        return kernel
                            .downcast::<K>()
                            .map_err(|_| SnippetsError::structure("cached kernel has a different type"));
                    }
                    Slot::Failed(err) => return Err(err.clone()),
                    Slot::InFlight => self.ready.wait(&mut state),
                },
                None => {
                    state.entries.entry(key).or_default().push(Entry {
                        config: Box::new(config.clone()),
                        slot: Slot::InFlight,
                        last_used: tick,
                    });
                    break;
                }
            }
        }
        drop(state);

        trace!("compiling kernel for {config:?}");
        let mut guard = InFlightGuard { cache: self, key, config, armed: true };
        let result = compile(config).map(Arc::new);
        guard.armed = false;

        let slot = match &result {
            Ok(kernel) => Slot::Ready(kernel.clone()),
            Err(SnippetsError::UnsupportedConfig { reason }) => Slot::Failed(SnippetsError::unsupported_config(reason.clone())),
            Err(err) => Slot::Failed(SnippetsError::unsupported_config(err.to_string())),
        };
        self.settle(key, config, slot);

        match result {
            Ok(kernel) => Ok(kernel),
            Err(err) => {
                debug!("kernel compilation failed for {config:?}: {err}");
                Err(match err {
                    SnippetsError::UnsupportedConfig { .. } => err,
                    other => SnippetsError::unsupported_config(other.to_string()),
                })
            }
        }
    }

    /// Replace the in-flight slot of `config`, enforce capacity and wake waiters.
    fn settle<C: GenericConfig>(&self, key: (TypeId, u64), config: &C, slot: Slot) {
        let mut state = self.state.lock();
        if let Some(entry) = state.find(key, config) {
            entry.slot = slot;
        }
        state.compiled += 1;
        while state.settled_count() > self.capacity {
            state.evict_lru();
        }
        self.ready.notify_all();
    }

    /// Drop kernels nobody but the cache references. Returns how many were removed.
    pub fn evict_unused(&self) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        for list in state.entries.values_mut() {
            list.retain(|e| match &e.slot {
                Slot::Ready(kernel) if Arc::strong_count(kernel) == 1 => {
                    removed += 1;
                    false
                }
                _ => true,
            });
        }
        state.entries.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.retain(|_, list| {
            list.retain(|e| matches!(e.slot, Slot::InFlight));
            !list.is_empty()
        });
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.values().map(Vec::len).sum(),
            compiled: state.compiled,
            hits: state.hits,
        }
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Cfg {
        dims: Vec<usize>,
        /// Forces hash collisions in tests.
        bucket: u64,
    }

    impl GenericConfig for Cfg {
        fn is_completed(&self) -> bool {
            true
        }
        fn is_empty(&self) -> bool {
            self.dims.is_empty()
        }
        fn hash(&self) -> u64 {
            self.bucket
        }
    }

    fn cfg(dims: &[usize]) -> Cfg {
        Cfg { dims: dims.to_vec(), bucket: 7 }
    }

    #[test]
    fn test_equal_configs_share_kernel() {
        let cache = KernelCache::new(16);
        let a = cache.get_or_compile(&cfg(&[4, 4]), |c| Ok(c.dims.iter().sum::<usize>())).unwrap();
        let b = cache.get_or_compile(&cfg(&[4, 4]), |_| Ok(0usize)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats().compiled, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_hash_collision_is_disambiguated_by_equality() {
        let cache = KernelCache::new(16);
        let a = cache.get_or_compile(&cfg(&[1, 2]), |_| Ok(1usize)).unwrap();
        let b = cache.get_or_compile(&cfg(&[2, 1]), |_| Ok(2usize)).unwrap();
        assert_eq!((*a, *b), (1, 2));
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_failure_is_memoized() {
        let cache = KernelCache::new(16);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let err = cache
                .get_or_compile(&cfg(&[3]), |_| -> Result<usize> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SnippetsError::Encoding { reason: "bad".into() })
                })
                .unwrap_err();
            assert!(matches!(err, SnippetsError::UnsupportedConfig { .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_single_flight_under_contention() {
        let cache = Arc::new(KernelCache::new(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                thread::spawn(move || {
                    cache
                        .get_or_compile(&cfg(&[8, 8]), |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(vec![0u8; 64])
                        })
                        .unwrap()
                })
            })
            .collect();
        let kernels: Vec<Arc<Vec<u8>>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(kernels.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_lru_capacity_and_unused_eviction() {
        let cache = KernelCache::new(2);
        let first = cache.get_or_compile(&cfg(&[1]), |_| Ok(1usize)).unwrap();
        let _ = cache.get_or_compile(&cfg(&[2]), |_| Ok(2usize)).unwrap();
        // Touch the first entry so the second becomes least recently used.
        let _ = cache.get_or_compile(&cfg(&[1]), |_| Ok(0usize)).unwrap();
        let third = cache.get_or_compile(&cfg(&[3]), |_| Ok(3usize)).unwrap();
        assert_eq!(cache.stats().entries, 2);
        let again = cache.get_or_compile(&cfg(&[2]), |_| Ok(22usize)).unwrap();
        assert_eq!(*again, 22);

        // Only [3] and [2] remain; [3] is still held outside the cache.
        drop(again);
        assert_eq!(cache.evict_unused(), 1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!((*first, *third), (1, 3));
    }

    #[test]
    fn test_failures_count_toward_capacity() {
        let cache = KernelCache::new(2);
        for n in 0..6 {
            let err = cache
                .get_or_compile(&cfg(&[n]), |_| -> Result<usize> { Err(SnippetsError::unsupported_config("no isa")) })
                .unwrap_err();
            assert!(matches!(err, SnippetsError::UnsupportedConfig { .. }));
        }
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_panicking_compile_releases_waiters() {
        let cache = Arc::new(KernelCache::new(4));
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let panicking = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache.get_or_compile(&cfg(&[9]), |_| -> Result<usize> {
                    started_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    panic!("emitter bug");
                })
            })
        };
        started_rx.recv().unwrap();
        let waiter = {
            let cache = cache.clone();
            thread::spawn(move || cache.get_or_compile(&cfg(&[9]), |_| Ok(1usize)))
        };
        assert!(panicking.join().is_err());
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, SnippetsError::UnsupportedConfig { .. }));
    }
}
