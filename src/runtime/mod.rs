// Runtime configuration of compiled kernels. A kernel compiled for dynamic shapes reads its
// loop work amounts, pointer increments, finalization offsets and the offsets of buffers
// sized at runtime from the runtime-args table; the configurator fills that table for the
// concrete shapes of every invocation and also derives how the outer dimensions are split
// into independent work units for the parallel executor. Static kernels get the same
// configuration once, without a table.

//! Invocation-time configuration: runtime config, configurator and optimizers.

pub mod configurator;
pub mod optimizer;

pub use configurator::{ConfiguratorState, RuntimeConfigurator};
pub use optimizer::{MHAParallelWAOptimizer, RuntimeOptimizer};

use crate::core::VectorDims;
use crate::kernel_executor::KernelExecutorTable;

/// Configuration of one kernel for one set of invocation shapes.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub tensor_rank: usize,
    pub master_shape: VectorDims,
    /// Shapes of the parameters followed by the results, as passed by the caller.
    pub io_shapes: Vec<VectorDims>,
    /// Byte offset of each io per step of each parallel-domain dimension.
    pub io_data_offsets: Vec<Vec<usize>>,
    pub parallel_domain: VectorDims,
    /// Per-thread scratchpad bytes, static and runtime-sized buffers together.
    pub buffer_scratchpad_size: usize,
    /// Scratchpad offset of every buffer register group sized at runtime.
    pub buffer_offsets: Vec<(usize, usize)>,
    /// Contents of the runtime-args table read by the kernel.
    pub loop_args: Vec<i64>,
    pub executors: KernelExecutorTable,
}

impl RuntimeConfig {
    /// Number of independent kernel calls.
    pub fn work_amount(&self) -> usize {
        self.parallel_domain.iter().product()
    }

    /// Coordinates of work unit `index` in the parallel domain, outermost first.
    pub fn domain_coords(&self, mut index: usize) -> VectorDims {
        let mut coords = vec![0; self.parallel_domain.len()];
        for (coord, &dim) in coords.iter_mut().zip(&self.parallel_domain).rev() {
            *coord = index % dim.max(1);
            index /= dim.max(1);
        }
        coords
    }

    /// Byte offset of io `io` for the work unit at `coords`.
    pub fn io_offset(&self, io: usize, coords: &[usize]) -> usize {
        self.io_data_offsets
            .get(io)
            .map_or(0, |steps| steps.iter().zip(coords).map(|(step, c)| step * c).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_coords_and_offsets() {
        let config = RuntimeConfig {
            parallel_domain: vec![2, 3],
            io_data_offsets: vec![vec![96, 32], vec![0, 4]],
            ..Default::default()
        };
        assert_eq!(config.work_amount(), 6);
        assert_eq!(config.domain_coords(0), vec![0, 0]);
        assert_eq!(config.domain_coords(4), vec![1, 1]);
        assert_eq!(config.io_offset(0, &[1, 1]), 128);
        assert_eq!(config.io_offset(1, &[1, 2]), 8);
        assert_eq!(config.io_offset(5, &[1, 2]), 0);
    }
}
