// This module implements the weights repacking executor used in front of low-precision brgemm.
// Matrix B is copied into blocks of N_BLOCK columns; inside a block, rows are grouped by the
// VNNI factor of the element type so that consecutive bytes hold the K values one dot-product
// instruction consumes. K and N are padded with zeros up to the group and block sizes. For
// signed int8 sources the kernel also appends one i32 compensation term per column, equal to
// -128 times the column sum, which lets the brgemm kernel shift signed activations into the
// unsigned range and correct the result afterwards.

//! Repacking of brgemm weights.

use std::sync::Arc;

use log::trace;

use crate::core::dims::is_dynamic_value;
use crate::core::{ElementType, Result, SnippetsError, DYNAMIC_DIMENSION};
use crate::lowered::PortDescriptor;

use super::{hash_combine, GenericConfig, KernelCompiler, KernelExecutor};

/// Columns per repacked block.
pub const N_BLOCK: usize = 16;

/// K values packed together for one dot-product lane.
pub fn vnni_factor(et: ElementType) -> usize {
    match et {
        ElementType::I8 | ElementType::U8 => 4,
        ElementType::Bf16 | ElementType::F16 => 2,
        _ => 1,
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Bytes of repacked weights for a `k x n` matrix, compensations excluded.
pub fn repacked_size(k: usize, n: usize, et: ElementType) -> usize {
    round_up(k, vnni_factor(et)) * round_up(n, N_BLOCK) * et.size()
}

/// Element index of `B[k_idx][n_idx]` inside the repacked block layout.
pub fn repacked_index(k_idx: usize, n_idx: usize, k: usize, et: ElementType) -> usize {
    let vnni = vnni_factor(et);
    let padded_k = round_up(k, vnni);
    (n_idx / N_BLOCK) * padded_k * N_BLOCK + (k_idx / vnni) * N_BLOCK * vnni + (n_idx % N_BLOCK) * vnni + k_idx % vnni
}

#[derive(Debug, PartialEq, Eq)]
pub struct CopyBStaticParams {
    pub src_type: ElementType,
    pub wei_type: ElementType,
    pub with_compensations: bool,
    hash: u64,
}

impl CopyBStaticParams {
    pub fn new(src_type: ElementType, wei_type: ElementType, with_compensations: bool) -> Arc<Self> {
        let hash = hash_combine(hash_combine(hash_combine(0, &src_type), &wei_type), &with_compensations);
        Arc::new(Self { src_type, wei_type, with_compensations, hash })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrgemmCopyBConfig {
    pub static_params: Arc<CopyBStaticParams>,
    pub k: usize,
    pub n: usize,
    /// Element strides of the source rows and columns.
    pub stride_k: usize,
    pub stride_n: usize,
}

impl BrgemmCopyBConfig {
    pub fn new(static_params: Arc<CopyBStaticParams>) -> Self {
        Self {
            static_params,
            k: DYNAMIC_DIMENSION,
            n: DYNAMIC_DIMENSION,
            stride_k: 0,
            stride_n: 0,
        }
    }
}

impl GenericConfig for BrgemmCopyBConfig {
    fn is_completed(&self) -> bool {
        !is_dynamic_value(self.k) && !is_dynamic_value(self.n)
    }

    fn is_empty(&self) -> bool {
        self.k == 0 || self.n == 0
    }

    fn hash(&self) -> u64 {
        [self.k, self.n, self.stride_k, self.stride_n]
            .iter()
            .fold(self.static_params.hash, hash_combine)
    }
}

/// Compiled repacking routine for one configuration.
#[derive(Debug)]
pub struct BrgemmCopyBKernel {
    config: BrgemmCopyBConfig,
}

impl BrgemmCopyBKernel {
    /// Bytes written to the destination, compensations included.
    pub fn output_size(&self) -> usize {
        let c = &self.config;
        let comp = if c.static_params.with_compensations { c.n * ElementType::I32.size() } else { 0 };
        repacked_size(c.k, c.n, c.static_params.wei_type) + comp
    }

    /// Repack `src` into `dst`.
    ///
    /// # Safety
    /// `src` must cover the source matrix under the configured strides and `dst` must
    /// hold [`Self::output_size`] bytes.
    pub unsafe fn execute(&self, src: *const u8, dst: *mut u8) {
        let c = &self.config;
        let et = c.static_params.wei_type;
        let size = et.size();
        let packed = repacked_size(c.k, c.n, et);
        std::ptr::write_bytes(dst, 0, packed);
        for k_idx in 0..c.k {
            for n_idx in 0..c.n {
                let from = src.add((k_idx * c.stride_k + n_idx * c.stride_n) * size);
                let to = dst.add(repacked_index(k_idx, n_idx, c.k, et) * size);
                std::ptr::copy_nonoverlapping(from, to, size);
            }
        }
        if c.static_params.with_compensations {
            let comp = dst.add(packed) as *mut i32;
            for n_idx in 0..c.n {
                let sum: i32 = (0..c.k)
                    .map(|k_idx| *(src.add(k_idx * c.stride_k + n_idx * c.stride_n) as *const i8) as i32)
                    .sum();
                comp.add(n_idx).write_unaligned(-128 * sum);
            }
        }
    }
}

pub struct BrgemmCopyBCompiler;

impl KernelCompiler for BrgemmCopyBCompiler {
    type Config = BrgemmCopyBConfig;
    type Kernel = BrgemmCopyBKernel;

    fn compile_kernel(&self, config: &BrgemmCopyBConfig) -> Result<BrgemmCopyBKernel> {
        let params = &config.static_params;
        if params.with_compensations && params.wei_type != ElementType::I8 {
            return Err(SnippetsError::unsupported_config(format!(
                "compensations need i8 weights, got {}",
                params.wei_type
            )));
        }
        trace!("repacking kernel {}x{} {}", config.k, config.n, params.wei_type);
        Ok(BrgemmCopyBKernel { config: config.clone() })
    }

    fn update_config(&self, inputs: &[PortDescriptor], _outputs: &[PortDescriptor], config: &mut BrgemmCopyBConfig) -> Result<()> {
        let src = inputs
            .first()
            .ok_or_else(|| SnippetsError::structure("BrgemmCopyB without an input descriptor"))?;
        let rank = src.rank();
        if rank < 2 {
            return Err(SnippetsError::shape_update(format!("weights of rank {rank}")));
        }
        config.k = src.shape[rank - 2];
        config.n = src.shape[rank - 1];
        if config.is_completed() && !crate::core::dims::is_dynamic_shape(&src.shape) {
            let strides = src.planar_strides(&src.shape);
            config.stride_k = strides[rank - 2];
            config.stride_n = strides[rank - 1];
        } else {
            config.stride_k = 0;
            config.stride_n = 0;
        }
        Ok(())
    }
}

pub type BrgemmCopyBExecutor = KernelExecutor<BrgemmCopyBCompiler>;

/// Entry point called from emitted code.
///
/// # Safety
/// `executor` must point to a live executor and the buffers must match its configuration.
pub unsafe extern "C" fn brgemm_copy_b_call(executor: *const BrgemmCopyBExecutor, src: *const u8, dst: *mut u8) {
    if let Some(kernel) = executor.as_ref().and_then(|e| e.kernel()) {
        kernel.execute(src, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_executor::KernelCache;

    fn executor(k: usize, n: usize, wei: ElementType, comp: bool) -> BrgemmCopyBExecutor {
        let cache = Arc::new(KernelCache::new(4));
        let src = if comp { ElementType::I8 } else { ElementType::U8 };
        let executor = KernelExecutor::new(
            BrgemmCopyBCompiler,
            BrgemmCopyBConfig::new(CopyBStaticParams::new(src, wei, comp)),
            &cache,
        )
        .unwrap();
        let desc = PortDescriptor::new(vec![1, k, n], wei);
        crate::kernel_executor::KernelExecutorBase::update_by_descs(&executor, &[desc], &[]).unwrap();
        executor
    }

    #[test]
    fn test_repacked_geometry() {
        assert_eq!(repacked_size(5, 3, ElementType::I8), 8 * 16);
        assert_eq!(repacked_size(4, 16, ElementType::Bf16), 4 * 16 * 2);
        // Second row of the first block lives next to the first row.
        assert_eq!(repacked_index(1, 0, 8, ElementType::I8), 1);
        assert_eq!(repacked_index(0, 1, 8, ElementType::I8), 4);
        assert_eq!(repacked_index(4, 0, 8, ElementType::I8), 64);
        assert_eq!(repacked_index(0, 16, 8, ElementType::I8), 128);
    }

    #[test]
    fn test_int8_repack_with_compensations() {
        let (k, n) = (3, 2);
        let b: Vec<i8> = vec![1, -2, 3, 4, -5, 6];
        let exec = executor(k, n, ElementType::I8, true);
        let kernel = exec.kernel().unwrap();
        let mut dst = vec![0x55u8; kernel.output_size()];
        unsafe { brgemm_copy_b_call(&exec, b.as_ptr() as *const u8, dst.as_mut_ptr()) };

        for k_idx in 0..k {
            for n_idx in 0..n {
                let got = dst[repacked_index(k_idx, n_idx, k, ElementType::I8)] as i8;
                assert_eq!(got, b[k_idx * n + n_idx]);
            }
        }
        // Padding row 3 is zeroed.
        assert_eq!(dst[repacked_index(3, 0, k, ElementType::I8)], 0);
        let packed = repacked_size(k, n, ElementType::I8);
        let comp: Vec<i32> = dst[packed..]
            .chunks(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(comp, vec![-128 * (1 + 3 - 5), -128 * (-2 + 4 + 6)]);
    }

    #[test]
    fn test_dynamic_weights_have_no_kernel() {
        let exec = executor(DYNAMIC_DIMENSION, 16, ElementType::Bf16, false);
        assert!(exec.kernel().is_none());
    }
}
