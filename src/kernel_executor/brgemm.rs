//! Batch-reduce GEMM executor.
//!
//! A brgemm expression multiplies one `[M, K]` tile of A with one `[K, N]` tile of B into
//! `[M, N]` of C per kernel call. The configuration splits into static parameters fixed at
//! lowering time (precisions, ISA, transposition) and the dimensions and strides refreshed
//! from the resolved port shapes. Low-precision weights arrive repacked by the
//! [`super::brgemm_copy_b`] executor; signed int8 activations are shifted by 128 and
//! corrected with the compensation terms stored after the repacked weights.

use std::sync::Arc;

use half::bf16;
use log::trace;

use crate::core::dims::{is_dynamic_shape, is_dynamic_value};
use crate::core::{ElementType, Result, SnippetsError, DYNAMIC_DIMENSION};
use crate::lowered::PortDescriptor;
use crate::target_machine::Isa;

use super::brgemm_copy_b::{repacked_index, repacked_size};
use super::{hash_combine, GenericConfig, KernelCompiler, KernelExecutor};

#[derive(Debug, PartialEq, Eq)]
pub struct BrgemmStaticParams {
    pub src_type: ElementType,
    pub wei_type: ElementType,
    pub isa: Isa,
    pub transposed_b: bool,
    hash: u64,
}

impl BrgemmStaticParams {
    pub fn new(src_type: ElementType, wei_type: ElementType, isa: Isa, transposed_b: bool) -> Arc<Self> {
        let hash = [src_type.name(), wei_type.name(), isa.name()]
            .iter()
            .fold(hash_combine(0, &transposed_b), hash_combine);
        Arc::new(Self { src_type, wei_type, isa, transposed_b, hash })
    }

    /// Weights are read from the repacked block layout.
    pub fn with_repacking(&self) -> bool {
        self.wei_type != ElementType::F32
    }

    pub fn with_compensations(&self) -> bool {
        self.src_type == ElementType::I8
    }

    pub fn output_type(&self) -> ElementType {
        if self.src_type.is_real() {
            ElementType::F32
        } else {
            ElementType::I32
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrgemmConfig {
    pub static_params: Arc<BrgemmStaticParams>,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// Element strides of A, B and the row stride of C.
    pub a_stride_m: usize,
    pub a_stride_k: usize,
    pub b_stride_k: usize,
    pub b_stride_n: usize,
    pub ldc: usize,
    pub beta: f32,
}

impl BrgemmConfig {
    pub fn new(static_params: Arc<BrgemmStaticParams>, beta: f32) -> Self {
        Self {
            static_params,
            m: DYNAMIC_DIMENSION,
            n: DYNAMIC_DIMENSION,
            k: DYNAMIC_DIMENSION,
            a_stride_m: 0,
            a_stride_k: 0,
            b_stride_k: 0,
            b_stride_n: 0,
            ldc: 0,
            beta,
        }
    }
}

impl GenericConfig for BrgemmConfig {
    fn is_completed(&self) -> bool {
        ![self.m, self.n, self.k].into_iter().any(is_dynamic_value)
    }

    fn is_empty(&self) -> bool {
        self.m == 0 || self.n == 0
    }

    fn hash(&self) -> u64 {
        [self.m, self.n, self.k, self.a_stride_m, self.a_stride_k, self.b_stride_k, self.b_stride_n, self.ldc]
            .iter()
            .fold(hash_combine(self.static_params.hash, &self.beta.to_bits()), hash_combine)
    }
}

/// Compiled brgemm routine for one configuration.
#[derive(Debug)]
pub struct BrgemmKernel {
    config: BrgemmConfig,
}

impl BrgemmKernel {
    pub fn config(&self) -> &BrgemmConfig {
        &self.config
    }

    unsafe fn weight(&self, b: *const u8, k_idx: usize, n_idx: usize) -> *const u8 {
        let c = &self.config;
        let et = c.static_params.wei_type;
        let index = if c.static_params.with_repacking() {
            repacked_index(k_idx, n_idx, c.k, et)
        } else {
            k_idx * c.b_stride_k + n_idx * c.b_stride_n
        };
        b.add(index * et.size())
    }

    /// `C = A x B + beta * C` over one tile.
    ///
    /// # Safety
    /// Pointers must cover the tiles described by the configuration; repacked weights must
    /// include their compensations when the source is signed int8.
    pub unsafe fn execute(&self, a: *const u8, b: *const u8, out: *mut u8) {
        let c = &self.config;
        let params = &c.static_params;
        let src_size = params.src_type.size();
        for mi in 0..c.m {
            for ni in 0..c.n {
                let dst = out.add((mi * c.ldc + ni) * 4);
                let a_at = |ki: usize| a.add((mi * c.a_stride_m + ki * c.a_stride_k) * src_size);
                match params.src_type {
                    ElementType::F32 => {
                        let mut acc = 0.0f32;
                        for ki in 0..c.k {
                            let x = (a_at(ki) as *const f32).read_unaligned();
                            let w = (self.weight(b, ki, ni) as *const f32).read_unaligned();
                            acc += x * w;
                        }
                        let dst = dst as *mut f32;
                        if c.beta != 0.0 {
                            acc += c.beta * dst.read_unaligned();
                        }
                        dst.write_unaligned(acc);
                    }
                    ElementType::Bf16 => {
                        let mut acc = 0.0f32;
                        for ki in 0..c.k {
                            let x = bf16::from_bits((a_at(ki) as *const u16).read_unaligned());
                            let w = bf16::from_bits((self.weight(b, ki, ni) as *const u16).read_unaligned());
                            acc += x.to_f32() * w.to_f32();
                        }
                        let dst = dst as *mut f32;
                        if c.beta != 0.0 {
                            acc += c.beta * dst.read_unaligned();
                        }
                        dst.write_unaligned(acc);
                    }
                    ElementType::U8 | ElementType::I8 => {
                        let signed = params.src_type == ElementType::I8;
                        let mut acc = 0i32;
                        for ki in 0..c.k {
                            let x = if signed {
                                *(a_at(ki) as *const i8) as i32 + 128
                            } else {
                                *a_at(ki) as i32
                            };
                            let w = *(self.weight(b, ki, ni) as *const i8) as i32;
                            acc += x * w;
                        }
                        if signed {
                            let comp = b.add(repacked_size(c.k, c.n, params.wei_type)) as *const i32;
                            acc += comp.add(ni).read_unaligned();
                        }
                        let dst = dst as *mut i32;
                        if c.beta != 0.0 {
                            acc += dst.read_unaligned();
                        }
                        dst.write_unaligned(acc);
                    }
                    _ => {}
                }
            }
        }
    }
}

pub struct BrgemmCompiler;

impl KernelCompiler for BrgemmCompiler {
    type Config = BrgemmConfig;
    type Kernel = BrgemmKernel;

    fn compile_kernel(&self, config: &BrgemmConfig) -> Result<BrgemmKernel> {
        let p = &config.static_params;
        let supported = match (p.src_type, p.wei_type) {
            (ElementType::F32, ElementType::F32) => true,
            (ElementType::U8 | ElementType::I8, ElementType::I8) => p.isa >= Isa::Avx2,
            (ElementType::Bf16, ElementType::Bf16) => p.isa == Isa::Avx512,
            _ => false,
        };
        if !supported {
            return Err(SnippetsError::unsupported_config(format!(
                "brgemm {}x{} is not available on {}",
                p.src_type, p.wei_type, p.isa
            )));
        }
        trace!("brgemm kernel m={} n={} k={} {}x{}", config.m, config.n, config.k, p.src_type, p.wei_type);
        Ok(BrgemmKernel { config: config.clone() })
    }

    fn update_config(&self, inputs: &[PortDescriptor], outputs: &[PortDescriptor], config: &mut BrgemmConfig) -> Result<()> {
        let (a, b, c) = match (inputs, outputs) {
            ([a, b], [c]) => (a, b, c),
            _ => return Err(SnippetsError::structure("brgemm expects two inputs and one output")),
        };
        let rank = c.rank();
        if a.rank() != rank || b.rank() != rank || rank < 2 {
            return Err(SnippetsError::shape_update(format!(
                "brgemm ranks {} x {} -> {}",
                a.rank(),
                b.rank(),
                rank
            )));
        }
        config.m = a.shape[rank - 2];
        config.k = a.shape[rank - 1];
        config.n = c.shape[rank - 1];
        let kb = b.shape[rank - 2];
        if !is_dynamic_value(kb) && !is_dynamic_value(config.k) && kb != config.k {
            return Err(SnippetsError::shape_update(format!("brgemm K mismatch: {} vs {kb}", config.k)));
        }

        let resolved = !is_dynamic_shape(&a.shape) && !is_dynamic_shape(&b.shape) && !is_dynamic_shape(&c.shape);
        if resolved {
            let a_strides = a.planar_strides(&a.shape);
            let b_strides = b.planar_strides(&b.shape);
            let c_strides = c.planar_strides(&c.shape);
            config.a_stride_m = a_strides[rank - 2];
            config.a_stride_k = a_strides[rank - 1];
            if config.static_params.with_repacking() {
                config.b_stride_k = 0;
                config.b_stride_n = 0;
            } else {
                config.b_stride_k = b_strides[rank - 2];
                config.b_stride_n = b_strides[rank - 1];
            }
            config.ldc = c_strides[rank - 2];
        }
        Ok(())
    }
}

pub type BrgemmExecutor = KernelExecutor<BrgemmCompiler>;

/// Entry point called from emitted code.
///
/// # Safety
/// `executor` must point to a live executor and the pointers must match its configuration.
pub unsafe extern "C" fn brgemm_call(executor: *const BrgemmExecutor, a: *const u8, b: *const u8, c: *mut u8) {
    if let Some(kernel) = executor.as_ref().and_then(|e| e.kernel()) {
        kernel.execute(a, b, c);
    }
}
