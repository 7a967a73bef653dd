// Heuristics that split the M dimension of a matmul into an outer part, which joins the
// parallel domain, and an inner part, which stays in the kernel. Splitting pays off when
// the batch dimensions alone give fewer work units than there are threads. Three strategies
// are tried in order: an ideal split making the batch a multiple of the thread count, a
// split keeping the kernel M as small as possible but not below MIN_KERNEL_M, and a
// fallback that only raises the parallel work amount into [concurrency, 2 * concurrency).

//! M-dimension splitting for matmul subgraphs.

use crate::core::VectorDims;

use super::model::{Model, NodeId, NodeOp};

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut d = 2;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 1;
    }
    true
}

pub struct SplitDimensionM;

impl SplitDimensionM {
    pub const MIN_KERNEL_M: usize = 32;

    /// Matmuls whose A input is not transposed and has at least two dimensions.
    pub fn is_supported_matmul(model: &Model, id: NodeId) -> bool {
        let Ok(node) = model.node(id) else {
            return false;
        };
        if !matches!(node.op, NodeOp::MatMul { transpose_a: false, .. }) {
            return false;
        }
        node.outputs
            .first()
            .and_then(|d| d.shape.rank())
            .is_some_and(|rank| rank >= 2)
    }

    /// The matmul's static output shape can be split for `concurrency` threads.
    pub fn can_be_optimized(model: &Model, id: NodeId, concurrency: usize) -> bool {
        if !Self::is_supported_matmul(model, id) {
            return false;
        }
        let Ok(node) = model.node(id) else {
            return false;
        };
        match node.outputs.first().map(|d| &d.shape) {
            Some(shape) if shape.is_static() => shape.dims().and_then(|d| Self::split(d, concurrency)).is_some(),
            _ => false,
        }
    }

    /// Split M of a `[..batch, M, N]` shape; returns `(batch_m, new_m)`.
    pub fn split(shape: &[usize], concurrency: usize) -> Option<(usize, usize)> {
        let rank = shape.len();
        let batch = shape[..rank.saturating_sub(2)].iter().product();
        let m = if rank >= 2 { shape[rank - 2] } else { 1 };
        Self::split_dims(batch, m, concurrency)
    }

    pub fn split_dims(batch: usize, m: usize, concurrency: usize) -> Option<(usize, usize)> {
        if batch == 0 || concurrency == 0 || is_prime(m) || batch % concurrency == 0 {
            return None;
        }
        let done = |(batch_m, _): (usize, usize)| batch_m != 1;
        let ideal = Self::split_ideally(batch, m, concurrency);
        if done(ideal) {
            return Some(ideal);
        }
        let minimal = Self::split_minimize_kernel_wa(batch, m, concurrency);
        if done(minimal) {
            return Some(minimal);
        }
        if batch < concurrency {
            let fallback = Self::split_fallback_increase_parallel_wa(batch, m, concurrency);
            if done(fallback) {
                return Some(fallback);
            }
        }
        None
    }

    fn split_ideally(batch: usize, m: usize, concurrency: usize) -> (usize, usize) {
        // The outer part of M completes the batch to exactly the thread count.
        if concurrency % batch == 0 {
            let bound = concurrency / batch;
            if m % bound == 0 {
                return (bound, m / bound);
            }
        }
        if m % concurrency == 0 && m / concurrency >= Self::MIN_KERNEL_M {
            return (concurrency, m / concurrency);
        }
        (1, m)
    }

    fn split_minimize_kernel_wa(batch: usize, m: usize, concurrency: usize) -> (usize, usize) {
        let mut best = (1, m);
        let mut divisor = 2;
        while divisor * divisor < m {
            if m % divisor == 0 {
                if divisor >= Self::MIN_KERNEL_M {
                    return (m / divisor, divisor);
                }
                let kernel_m = m / divisor;
                if kernel_m >= Self::MIN_KERNEL_M {
                    best = (divisor, kernel_m);
                }
            }
            divisor += 1;
        }
        if best.0 * batch >= concurrency {
            best
        } else {
            (1, m)
        }
    }

    fn split_fallback_increase_parallel_wa(batch: usize, m: usize, concurrency: usize) -> (usize, usize) {
        let upper = (2 * concurrency).div_ceil(batch);
        for outer in (2..upper).rev() {
            if m % outer == 0 {
                return if outer * batch >= concurrency { (outer, m / outer) } else { (1, m) };
            }
        }
        (1, m)
    }

    /// Replace dimension `m_index` by `[batch_m, new_m]`; a unit M gets a leading 1.
    pub fn reshape_m_dim(mut shape: VectorDims, m_index: usize, batch_m: usize, new_m: usize) -> VectorDims {
        if shape[m_index] == 1 {
            return Self::unsqueeze_m_dim(shape, m_index);
        }
        shape[m_index] = new_m;
        shape.insert(m_index, batch_m);
        shape
    }

    pub fn unsqueeze_m_dim(mut shape: VectorDims, m_index: usize) -> VectorDims {
        shape.insert(m_index, 1);
        shape
    }

    /// Transpose order after dimension `m_index` is split in two.
    pub fn get_updated_order(order: &[usize], m_index: usize) -> Vec<usize> {
        let mut updated = Vec::with_capacity(order.len() + 1);
        for &dim in order {
            match dim {
                d if d < m_index => updated.push(d),
                d if d == m_index => {
                    updated.push(d);
                    updated.push(d + 1);
                }
                d => updated.push(d + 1),
            }
        }
        updated
    }
}
