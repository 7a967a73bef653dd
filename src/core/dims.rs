//! Dimension helpers shared by the IR, the runtime configurator and tokenization.

/// Shape of a tensor port as plain dimensions.
pub type VectorDims = Vec<usize>;

/// Marker for a dimension whose value is only known at invocation time.
pub const DYNAMIC_DIMENSION: usize = usize::MAX;

/// Subtensor marker: the port processes the whole dimension at once.
pub const FULL_DIM: usize = usize::MAX - 1;

pub fn is_dynamic_value(dim: usize) -> bool {
    dim == DYNAMIC_DIMENSION
}

pub fn is_dynamic_shape(shape: &[usize]) -> bool {
    shape.iter().any(|&d| is_dynamic_value(d))
}

/// Number of elements, or `None` if any dimension is dynamic.
pub fn volume(shape: &[usize]) -> Option<usize> {
    if is_dynamic_shape(shape) {
        return None;
    }
    Some(shape.iter().product())
}

/// Merge two dimensions with numpy broadcasting rules.
pub fn broadcast_merge_dim(lhs: usize, rhs: usize) -> Option<usize> {
    match (lhs, rhs) {
        (a, b) if a == b => Some(a),
        (1, b) => Some(b),
        (a, 1) => Some(a),
        (DYNAMIC_DIMENSION, b) => Some(b),
        (a, DYNAMIC_DIMENSION) => Some(a),
        _ => None,
    }
}

/// Numpy-broadcast `rhs` into `dst`, aligning from the innermost dimension.
pub fn broadcast_merge_into(dst: &mut VectorDims, rhs: &[usize]) -> bool {
    if rhs.len() > dst.len() {
        let mut extended = vec![1; rhs.len() - dst.len()];
        extended.extend_from_slice(dst);
        *dst = extended;
    }
    let offset = dst.len() - rhs.len();
    for (i, &d) in rhs.iter().enumerate() {
        match broadcast_merge_dim(dst[offset + i], d) {
            Some(merged) => dst[offset + i] = merged,
            None => return false,
        }
    }
    true
}

/// Prepend ones until the shape has `rank` dimensions.
pub fn pshape_to_rank(shape: &[usize], rank: usize) -> VectorDims {
    let mut out = vec![1; rank.saturating_sub(shape.len())];
    out.extend_from_slice(shape);
    out
}

/// Dense row-major element strides of a static shape.
pub fn dense_strides(shape: &[usize]) -> VectorDims {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Render dimensions with `?` for dynamic and `*` for full-dim markers.
pub fn format_dims(dims: &[usize]) -> String {
    let parts: Vec<String> = dims
        .iter()
        .map(|&d| match d {
            DYNAMIC_DIMENSION => "?".to_string(),
            FULL_DIM => "*".to_string(),
            d => d.to_string(),
        })
        .collect();
    format!("[{}]", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_merge() {
        let mut dst = vec![2, 1, 130];
        assert!(broadcast_merge_into(&mut dst, &[3, 1]));
        assert_eq!(dst, vec![2, 3, 130]);
        assert!(!broadcast_merge_into(&mut dst, &[4, 130]));

        let mut dst = vec![1];
        assert!(broadcast_merge_into(&mut dst, &[2, 5]));
        assert_eq!(dst, vec![2, 5]);
    }

    #[test]
    fn test_strides_and_format() {
        assert_eq!(dense_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(volume(&[2, DYNAMIC_DIMENSION]), None);
        assert_eq!(format_dims(&[1, DYNAMIC_DIMENSION, FULL_DIM]), "[1,?,*]");
    }
}
