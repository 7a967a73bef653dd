//! Tensor element types understood by the compiler.

use std::fmt;

/// Element type of a tensor port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementType {
    F32,
    Bf16,
    F16,
    I8,
    U8,
    I32,
    Boolean,
}

impl ElementType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::Bf16 | ElementType::F16 => 2,
            ElementType::I8 | ElementType::U8 | ElementType::Boolean => 1,
        }
    }

    pub const fn is_real(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::Bf16 | ElementType::F16)
    }

    pub const fn is_integral(self) -> bool {
        !self.is_real()
    }

    pub fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::Bf16 => "bf16",
            ElementType::F16 => "f16",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
            ElementType::I32 => "i32",
            ElementType::Boolean => "boolean",
        }
    }

    /// Parse the short name produced by [`ElementType::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "f32" => ElementType::F32,
            "bf16" => ElementType::Bf16,
            "f16" => ElementType::F16,
            "i8" => ElementType::I8,
            "u8" => ElementType::U8,
            "i32" => ElementType::I32,
            "boolean" => ElementType::Boolean,
            _ => return None,
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element types the element-wise tokenizer accepts on subgraph boundaries.
pub const SUPPORTED_ELEMENT_TYPES: [ElementType; 5] = [
    ElementType::F32,
    ElementType::Bf16,
    ElementType::F16,
    ElementType::I8,
    ElementType::U8,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_and_names() {
        assert_eq!(ElementType::F32.size(), 4);
        assert_eq!(ElementType::Bf16.size(), 2);
        assert_eq!(ElementType::U8.size(), 1);
        for ty in SUPPORTED_ELEMENT_TYPES {
            assert_eq!(ElementType::from_name(ty.name()), Some(ty));
        }
        assert_eq!(ElementType::from_name("f64"), None);
    }
}
