//! Type representation in the IR

use serde::{Deserialize, Serialize};

/// IR types. Pointers are opaque, the pointee type is not tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    I1,
    I8,
    I32,
    I64,
    F32,
    F64,
    Ptr,
    Array { elem: Box<Type>, len: u64 },
}

impl Type {
    pub fn is_integer(&self) -> bool {
        matches!(self, Type::I1 | Type::I8 | Type::I32 | Type::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    /// Bit width of scalar integer types.
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Type::I1 => Some(1),
            Type::I8 => Some(8),
            Type::I32 => Some(32),
            Type::I64 => Some(64),
            _ => None,
        }
    }

    /// Size in bytes when stored in memory.
    pub fn byte_size(&self) -> Option<u64> {
        match self {
            Type::Void => Some(0),
            Type::I1 | Type::I8 => Some(1),
            Type::I32 | Type::F32 => Some(4),
            Type::I64 | Type::F64 | Type::Ptr => Some(8),
            Type::Array { elem, len } => elem.byte_size().map(|s| s * len),
        }
    }

    /// Byte array type used for string globals.
    pub fn bytes(len: u64) -> Type {
        Type::Array { elem: Box::new(Type::I8), len }
    }
}
