//! Values and constants

use crate::module::GlobalId;
use crate::types::Type;
use serde::{Deserialize, Serialize};

/// Unique handle of an instruction inside its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstId(pub u32);

/// Unique handle of a basic block inside its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Compile-time constants.
///
/// `ElementPtr` is the constant-expression form of an address into a global
/// array, the way a string literal is passed to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int { ty: Type, value: i64 },
    Float { ty: Type, value: f64 },
    GlobalAddr(GlobalId),
    ElementPtr { global: GlobalId, offset: u64 },
    Undef(Type),
}

impl Constant {
    pub fn i1(value: bool) -> Self {
        Constant::Int { ty: Type::I1, value: value as i64 }
    }

    pub fn i32(value: i32) -> Self {
        Constant::Int { ty: Type::I32, value: value as i64 }
    }

    pub fn i64(value: i64) -> Self {
        Constant::Int { ty: Type::I64, value }
    }

    pub fn ty(&self) -> Type {
        match self {
            Constant::Int { ty, .. } => ty.clone(),
            Constant::Float { ty, .. } => ty.clone(),
            Constant::GlobalAddr(_) => Type::Ptr,
            Constant::ElementPtr { .. } => Type::Ptr,
            Constant::Undef(ty) => ty.clone(),
        }
    }

    /// The global this constant addresses, if it is an address constant.
    pub fn pointee_global(&self) -> Option<GlobalId> {
        match self {
            Constant::GlobalAddr(g) => Some(*g),
            Constant::ElementPtr { global, .. } => Some(*global),
            _ => None,
        }
    }
}

/// An operand of an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Constant(Constant),
    Argument(usize),
    Inst(InstId),
}

impl Value {
    pub fn const_i32(value: i32) -> Self {
        Value::Constant(Constant::i32(value))
    }

    pub fn const_i64(value: i64) -> Self {
        Value::Constant(Constant::i64(value))
    }

    pub fn as_inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<InstId> for Value {
    fn from(id: InstId) -> Self {
        Value::Inst(id)
    }
}
