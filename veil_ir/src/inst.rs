//! Instructions and terminators

use crate::types::Type;
use crate::value::{BlockId, Value};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use veil_common::DebugLoc;

/// Binary operator opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

impl BinOp {
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv | BinOp::FRem)
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::UDiv => "udiv",
            BinOp::SDiv => "sdiv",
            BinOp::URem => "urem",
            BinOp::SRem => "srem",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::FAdd => "fadd",
            BinOp::FSub => "fsub",
            BinOp::FMul => "fmul",
            BinOp::FDiv => "fdiv",
            BinOp::FRem => "frem",
        }
    }
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

impl IntPredicate {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Ugt => "ugt",
            IntPredicate::Uge => "uge",
            IntPredicate::Ult => "ult",
            IntPredicate::Ule => "ule",
            IntPredicate::Sgt => "sgt",
            IntPredicate::Sge => "sge",
            IntPredicate::Slt => "slt",
            IntPredicate::Sle => "sle",
        }
    }
}

/// Non-terminator instruction payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstKind {
    Binary { op: BinOp, lhs: Value, rhs: Value },
    ICmp { pred: IntPredicate, lhs: Value, rhs: Value },
    Alloca { allocated: Type },
    Load { ptr: Value },
    Store { value: Value, ptr: Value },
    Call { callee: String, args: Vec<Value> },
    Select { cond: Value, if_true: Value, if_false: Value },
    Phi { incoming: Vec<(Value, BlockId)> },
}

impl InstKind {
    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, InstKind::Binary { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, InstKind::Call { .. })
    }

    /// All value operand slots, in operand order.
    pub fn values(&self) -> SmallVec<[&Value; 4]> {
        let mut out = SmallVec::new();
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                out.push(lhs);
                out.push(rhs);
            }
            InstKind::Alloca { .. } => {}
            InstKind::Load { ptr } => out.push(ptr),
            InstKind::Store { value, ptr } => {
                out.push(value);
                out.push(ptr);
            }
            InstKind::Call { args, .. } => out.extend(args.iter()),
            InstKind::Select { cond, if_true, if_false } => {
                out.push(cond);
                out.push(if_true);
                out.push(if_false);
            }
            InstKind::Phi { incoming } => out.extend(incoming.iter().map(|(v, _)| v)),
        }
        out
    }

    /// Mutable access to every value operand slot.
    pub fn values_mut(&mut self) -> SmallVec<[&mut Value; 4]> {
        let mut out = SmallVec::new();
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                out.push(lhs);
                out.push(rhs);
            }
            InstKind::Alloca { .. } => {}
            InstKind::Load { ptr } => out.push(ptr),
            InstKind::Store { value, ptr } => {
                out.push(value);
                out.push(ptr);
            }
            InstKind::Call { args, .. } => out.extend(args.iter_mut()),
            InstKind::Select { cond, if_true, if_false } => {
                out.push(cond);
                out.push(if_true);
                out.push(if_false);
            }
            InstKind::Phi { incoming } => out.extend(incoming.iter_mut().map(|(v, _)| v)),
        }
        out
    }
}

/// An instruction together with its result type and debug location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstData {
    pub kind: InstKind,
    pub ty: Type,
    pub dbg: Option<DebugLoc>,
    pub(crate) erased: bool,
}

impl InstData {
    pub fn new(kind: InstKind, ty: Type) -> Self {
        Self { kind, ty, dbg: None, erased: false }
    }

    pub fn is_erased(&self) -> bool {
        self.erased
    }
}

/// Block terminators. Every well-formed block ends in exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    Ret(Option<Value>),
    Br(BlockId),
    CondBr { cond: Value, then_dest: BlockId, else_dest: BlockId },
    Switch { value: Value, default: BlockId, cases: Vec<(i32, BlockId)> },
    Invoke { callee: String, args: Vec<Value>, normal: BlockId, unwind: BlockId },
    Unreachable,
}

impl Terminator {
    /// Successor blocks in operand order.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        let mut out = SmallVec::new();
        match self {
            Terminator::Ret(_) | Terminator::Unreachable => {}
            Terminator::Br(dest) => out.push(*dest),
            Terminator::CondBr { then_dest, else_dest, .. } => {
                out.push(*then_dest);
                out.push(*else_dest);
            }
            Terminator::Switch { default, cases, .. } => {
                out.push(*default);
                out.extend(cases.iter().map(|(_, b)| *b));
            }
            Terminator::Invoke { normal, unwind, .. } => {
                out.push(*normal);
                out.push(*unwind);
            }
        }
        out
    }

    /// Mutable access to every successor slot.
    pub fn successors_mut(&mut self) -> SmallVec<[&mut BlockId; 2]> {
        let mut out = SmallVec::new();
        match self {
            Terminator::Ret(_) | Terminator::Unreachable => {}
            Terminator::Br(dest) => out.push(dest),
            Terminator::CondBr { then_dest, else_dest, .. } => {
                out.push(then_dest);
                out.push(else_dest);
            }
            Terminator::Switch { default, cases, .. } => {
                out.push(default);
                out.extend(cases.iter_mut().map(|(_, b)| b));
            }
            Terminator::Invoke { normal, unwind, .. } => {
                out.push(normal);
                out.push(unwind);
            }
        }
        out
    }

    /// All value operand slots.
    pub fn values(&self) -> SmallVec<[&Value; 2]> {
        let mut out = SmallVec::new();
        match self {
            Terminator::Ret(Some(v)) => out.push(v),
            Terminator::Ret(None) | Terminator::Br(_) | Terminator::Unreachable => {}
            Terminator::CondBr { cond, .. } => out.push(cond),
            Terminator::Switch { value, .. } => out.push(value),
            Terminator::Invoke { args, .. } => out.extend(args.iter()),
        }
        out
    }

    /// Mutable access to every value operand slot.
    pub fn values_mut(&mut self) -> SmallVec<[&mut Value; 2]> {
        let mut out = SmallVec::new();
        match self {
            Terminator::Ret(Some(v)) => out.push(v),
            Terminator::Ret(None) | Terminator::Br(_) | Terminator::Unreachable => {}
            Terminator::CondBr { cond, .. } => out.push(cond),
            Terminator::Switch { value, .. } => out.push(value),
            Terminator::Invoke { args, .. } => out.extend(args.iter_mut()),
        }
        out
    }

    pub fn is_invoke(&self) -> bool {
        matches!(self, Terminator::Invoke { .. })
    }

    /// Case key whose destination is `dest`, if any.
    pub fn switch_case_for(&self, dest: BlockId) -> Option<i32> {
        match self {
            Terminator::Switch { cases, .. } => {
                cases.iter().find(|(_, b)| *b == dest).map(|(k, _)| *k)
            }
            _ => None,
        }
    }
}
