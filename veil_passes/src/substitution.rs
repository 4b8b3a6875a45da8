//! Instruction substitution
//!
//! Rewrites integer additions and subtractions into longer sequences that
//! compute the same value under wrap-around arithmetic. The replaced
//! instruction is left in place, dead, for later cleanup.

use crate::FunctionPass;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use veil_ir::{BinOp, BlockId, Constant, Function, InstId, InstKind, Module, Type, Value};

pub const DEFAULT_LOOPS: u32 = 2;
pub const DEFAULT_PROBABILITY: u32 = 50;

pub struct SubstitutionPass {
    loops: u32,
    probability: u32,
    rng: StdRng,
}

impl Default for SubstitutionPass {
    fn default() -> Self {
        Self::new(DEFAULT_LOOPS, DEFAULT_PROBABILITY)
    }
}

impl SubstitutionPass {
    pub fn new(loops: u32, probability: u32) -> Self {
        Self { loops, probability, rng: StdRng::from_entropy() }
    }

    fn rewrite(&mut self, f: &mut Function, block: BlockId, inst: InstId) -> bool {
        match &f.inst(inst).kind {
            InstKind::Binary { op: BinOp::Add, .. } => {
                match self.rng.gen_range(0..3) {
                    0 => self.add_neg(f, block, inst),
                    1 => self.add_rand(f, block, inst),
                    _ => self.add_double_neg(f, block, inst),
                }
                true
            }
            InstKind::Binary { op: BinOp::Sub, .. } => {
                if self.rng.gen_range(0..2) == 0 {
                    self.sub_neg(f, block, inst)
                } else {
                    self.sub_rand(f, block, inst)
                }
                true
            }
            _ => false,
        }
    }

    /// a = b + c  =>  a = b - (-c)
    fn add_neg(&mut self, f: &mut Function, block: BlockId, inst: InstId) {
        let (lhs, rhs, ty) = operands(f, inst);
        let at = f.position_of(block, inst).expect("instruction in block");
        let neg = f.insert_inst(
            block,
            at,
            InstKind::Binary { op: BinOp::Sub, lhs: zero(&ty), rhs },
            ty.clone(),
        );
        let repl = f.insert_inst(
            block,
            at + 1,
            InstKind::Binary { op: BinOp::Sub, lhs, rhs: Value::Inst(neg) },
            ty,
        );
        f.replace_all_uses(inst, Value::Inst(repl));
    }

    /// r = rand(); a = ((b + r) + c) - r
    fn add_rand(&mut self, f: &mut Function, block: BlockId, inst: InstId) {
        let (lhs, rhs, ty) = operands(f, inst);
        let r = self.rand_const(&ty);
        let at = f.position_of(block, inst).expect("instruction in block");
        let t0 = f.insert_inst(
            block,
            at,
            InstKind::Binary { op: BinOp::Add, lhs, rhs: r.clone() },
            ty.clone(),
        );
        let t1 = f.insert_inst(
            block,
            at + 1,
            InstKind::Binary { op: BinOp::Add, lhs: Value::Inst(t0), rhs },
            ty.clone(),
        );
        let repl = f.insert_inst(
            block,
            at + 2,
            InstKind::Binary { op: BinOp::Sub, lhs: Value::Inst(t1), rhs: r },
            ty,
        );
        f.replace_all_uses(inst, Value::Inst(repl));
    }

    /// a = b + c  =>  a = -((-b) + (-c))
    fn add_double_neg(&mut self, f: &mut Function, block: BlockId, inst: InstId) {
        let (lhs, rhs, ty) = operands(f, inst);
        let at = f.position_of(block, inst).expect("instruction in block");
        let neg_rhs = f.insert_inst(
            block,
            at,
            InstKind::Binary { op: BinOp::Sub, lhs: zero(&ty), rhs },
            ty.clone(),
        );
        let neg_lhs = f.insert_inst(
            block,
            at + 1,
            InstKind::Binary { op: BinOp::Sub, lhs: zero(&ty), rhs: lhs },
            ty.clone(),
        );
        let sum = f.insert_inst(
            block,
            at + 2,
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Inst(neg_lhs),
                rhs: Value::Inst(neg_rhs),
            },
            ty.clone(),
        );
        let repl = f.insert_inst(
            block,
            at + 3,
            InstKind::Binary { op: BinOp::Sub, lhs: zero(&ty), rhs: Value::Inst(sum) },
            ty,
        );
        f.replace_all_uses(inst, Value::Inst(repl));
    }

    /// a = b - c  =>  a = b + (-c)
    fn sub_neg(&mut self, f: &mut Function, block: BlockId, inst: InstId) {
        let (lhs, rhs, ty) = operands(f, inst);
        let at = f.position_of(block, inst).expect("instruction in block");
        let neg = f.insert_inst(
            block,
            at,
            InstKind::Binary { op: BinOp::Sub, lhs: zero(&ty), rhs },
            ty.clone(),
        );
        let repl = f.insert_inst(
            block,
            at + 1,
            InstKind::Binary { op: BinOp::Add, lhs, rhs: Value::Inst(neg) },
            ty,
        );
        f.replace_all_uses(inst, Value::Inst(repl));
    }

    /// r = rand(); a = ((b + r) - c) - r
    fn sub_rand(&mut self, f: &mut Function, block: BlockId, inst: InstId) {
        let (lhs, rhs, ty) = operands(f, inst);
        let r = self.rand_const(&ty);
        let at = f.position_of(block, inst).expect("instruction in block");
        let t0 = f.insert_inst(
            block,
            at,
            InstKind::Binary { op: BinOp::Add, lhs, rhs: r.clone() },
            ty.clone(),
        );
        let t1 = f.insert_inst(
            block,
            at + 1,
            InstKind::Binary { op: BinOp::Sub, lhs: Value::Inst(t0), rhs },
            ty.clone(),
        );
        let repl = f.insert_inst(
            block,
            at + 2,
            InstKind::Binary { op: BinOp::Sub, lhs: Value::Inst(t1), rhs: r },
            ty,
        );
        f.replace_all_uses(inst, Value::Inst(repl));
    }

    fn rand_const(&mut self, ty: &Type) -> Value {
        let value = match ty {
            Type::I64 => self.rng.gen::<i64>(),
            _ => self.rng.gen::<i32>() as i64,
        };
        Value::Constant(Constant::Int { ty: ty.clone(), value })
    }
}

fn operands(f: &Function, inst: InstId) -> (Value, Value, Type) {
    match &f.inst(inst).kind {
        InstKind::Binary { lhs, rhs, .. } => (lhs.clone(), rhs.clone(), f.inst(inst).ty.clone()),
        _ => panic!("substitution target is not a binary operator"),
    }
}

fn zero(ty: &Type) -> Value {
    Value::Constant(Constant::Int { ty: ty.clone(), value: 0 })
}

impl FunctionPass for SubstitutionPass {
    fn flag(&self) -> &'static str {
        "subobf"
    }

    fn description(&self) -> &'static str {
        "Enable Instruction Substitution"
    }

    fn run_on_function(&mut self, _module: &mut Module, f: &mut Function) -> bool {
        let mut changed = false;
        for _ in 0..self.loops {
            for block in f.block_ids() {
                // Snapshot; the rewrites splice new instructions in place.
                for inst in f.block(block).insts.clone() {
                    // Losing the roll only skips instructions the opcode
                    // match below would ignore anyway.
                    if self.rng.gen_range(0..100) >= self.probability
                        && !f.inst(inst).kind.is_binary()
                    {
                        continue;
                    }
                    changed |= self.rewrite(f, block, inst);
                }
            }
        }
        changed
    }
}
