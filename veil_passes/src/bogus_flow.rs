//! Bogus control flow
//!
//! Guards each obfuscated block with an opaque predicate and a scrambled
//! twin of the block. The predicate `((x * (x + 1)) % 2) == 0` holds for
//! every 32-bit x, so the twin is never executed, but both paths look live
//! to a static reader.

use crate::FunctionPass;
use hashbrown::HashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use veil_ir::{
    BinOp, BlockId, Constant, Function, GlobalVariable, Initializer, InstId, InstKind,
    IntPredicate, Linkage, Module, Terminator, Type, Value,
};

pub const DEFAULT_PROBABILITY: u32 = 70;

pub struct BogusFlowPass {
    probability: u32,
    rng: StdRng,
}

impl Default for BogusFlowPass {
    fn default() -> Self {
        Self::new(DEFAULT_PROBABILITY)
    }
}

impl BogusFlowPass {
    pub fn new(probability: u32) -> Self {
        Self { probability, rng: StdRng::from_entropy() }
    }

    /// Deep-clone `target` into a plausible but arithmetically wrong twin.
    fn make_bogus_block(&mut self, f: &mut Function, target: BlockId) -> BlockId {
        let (bogus, map) = f.clone_block(target, "bogusBlock");
        let block_map = HashMap::from_iter([(target, bogus)]);
        f.remap_block(bogus, &map, &block_map);

        // Phi clones would claim the template's predecessors, which the twin
        // does not have. The originals end up in the header, which dominates
        // the twin, so they stand in directly.
        for &orig in &f.block(target).insts.clone() {
            if f.inst(orig).kind.is_phi() {
                let clone = map[&orig];
                f.replace_all_uses(clone, Value::Inst(orig));
                f.erase_inst(bogus, clone);
            }
        }

        // Scramble binary operators: overwrite the left operand with a
        // randomly chosen operand of the same instruction.
        for inst in f.block(bogus).insts.clone() {
            if let InstKind::Binary { lhs, rhs, .. } = &mut f.inst_mut(inst).kind {
                if self.rng.gen_range(0..2) == 1 {
                    *lhs = rhs.clone();
                }
            }
        }
        bogus
    }

    /// Wire `target` into header / body / tail with the twin on the false
    /// edges of an always-true predicate.
    fn add_bogus_flow(
        &mut self,
        module: &mut Module,
        f: &mut Function,
        target: BlockId,
        bogus: BlockId,
        allocas: &[InstId],
        allocas_usable: bool,
    ) {
        let body = f.split_block(target, f.first_non_phi(target));
        f.take_terminator(bogus);
        f.take_terminator(target);

        // Opaque value: a resident i32 stack slot when one exists, otherwise
        // a fresh private global with a random initializer.
        let x_ptr = if allocas_usable && !allocas.is_empty() {
            let slot = allocas[self.rng.gen_range(0..allocas.len())];
            Value::Inst(slot)
        } else {
            let global = module.add_global(GlobalVariable {
                name: module.fresh_global_name("opaque"),
                ty: Type::I32,
                linkage: Linkage::Private,
                is_constant: false,
                init: Some(Initializer::Int { ty: Type::I32, value: self.rng.gen::<i32>() as i64 }),
            });
            Value::Constant(Constant::GlobalAddr(global))
        };
        let x = f.append_inst(target, InstKind::Load { ptr: x_ptr }, Type::I32);
        let x1 = f.append_inst(
            target,
            InstKind::Binary { op: BinOp::Add, lhs: Value::Inst(x), rhs: Value::const_i32(1) },
            Type::I32,
        );
        let prod = f.append_inst(
            target,
            InstKind::Binary { op: BinOp::Mul, lhs: Value::Inst(x), rhs: Value::Inst(x1) },
            Type::I32,
        );
        let rem = f.append_inst(
            target,
            InstKind::Binary { op: BinOp::SRem, lhs: Value::Inst(prod), rhs: Value::const_i32(2) },
            Type::I32,
        );
        let cond = f.append_inst(
            target,
            InstKind::ICmp { pred: IntPredicate::Eq, lhs: Value::Inst(rem), rhs: Value::const_i32(0) },
            Type::I1,
        );
        f.set_terminator(
            target,
            Terminator::CondBr { cond: Value::Inst(cond), then_dest: body, else_dest: bogus },
        );
        f.set_terminator(bogus, Terminator::Br(body));

        // Carve the original terminator off into a tail block and gate it
        // with the predicate a second time.
        let tail = f.split_block(body, f.block(body).insts.len());
        f.take_terminator(body);
        let cond2 = f.append_inst(
            body,
            InstKind::ICmp { pred: IntPredicate::Eq, lhs: Value::Inst(rem), rhs: Value::const_i32(0) },
            Type::I1,
        );
        f.set_terminator(
            body,
            Terminator::CondBr { cond: Value::Inst(cond2), then_dest: tail, else_dest: bogus },
        );
    }
}

/// `alloca i32` instructions of the entry block.
fn find_alloca_insts(f: &Function) -> SmallVec<[InstId; 8]> {
    let mut out = SmallVec::new();
    for &i in &f.block(f.entry()).insts {
        if matches!(&f.inst(i).kind, InstKind::Alloca { allocated } if *allocated == Type::I32) {
            out.push(i);
        }
    }
    out
}

impl FunctionPass for BogusFlowPass {
    fn flag(&self) -> &'static str {
        "boguscf"
    }

    fn description(&self) -> &'static str {
        "inserting bogus control flow"
    }

    fn run_on_function(&mut self, module: &mut Module, f: &mut Function) -> bool {
        let targets = f.block_ids();
        let allocas = find_alloca_insts(f);
        let entry = f.entry();

        let mut changed = false;
        for target in targets {
            if self.rng.gen_range(0..100) >= self.probability {
                continue;
            }
            // Splitting the entry moves its allocas below the header, so the
            // opaque load must come from a global there.
            let allocas_usable = target != entry;
            let bogus = self.make_bogus_block(f, target);
            self.add_bogus_flow(module, f, target, bogus, &allocas, allocas_usable);
            changed = true;
        }
        if changed {
            log::debug!("added bogus flow to '{}'", f.name);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_ir::interp::{Machine, RtVal};
    use veil_ir::verify_module;

    fn run_at(prob: u32, module: &mut Module, f: &mut Function) -> bool {
        BogusFlowPass::new(prob).run_on_function(module, f)
    }

    #[test]
    fn test_opaque_predicate_is_always_true() {
        let check = |x: i32| {
            let prod = x.wrapping_mul(x.wrapping_add(1));
            assert_eq!(prod.wrapping_rem(2), 0, "predicate failed for {x}");
        };
        for x in [0, 1, -1, 2, i32::MAX, i32::MIN, i32::MAX - 1, i32::MIN + 1] {
            check(x);
        }
        let mut rng = StdRng::from_entropy();
        for _ in 0..1_000_000 {
            check(rng.gen());
        }
    }

    #[test]
    fn test_single_block_diamond() {
        // entry: ret 0, obfuscated unconditionally.
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![], Type::I32);
        let entry = f.add_block("entry");
        f.set_terminator(entry, Terminator::Ret(Some(Value::const_i32(0))));

        assert!(run_at(100, &mut m, &mut f));
        assert_eq!(f.num_blocks(), 4);

        // Header ends in a conditional branch with the twin on the false edge.
        let (body, bogus) = match f.block(entry).terminator.as_ref().unwrap() {
            Terminator::CondBr { then_dest, else_dest, .. } => (*then_dest, *else_dest),
            other => panic!("expected guarded branch, got {other:?}"),
        };

        // The twin: at least one predecessor, exactly one successor.
        assert!(!f.predecessors(bogus).is_empty());
        assert_eq!(f.successors(bogus).len(), 1);
        assert_eq!(f.successors(bogus)[0], body);

        // Body re-checks the predicate; its true edge carries the return.
        let tail = match f.block(body).terminator.as_ref().unwrap() {
            Terminator::CondBr { then_dest, else_dest, .. } => {
                assert_eq!(*else_dest, bogus);
                *then_dest
            }
            other => panic!("expected guarded branch, got {other:?}"),
        };
        assert!(matches!(
            f.block(tail).terminator,
            Some(Terminator::Ret(Some(Value::Constant(Constant::Int { value: 0, .. }))))
        ));

        // The fallback opaque global was minted in the module.
        assert_eq!(m.globals.len(), 1);
        assert!(!m.global(veil_ir::GlobalId(0)).is_constant);

        m.add_function(f);
        verify_module(&m).unwrap();
        let mut machine = Machine::new(&m);
        assert_eq!(machine.call("f", &[]).unwrap(), Some(RtVal::i32(0)));
    }

    #[test]
    fn test_prefers_existing_stack_slot() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::I32], Type::I32);
        let entry = f.add_block("entry");
        let slot = f.append_inst(entry, InstKind::Alloca { allocated: Type::I32 }, Type::Ptr);
        f.append_inst(
            entry,
            InstKind::Store { value: Value::Argument(0), ptr: Value::Inst(slot) },
            Type::Void,
        );
        let exit = f.add_block("exit");
        f.set_terminator(entry, Terminator::Br(exit));
        let v = f.append_inst(exit, InstKind::Load { ptr: Value::Inst(slot) }, Type::I32);
        f.set_terminator(exit, Terminator::Ret(Some(Value::Inst(v))));

        // Force obfuscation of every block; the non-entry block must read
        // its opaque value from the existing slot, not a new global.
        assert!(run_at(100, &mut m, &mut f));
        let loads_from_slot = f
            .block_ids()
            .iter()
            .flat_map(|&b| f.block(b).insts.clone())
            .filter(|&i| {
                matches!(&f.inst(i).kind, InstKind::Load { ptr } if ptr.as_inst() == Some(slot))
            })
            .count();
        assert!(loads_from_slot >= 2);

        m.add_function(f);
        verify_module(&m).unwrap();
        let mut machine = Machine::new(&m);
        assert_eq!(machine.call("f", &[RtVal::i32(9)]).unwrap(), Some(RtVal::i32(9)));
    }

    #[test]
    fn test_zero_probability_is_identity() {
        let mut m = veil_ir::synth::synth_module(3);
        let before = m.clone();
        let mut f = std::mem::replace(
            &mut m.functions[0],
            Function::new("", vec![], Type::Void),
        );
        assert!(!run_at(0, &mut m, &mut f));
        m.functions[0] = f;
        assert_eq!(before, m);
    }

    #[test]
    fn test_synth_corpus() {
        for seed in 0..40 {
            let original = veil_ir::synth::synth_module(seed);
            let mut obfuscated = original.clone();
            let mut f = std::mem::replace(
                &mut obfuscated.functions[0],
                Function::new("", vec![], Type::Void),
            );
            run_at(100, &mut obfuscated, &mut f);
            obfuscated.functions[0] = f;
            verify_module(&obfuscated).unwrap_or_else(|e| panic!("seed {seed}: {e}"));

            for (a, b) in [(2, 2), (-8, 19), (i32::MIN, -1)] {
                let args = [RtVal::i32(a), RtVal::i32(b)];
                let want = Machine::new(&original).call("synth", &args).unwrap();
                let got = Machine::new(&obfuscated).call("synth", &args).unwrap();
                assert_eq!(want, got, "seed {seed} diverged on ({a}, {b})");
            }
        }
    }
}
