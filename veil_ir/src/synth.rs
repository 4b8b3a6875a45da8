//! Synthetic module generation
//!
//! Seed-driven construction of small, verifier-clean functions with
//! arithmetic, diamonds, loops, and phi nodes. The property tests run the
//! passes over this corpus; the benches feed on it too.

use crate::function::Function;
use crate::inst::{BinOp, InstKind, IntPredicate, Terminator};
use crate::module::{GlobalVariable, Initializer, Linkage, Module};
use crate::types::Type;
use crate::value::{BlockId, Constant, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A module holding one function `synth(i32, i32) -> i32` built from the seed.
pub fn synth_module(seed: u64) -> Module {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut m = Module::new(format!("synth.{seed}"));
    m.add_function(synth_function(&mut rng));
    m
}

/// Like [`synth_module`], plus a private string global with a single
/// `puts` use in a second function `greet()`.
pub fn synth_module_with_string(seed: u64) -> Module {
    let mut m = synth_module(seed);
    m.get_or_insert_declaration("puts", vec![Type::Ptr], Type::I32);
    let text = b"tell nobody\0";
    let g = m.add_global(GlobalVariable {
        name: "msg".to_string(),
        ty: Type::bytes(text.len() as u64),
        linkage: Linkage::Private,
        is_constant: true,
        init: Some(Initializer::Bytes(text.to_vec())),
    });

    let mut f = Function::new("greet", vec![], Type::Void);
    let entry = f.add_block("entry");
    f.append_inst(
        entry,
        InstKind::Call {
            callee: "puts".to_string(),
            args: vec![Value::Constant(Constant::ElementPtr { global: g, offset: 0 })],
        },
        Type::I32,
    );
    f.set_terminator(entry, Terminator::Ret(None));
    m.add_function(f);
    m
}

fn synth_function(rng: &mut StdRng) -> Function {
    let mut f = Function::new("synth", vec![Type::I32, Type::I32], Type::I32);
    let entry = f.add_block("entry");
    let mut pool: Vec<Value> = vec![Value::Argument(0), Value::Argument(1)];
    let mut cur = entry;

    // An occasional i32 stack slot, so bogus-flow obfuscation sometimes
    // finds one to draw its opaque value from.
    if rng.gen_bool(0.5) {
        let slot = f.append_inst(cur, InstKind::Alloca { allocated: Type::I32 }, Type::Ptr);
        let init = operand(rng, &pool);
        f.append_inst(cur, InstKind::Store { value: init, ptr: Value::Inst(slot) }, Type::Void);
    }

    for segment in 0..rng.gen_range(1..=3) {
        match rng.gen_range(0..3) {
            0 => straight_line(rng, &mut f, cur, &mut pool),
            1 => cur = diamond(rng, &mut f, cur, &mut pool, segment),
            _ => cur = counted_loop(rng, &mut f, cur, &mut pool, segment),
        }
    }

    let a = operand(rng, &pool);
    let b = operand(rng, &pool);
    let result = f.append_inst(
        cur,
        InstKind::Binary { op: BinOp::Xor, lhs: a, rhs: b },
        Type::I32,
    );
    f.set_terminator(cur, Terminator::Ret(Some(Value::Inst(result))));
    f
}

fn rand_op(rng: &mut StdRng) -> BinOp {
    const OPS: [BinOp; 7] =
        [BinOp::Add, BinOp::Sub, BinOp::Mul, BinOp::And, BinOp::Or, BinOp::Xor, BinOp::Shl];
    OPS[rng.gen_range(0..OPS.len())]
}

fn operand(rng: &mut StdRng, pool: &[Value]) -> Value {
    if rng.gen_bool(0.3) {
        Value::const_i32(rng.gen_range(-64..=64))
    } else {
        pool[rng.gen_range(0..pool.len())].clone()
    }
}

fn straight_line(rng: &mut StdRng, f: &mut Function, block: BlockId, pool: &mut Vec<Value>) {
    for _ in 0..rng.gen_range(1..=4) {
        let lhs = operand(rng, pool);
        let rhs = operand(rng, pool);
        let inst = f.append_inst(
            block,
            InstKind::Binary { op: rand_op(rng), lhs, rhs },
            Type::I32,
        );
        pool.push(Value::Inst(inst));
    }
}

fn diamond(
    rng: &mut StdRng,
    f: &mut Function,
    cur: BlockId,
    pool: &mut Vec<Value>,
    n: usize,
) -> BlockId {
    let lhs = operand(rng, pool);
    let rhs = operand(rng, pool);
    let cond = f.append_inst(
        cur,
        InstKind::ICmp { pred: IntPredicate::Slt, lhs, rhs },
        Type::I1,
    );
    let then_b = f.add_block(format!("then{n}"));
    let else_b = f.add_block(format!("else{n}"));
    let join = f.add_block(format!("join{n}"));
    f.set_terminator(
        cur,
        Terminator::CondBr { cond: Value::Inst(cond), then_dest: then_b, else_dest: else_b },
    );

    let arm = |f: &mut Function, block: BlockId, rng: &mut StdRng| -> Value {
        let mut scoped = pool.clone();
        for _ in 0..rng.gen_range(1..=2) {
            let lhs = operand(rng, &scoped);
            let rhs = operand(rng, &scoped);
            let inst = f.append_inst(
                block,
                InstKind::Binary { op: rand_op(rng), lhs, rhs },
                Type::I32,
            );
            scoped.push(Value::Inst(inst));
        }
        f.set_terminator(block, Terminator::Br(join));
        scoped.last().cloned().expect("arm produced a value")
    };
    let tv = arm(f, then_b, rng);
    let fv = arm(f, else_b, rng);

    let phi = f.append_inst(
        join,
        InstKind::Phi { incoming: vec![(tv, then_b), (fv, else_b)] },
        Type::I32,
    );
    pool.push(Value::Inst(phi));
    join
}

fn counted_loop(
    rng: &mut StdRng,
    f: &mut Function,
    cur: BlockId,
    pool: &mut Vec<Value>,
    n: usize,
) -> BlockId {
    let header = f.add_block(format!("header{n}"));
    let body = f.add_block(format!("body{n}"));
    let exit = f.add_block(format!("exit{n}"));
    let trips = rng.gen_range(1..=6);
    let init = operand(rng, pool);
    f.set_terminator(cur, Terminator::Br(header));

    // Incoming slots for the latch edge are patched once the body exists.
    let iphi = f.append_inst(
        header,
        InstKind::Phi { incoming: vec![(Value::const_i32(0), cur)] },
        Type::I32,
    );
    let aphi = f.append_inst(
        header,
        InstKind::Phi { incoming: vec![(init, cur)] },
        Type::I32,
    );
    let done = f.append_inst(
        header,
        InstKind::ICmp {
            pred: IntPredicate::Sge,
            lhs: Value::Inst(iphi),
            rhs: Value::const_i32(trips),
        },
        Type::I1,
    );
    f.set_terminator(
        header,
        Terminator::CondBr { cond: Value::Inst(done), then_dest: exit, else_dest: body },
    );

    let step = operand(rng, pool);
    let anext = f.append_inst(
        body,
        InstKind::Binary { op: rand_op(rng), lhs: Value::Inst(aphi), rhs: step },
        Type::I32,
    );
    let inc = f.append_inst(
        body,
        InstKind::Binary {
            op: BinOp::Add,
            lhs: Value::Inst(iphi),
            rhs: Value::const_i32(1),
        },
        Type::I32,
    );
    f.set_terminator(body, Terminator::Br(header));

    if let InstKind::Phi { incoming } = &mut f.inst_mut(iphi).kind {
        incoming.push((Value::Inst(inc), body));
    }
    if let InstKind::Phi { incoming } = &mut f.inst_mut(aphi).kind {
        incoming.push((Value::Inst(anext), body));
    }

    pool.push(Value::Inst(aphi));
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{Machine, RtVal};
    use crate::verify::verify_module;

    #[test]
    fn test_corpus_is_verifier_clean() {
        for seed in 0..200 {
            let m = synth_module(seed);
            verify_module(&m).unwrap_or_else(|e| panic!("seed {seed}: {e}"));
        }
    }

    #[test]
    fn test_corpus_executes() {
        for seed in 0..50 {
            let m = synth_module(seed);
            let mut machine = Machine::new(&m);
            machine
                .call("synth", &[RtVal::i32(3), RtVal::i32(-9)])
                .unwrap_or_else(|e| panic!("seed {seed}: {e}"));
        }
    }

    #[test]
    fn test_string_module_greets() {
        let m = synth_module_with_string(7);
        verify_module(&m).unwrap();
        let mut machine = Machine::new(&m);
        machine.call("greet", &[]).unwrap();
        assert_eq!(machine.output(), "tell nobody\n");
    }
}
