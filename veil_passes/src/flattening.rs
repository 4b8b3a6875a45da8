//! Control-flow flattening
//!
//! Dissolves a function's CFG into one dispatch loop: every original block
//! becomes a case of a switch on a stack-held state variable, and each
//! block picks its successor by storing the successor's case key.

use crate::demote::demote_to_stack;
use crate::FunctionPass;
use hashbrown::HashSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use veil_ir::{BlockId, Function, InstKind, Module, Terminator, Type, Value};

pub struct FlatteningPass {
    rng: StdRng,
}

impl Default for FlatteningPass {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatteningPass {
    pub fn new() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    /// A case key no other case in this function uses.
    fn fresh_key(&mut self, used: &mut HashSet<i32>) -> i32 {
        loop {
            let key = self.rng.gen::<i32>();
            if used.insert(key) {
                return key;
            }
        }
    }
}

impl FunctionPass for FlatteningPass {
    fn flag(&self) -> &'static str {
        "flattening"
    }

    fn description(&self) -> &'static str {
        "Control flow graph flattening"
    }

    fn run_on_function(&mut self, _module: &mut Module, f: &mut Function) -> bool {
        if f.num_blocks() <= 1 {
            return false;
        }
        // Exception edges cannot be routed through the dispatcher.
        for b in f.block_ids() {
            if matches!(&f.block(b).terminator, Some(t) if t.is_invoke()) {
                return false;
            }
        }

        let entry = f.entry();
        let mut origin: Vec<BlockId> = f.block_ids().into_iter().skip(1).collect();

        // The entry keeps only straight-line code; its terminator moves into
        // a new block that is dispatched like any other. An entry that ends
        // the function outright leaves every other block dead, and reviving
        // dead blocks through the dispatcher would change behavior.
        match &f.block(entry).terminator {
            Some(Terminator::Br(_) | Terminator::CondBr { .. } | Terminator::Switch { .. }) => {
                let split = f.split_block(entry, f.block(entry).insts.len());
                origin.insert(0, split);
            }
            _ => return false,
        }

        f.take_terminator(entry);

        let loop_entry = f.add_block("loopEntry");
        let loop_end = f.add_block("loopEnd");
        let sw_default = f.add_block("switchDefault");

        // Switch variable lives in the entry block.
        let sw_ptr = f.append_inst(entry, InstKind::Alloca { allocated: Type::I32 }, Type::Ptr);
        let placeholder = self.rng.gen::<i32>();
        let first_store = f.append_inst(
            entry,
            InstKind::Store { value: Value::const_i32(placeholder), ptr: Value::Inst(sw_ptr) },
            Type::Void,
        );
        f.set_terminator(entry, Terminator::Br(loop_entry));

        let sw_var = f.append_inst(loop_entry, InstKind::Load { ptr: Value::Inst(sw_ptr) }, Type::I32);
        f.set_terminator(sw_default, Terminator::Br(loop_entry));
        f.set_terminator(loop_end, Terminator::Br(loop_entry));

        // Hand every original block a fresh random key.
        let mut used_keys = HashSet::new();
        let mut cases = Vec::with_capacity(origin.len());
        for &b in &origin {
            f.move_block_before(b, loop_end);
            cases.push((self.fresh_key(&mut used_keys), b));
        }
        f.set_terminator(
            loop_entry,
            Terminator::Switch { value: Value::Inst(sw_var), default: sw_default, cases },
        );
        let case_for = |f: &Function, dest: BlockId| -> Option<i32> {
            f.block(loop_entry).terminator.as_ref().and_then(|t| t.switch_case_for(dest))
        };

        // Reroute each block through the dispatcher.
        for &b in &origin {
            let term = f.block(b).terminator.clone().expect("original block has terminator");
            match term {
                Terminator::Br(succ) => {
                    let key = match case_for(f, succ) {
                        Some(k) => k,
                        None => self.fresh_key(&mut used_keys),
                    };
                    f.take_terminator(b);
                    let end = f.block(b).insts.len();
                    f.insert_inst(
                        b,
                        end,
                        InstKind::Store { value: Value::const_i32(key), ptr: Value::Inst(sw_ptr) },
                        Type::Void,
                    );
                    f.set_terminator(b, Terminator::Br(loop_end));
                }
                Terminator::CondBr { cond, then_dest, else_dest } => {
                    let key_t = match case_for(f, then_dest) {
                        Some(k) => k,
                        None => self.fresh_key(&mut used_keys),
                    };
                    let key_f = match case_for(f, else_dest) {
                        Some(k) => k,
                        None => self.fresh_key(&mut used_keys),
                    };
                    f.take_terminator(b);
                    let end = f.block(b).insts.len();
                    let sel = f.insert_inst(
                        b,
                        end,
                        InstKind::Select {
                            cond,
                            if_true: Value::const_i32(key_t),
                            if_false: Value::const_i32(key_f),
                        },
                        Type::I32,
                    );
                    f.insert_inst(
                        b,
                        end + 1,
                        InstKind::Store { value: Value::Inst(sel), ptr: Value::Inst(sw_ptr) },
                        Type::Void,
                    );
                    f.set_terminator(b, Terminator::Br(loop_end));
                }
                // Returns and unreachables stay; an inner switch keeps its
                // direct edges and merely bypasses the dispatcher.
                _ => {}
            }
        }

        // Execution starts at the first original block.
        let first_key = case_for(f, origin[0]).expect("first block has a case");
        f.inst_mut(first_store).kind = InstKind::Store {
            value: Value::const_i32(first_key),
            ptr: Value::Inst(sw_ptr),
        };

        let demoted = demote_to_stack(f);
        log::debug!(
            "flattened '{}': {} dispatched blocks, {} values demoted",
            f.name,
            origin.len(),
            demoted
        );
        true
    }
}
