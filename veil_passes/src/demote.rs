//! SSA-to-stack demotion
//!
//! Moves every value that crosses a block boundary into an entry-block
//! stack slot, and lowers phi nodes to per-predecessor stores. Flattening
//! depends on this: tearing the CFG apart moves definitions into distinct
//! switch arms, and only memory traffic survives that.

use veil_ir::{BlockId, Function, InstId, InstKind, Type, Value};

/// Demote escaping values and phi nodes; returns how many were lowered.
pub fn demote_to_stack(f: &mut Function) -> usize {
    let entry = f.entry();

    // Values whose uses escape their defining block, or feed a phi.
    let mut worklist: Vec<(BlockId, InstId)> = Vec::new();
    for b in f.block_ids() {
        for &i in &f.block(b).insts {
            let data = f.inst(i);
            if data.ty == Type::Void {
                continue;
            }
            // Entry-block allocas are the slots themselves.
            if matches!(data.kind, InstKind::Alloca { .. }) && b == entry {
                continue;
            }
            if value_escapes(f, b, i) {
                worklist.push((b, i));
            }
        }
    }
    let mut demoted = worklist.len();
    for (block, inst) in worklist {
        demote_value(f, entry, block, inst);
    }

    // Now every phi, whether it escaped or not.
    let mut phis: Vec<(BlockId, InstId)> = Vec::new();
    for b in f.block_ids() {
        for &i in &f.block(b).insts {
            if f.inst(i).kind.is_phi() {
                phis.push((b, i));
            }
        }
    }
    demoted += phis.len();
    for (block, phi) in phis {
        demote_phi(f, entry, block, phi);
    }
    demoted
}

fn value_escapes(f: &Function, def_block: BlockId, def: InstId) -> bool {
    for b in f.block_ids() {
        for &i in &f.block(b).insts {
            let user = f.inst(i);
            let uses_def = user.kind.values().iter().any(|v| v.as_inst() == Some(def));
            if uses_def && (b != def_block || user.kind.is_phi()) {
                return true;
            }
        }
        if b != def_block {
            if let Some(term) = &f.block(b).terminator {
                if term.values().iter().any(|v| v.as_inst() == Some(def)) {
                    return true;
                }
            }
        }
    }
    false
}

/// Give `def` a stack slot: store its result right after the definition and
/// reload it at every use site.
fn demote_value(f: &mut Function, entry: BlockId, def_block: BlockId, def: InstId) {
    let ty = f.inst(def).ty.clone();
    let slot = f.insert_inst(entry, 0, InstKind::Alloca { allocated: ty.clone() }, Type::Ptr);

    // Collect use sites before touching anything.
    let mut inst_users: Vec<(BlockId, InstId)> = Vec::new();
    let mut term_users: Vec<BlockId> = Vec::new();
    for b in f.block_ids() {
        for &i in &f.block(b).insts {
            if f.inst(i).kind.values().iter().any(|v| v.as_inst() == Some(def)) {
                inst_users.push((b, i));
            }
        }
        if let Some(term) = &f.block(b).terminator {
            if term.values().iter().any(|v| v.as_inst() == Some(def)) {
                term_users.push(b);
            }
        }
    }

    for (b, user) in inst_users {
        if f.inst(user).kind.is_phi() {
            // The value is consumed on the incoming edge; reload it at the
            // end of each predecessor that carries it.
            let incoming = match &f.inst(user).kind {
                InstKind::Phi { incoming } => incoming.clone(),
                _ => unreachable!(),
            };
            for (idx, (v, pred)) in incoming.iter().enumerate() {
                if v.as_inst() != Some(def) {
                    continue;
                }
                let end = f.block(*pred).insts.len();
                let load = f.insert_inst(*pred, end, InstKind::Load { ptr: Value::Inst(slot) }, ty.clone());
                if let InstKind::Phi { incoming } = &mut f.inst_mut(user).kind {
                    incoming[idx].0 = Value::Inst(load);
                }
            }
        } else {
            let at = f.position_of(b, user).expect("user in block");
            let load = f.insert_inst(b, at, InstKind::Load { ptr: Value::Inst(slot) }, ty.clone());
            replace_in_inst(f, user, def, Value::Inst(load));
        }
    }
    for b in term_users {
        let end = f.block(b).insts.len();
        let load = f.insert_inst(b, end, InstKind::Load { ptr: Value::Inst(slot) }, ty.clone());
        let to = Value::Inst(load);
        if let Some(term) = &mut f.block_mut(b).terminator {
            for v in term.values_mut() {
                if v.as_inst() == Some(def) {
                    *v = to.clone();
                }
            }
        }
    }

    // The store goes after the definition, or after the phi group when the
    // definition is itself a phi.
    let store_at = if f.inst(def).kind.is_phi() {
        f.first_non_phi(def_block)
    } else {
        f.position_of(def_block, def).expect("definition in block") + 1
    };
    f.insert_inst(
        def_block,
        store_at,
        InstKind::Store { value: Value::Inst(def), ptr: Value::Inst(slot) },
        Type::Void,
    );
}

fn replace_in_inst(f: &mut Function, user: InstId, from: InstId, to: Value) {
    for v in f.inst_mut(user).kind.values_mut() {
        if v.as_inst() == Some(from) {
            *v = to.clone();
        }
    }
}

/// Lower a phi to a slot: each predecessor stores its incoming value before
/// branching, and a load at the head of the block replaces the phi.
fn demote_phi(f: &mut Function, entry: BlockId, block: BlockId, phi: InstId) {
    let ty = f.inst(phi).ty.clone();
    let incoming = match &f.inst(phi).kind {
        InstKind::Phi { incoming } => incoming.clone(),
        _ => unreachable!("demote_phi on a non-phi"),
    };
    let slot = f.insert_inst(entry, 0, InstKind::Alloca { allocated: ty.clone() }, Type::Ptr);

    for (v, pred) in incoming {
        let end = f.block(pred).insts.len();
        f.insert_inst(
            pred,
            end,
            InstKind::Store { value: v, ptr: Value::Inst(slot) },
            Type::Void,
        );
    }

    let at = f.first_non_phi(block);
    let load = f.insert_inst(block, at, InstKind::Load { ptr: Value::Inst(slot) }, ty);
    f.replace_all_uses(phi, Value::Inst(load));
    f.erase_inst(block, phi);
}
