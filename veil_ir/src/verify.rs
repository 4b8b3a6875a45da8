//! Structural and SSA verification
//!
//! Checks the invariants every pass must preserve: one terminator per block,
//! phi lists matching predecessor sets, dominance of every use, and type
//! well-formedness. A verifier failure after a pass is a bug in the pass.

use crate::function::Function;
use crate::inst::{InstKind, Terminator};
use crate::module::Module;
use crate::types::Type;
use crate::value::{BlockId, Constant, InstId, Value};
use hashbrown::{HashMap, HashSet};
use veil_common::{VeilError, VeilResult};

/// Verify a whole module.
pub fn verify_module(module: &Module) -> VeilResult<()> {
    let mut names = HashSet::new();
    for g in &module.globals {
        if !names.insert(g.name.as_str()) {
            return Err(VeilError::verify(format!("duplicate global name '{}'", g.name)));
        }
    }
    let mut fnames = HashSet::new();
    for f in &module.functions {
        if !fnames.insert(f.name.as_str()) {
            return Err(VeilError::verify(format!("duplicate function name '{}'", f.name)));
        }
    }
    for d in &module.declarations {
        if fnames.contains(d.name.as_str()) {
            return Err(VeilError::verify(format!(
                "declaration '{}' shadows a defined function",
                d.name
            )));
        }
    }
    for f in &module.functions {
        verify_function(module, f)
            .map_err(|e| VeilError::verify(format!("in function '{}': {e}", f.name)))?;
    }
    Ok(())
}

/// Verify one function against the module it lives in.
pub fn verify_function(module: &Module, f: &Function) -> VeilResult<()> {
    if f.num_blocks() == 0 {
        return Err(VeilError::verify("function has no blocks"));
    }

    let placement = check_structure(f)?;
    check_phis(f)?;
    let doms = Dominators::compute(f);
    check_types(module, f)?;
    check_dominance(f, &placement, &doms)?;
    Ok(())
}

/// Where each instruction lives: (block, position).
type Placement = HashMap<InstId, (BlockId, usize)>;

fn check_structure(f: &Function) -> VeilResult<Placement> {
    let layout: HashSet<BlockId> = f.block_ids().into_iter().collect();
    let mut placement = Placement::new();

    for b in f.block_ids() {
        let block = f.block(b);
        let mut seen_non_phi = false;
        for (pos, &i) in block.insts.iter().enumerate() {
            let data = f.inst(i);
            if data.is_erased() {
                return Err(VeilError::verify(format!(
                    "block '{}' lists erased instruction",
                    block.name
                )));
            }
            if placement.insert(i, (b, pos)).is_some() {
                return Err(VeilError::verify("instruction placed in more than one block"));
            }
            if data.kind.is_phi() {
                if seen_non_phi {
                    return Err(VeilError::verify(format!(
                        "phi node after non-phi in block '{}'",
                        block.name
                    )));
                }
            } else {
                seen_non_phi = true;
            }
        }
        let term = block.terminator.as_ref().ok_or_else(|| {
            VeilError::verify(format!("block '{}' has no terminator", block.name))
        })?;
        for succ in term.successors() {
            if !layout.contains(&succ) {
                return Err(VeilError::verify(format!(
                    "block '{}' branches to a block outside the function",
                    block.name
                )));
            }
        }
        if let Terminator::Switch { cases, .. } = term {
            let mut keys = HashSet::new();
            for (k, _) in cases {
                if !keys.insert(*k) {
                    return Err(VeilError::verify(format!(
                        "switch in block '{}' has duplicate case key {k}",
                        block.name
                    )));
                }
            }
        }
    }
    Ok(placement)
}

fn check_phis(f: &Function) -> VeilResult<()> {
    for b in f.block_ids() {
        let preds = f.predecessors(b);
        for &i in &f.block(b).insts {
            if let InstKind::Phi { incoming } = &f.inst(i).kind {
                let mut seen = HashSet::new();
                for (_, pred) in incoming {
                    if !seen.insert(*pred) {
                        return Err(VeilError::verify(format!(
                            "phi in block '{}' has duplicate entry for a predecessor",
                            f.block(b).name
                        )));
                    }
                    if !preds.contains(pred) {
                        return Err(VeilError::verify(format!(
                            "phi in block '{}' names a non-predecessor",
                            f.block(b).name
                        )));
                    }
                }
                for pred in &preds {
                    if !seen.contains(pred) {
                        return Err(VeilError::verify(format!(
                            "phi in block '{}' is missing an entry for a predecessor",
                            f.block(b).name
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Type of a value in the context of a function and module.
pub fn type_of(module: &Module, f: &Function, value: &Value) -> VeilResult<Type> {
    match value {
        Value::Constant(c) => {
            if let Some(g) = c.pointee_global() {
                if g.0 as usize >= module.globals.len() {
                    return Err(VeilError::verify("constant references unknown global"));
                }
            }
            Ok(c.ty())
        }
        Value::Argument(i) => f
            .params
            .get(*i)
            .cloned()
            .ok_or_else(|| VeilError::verify(format!("argument index {i} out of range"))),
        Value::Inst(id) => {
            let data = f.inst(*id);
            if data.is_erased() {
                return Err(VeilError::verify("use of erased instruction"));
            }
            Ok(data.ty.clone())
        }
    }
}

fn check_types(module: &Module, f: &Function) -> VeilResult<()> {
    for b in f.block_ids() {
        for &i in &f.block(b).insts {
            let data = f.inst(i);
            match &data.kind {
                InstKind::Binary { op, lhs, rhs } => {
                    let lt = type_of(module, f, lhs)?;
                    let rt = type_of(module, f, rhs)?;
                    if lt != rt || lt != data.ty {
                        return Err(VeilError::verify("binary operand/result type mismatch"));
                    }
                    if op.is_integer() && !lt.is_integer() {
                        return Err(VeilError::verify("integer opcode on non-integer type"));
                    }
                    if op.is_float() && !lt.is_float() {
                        return Err(VeilError::verify("float opcode on non-float type"));
                    }
                }
                InstKind::ICmp { lhs, rhs, .. } => {
                    let lt = type_of(module, f, lhs)?;
                    let rt = type_of(module, f, rhs)?;
                    if lt != rt {
                        return Err(VeilError::verify("icmp operand type mismatch"));
                    }
                    if !(lt.is_integer() || lt == Type::Ptr) {
                        return Err(VeilError::verify("icmp on non-integer type"));
                    }
                    if data.ty != Type::I1 {
                        return Err(VeilError::verify("icmp result must be i1"));
                    }
                }
                InstKind::Alloca { .. } => {
                    if data.ty != Type::Ptr {
                        return Err(VeilError::verify("alloca result must be ptr"));
                    }
                }
                InstKind::Load { ptr } => {
                    if type_of(module, f, ptr)? != Type::Ptr {
                        return Err(VeilError::verify("load address must be ptr"));
                    }
                    if data.ty == Type::Void {
                        return Err(VeilError::verify("load result cannot be void"));
                    }
                }
                InstKind::Store { value, ptr } => {
                    type_of(module, f, value)?;
                    if type_of(module, f, ptr)? != Type::Ptr {
                        return Err(VeilError::verify("store address must be ptr"));
                    }
                    if data.ty != Type::Void {
                        return Err(VeilError::verify("store has no result"));
                    }
                }
                InstKind::Call { callee, args } => {
                    check_call(module, f, callee, args, &data.ty)?;
                }
                InstKind::Select { cond, if_true, if_false } => {
                    if type_of(module, f, cond)? != Type::I1 {
                        return Err(VeilError::verify("select condition must be i1"));
                    }
                    let tt = type_of(module, f, if_true)?;
                    let ft = type_of(module, f, if_false)?;
                    if tt != ft || tt != data.ty {
                        return Err(VeilError::verify("select arm/result type mismatch"));
                    }
                }
                InstKind::Phi { incoming } => {
                    for (v, _) in incoming {
                        if type_of(module, f, v)? != data.ty {
                            return Err(VeilError::verify("phi incoming type mismatch"));
                        }
                    }
                }
            }
        }
        match f.block(b).terminator.as_ref().expect("checked") {
            Terminator::Ret(v) => {
                let ty = match v {
                    Some(v) => type_of(module, f, v)?,
                    None => Type::Void,
                };
                if ty != f.ret {
                    return Err(VeilError::verify("return type mismatch"));
                }
            }
            Terminator::Br(_) | Terminator::Unreachable => {}
            Terminator::CondBr { cond, .. } => {
                if type_of(module, f, cond)? != Type::I1 {
                    return Err(VeilError::verify("branch condition must be i1"));
                }
            }
            Terminator::Switch { value, .. } => {
                if type_of(module, f, value)? != Type::I32 {
                    return Err(VeilError::verify("switch scrutinee must be i32"));
                }
            }
            Terminator::Invoke { callee, args, .. } => {
                check_call(module, f, callee, args, &Type::Void)?;
            }
        }
    }
    Ok(())
}

fn check_call(
    module: &Module,
    f: &Function,
    callee: &str,
    args: &[Value],
    result: &Type,
) -> VeilResult<()> {
    let (params, ret) = module
        .callee_signature(callee)
        .ok_or_else(|| VeilError::verify(format!("call to unknown function '{callee}'")))?;
    if params.len() != args.len() {
        return Err(VeilError::verify(format!("call to '{callee}' with wrong arity")));
    }
    for (arg, param) in args.iter().zip(&params) {
        if &type_of(module, f, arg)? != param {
            return Err(VeilError::verify(format!("call to '{callee}' with mismatched argument type")));
        }
    }
    // An invoke result is not modeled; only direct calls check the result.
    if result != &Type::Void && result != &ret {
        return Err(VeilError::verify(format!("call to '{callee}' with mismatched result type")));
    }
    Ok(())
}

/// Dominator tree over the reachable portion of a function's CFG.
pub struct Dominators {
    idom: HashMap<BlockId, BlockId>,
    rpo_index: HashMap<BlockId, usize>,
}

impl Dominators {
    /// Iterative dataflow construction over a reverse post-order.
    pub fn compute(f: &Function) -> Self {
        let entry = f.entry();
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // Iterative post-order DFS.
        let mut stack = vec![(entry, 0usize)];
        visited.insert(entry);
        while let Some((b, i)) = stack.pop() {
            let succs = f.successors(b);
            if i < succs.len() {
                stack.push((b, i + 1));
                let s = succs[i];
                if visited.insert(s) {
                    stack.push((s, 0));
                }
            } else {
                order.push(b);
            }
        }
        order.reverse();
        let rpo_index: HashMap<BlockId, usize> =
            order.iter().enumerate().map(|(i, b)| (*b, i)).collect();

        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        idom.insert(entry, entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in order.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for p in f.predecessors(b) {
                    if !idom.contains_key(&p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => Self::intersect(&idom, &rpo_index, p, cur),
                    });
                }
                if let Some(n) = new_idom {
                    if idom.get(&b) != Some(&n) {
                        idom.insert(b, n);
                        changed = true;
                    }
                }
            }
        }
        Self { idom, rpo_index }
    }

    fn intersect(
        idom: &HashMap<BlockId, BlockId>,
        rpo: &HashMap<BlockId, usize>,
        mut a: BlockId,
        mut b: BlockId,
    ) -> BlockId {
        while a != b {
            while rpo[&a] > rpo[&b] {
                a = idom[&a];
            }
            while rpo[&b] > rpo[&a] {
                b = idom[&b];
            }
        }
        a
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.rpo_index.contains_key(&b)
    }

    /// Whether `a` dominates `b`. Both must be reachable.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            let up = self.idom[&cur];
            if up == cur {
                return false;
            }
            cur = up;
        }
    }
}

fn check_dominance(f: &Function, placement: &Placement, doms: &Dominators) -> VeilResult<()> {
    let def_site = |v: &Value| -> Option<(BlockId, usize)> {
        v.as_inst().and_then(|id| placement.get(&id).copied())
    };

    for b in f.block_ids() {
        // Dominance is only meaningful on reachable blocks.
        if !doms.is_reachable(b) {
            continue;
        }
        let block = f.block(b);
        for (pos, &i) in block.insts.iter().enumerate() {
            match &f.inst(i).kind {
                InstKind::Phi { incoming } => {
                    // A phi use must be available at the end of the incoming edge.
                    // Edges from unreachable predecessors carry no obligation.
                    for (v, pred) in incoming {
                        if !doms.is_reachable(*pred) {
                            continue;
                        }
                        if let Some((db, _)) = def_site(v) {
                            if db != *pred && !doms.dominates(db, *pred) {
                                return Err(VeilError::verify(format!(
                                    "phi incoming value does not dominate edge into '{}'",
                                    block.name
                                )));
                            }
                        }
                    }
                }
                kind => {
                    for v in kind.values() {
                        check_use(f, doms, &def_site(v), b, pos, &block.name)?;
                    }
                }
            }
        }
        if let Some(term) = &block.terminator {
            for v in term.values() {
                check_use(f, doms, &def_site(v), b, block.insts.len(), &block.name)?;
            }
        }
    }
    Ok(())
}

fn check_use(
    f: &Function,
    doms: &Dominators,
    def: &Option<(BlockId, usize)>,
    use_block: BlockId,
    use_pos: usize,
    block_name: &str,
) -> VeilResult<()> {
    let Some((def_block, def_pos)) = def else {
        return Ok(());
    };
    let ok = if *def_block == use_block {
        // A phi definition is available from block entry.
        *def_pos < use_pos || f.inst(f.block(use_block).insts[*def_pos]).kind.is_phi()
    } else {
        doms.dominates(*def_block, use_block)
    };
    if ok {
        Ok(())
    } else {
        Err(VeilError::verify(format!(
            "use in block '{block_name}' is not dominated by its definition"
        )))
    }
}
