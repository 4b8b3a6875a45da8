//! Functions, basic blocks, and the surgery the passes rely on

use crate::inst::{InstData, InstKind, Terminator};
use crate::types::Type;
use crate::value::{BlockId, InstId, Value};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A basic block: ordered instructions plus one terminator.
///
/// The terminator is `None` only transiently, while a pass rewires control
/// flow. The verifier rejects a function that leaves it unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
    pub terminator: Option<Terminator>,
}

impl Block {
    fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), insts: Vec::new(), terminator: None }
    }
}

/// A function: a typed signature and an ordered, non-empty list of blocks.
///
/// Blocks and instructions live in arenas addressed by dense ids; `layout`
/// holds the block order and its first entry is the function entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    insts: Vec<InstData>,
    blocks: Vec<Block>,
    layout: Vec<BlockId>,
}

impl Function {
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        Self { name: name.into(), params, ret, insts: Vec::new(), blocks: Vec::new(), layout: Vec::new() }
    }

    /// The entry block. Panics on an empty function.
    pub fn entry(&self) -> BlockId {
        self.layout[0]
    }

    pub fn num_blocks(&self) -> usize {
        self.layout.len()
    }

    /// Block ids in layout order. Snapshot, safe to hold across mutation.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.layout.clone()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn inst(&self, id: InstId) -> &InstData {
        &self.insts[id.0 as usize]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut InstData {
        &mut self.insts[id.0 as usize]
    }

    /// Append a fresh block at the end of the layout.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(name));
        self.layout.push(id);
        id
    }

    /// Create an instruction in the arena without placing it in a block.
    pub fn create_inst(&mut self, data: InstData) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(data);
        id
    }

    /// Create an instruction and append it at the end of `block`, before the
    /// terminator position.
    pub fn append_inst(&mut self, block: BlockId, kind: InstKind, ty: Type) -> InstId {
        let id = self.create_inst(InstData::new(kind, ty));
        self.block_mut(block).insts.push(id);
        id
    }

    /// Create an instruction and insert it at `index` within `block`.
    pub fn insert_inst(&mut self, block: BlockId, index: usize, kind: InstKind, ty: Type) -> InstId {
        let id = self.create_inst(InstData::new(kind, ty));
        self.block_mut(block).insts.insert(index, id);
        id
    }

    /// Remove `inst` from `block` and tombstone it in the arena.
    pub fn erase_inst(&mut self, block: BlockId, inst: InstId) {
        self.block_mut(block).insts.retain(|i| *i != inst);
        self.inst_mut(inst).erased = true;
    }

    pub fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        self.block_mut(block).terminator = Some(term);
    }

    /// Detach and return the terminator of `block`.
    pub fn take_terminator(&mut self, block: BlockId) -> Option<Terminator> {
        self.block_mut(block).terminator.take()
    }

    /// Position of `inst` within `block`, if present.
    pub fn position_of(&self, block: BlockId, inst: InstId) -> Option<usize> {
        self.block(block).insts.iter().position(|i| *i == inst)
    }

    /// Successor blocks of `block`.
    pub fn successors(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        match &self.block(block).terminator {
            Some(term) => term.successors(),
            None => SmallVec::new(),
        }
    }

    /// Deduplicated predecessor set of `block`, in layout order.
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        let mut preds = Vec::new();
        for &b in &self.layout {
            if self.successors(b).contains(&block) && !preds.contains(&b) {
                preds.push(b);
            }
        }
        preds
    }

    /// Index of the first instruction in `block` that is not a phi node.
    pub fn first_non_phi(&self, block: BlockId) -> usize {
        let b = self.block(block);
        b.insts
            .iter()
            .position(|&i| !self.inst(i).kind.is_phi())
            .unwrap_or(b.insts.len())
    }

    /// Reposition `block` in the layout so it sits immediately before
    /// `before`. The entry block cannot be moved.
    pub fn move_block_before(&mut self, block: BlockId, before: BlockId) {
        assert_ne!(block, self.entry(), "cannot reorder the entry block");
        self.layout.retain(|b| *b != block);
        let at = self
            .layout
            .iter()
            .position(|b| *b == before)
            .expect("target block not in layout");
        self.layout.insert(at, block);
    }

    /// Split `block` before the instruction at `at`.
    ///
    /// The original block keeps its id, its name, and the instructions before
    /// `at`, and is terminated with a branch to the new block. The new block
    /// receives the remaining instructions and the original terminator. Phi
    /// nodes in the terminator's successors that named `block` as an incoming
    /// edge are retargeted to the new block, since control now arrives from
    /// there.
    pub fn split_block(&mut self, block: BlockId, at: usize) -> BlockId {
        let name = format!("{}.split", self.block(block).name);
        let new_id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(name));

        let tail: Vec<InstId> = self.block_mut(block).insts.split_off(at);
        let term = self.block_mut(block).terminator.take();
        let new_block = self.block_mut(new_id);
        new_block.insts = tail;
        new_block.terminator = term;

        // New block goes right after the original in the layout.
        let pos = self
            .layout
            .iter()
            .position(|b| *b == block)
            .expect("block not in layout");
        self.layout.insert(pos + 1, new_id);

        self.set_terminator(block, Terminator::Br(new_id));

        for succ in self.successors(new_id) {
            self.retarget_phis(succ, block, new_id);
        }
        new_id
    }

    /// Rewrite phi incoming-block slots in `block` from `old_pred` to `new_pred`.
    pub fn retarget_phis(&mut self, block: BlockId, old_pred: BlockId, new_pred: BlockId) {
        for inst in self.block(block).insts.clone() {
            if let InstKind::Phi { incoming } = &mut self.inst_mut(inst).kind {
                for (_, pred) in incoming.iter_mut() {
                    if *pred == old_pred {
                        *pred = new_pred;
                    }
                }
            }
        }
    }

    /// Phase one of block duplication: structurally copy every instruction
    /// and the terminator of `src` into a fresh block named `name`.
    ///
    /// Operands of the copies still reference the originals; resolving them
    /// through the returned map is a separate step (`remap_block`), so that
    /// the map is complete before any operand is rewritten.
    pub fn clone_block(&mut self, src: BlockId, name: impl Into<String>) -> (BlockId, HashMap<InstId, InstId>) {
        let new_id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(name));
        self.layout.push(new_id);

        let src_insts = self.block(src).insts.clone();
        let mut map = HashMap::with_capacity(src_insts.len());
        for inst in src_insts {
            let data = self.inst(inst).clone();
            let copy = self.create_inst(data);
            self.block_mut(new_id).insts.push(copy);
            map.insert(inst, copy);
        }
        let term = self.block(src).terminator.clone();
        self.block_mut(new_id).terminator = term;
        (new_id, map)
    }

    /// Phase two of block duplication: rewrite the operand slots of every
    /// instruction in `block` (and of its terminator) through `map`, and phi
    /// incoming-block slots through `block_map`. Slots whose value is not in
    /// the map are left untouched; they refer to definitions outside the
    /// cloned region.
    pub fn remap_block(
        &mut self,
        block: BlockId,
        map: &HashMap<InstId, InstId>,
        block_map: &HashMap<BlockId, BlockId>,
    ) {
        for inst in self.block(block).insts.clone() {
            let data = self.inst_mut(inst);
            for slot in data.kind.values_mut() {
                if let Value::Inst(id) = slot {
                    if let Some(mapped) = map.get(id) {
                        *slot = Value::Inst(*mapped);
                    }
                }
            }
            if let InstKind::Phi { incoming } = &mut data.kind {
                for (_, pred) in incoming.iter_mut() {
                    if let Some(mapped) = block_map.get(pred) {
                        *pred = *mapped;
                    }
                }
            }
        }
        if let Some(term) = &mut self.block_mut(block).terminator {
            for slot in term.values_mut() {
                if let Value::Inst(id) = slot {
                    if let Some(mapped) = map.get(id) {
                        *slot = Value::Inst(*mapped);
                    }
                }
            }
            for succ in term.successors_mut() {
                if let Some(mapped) = block_map.get(succ) {
                    *succ = *mapped;
                }
            }
        }
    }

    /// Replace every use of `from` with `to`, in instruction operands, phi
    /// incoming values, and terminator operands.
    pub fn replace_all_uses(&mut self, from: InstId, to: Value) {
        for data in self.insts.iter_mut() {
            if data.erased {
                continue;
            }
            for slot in data.kind.values_mut() {
                if slot.as_inst() == Some(from) {
                    *slot = to.clone();
                }
            }
        }
        for block in self.blocks.iter_mut() {
            if let Some(term) = &mut block.terminator {
                for slot in term.values_mut() {
                    if slot.as_inst() == Some(from) {
                        *slot = to.clone();
                    }
                }
            }
        }
    }

    /// Whether any instruction or terminator still uses the value of `inst`.
    pub fn has_uses(&self, inst: InstId) -> bool {
        for &b in &self.layout {
            let block = self.block(b);
            for &i in &block.insts {
                if self.inst(i).kind.values().iter().any(|v| v.as_inst() == Some(inst)) {
                    return true;
                }
            }
            if let Some(term) = &block.terminator {
                if term.values().iter().any(|v| v.as_inst() == Some(inst)) {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::BinOp;
    use crate::value::Constant;

    fn two_block_function() -> (Function, BlockId, BlockId, InstId) {
        let mut f = Function::new("f", vec![Type::I32, Type::I32], Type::I32);
        let entry = f.add_block("entry");
        let exit = f.add_block("exit");
        let sum = f.append_inst(
            entry,
            InstKind::Binary { op: BinOp::Add, lhs: Value::Argument(0), rhs: Value::Argument(1) },
            Type::I32,
        );
        f.set_terminator(entry, Terminator::Br(exit));
        f.set_terminator(exit, Terminator::Ret(Some(Value::Inst(sum))));
        (f, entry, exit, sum)
    }

    #[test]
    fn test_predecessors_and_successors() {
        let (f, entry, exit, _) = two_block_function();
        assert_eq!(f.successors(entry).as_slice(), &[exit]);
        assert_eq!(f.predecessors(exit), vec![entry]);
        assert!(f.predecessors(entry).is_empty());
    }

    #[test]
    fn test_split_moves_terminator() {
        let (mut f, entry, exit, sum) = two_block_function();
        let tail = f.split_block(entry, 0);
        assert_eq!(f.block(entry).insts.len(), 0);
        assert_eq!(f.block(tail).insts, vec![sum]);
        assert_eq!(f.block(entry).terminator, Some(Terminator::Br(tail)));
        assert_eq!(f.block(tail).terminator, Some(Terminator::Br(exit)));
    }

    #[test]
    fn test_split_retargets_successor_phis() {
        let mut f = Function::new("f", vec![Type::I1], Type::I32);
        let entry = f.add_block("entry");
        let merge = f.add_block("merge");
        let c = f.append_inst(
            entry,
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::const_i32(1),
                rhs: Value::const_i32(2),
            },
            Type::I32,
        );
        f.set_terminator(entry, Terminator::Br(merge));
        let phi = f.append_inst(
            merge,
            InstKind::Phi { incoming: vec![(Value::Inst(c), entry)] },
            Type::I32,
        );
        f.set_terminator(merge, Terminator::Ret(Some(Value::Inst(phi))));

        let tail = f.split_block(entry, 1);
        match &f.inst(phi).kind {
            InstKind::Phi { incoming } => assert_eq!(incoming[0].1, tail),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_clone_then_remap_resolves_internal_refs() {
        let (mut f, entry, _, sum) = two_block_function();
        let dbl = f.append_inst(
            entry,
            InstKind::Binary { op: BinOp::Add, lhs: Value::Inst(sum), rhs: Value::Inst(sum) },
            Type::I32,
        );
        let (twin, map) = f.clone_block(entry, "twin");

        // Before remap the copies still point at the originals.
        let dbl_copy = map[&dbl];
        assert_eq!(
            f.inst(dbl_copy).kind.values()[0].as_inst(),
            Some(sum)
        );

        let block_map = HashMap::from_iter([(entry, twin)]);
        f.remap_block(twin, &map, &block_map);
        assert_eq!(
            f.inst(dbl_copy).kind.values()[0].as_inst(),
            Some(map[&sum])
        );
        // Arguments are outside the cloned region and stay untouched.
        assert_eq!(f.inst(map[&sum]).kind.values()[0], &Value::Argument(0));
    }

    #[test]
    fn test_replace_all_uses() {
        let (mut f, _, _, sum) = two_block_function();
        f.replace_all_uses(sum, Value::Constant(Constant::i32(9)));
        assert!(!f.has_uses(sum));
    }
}
