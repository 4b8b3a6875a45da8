//! String obfuscation
//!
//! XOR-encrypts qualifying constant string globals in place and brackets
//! their single call-site use with runtime `__decrypt` / `__encrypt` calls,
//! so the plaintext only exists in memory while the callee runs.

use crate::ModulePass;
use smallvec::SmallVec;
use veil_ir::{GlobalId, InstId, InstKind, Initializer, Module, Type, Value};

/// Fixed XOR key shared with the runtime library.
const XOR_KEY: u8 = 42;

#[derive(Default)]
pub struct StringObfuscationPass;

impl StringObfuscationPass {
    pub fn new() -> Self {
        Self
    }
}

/// One instruction-level use of a global: function index, block, call, and
/// the exact pointer constant the call carries.
struct LeafUse {
    func: usize,
    block: veil_ir::BlockId,
    inst: InstId,
    pointer: Value,
}

/// Collect every instruction-level use of `global`. Returns `None` when any
/// use is not a call, which disqualifies the global outright.
fn call_uses(m: &Module, global: GlobalId) -> Option<SmallVec<[LeafUse; 2]>> {
    let mut leaves = SmallVec::new();
    let refers = |v: &Value| match v {
        Value::Constant(c) => c.pointee_global() == Some(global),
        _ => false,
    };
    for (fi, f) in m.functions.iter().enumerate() {
        for b in f.block_ids() {
            for &i in &f.block(b).insts {
                let data = f.inst(i);
                for v in data.kind.values() {
                    if !refers(v) {
                        continue;
                    }
                    if !data.kind.is_call() {
                        return None;
                    }
                    leaves.push(LeafUse { func: fi, block: b, inst: i, pointer: v.clone() });
                }
            }
            if let Some(term) = &f.block(b).terminator {
                if term.values().iter().any(|v| refers(v)) {
                    return None;
                }
            }
        }
    }
    Some(leaves)
}

impl ModulePass for StringObfuscationPass {
    fn flag(&self) -> &'static str {
        "obfstr"
    }

    fn description(&self) -> &'static str {
        "obfuscate string"
    }

    fn run_on_module(&mut self, m: &mut Module) -> bool {
        let mut changed = false;
        for global in m.global_ids() {
            let Some(Initializer::Bytes(data)) = &m.global(global).init else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            let len = data.len();

            let Some(leaves) = call_uses(m, global) else {
                continue;
            };
            if leaves.len() != 1 {
                continue;
            }
            let leaf = &leaves[0];

            // Encrypt in place, leaving the terminator byte untouched.
            let mut encrypted = data.clone();
            for b in &mut encrypted[..len - 1] {
                *b ^= XOR_KEY;
            }
            let gvar = m.global_mut(global);
            gvar.init = Some(Initializer::Bytes(encrypted));
            gvar.is_constant = false;

            m.get_or_insert_declaration("__decrypt", vec![Type::Ptr, Type::I64], Type::Ptr);
            m.get_or_insert_declaration("__encrypt", vec![Type::Ptr, Type::I64], Type::Ptr);

            let args = vec![leaf.pointer.clone(), Value::const_i64((len - 1) as i64)];
            let f = &mut m.functions[leaf.func];
            let at = f
                .position_of(leaf.block, leaf.inst)
                .expect("qualifying use is in its block");
            f.insert_inst(
                leaf.block,
                at,
                InstKind::Call { callee: "__decrypt".to_string(), args: args.clone() },
                Type::Ptr,
            );
            f.insert_inst(
                leaf.block,
                at + 2,
                InstKind::Call { callee: "__encrypt".to_string(), args },
                Type::Ptr,
            );

            log::debug!("obfuscated string global '{}'", m.global(global).name);
            changed = true;
        }
        changed
    }
}
