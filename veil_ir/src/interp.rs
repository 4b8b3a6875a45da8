//! Reference interpreter
//!
//! Direct execution of IR functions, used to compare observable behavior of
//! a module before and after obfuscation. Integer arithmetic wraps at the
//! type width; memory is byte-addressed. A step budget guards against
//! runaway dispatch loops.

use crate::function::Function;
use crate::inst::{BinOp, InstKind, IntPredicate, Terminator};
use crate::module::{GlobalId, Initializer, Module};
use crate::types::Type;
use crate::value::{BlockId, InstId, Value};
use hashbrown::HashMap;
use veil_common::{VeilError, VeilResult};

const MAX_CALL_DEPTH: u32 = 64;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum RtVal {
    Int { ty: Type, value: i64 },
    Float { ty: Type, value: f64 },
    Ptr(Addr),
}

impl RtVal {
    pub fn i32(value: i32) -> Self {
        RtVal::Int { ty: Type::I32, value: value as i64 }
    }

    pub fn as_int(&self) -> VeilResult<i64> {
        match self {
            RtVal::Int { value, .. } => Ok(*value),
            _ => Err(VeilError::eval("expected an integer value")),
        }
    }
}

/// A memory address: a stack slot or a global, plus a byte offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Addr {
    pub base: Base,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Base {
    Stack(usize),
    Global(GlobalId),
}

/// Executes functions of one module against mutable global memory.
pub struct Machine<'m> {
    module: &'m Module,
    globals: Vec<Vec<u8>>,
    slots: Vec<Vec<u8>>,
    output: String,
    steps: u64,
    step_limit: u64,
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module) -> Self {
        let globals = module
            .globals
            .iter()
            .map(|g| match &g.init {
                Some(Initializer::Bytes(data)) => data.clone(),
                Some(Initializer::Int { ty, value }) => {
                    let size = ty.byte_size().unwrap_or(8) as usize;
                    value.to_le_bytes()[..size.min(8)].to_vec()
                }
                Some(Initializer::Zero) | None => {
                    vec![0; g.ty.byte_size().unwrap_or(8) as usize]
                }
            })
            .collect();
        Self {
            module,
            globals,
            slots: Vec::new(),
            output: String::new(),
            steps: 0,
            step_limit: 1 << 22,
        }
    }

    pub fn with_step_limit(module: &'m Module, step_limit: u64) -> Self {
        Self { step_limit, ..Self::new(module) }
    }

    /// Text captured from `puts` calls during execution.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Current bytes of a global, by name.
    pub fn global_bytes(&self, name: &str) -> Option<&[u8]> {
        let idx = self.module.globals.iter().position(|g| g.name == name)?;
        Some(&self.globals[idx])
    }

    /// Run a defined function on the given arguments.
    pub fn call(&mut self, name: &str, args: &[RtVal]) -> VeilResult<Option<RtVal>> {
        self.call_at_depth(name, args, 0)
    }

    fn call_at_depth(&mut self, name: &str, args: &[RtVal], depth: u32) -> VeilResult<Option<RtVal>> {
        if depth > MAX_CALL_DEPTH {
            return Err(VeilError::eval("call depth exceeded"));
        }
        let f = self
            .module
            .function(name)
            .ok_or_else(|| VeilError::eval(format!("no defined function '{name}'")))?;
        if args.len() != f.params.len() {
            return Err(VeilError::eval(format!("'{name}' called with wrong arity")));
        }
        self.run_function(f, args, depth)
    }

    fn run_function(
        &mut self,
        f: &'m Function,
        args: &[RtVal],
        depth: u32,
    ) -> VeilResult<Option<RtVal>> {
        let mut values: HashMap<InstId, RtVal> = HashMap::new();
        let mut cur = f.entry();
        let mut prev: Option<BlockId> = None;

        loop {
            let block = f.block(cur);

            // Phi nodes read their inputs simultaneously on block entry.
            let mut phi_writes: Vec<(InstId, RtVal)> = Vec::new();
            let mut body_start = 0;
            for (pos, &i) in block.insts.iter().enumerate() {
                if let InstKind::Phi { incoming } = &f.inst(i).kind {
                    let from = prev.ok_or_else(|| VeilError::eval("phi in entry block"))?;
                    let (v, _) = incoming
                        .iter()
                        .find(|(_, pred)| *pred == from)
                        .ok_or_else(|| VeilError::eval("phi has no entry for predecessor"))?;
                    phi_writes.push((i, self.eval(&values, args, v)?));
                } else {
                    body_start = pos;
                    break;
                }
                body_start = pos + 1;
            }
            for (i, v) in phi_writes {
                values.insert(i, v);
                self.tick()?;
            }

            for &i in &block.insts[body_start..] {
                self.tick()?;
                if let Some(result) = self.exec_inst(f, &values, args, i, depth)? {
                    values.insert(i, result);
                }
            }

            self.tick()?;
            let term = block
                .terminator
                .as_ref()
                .ok_or_else(|| VeilError::eval("block has no terminator"))?;
            match term {
                Terminator::Ret(v) => {
                    return match v {
                        Some(v) => Ok(Some(self.eval(&values, args, v)?)),
                        None => Ok(None),
                    };
                }
                Terminator::Br(dest) => {
                    prev = Some(cur);
                    cur = *dest;
                }
                Terminator::CondBr { cond, then_dest, else_dest } => {
                    let c = self.eval(&values, args, cond)?.as_int()?;
                    prev = Some(cur);
                    cur = if c != 0 { *then_dest } else { *else_dest };
                }
                Terminator::Switch { value, default, cases } => {
                    let v = self.eval(&values, args, value)?.as_int()? as i32;
                    prev = Some(cur);
                    cur = cases
                        .iter()
                        .find(|(k, _)| *k == v)
                        .map(|(_, b)| *b)
                        .unwrap_or(*default);
                }
                Terminator::Invoke { callee, args: call_args, normal, .. } => {
                    let mut evaluated = Vec::with_capacity(call_args.len());
                    for a in call_args {
                        evaluated.push(self.eval(&values, args, a)?);
                    }
                    self.dispatch_call(callee, &evaluated, depth)?;
                    prev = Some(cur);
                    cur = *normal;
                }
                Terminator::Unreachable => {
                    return Err(VeilError::eval("executed unreachable"));
                }
            }
        }
    }

    fn exec_inst(
        &mut self,
        f: &'m Function,
        values: &HashMap<InstId, RtVal>,
        args: &[RtVal],
        inst: InstId,
        depth: u32,
    ) -> VeilResult<Option<RtVal>> {
        let data = f.inst(inst);
        match &data.kind {
            InstKind::Binary { op, lhs, rhs } => {
                let a = self.eval(values, args, lhs)?;
                let b = self.eval(values, args, rhs)?;
                Ok(Some(apply_binop(*op, &data.ty, &a, &b)?))
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                let a = self.eval(values, args, lhs)?;
                let b = self.eval(values, args, rhs)?;
                Ok(Some(apply_icmp(*pred, &a, &b)?))
            }
            InstKind::Alloca { allocated } => {
                let size = allocated
                    .byte_size()
                    .ok_or_else(|| VeilError::eval("alloca of unsized type"))?;
                self.slots.push(vec![0; size as usize]);
                Ok(Some(RtVal::Ptr(Addr { base: Base::Stack(self.slots.len() - 1), offset: 0 })))
            }
            InstKind::Load { ptr } => {
                let addr = self.eval_addr(values, args, ptr)?;
                Ok(Some(self.mem_read(addr, &data.ty)?))
            }
            InstKind::Store { value, ptr } => {
                let v = self.eval(values, args, value)?;
                let addr = self.eval_addr(values, args, ptr)?;
                self.mem_write(addr, &v)?;
                Ok(None)
            }
            InstKind::Call { callee, args: call_args } => {
                let mut evaluated = Vec::with_capacity(call_args.len());
                for a in call_args {
                    evaluated.push(self.eval(values, args, a)?);
                }
                self.dispatch_call(callee, &evaluated, depth)
            }
            InstKind::Select { cond, if_true, if_false } => {
                let c = self.eval(values, args, cond)?.as_int()?;
                let picked = if c != 0 { if_true } else { if_false };
                Ok(Some(self.eval(values, args, picked)?))
            }
            InstKind::Phi { .. } => Err(VeilError::eval("phi after non-phi instruction")),
        }
    }

    fn dispatch_call(
        &mut self,
        callee: &str,
        args: &[RtVal],
        depth: u32,
    ) -> VeilResult<Option<RtVal>> {
        match callee {
            "__decrypt" | "__encrypt" => {
                let addr = match &args[0] {
                    RtVal::Ptr(a) => *a,
                    _ => return Err(VeilError::eval("xor runtime needs a pointer")),
                };
                let len = args[1].as_int()? as u64;
                let bytes = self.mem_bytes_mut(addr.base)?;
                let start = addr.offset as usize;
                let end = start + len as usize;
                if end > bytes.len() {
                    return Err(VeilError::eval("xor runtime out of bounds"));
                }
                for b in &mut bytes[start..end] {
                    *b ^= 42;
                }
                Ok(Some(RtVal::Ptr(addr)))
            }
            "puts" => {
                let addr = match &args[0] {
                    RtVal::Ptr(a) => *a,
                    _ => return Err(VeilError::eval("puts needs a pointer")),
                };
                let bytes = self.mem_bytes_mut(addr.base)?;
                let mut s = String::new();
                let mut i = addr.offset as usize;
                while i < bytes.len() && bytes[i] != 0 {
                    s.push(bytes[i] as char);
                    i += 1;
                }
                self.output.push_str(&s);
                self.output.push('\n');
                Ok(Some(RtVal::i32(0)))
            }
            _ => {
                if self.module.function(callee).is_some() {
                    return self.call_at_depth(callee, args, depth + 1);
                }
                Err(VeilError::eval(format!("call to unmodeled external '{callee}'")))
            }
        }
    }

    fn eval(
        &self,
        values: &HashMap<InstId, RtVal>,
        args: &[RtVal],
        value: &Value,
    ) -> VeilResult<RtVal> {
        match value {
            Value::Constant(c) => match c {
                crate::value::Constant::Int { ty, value } => {
                    Ok(RtVal::Int { ty: ty.clone(), value: canon(ty, *value) })
                }
                crate::value::Constant::Float { ty, value } => {
                    Ok(RtVal::Float { ty: ty.clone(), value: *value })
                }
                crate::value::Constant::GlobalAddr(g) => {
                    Ok(RtVal::Ptr(Addr { base: Base::Global(*g), offset: 0 }))
                }
                crate::value::Constant::ElementPtr { global, offset } => {
                    Ok(RtVal::Ptr(Addr { base: Base::Global(*global), offset: *offset }))
                }
                crate::value::Constant::Undef(ty) => {
                    // Any value is a correct refinement of undef.
                    Ok(RtVal::Int { ty: ty.clone(), value: 0 })
                }
            },
            Value::Argument(i) => args
                .get(*i)
                .cloned()
                .ok_or_else(|| VeilError::eval("argument index out of range")),
            Value::Inst(id) => values
                .get(id)
                .cloned()
                .ok_or_else(|| VeilError::eval("use of a value before its definition")),
        }
    }

    fn eval_addr(
        &self,
        values: &HashMap<InstId, RtVal>,
        args: &[RtVal],
        value: &Value,
    ) -> VeilResult<Addr> {
        match self.eval(values, args, value)? {
            RtVal::Ptr(addr) => Ok(addr),
            _ => Err(VeilError::eval("expected a pointer value")),
        }
    }

    fn mem_bytes_mut(&mut self, base: Base) -> VeilResult<&mut Vec<u8>> {
        match base {
            Base::Stack(i) => self
                .slots
                .get_mut(i)
                .ok_or_else(|| VeilError::eval("dangling stack slot")),
            Base::Global(g) => self
                .globals
                .get_mut(g.0 as usize)
                .ok_or_else(|| VeilError::eval("unknown global")),
        }
    }

    fn mem_read(&mut self, addr: Addr, ty: &Type) -> VeilResult<RtVal> {
        let size = ty
            .byte_size()
            .ok_or_else(|| VeilError::eval("load of unsized type"))? as usize;
        let bytes = self.mem_bytes_mut(addr.base)?;
        let start = addr.offset as usize;
        if start + size > bytes.len() {
            return Err(VeilError::eval("load out of bounds"));
        }
        let chunk = &bytes[start..start + size];
        match ty {
            Type::I1 | Type::I8 | Type::I32 | Type::I64 => {
                let mut raw = [0u8; 8];
                raw[..size].copy_from_slice(chunk);
                Ok(RtVal::Int { ty: ty.clone(), value: canon(ty, i64::from_le_bytes(raw)) })
            }
            Type::F32 => {
                let raw: [u8; 4] = chunk.try_into().expect("sized");
                Ok(RtVal::Float { ty: Type::F32, value: f32::from_le_bytes(raw) as f64 })
            }
            Type::F64 => {
                let raw: [u8; 8] = chunk.try_into().expect("sized");
                Ok(RtVal::Float { ty: Type::F64, value: f64::from_le_bytes(raw) })
            }
            _ => Err(VeilError::eval("load of unmodeled type")),
        }
    }

    fn mem_write(&mut self, addr: Addr, value: &RtVal) -> VeilResult<()> {
        let (size, raw) = match value {
            RtVal::Int { ty, value } => {
                let size = ty
                    .byte_size()
                    .ok_or_else(|| VeilError::eval("store of unsized type"))?
                    as usize;
                (size, value.to_le_bytes())
            }
            RtVal::Float { ty, value } => match ty {
                Type::F32 => {
                    let mut raw = [0u8; 8];
                    raw[..4].copy_from_slice(&(*value as f32).to_le_bytes());
                    (4, raw)
                }
                _ => (8, value.to_le_bytes()),
            },
            RtVal::Ptr(_) => return Err(VeilError::eval("store of pointer not modeled")),
        };
        let bytes = self.mem_bytes_mut(addr.base)?;
        let start = addr.offset as usize;
        if start + size > bytes.len() {
            return Err(VeilError::eval("store out of bounds"));
        }
        bytes[start..start + size].copy_from_slice(&raw[..size]);
        Ok(())
    }

    fn tick(&mut self) -> VeilResult<()> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(VeilError::eval("step limit exceeded"));
        }
        Ok(())
    }
}

/// Truncate to the width of `ty`, sign-extending into the canonical i64.
/// I1 is kept as 0 or 1.
fn canon(ty: &Type, v: i64) -> i64 {
    match ty {
        Type::I1 => v & 1,
        Type::I8 => v as i8 as i64,
        Type::I32 => v as i32 as i64,
        _ => v,
    }
}

fn unsigned(ty: &Type, v: i64) -> u64 {
    match ty.bit_width() {
        Some(64) | None => v as u64,
        Some(w) => (v as u64) & ((1u64 << w) - 1),
    }
}

fn apply_binop(op: BinOp, ty: &Type, a: &RtVal, b: &RtVal) -> VeilResult<RtVal> {
    if op.is_float() {
        let (x, y) = match (a, b) {
            (RtVal::Float { value: x, .. }, RtVal::Float { value: y, .. }) => (*x, *y),
            _ => return Err(VeilError::eval("float opcode on non-float values")),
        };
        let r = match op {
            BinOp::FAdd => x + y,
            BinOp::FSub => x - y,
            BinOp::FMul => x * y,
            BinOp::FDiv => x / y,
            BinOp::FRem => x % y,
            _ => unreachable!(),
        };
        let r = if *ty == Type::F32 { r as f32 as f64 } else { r };
        return Ok(RtVal::Float { ty: ty.clone(), value: r });
    }

    let x = a.as_int()?;
    let y = b.as_int()?;
    let w = ty
        .bit_width()
        .ok_or_else(|| VeilError::eval("integer opcode on non-integer type"))? as u64;
    let ux = unsigned(ty, x);
    let uy = unsigned(ty, y);
    let r = match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::UDiv => {
            if uy == 0 {
                return Err(VeilError::eval("division by zero"));
            }
            (ux / uy) as i64
        }
        BinOp::SDiv => {
            if y == 0 {
                return Err(VeilError::eval("division by zero"));
            }
            x.wrapping_div(y)
        }
        BinOp::URem => {
            if uy == 0 {
                return Err(VeilError::eval("division by zero"));
            }
            (ux % uy) as i64
        }
        BinOp::SRem => {
            if y == 0 {
                return Err(VeilError::eval("division by zero"));
            }
            x.wrapping_rem(y)
        }
        BinOp::Shl => x.wrapping_shl((uy % w) as u32),
        BinOp::LShr => (ux >> (uy % w)) as i64,
        BinOp::AShr => x >> (uy % w),
        BinOp::And => x & y,
        BinOp::Or => x | y,
        BinOp::Xor => x ^ y,
        _ => unreachable!(),
    };
    Ok(RtVal::Int { ty: ty.clone(), value: canon(ty, r) })
}

fn apply_icmp(pred: IntPredicate, a: &RtVal, b: &RtVal) -> VeilResult<RtVal> {
    // Pointer equality compares addresses; other predicates are integer-only.
    let (x, y, ux, uy) = match (a, b) {
        (RtVal::Int { ty, value: x }, RtVal::Int { value: y, .. }) => {
            (*x, *y, unsigned(ty, *x), unsigned(ty, *y))
        }
        (RtVal::Ptr(p), RtVal::Ptr(q)) => {
            let enc = |a: &Addr| -> i64 {
                let base = match a.base {
                    Base::Stack(i) => i as i64,
                    Base::Global(g) => (1i64 << 32) + g.0 as i64,
                };
                (base << 16) ^ a.offset as i64
            };
            (enc(p), enc(q), enc(p) as u64, enc(q) as u64)
        }
        _ => return Err(VeilError::eval("icmp on mixed value kinds")),
    };
    let r = match pred {
        IntPredicate::Eq => x == y,
        IntPredicate::Ne => x != y,
        IntPredicate::Ugt => ux > uy,
        IntPredicate::Uge => ux >= uy,
        IntPredicate::Ult => ux < uy,
        IntPredicate::Ule => ux <= uy,
        IntPredicate::Sgt => x > y,
        IntPredicate::Sge => x >= y,
        IntPredicate::Slt => x < y,
        IntPredicate::Sle => x <= y,
    };
    Ok(RtVal::Int { ty: Type::I1, value: r as i64 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{GlobalVariable, Linkage};
    use crate::value::Constant;

    #[test]
    fn test_add_function() {
        let mut f = Function::new("add", vec![Type::I32, Type::I32], Type::I32);
        let entry = f.add_block("entry");
        let sum = f.append_inst(
            entry,
            InstKind::Binary { op: BinOp::Add, lhs: Value::Argument(0), rhs: Value::Argument(1) },
            Type::I32,
        );
        f.set_terminator(entry, Terminator::Ret(Some(Value::Inst(sum))));
        let mut m = Module::new("m");
        m.add_function(f);

        let mut machine = Machine::new(&m);
        let r = machine.call("add", &[RtVal::i32(i32::MAX), RtVal::i32(1)]).unwrap();
        assert_eq!(r, Some(RtVal::i32(i32::MIN)));
    }

    #[test]
    fn test_loop_with_memory() {
        // acc = 0; for i in 0..5 { acc += i } via stack slots
        let mut f = Function::new("sum5", vec![], Type::I32);
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let body = f.add_block("body");
        let exit = f.add_block("exit");

        let acc = f.append_inst(entry, InstKind::Alloca { allocated: Type::I32 }, Type::Ptr);
        let i = f.append_inst(entry, InstKind::Alloca { allocated: Type::I32 }, Type::Ptr);
        f.append_inst(
            entry,
            InstKind::Store { value: Value::const_i32(0), ptr: Value::Inst(acc) },
            Type::Void,
        );
        f.append_inst(
            entry,
            InstKind::Store { value: Value::const_i32(0), ptr: Value::Inst(i) },
            Type::Void,
        );
        f.set_terminator(entry, Terminator::Br(header));

        let iv = f.append_inst(header, InstKind::Load { ptr: Value::Inst(i) }, Type::I32);
        let done = f.append_inst(
            header,
            InstKind::ICmp { pred: IntPredicate::Sge, lhs: Value::Inst(iv), rhs: Value::const_i32(5) },
            Type::I1,
        );
        f.set_terminator(
            header,
            Terminator::CondBr { cond: Value::Inst(done), then_dest: exit, else_dest: body },
        );

        let av = f.append_inst(body, InstKind::Load { ptr: Value::Inst(acc) }, Type::I32);
        let iv2 = f.append_inst(body, InstKind::Load { ptr: Value::Inst(i) }, Type::I32);
        let sum = f.append_inst(
            body,
            InstKind::Binary { op: BinOp::Add, lhs: Value::Inst(av), rhs: Value::Inst(iv2) },
            Type::I32,
        );
        f.append_inst(
            body,
            InstKind::Store { value: Value::Inst(sum), ptr: Value::Inst(acc) },
            Type::Void,
        );
        let inc = f.append_inst(
            body,
            InstKind::Binary { op: BinOp::Add, lhs: Value::Inst(iv2), rhs: Value::const_i32(1) },
            Type::I32,
        );
        f.append_inst(
            body,
            InstKind::Store { value: Value::Inst(inc), ptr: Value::Inst(i) },
            Type::Void,
        );
        f.set_terminator(body, Terminator::Br(header));

        let fin = f.append_inst(exit, InstKind::Load { ptr: Value::Inst(acc) }, Type::I32);
        f.set_terminator(exit, Terminator::Ret(Some(Value::Inst(fin))));

        let mut m = Module::new("m");
        m.add_function(f);
        let mut machine = Machine::new(&m);
        assert_eq!(machine.call("sum5", &[]).unwrap(), Some(RtVal::i32(10)));
    }

    #[test]
    fn test_puts_and_xor_runtime() {
        let mut m = Module::new("m");
        let g = m.add_global(GlobalVariable {
            name: "msg".to_string(),
            ty: Type::bytes(6),
            linkage: Linkage::Private,
            is_constant: true,
            init: Some(Initializer::Bytes(b"hello\0".to_vec())),
        });
        m.get_or_insert_declaration("puts", vec![Type::Ptr], Type::I32);
        m.get_or_insert_declaration("__decrypt", vec![Type::Ptr, Type::I64], Type::Ptr);

        let mut f = Function::new("greet", vec![], Type::Void);
        let entry = f.add_block("entry");
        let ptr = Value::Constant(Constant::ElementPtr { global: g, offset: 0 });
        f.append_inst(
            entry,
            InstKind::Call { callee: "__decrypt".to_string(), args: vec![ptr.clone(), Value::const_i64(5)] },
            Type::Ptr,
        );
        f.append_inst(entry, InstKind::Call { callee: "puts".to_string(), args: vec![ptr] }, Type::I32);
        f.set_terminator(entry, Terminator::Ret(None));
        m.add_function(f);

        let mut machine = Machine::new(&m);
        machine.call("greet", &[]).unwrap();
        // XOR over the plain text garbles it; the global was not encrypted here.
        let expected: String = b"hello".iter().map(|b| (b ^ 42) as char).collect();
        assert_eq!(machine.output(), format!("{expected}\n"));
    }
}
