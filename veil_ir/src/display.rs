//! Textual rendering of modules
//!
//! An LLVM-flavoured form, for the CLI `show` command and test output.

use crate::function::Function;
use crate::inst::{InstKind, Terminator};
use crate::module::{Initializer, Linkage, Module};
use crate::types::Type;
use crate::value::{BlockId, Constant, Value};
use std::fmt;

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::I1 => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F32 => write!(f, "float"),
            Type::F64 => write!(f, "double"),
            Type::Ptr => write!(f, "ptr"),
            Type::Array { elem, len } => write!(f, "[{len} x {elem}]"),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(out, "; module '{}'", self.name)?;
        for g in &self.globals {
            let linkage = match g.linkage {
                Linkage::External => "",
                Linkage::Internal => "internal ",
                Linkage::Private => "private ",
            };
            let kind = if g.is_constant { "constant" } else { "global" };
            write!(out, "@{} = {}{} {}", g.name, linkage, kind, g.ty)?;
            match &g.init {
                Some(Initializer::Int { value, .. }) => writeln!(out, " {value}")?,
                Some(Initializer::Bytes(data)) => {
                    write!(out, " c\"")?;
                    for b in data {
                        if b.is_ascii_graphic() || *b == b' ' {
                            write!(out, "{}", *b as char)?;
                        } else {
                            write!(out, "\\{b:02X}")?;
                        }
                    }
                    writeln!(out, "\"")?;
                }
                Some(Initializer::Zero) => writeln!(out, " zeroinitializer")?,
                None => writeln!(out)?,
            }
        }
        for d in &self.declarations {
            let params: Vec<String> = d.params.iter().map(|t| t.to_string()).collect();
            writeln!(out, "declare {} @{}({})", d.ret, d.name, params.join(", "))?;
        }
        for f in &self.functions {
            writeln!(out)?;
            write_function(out, self, f)?;
        }
        Ok(())
    }
}

fn write_function(out: &mut fmt::Formatter<'_>, m: &Module, f: &Function) -> fmt::Result {
    let params: Vec<String> = f
        .params
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{t} %a{i}"))
        .collect();
    writeln!(out, "define {} @{}({}) {{", f.ret, f.name, params.join(", "))?;
    for b in f.block_ids() {
        writeln!(out, "{}:", label(f, b))?;
        for &i in &f.block(b).insts {
            write!(out, "  ")?;
            write_inst(out, m, f, i)?;
            writeln!(out)?;
        }
        write!(out, "  ")?;
        match &f.block(b).terminator {
            Some(t) => write_terminator(out, m, f, t)?,
            None => write!(out, "<missing terminator>")?,
        }
        writeln!(out)?;
    }
    writeln!(out, "}}")
}

fn label(f: &Function, b: BlockId) -> String {
    format!("{}.{}", f.block(b).name, b.0)
}

fn val(m: &Module, v: &Value) -> String {
    match v {
        Value::Constant(c) => match c {
            Constant::Int { value, .. } => format!("{value}"),
            Constant::Float { value, .. } => format!("{value:e}"),
            Constant::GlobalAddr(g) => format!("@{}", m.global(*g).name),
            Constant::ElementPtr { global, offset } => {
                format!("@{}[{offset}]", m.global(*global).name)
            }
            Constant::Undef(_) => "undef".to_string(),
        },
        Value::Argument(i) => format!("%a{i}"),
        Value::Inst(id) => format!("%v{}", id.0),
    }
}

fn write_inst(
    out: &mut fmt::Formatter<'_>,
    m: &Module,
    f: &Function,
    i: crate::value::InstId,
) -> fmt::Result {
    let data = f.inst(i);
    match &data.kind {
        InstKind::Binary { op, lhs, rhs } => write!(
            out,
            "%v{} = {} {} {}, {}",
            i.0,
            op.mnemonic(),
            data.ty,
            val(m, lhs),
            val(m, rhs)
        ),
        InstKind::ICmp { pred, lhs, rhs } => write!(
            out,
            "%v{} = icmp {} {}, {}",
            i.0,
            pred.mnemonic(),
            val(m, lhs),
            val(m, rhs)
        ),
        InstKind::Alloca { allocated } => write!(out, "%v{} = alloca {allocated}", i.0),
        InstKind::Load { ptr } => write!(out, "%v{} = load {}, ptr {}", i.0, data.ty, val(m, ptr)),
        InstKind::Store { value, ptr } => {
            write!(out, "store {}, ptr {}", val(m, value), val(m, ptr))
        }
        InstKind::Call { callee, args } => {
            let args: Vec<String> = args.iter().map(|a| val(m, a)).collect();
            if data.ty == Type::Void {
                write!(out, "call void @{callee}({})", args.join(", "))
            } else {
                write!(out, "%v{} = call {} @{callee}({})", i.0, data.ty, args.join(", "))
            }
        }
        InstKind::Select { cond, if_true, if_false } => write!(
            out,
            "%v{} = select i1 {}, {}, {}",
            i.0,
            val(m, cond),
            val(m, if_true),
            val(m, if_false)
        ),
        InstKind::Phi { incoming } => {
            let arms: Vec<String> = incoming
                .iter()
                .map(|(v, b)| format!("[ {}, %{} ]", val(m, v), label(f, *b)))
                .collect();
            write!(out, "%v{} = phi {} {}", i.0, data.ty, arms.join(", "))
        }
    }
}

fn write_terminator(
    out: &mut fmt::Formatter<'_>,
    m: &Module,
    f: &Function,
    t: &Terminator,
) -> fmt::Result {
    match t {
        Terminator::Ret(None) => write!(out, "ret void"),
        Terminator::Ret(Some(v)) => write!(out, "ret {}", val(m, v)),
        Terminator::Br(dest) => write!(out, "br label %{}", label(f, *dest)),
        Terminator::CondBr { cond, then_dest, else_dest } => write!(
            out,
            "br i1 {}, label %{}, label %{}",
            val(m, cond),
            label(f, *then_dest),
            label(f, *else_dest)
        ),
        Terminator::Switch { value, default, cases } => {
            write!(out, "switch i32 {}, label %{} [", val(m, value), label(f, *default))?;
            for (k, b) in cases {
                write!(out, " {k}: %{}", label(f, *b))?;
            }
            write!(out, " ]")
        }
        Terminator::Invoke { callee, args, normal, unwind } => {
            let args: Vec<String> = args.iter().map(|a| val(m, a)).collect();
            write!(
                out,
                "invoke @{callee}({}) to label %{} unwind label %{}",
                args.join(", "),
                label(f, *normal),
                label(f, *unwind)
            )
        }
        Terminator::Unreachable => write!(out, "unreachable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::BinOp;
    use crate::inst::InstKind;

    #[test]
    fn test_render_contains_structure() {
        let mut m = Module::new("demo");
        let mut f = Function::new("add", vec![Type::I32, Type::I32], Type::I32);
        let entry = f.add_block("entry");
        let sum = f.append_inst(
            entry,
            InstKind::Binary { op: BinOp::Add, lhs: Value::Argument(0), rhs: Value::Argument(1) },
            Type::I32,
        );
        f.set_terminator(entry, Terminator::Ret(Some(Value::Inst(sum))));
        m.add_function(f);

        let text = m.to_string();
        assert!(text.contains("define i32 @add(i32 %a0, i32 %a1)"));
        assert!(text.contains("add i32 %a0, %a1"));
        assert!(text.contains("ret %v0"));
    }
}
