//! Modules, global variables, and external declarations

use crate::function::Function;
use crate::types::Type;
use serde::{Deserialize, Serialize};

/// Unique handle of a global variable within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

/// Linkage of a global variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Linkage {
    External,
    Internal,
    Private,
}

/// Initializer of a global variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Int { ty: Type, value: i64 },
    /// Immutable byte sequence. With a trailing NUL byte this is a C string.
    Bytes(Vec<u8>),
    Zero,
}

impl Initializer {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Initializer::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// True when the byte data ends in a NUL terminator.
    pub fn is_cstring(&self) -> bool {
        matches!(self, Initializer::Bytes(data) if data.last() == Some(&0))
    }
}

/// A module-scope memory cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub name: String,
    pub ty: Type,
    pub linkage: Linkage,
    pub is_constant: bool,
    pub init: Option<Initializer>,
}

/// Declaration of an externally linked function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDecl {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
}

/// A translation unit: globals, defined functions, and declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub globals: Vec<GlobalVariable>,
    pub functions: Vec<Function>,
    pub declarations: Vec<FuncDecl>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            globals: Vec::new(),
            functions: Vec::new(),
            declarations: Vec::new(),
        }
    }

    pub fn add_global(&mut self, global: GlobalVariable) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        &self.globals[id.0 as usize]
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVariable {
        &mut self.globals[id.0 as usize]
    }

    pub fn global_ids(&self) -> Vec<GlobalId> {
        (0..self.globals.len() as u32).map(GlobalId).collect()
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn declaration(&self, name: &str) -> Option<&FuncDecl> {
        self.declarations.iter().find(|d| d.name == name)
    }

    /// Look up the signature of a callee, defined or declared.
    pub fn callee_signature(&self, name: &str) -> Option<(Vec<Type>, Type)> {
        if let Some(f) = self.function(name) {
            return Some((f.params.clone(), f.ret.clone()));
        }
        self.declaration(name).map(|d| (d.params.clone(), d.ret.clone()))
    }

    /// Declare an external function, reusing an existing declaration with
    /// the same name.
    pub fn get_or_insert_declaration(&mut self, name: &str, params: Vec<Type>, ret: Type) {
        if self.declaration(name).is_some() || self.function(name).is_some() {
            return;
        }
        self.declarations.push(FuncDecl { name: name.to_string(), params, ret });
    }

    /// A global name not yet taken, derived from `base`.
    pub fn fresh_global_name(&self, base: &str) -> String {
        let mut n = self.globals.len();
        loop {
            let candidate = format!("{base}.{n}");
            if !self.globals.iter().any(|g| g.name == candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstring_detection() {
        assert!(Initializer::Bytes(b"hi\0".to_vec()).is_cstring());
        assert!(!Initializer::Bytes(b"hi".to_vec()).is_cstring());
        assert!(!Initializer::Zero.is_cstring());
    }

    #[test]
    fn test_declaration_reuse() {
        let mut m = Module::new("m");
        m.get_or_insert_declaration("__decrypt", vec![Type::Ptr, Type::I64], Type::Ptr);
        m.get_or_insert_declaration("__decrypt", vec![Type::Ptr, Type::I64], Type::Ptr);
        assert_eq!(m.declarations.len(), 1);
    }

    #[test]
    fn test_fresh_global_name() {
        let mut m = Module::new("m");
        m.add_global(GlobalVariable {
            name: "opaque.0".to_string(),
            ty: Type::I32,
            linkage: Linkage::Private,
            is_constant: false,
            init: None,
        });
        let name = m.fresh_global_name("opaque");
        assert_ne!(name, "opaque.0");
    }
}
