//! Obfuscation passes over the Veil IR
//!
//! Each pass mutates a function or module in place and reports whether it
//! changed anything. Passes hold no state across invocations beyond their
//! own PRNG, so the host may schedule independent functions freely.

pub mod bogus_flow;
pub mod demote;
pub mod flattening;
pub mod string_obf;
pub mod substitution;

pub use bogus_flow::BogusFlowPass;
pub use demote::demote_to_stack;
pub use flattening::FlatteningPass;
pub use string_obf::StringObfuscationPass;
pub use substitution::SubstitutionPass;

use veil_ir::{Function, Module, Type};

/// A transformation applied once per function.
///
/// The function is detached from its module for the duration of the run, so
/// a pass may add globals or declarations through the module handle.
pub trait FunctionPass {
    /// Flag under which the host registers this pass.
    fn flag(&self) -> &'static str;

    /// One-line description for the host's pass registry.
    fn description(&self) -> &'static str;

    /// Returns true when the function was changed.
    fn run_on_function(&mut self, module: &mut Module, function: &mut Function) -> bool;
}

/// A transformation applied once per module.
pub trait ModulePass {
    fn flag(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Returns true when the module was changed.
    fn run_on_module(&mut self, module: &mut Module) -> bool;
}

/// An ordered set of passes, run the way the host driver would run them:
/// module passes once, function passes over every function.
#[derive(Default)]
pub struct Pipeline {
    module_passes: Vec<Box<dyn ModulePass>>,
    function_passes: Vec<Box<dyn FunctionPass>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module_pass(&mut self, pass: Box<dyn ModulePass>) -> &mut Self {
        self.module_passes.push(pass);
        self
    }

    pub fn add_function_pass(&mut self, pass: Box<dyn FunctionPass>) -> &mut Self {
        self.function_passes.push(pass);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.module_passes.is_empty() && self.function_passes.is_empty()
    }

    /// Run everything; returns true when any pass changed the module.
    pub fn run(&mut self, module: &mut Module) -> bool {
        let mut changed = false;
        for pass in &mut self.module_passes {
            log::debug!("running module pass '{}'", pass.flag());
            changed |= pass.run_on_module(module);
        }
        for pass in &mut self.function_passes {
            log::debug!("running function pass '{}'", pass.flag());
            for i in 0..module.functions.len() {
                // Detach the function so the pass can also reach the module.
                let mut f = std::mem::replace(
                    &mut module.functions[i],
                    Function::new("", vec![], Type::Void),
                );
                changed |= pass.run_on_function(module, &mut f);
                module.functions[i] = f;
            }
        }
        changed
    }
}
