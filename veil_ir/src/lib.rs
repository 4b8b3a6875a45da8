//! SSA intermediate representation for the Veil obfuscator
//!
//! A translation unit is a [`Module`] of global variables and functions;
//! functions own arenas of basic blocks and instructions addressed by dense
//! ids. The crate also carries the verifier the passes are checked against,
//! a reference interpreter for behavioral comparison, a textual printer,
//! and a synthetic-module generator for tests and benches.

pub mod display;
pub mod function;
pub mod inst;
pub mod interp;
pub mod module;
pub mod synth;
pub mod types;
pub mod value;
pub mod verify;

pub use function::{Block, Function};
pub use inst::{BinOp, InstData, InstKind, IntPredicate, Terminator};
pub use module::{FuncDecl, GlobalId, GlobalVariable, Initializer, Linkage, Module};
pub use types::Type;
pub use value::{BlockId, Constant, InstId, Value};
pub use verify::{verify_function, verify_module};
