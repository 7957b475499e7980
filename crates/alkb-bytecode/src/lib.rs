//! Instruction encoding and the binary `.alkb` module format.

pub mod insn;
pub mod loader;
pub mod module;
pub mod writer;

pub use insn::{Insn, Opcode, REG_NONE};
pub use loader::{load_file, parse, LoadError};
pub use module::{infer_reg_count, Constant, Function, Module};
