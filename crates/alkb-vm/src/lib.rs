//! The ALKB virtual machine: tagged values, a mark-and-sweep heap,
//! a register-based interpreter and a tracing JIT over hot regions.

pub mod error;
pub mod fields;
pub mod heap;
pub mod jit;
pub mod memory;
pub mod natives;
pub mod value;
pub mod vm;

pub use error::VmError;
pub use fields::FieldTable;
pub use heap::{GcStats, Heap, Marker, INITIAL_GC_THRESHOLD};
pub use jit::{JitStats, HOT_THRESHOLD};
pub use memory::{Frame, FrameStack, VALUE_STACK_CAPACITY};
pub use natives::Native;
pub use value::{value_equals, ObjBody, ObjRef, Value};
pub use vm::{Vm, VmConfig};
