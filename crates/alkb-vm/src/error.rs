/// VM execution errors.
///
/// Every variant aborts the current run; nothing is recovered locally.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    #[error("link error: unknown function '{0}'")]
    UnknownFunction(String),
    #[error("link error: entry function '{0}' not found")]
    MissingEntry(String),
    #[error("link error: unknown native id {0}")]
    UnknownNative(u8),
    #[error("link error: {argc} arguments do not fit a window of {regs} registers")]
    TooManyArgs { argc: u32, regs: u16 },

    #[error("type error: expected {expected}, got {got}")]
    Type {
        expected: &'static str,
        got: &'static str,
    },
    #[error("type error: native {name} takes {expected} arguments, got {got}")]
    NativeArity {
        name: &'static str,
        expected: &'static str,
        got: u8,
    },

    #[error("arithmetic error: division by zero")]
    DivisionByZero,

    #[error("bounds error: index {index} out of range for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("bounds error: negative array length {0}")]
    NegativeArrayLength(i32),

    #[error("runtime error: program counter {0} out of function bounds")]
    PcOutOfBounds(i32),
    #[error("runtime error: unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("runtime error: constant index {0} out of bounds")]
    ConstOutOfBounds(u16),
    #[error("runtime error: return with an empty call stack")]
    EmptyCallStack,
    #[error("runtime error: value stack overflow")]
    StackOverflow,
    #[error("runtime error: stdin read failed: {0}")]
    StdinFailed(String),
}
