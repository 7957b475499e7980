use std::fmt;

/// Bytecode opcodes.
///
/// The discriminants are the wire encoding: byte 0 of every
/// instruction word is one of these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Advance the program counter
    Nop = 0,

    /// R[A] := R[B]
    Mov = 1,
    /// R[A] := K[Bx]
    LoadK = 2,

    // INTEGER ARITHMETIC (wrapping two's complement)
    AddI = 3,
    SubI = 4,
    MulI = 5,
    /// Fails on a zero divisor
    DivI = 6,
    /// Fails on a zero divisor
    ModI = 7,

    // FLOAT ARITHMETIC (IEEE-754 single precision)
    AddF = 8,
    SubF = 9,
    MulF = 10,
    DivF = 11,
    /// Remainder towards zero (fmod)
    ModF = 12,

    // COMPARISONS -> Bool
    LtI = 13,
    LeI = 14,
    GtI = 15,
    GeI = 16,
    LtF = 17,
    LeF = 18,
    GtF = 19,
    GeF = 20,

    /// Structural/identity equality, see the value model
    Eq = 21,
    Ne = 22,
    /// R[A] := !R[B]; R[B] must be Bool
    Not = 23,

    // JUMPS (AsBx layout, target = pc + 1 + sBx)
    Jmp = 24,
    /// Branch when R[A] is true
    JmpT = 25,
    /// Branch when R[A] is false
    JmpF = 26,

    /// R[A] := Float(R[B])
    I2F = 27,

    // ARRAYS
    /// R[A] := fresh array of length R[B]
    NewArr = 28,
    /// R[A] := R[B][R[C]]
    GetElem = 29,
    /// R[A][R[B]] := R[C]
    SetElem = 30,

    // OBJECTS
    /// R[A] := fresh instance of the class named by K[Bx]
    NewObj = 31,
    /// R[A] := field of instance R[B] named by the FieldRef in R[C]
    GetField = 32,
    /// field of instance R[A] named by the FieldRef in R[B] := R[C]
    SetField = 33,

    // CALLS
    /// R[A] := call FuncRef in R[B] with C arguments
    Call = 34,
    /// R[A] := call FuncRef K[Bx], argument count from its arity
    CallK = 35,
    /// R[A] := native B with C arguments
    CallNative = 36,

    /// Return R[A], or Nil when A = 255
    Ret = 37,

    // BOOLEAN OPERATORS (both operands must be Bool)
    And = 38,
    Or = 39,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Mov => "MOV",
            Opcode::LoadK => "LOADK",
            Opcode::AddI => "ADD_I",
            Opcode::SubI => "SUB_I",
            Opcode::MulI => "MUL_I",
            Opcode::DivI => "DIV_I",
            Opcode::ModI => "MOD_I",
            Opcode::AddF => "ADD_F",
            Opcode::SubF => "SUB_F",
            Opcode::MulF => "MUL_F",
            Opcode::DivF => "DIV_F",
            Opcode::ModF => "MOD_F",
            Opcode::LtI => "LT_I",
            Opcode::LeI => "LE_I",
            Opcode::GtI => "GT_I",
            Opcode::GeI => "GE_I",
            Opcode::LtF => "LT_F",
            Opcode::LeF => "LE_F",
            Opcode::GtF => "GT_F",
            Opcode::GeF => "GE_F",
            Opcode::Eq => "EQ",
            Opcode::Ne => "NE",
            Opcode::Not => "NOT",
            Opcode::Jmp => "JMP",
            Opcode::JmpT => "JMP_T",
            Opcode::JmpF => "JMP_F",
            Opcode::I2F => "I2F",
            Opcode::NewArr => "NEW_ARR",
            Opcode::GetElem => "GET_ELEM",
            Opcode::SetElem => "SET_ELEM",
            Opcode::NewObj => "NEW_OBJ",
            Opcode::GetField => "GET_FIELD",
            Opcode::SetField => "SET_FIELD",
            Opcode::Call => "CALL",
            Opcode::CallK => "CALLK",
            Opcode::CallNative => "CALL_NATIVE",
            Opcode::Ret => "RET",
            Opcode::And => "AND",
            Opcode::Or => "OR",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0 => Opcode::Nop,
            1 => Opcode::Mov,
            2 => Opcode::LoadK,
            3 => Opcode::AddI,
            4 => Opcode::SubI,
            5 => Opcode::MulI,
            6 => Opcode::DivI,
            7 => Opcode::ModI,
            8 => Opcode::AddF,
            9 => Opcode::SubF,
            10 => Opcode::MulF,
            11 => Opcode::DivF,
            12 => Opcode::ModF,
            13 => Opcode::LtI,
            14 => Opcode::LeI,
            15 => Opcode::GtI,
            16 => Opcode::GeI,
            17 => Opcode::LtF,
            18 => Opcode::LeF,
            19 => Opcode::GtF,
            20 => Opcode::GeF,
            21 => Opcode::Eq,
            22 => Opcode::Ne,
            23 => Opcode::Not,
            24 => Opcode::Jmp,
            25 => Opcode::JmpT,
            26 => Opcode::JmpF,
            27 => Opcode::I2F,
            28 => Opcode::NewArr,
            29 => Opcode::GetElem,
            30 => Opcode::SetElem,
            31 => Opcode::NewObj,
            32 => Opcode::GetField,
            33 => Opcode::SetField,
            34 => Opcode::Call,
            35 => Opcode::CallK,
            36 => Opcode::CallNative,
            37 => Opcode::Ret,
            38 => Opcode::And,
            39 => Opcode::Or,
            other => return Err(other),
        })
    }
}

/// Register operand value that means "no register" (RET returns Nil).
pub const REG_NONE: u8 = 255;

/// A 32-bit instruction word.
///
/// Byte 0 is the opcode. The remaining bytes form one of three operand
/// layouts:
///
/// - ABC:  byte 1 = A, byte 2 = B, byte 3 = C
/// - ABx:  byte 1 = A, bytes 2..3 = unsigned Bx
/// - AsBx: byte 1 = A, bytes 2..3 = signed sBx
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Insn(pub u32);

impl Insn {
    pub fn abc(op: Opcode, a: u8, b: u8, c: u8) -> Self {
        Insn((op as u32) | (a as u32) << 8 | (b as u32) << 16 | (c as u32) << 24)
    }

    pub fn abx(op: Opcode, a: u8, bx: u16) -> Self {
        Insn((op as u32) | (a as u32) << 8 | (bx as u32) << 16)
    }

    pub fn asbx(op: Opcode, a: u8, sbx: i16) -> Self {
        Insn::abx(op, a, sbx as u16)
    }

    pub fn word(self) -> u32 {
        self.0
    }

    pub fn opcode(self) -> Result<Opcode, u8> {
        Opcode::try_from((self.0 & 0xFF) as u8)
    }

    pub fn a(self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub fn b(self) -> u8 {
        ((self.0 >> 16) & 0xFF) as u8
    }

    pub fn c(self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }

    pub fn bx(self) -> u16 {
        ((self.0 >> 16) & 0xFFFF) as u16
    }

    pub fn sbx(self) -> i16 {
        self.bx() as i16
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Ok(op) => match op {
                Opcode::Nop => write!(f, "{}", op.name()),
                Opcode::LoadK | Opcode::NewObj | Opcode::CallK => {
                    write!(f, "{} {} {}", op.name(), self.a(), self.bx())
                }
                Opcode::Jmp | Opcode::JmpT | Opcode::JmpF => {
                    write!(f, "{} {} {:+}", op.name(), self.a(), self.sbx())
                }
                _ => write!(f, "{} {} {} {}", op.name(), self.a(), self.b(), self.c()),
            },
            Err(byte) => write!(f, "??({byte})"),
        }
    }
}

impl fmt::Debug for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
