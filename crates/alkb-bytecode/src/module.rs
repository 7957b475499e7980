use crate::insn::{Insn, Opcode, REG_NONE};

/// A constant-pool entry as it appears in a module file.
///
/// Strings and reference constants stay plain data here; the VM interns
/// them into its heap when it binds the module.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f32),
    Bool(bool),
    Str(String),
    /// Named function plus its declared arity
    FuncRef { name: String, arity: u32 },
    ClassRef { name: String },
    FieldRef { class_name: String, field_name: String },
}

/// A decoded function record.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub num_params: u32,
    pub reg_count: u16,
    pub consts: Vec<Constant>,
    pub code: Vec<Insn>,
}

/// A decoded `.alkb` module: an ordered list of functions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(functions: Vec<Function>) -> Self {
        Module { functions }
    }
}

/// Infer a register count for legacy code-only modules by scanning the
/// register operand fields and taking `max + 1`. The RET sentinel 255
/// is ignored everywhere.
pub fn infer_reg_count(code: &[Insn]) -> u16 {
    let mut max_reg: Option<u32> = None;
    let mut consider = |r: u8| {
        if r != REG_NONE {
            let r = r as u32;
            max_reg = Some(max_reg.map_or(r, |m| m.max(r)));
        }
    };

    for insn in code {
        let Ok(op) = insn.opcode() else { continue };
        match op {
            Opcode::Nop | Opcode::Jmp => {}

            // ABx: only A names a register
            Opcode::LoadK | Opcode::NewObj | Opcode::CallK => consider(insn.a()),

            // AsBx: only A names a register
            Opcode::JmpT | Opcode::JmpF => consider(insn.a()),

            // B is a native id, C an argument count
            Opcode::CallNative => consider(insn.a()),

            Opcode::Mov
            | Opcode::AddI
            | Opcode::SubI
            | Opcode::MulI
            | Opcode::DivI
            | Opcode::ModI
            | Opcode::AddF
            | Opcode::SubF
            | Opcode::MulF
            | Opcode::DivF
            | Opcode::ModF
            | Opcode::LtI
            | Opcode::LeI
            | Opcode::GtI
            | Opcode::GeI
            | Opcode::LtF
            | Opcode::LeF
            | Opcode::GtF
            | Opcode::GeF
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Not
            | Opcode::And
            | Opcode::Or
            | Opcode::I2F
            | Opcode::NewArr
            | Opcode::GetElem
            | Opcode::SetElem
            | Opcode::GetField
            | Opcode::SetField
            | Opcode::Call
            | Opcode::Ret => {
                consider(insn.a());
                consider(insn.b());
                consider(insn.c());
            }
        }
    }

    max_reg.map_or(0, |m| (m + 1).min(u16::MAX as u32) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_from_arith() {
        let code = vec![
            Insn::abx(Opcode::LoadK, 0, 0),
            Insn::abc(Opcode::AddI, 2, 0, 1),
            Insn::abc(Opcode::Ret, 2, 0, 0),
        ];
        assert_eq!(infer_reg_count(&code), 3);
    }

    #[test]
    fn infer_ignores_ret_sentinel() {
        let code = vec![Insn::abc(Opcode::Ret, REG_NONE, 0, 0)];
        assert_eq!(infer_reg_count(&code), 1);
    }

    #[test]
    fn infer_ignores_bx_fields() {
        // Bx = 300 would read as b=44, c=1 if misinterpreted as ABC
        let code = vec![
            Insn::abx(Opcode::LoadK, 1, 300),
            Insn::abc(Opcode::Ret, 1, 0, 0),
        ];
        assert_eq!(infer_reg_count(&code), 2);
    }

    #[test]
    fn infer_empty_code() {
        assert_eq!(infer_reg_count(&[]), 0);
    }
}
