use std::io::Write;
use std::path::Path;

use crate::loader::MAGIC;
use crate::module::{Constant, Function, Module};

/// Encode a module in the `.alkb` format at the given version.
///
/// The encoding mirrors `loader::parse` exactly; tests lean on the
/// round-trip between the two.
pub fn encode(module: &Module, version: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&version.to_be_bytes());

    out.extend_from_slice(b"FN");
    out.extend_from_slice(&(module.functions.len() as u32).to_be_bytes());
    for f in &module.functions {
        encode_function(&mut out, f, version);
    }
    out
}

/// Encode a module and write it to disk.
pub fn write_file(path: impl AsRef<Path>, module: &Module, version: u16) -> std::io::Result<()> {
    let bytes = encode(module, version);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&bytes)
}

fn encode_function(out: &mut Vec<u8>, f: &Function, version: u16) {
    // FH
    let name = f.name.as_bytes();
    out.extend_from_slice(b"FH");
    out.extend_from_slice(&(2 + name.len() as u32 + 4 + 4).to_be_bytes());
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(&f.num_params.to_be_bytes());
    out.extend_from_slice(&(f.reg_count as u32).to_be_bytes());

    // CP
    let mut cp = Vec::new();
    cp.extend_from_slice(&(f.consts.len() as u32).to_be_bytes());
    for k in &f.consts {
        encode_constant(&mut cp, k, version);
    }
    out.extend_from_slice(b"CP");
    out.extend_from_slice(&(cp.len() as u32).to_be_bytes());
    out.extend_from_slice(&cp);

    // CD
    out.extend_from_slice(b"CD");
    out.extend_from_slice(&(f.code.len() as u32 * 4).to_be_bytes());
    for insn in &f.code {
        out.extend_from_slice(&insn.word().to_be_bytes());
    }
}

fn encode_constant(out: &mut Vec<u8>, k: &Constant, version: u16) {
    match k {
        Constant::Int(v) => {
            out.push(0);
            out.extend_from_slice(&(*v as u32).to_be_bytes());
        }
        Constant::Float(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Constant::Bool(v) => {
            out.push(2);
            out.push(*v as u8);
        }
        Constant::Str(s) => {
            out.push(3);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Constant::FuncRef { name, arity } => {
            out.push(4);
            encode_name(out, name, version);
            out.extend_from_slice(&arity.to_be_bytes());
        }
        Constant::ClassRef { name } => {
            out.push(5);
            encode_name(out, name, version);
        }
        Constant::FieldRef {
            class_name,
            field_name,
        } => {
            out.push(6);
            encode_name(out, class_name, version);
            encode_name(out, field_name, version);
        }
    }
}

fn encode_name(out: &mut Vec<u8>, name: &str, version: u16) {
    if version >= 2 {
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    } else {
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(name.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{Insn, Opcode};
    use crate::loader;

    #[test]
    fn code_section_is_big_endian_words() {
        let f = Function {
            name: "f".to_string(),
            num_params: 0,
            reg_count: 1,
            consts: Vec::new(),
            code: vec![Insn::abc(Opcode::Mov, 1, 2, 3)],
        };
        let bytes = encode(&Module::new(vec![f]), 1);
        let cd_at = bytes.windows(2).rposition(|w| w == b"CD").unwrap();
        let word = &bytes[cd_at + 6..cd_at + 10];
        // word = 0x03020101: op=1 (MOV), a=1, b=2, c=3, stored big-endian
        assert_eq!(word, &[0x03, 0x02, 0x01, 0x01]);
    }

    #[test]
    fn name_prefix_width_depends_on_version() {
        let f = Function {
            name: "f".to_string(),
            num_params: 0,
            reg_count: 0,
            consts: vec![Constant::ClassRef {
                name: "C".to_string(),
            }],
            code: Vec::new(),
        };
        let module = Module::new(vec![f]);
        let v1 = encode(&module, 1);
        let v2 = encode(&module, 2);
        // A 4-byte prefix makes the v2 encoding exactly 2 bytes longer.
        assert_eq!(v2.len(), v1.len() + 2);
        assert_eq!(loader::parse(&v1).unwrap(), loader::parse(&v2).unwrap());
    }
}
