use std::path::Path;

use crate::insn::Insn;
use crate::module::{infer_reg_count, Constant, Function, Module};

/// Magic bytes at the start of every `.alkb` file.
pub const MAGIC: [u8; 4] = *b"ALKB";

/// Module format versions this loader accepts.
pub const SUPPORTED_VERSIONS: [u16; 2] = [1, 2];

/// Errors produced while decoding a module file.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read module: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic (expected ALKB)")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("expected section tag '{expected}', found '{found}'")]
    UnexpectedTag { expected: &'static str, found: String },
    #[error("{section} size field says {declared} bytes, payload is {actual}")]
    SizeMismatch {
        section: &'static str,
        declared: u32,
        actual: u32,
    },
    #[error("unknown constant type {0}")]
    UnknownConstType(u8),
    #[error("code size {0} is not a multiple of 4")]
    CodeSizeNotAligned(u32),
    #[error("register count {0} out of range")]
    RegCountTooLarge(u32),
    #[error("string constant is not valid UTF-8")]
    InvalidUtf8,
    #[error("unexpected end of module")]
    UnexpectedEof,
}

/// Decode a module from raw bytes.
pub fn parse(bytes: &[u8]) -> Result<Module, LoadError> {
    let mut r = Reader::new(bytes);

    if r.read_array::<4>()? != MAGIC {
        return Err(LoadError::BadMagic);
    }
    let version = r.read_u16()?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(LoadError::UnsupportedVersion(version));
    }

    match &r.read_array::<2>()? {
        b"CD" => {
            // Legacy layout: the rest of the file is the code of a
            // single anonymous entry function.
            let code = read_code_payload(&mut r)?;
            let reg_count = infer_reg_count(&code);
            Ok(Module::new(vec![Function {
                name: "main".to_string(),
                num_params: 0,
                reg_count,
                consts: Vec::new(),
                code,
            }]))
        }
        b"FN" => {
            let count = r.read_u32()?;
            let mut functions = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                functions.push(read_function(&mut r, version)?);
            }
            Ok(Module::new(functions))
        }
        other => Err(LoadError::UnexpectedTag {
            expected: "FN",
            found: tag_to_string(other),
        }),
    }
}

/// Decode a module from a file on disk.
pub fn load_file(path: impl AsRef<Path>) -> Result<Module, LoadError> {
    let bytes = std::fs::read(path)?;
    parse(&bytes)
}

fn read_function(r: &mut Reader<'_>, version: u16) -> Result<Function, LoadError> {
    // FH: function header
    r.expect_tag("FH")?;
    let fh_size = r.read_u32()?;
    let name_len = r.read_u16()?;
    let expected = 2 + name_len as u32 + 4 + 4;
    if fh_size != expected {
        return Err(LoadError::SizeMismatch {
            section: "FH",
            declared: fh_size,
            actual: expected,
        });
    }
    let name = r.read_string(name_len as usize)?;
    let num_params = r.read_u32()?;
    let reg_count = r.read_u32()?;
    if reg_count > u16::MAX as u32 {
        return Err(LoadError::RegCountTooLarge(reg_count));
    }

    // CP: constant pool
    r.expect_tag("CP")?;
    let cp_size = r.read_u32()?;
    let cp_start = r.pos();
    let n_consts = r.read_u32()?;
    let mut consts = Vec::with_capacity(n_consts.min(4096) as usize);
    for _ in 0..n_consts {
        consts.push(read_constant(r, version)?);
    }
    let cp_actual = (r.pos() - cp_start) as u32;
    if cp_size != cp_actual {
        return Err(LoadError::SizeMismatch {
            section: "CP",
            declared: cp_size,
            actual: cp_actual,
        });
    }

    // CD: code
    let code = read_code_payload(r)?;

    Ok(Function {
        name,
        num_params,
        reg_count: reg_count as u16,
        consts,
        code,
    })
}

fn read_constant(r: &mut Reader<'_>, version: u16) -> Result<Constant, LoadError> {
    let tag = r.read_u8()?;
    Ok(match tag {
        0 => Constant::Int(r.read_u32()? as i32),
        1 => Constant::Float(f32::from_bits(r.read_u32()?)),
        2 => Constant::Bool(r.read_u8()? != 0),
        3 => {
            let len = r.read_u32()? as usize;
            Constant::Str(r.read_string(len)?)
        }
        4 => {
            let name = read_name(r, version)?;
            let arity = r.read_u32()?;
            Constant::FuncRef { name, arity }
        }
        5 => Constant::ClassRef {
            name: read_name(r, version)?,
        },
        6 => Constant::FieldRef {
            class_name: read_name(r, version)?,
            field_name: read_name(r, version)?,
        },
        7 => {
            // MethodRef is normalized into a mangled FuncRef at load time.
            let class_name = read_name(r, version)?;
            let method_name = read_name(r, version)?;
            let arity = r.read_u32()?;
            Constant::FuncRef {
                name: format!("{class_name}.{method_name}"),
                arity,
            }
        }
        other => return Err(LoadError::UnknownConstType(other)),
    })
}

/// Reference-constant names carry a 2-byte length prefix in version 1
/// and a 4-byte prefix from version 2 on.
fn read_name(r: &mut Reader<'_>, version: u16) -> Result<String, LoadError> {
    let len = if version >= 2 {
        r.read_u32()? as usize
    } else {
        r.read_u16()? as usize
    };
    r.read_string(len)
}

fn read_code_payload(r: &mut Reader<'_>) -> Result<Vec<Insn>, LoadError> {
    let size = r.read_u32()?;
    if size % 4 != 0 {
        return Err(LoadError::CodeSizeNotAligned(size));
    }
    let n = size / 4;
    let mut code = Vec::with_capacity(n.min(1 << 20) as usize);
    for _ in 0..n {
        code.push(Insn(r.read_u32()?));
    }
    Ok(code)
}

fn tag_to_string(tag: &[u8; 2]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

/// Cursor over the raw module bytes. All multi-byte reads are
/// big-endian.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        let end = self.pos.checked_add(n).ok_or(LoadError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(LoadError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], LoadError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, LoadError> {
        Ok(u16::from_be_bytes(self.read_array::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32, LoadError> {
        Ok(u32::from_be_bytes(self.read_array::<4>()?))
    }

    fn read_string(&mut self, len: usize) -> Result<String, LoadError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::InvalidUtf8)
    }

    fn expect_tag(&mut self, expected: &'static str) -> Result<(), LoadError> {
        let found = self.read_array::<2>()?;
        if found != expected.as_bytes() {
            return Err(LoadError::UnexpectedTag {
                expected,
                found: tag_to_string(&found),
            });
        }
        Ok(())
    }
}
