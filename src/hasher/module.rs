//! `CSHM` attestation module container and its instruction encoding.
//!
//! ```text
//! "CSHM" | version u8 | name
//! imports: u16 count, name*
//! natives: u16 count, (library, entry)*
//! types:   u16 count, (namespace, name, flags u32, methods: u16 count, method*)
//! method:  name, flags u16, impl_flags u16, params: u8 count, kind u8*, body: u32 len, bytes
//! ```
//! Strings are `u16 len | utf8`, integers little-endian.

use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"CSHM";
pub const FORMAT_VERSION: u8 = 1;

const MAX_ITEMS: usize = 256;
const MAX_BODY: usize = 64 * 1024;

pub const METHOD_PUBLIC: u16 = 0x0006;
pub const METHOD_STATIC: u16 = 0x0010;
pub const METHOD_PINVOKE: u16 = 0x2000;

pub const IMPL_UNMANAGED: u16 = 0x0004;
pub const IMPL_INTERNAL_CALL: u16 = 0x1000;

pub const TYPE_PUBLIC: u32 = 0x0000_0001;
pub const TYPE_SEALED: u32 = 0x0000_0100;

/// Parameter kinds accepted by an entry point.
pub const PARAM_MODULE: u8 = 1;

pub mod op {
    pub const NOP: u8 = 0x00;
    pub const LDARG: u8 = 0x03;
    pub const LDSELF: u8 = 0x04;
    pub const LDSECRET: u8 = 0x05;
    pub const SLOT: u8 = 0x10;
    pub const DIGEST: u8 = 0x20;
    pub const XORSECRET: u8 = 0x21;
    pub const ENCODE: u8 = 0x22;
    pub const CALLNATIVE: u8 = 0x28;
    pub const RET: u8 = 0x2A;
    pub const PREFIX: u8 = 0xFE;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("missing CSHM header")]
    BadMagic,

    #[error("unsupported module version {0}")]
    UnsupportedVersion(u8),

    #[error("module truncated")]
    Truncated,

    #[error("module contains invalid text")]
    InvalidText,

    #[error("{0} exceeds format limits")]
    TooLarge(&'static str),

    #[error("trailing bytes after module")]
    TrailingBytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeImport {
    pub library: String,
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub name: String,
    pub flags: u16,
    pub impl_flags: u16,
    pub params: Vec<u8>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    pub flags: u32,
    pub methods: Vec<MethodDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasherModule {
    pub name: String,
    pub imports: Vec<String>,
    pub natives: Vec<NativeImport>,
    pub types: Vec<TypeDef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    LdArg(u8),
    LdSelf,
    LdSecret(Vec<u8>),
    Slot(u8),
    Digest,
    XorSecret,
    Encode,
    CallNative(u16),
    Ret,
    /// Any opcode outside the instruction set, two-byte codes as `0xFExx`.
    Other(u16),
}

impl Instruction {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Instruction::Nop => out.push(op::NOP),
            Instruction::LdArg(idx) => out.extend_from_slice(&[op::LDARG, *idx]),
            Instruction::LdSelf => out.push(op::LDSELF),
            Instruction::LdSecret(bytes) => {
                out.push(op::LDSECRET);
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Instruction::Slot(id) => out.extend_from_slice(&[op::SLOT, *id]),
            Instruction::Digest => out.push(op::DIGEST),
            Instruction::XorSecret => out.push(op::XORSECRET),
            Instruction::Encode => out.push(op::ENCODE),
            Instruction::CallNative(idx) => {
                out.push(op::CALLNATIVE);
                out.extend_from_slice(&idx.to_le_bytes());
            }
            Instruction::Ret => out.push(op::RET),
            Instruction::Other(code) if *code > 0xFF => out.extend_from_slice(&code.to_be_bytes()),
            Instruction::Other(code) => out.push(*code as u8),
        }
    }
}

pub fn encode_body(instructions: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::new();
    for instruction in instructions {
        instruction.encode(&mut out);
    }
    out
}

/// Decodes a body into `(offset, instruction)` pairs.
pub fn decode_body(body: &[u8]) -> Result<Vec<(usize, Instruction)>, FormatError> {
    let mut reader = Reader::new(body);
    let mut out = Vec::new();
    while !reader.is_empty() {
        let offset = reader.pos;
        let code = reader.u8()?;
        let instruction = match code {
            op::NOP => Instruction::Nop,
            op::LDARG => Instruction::LdArg(reader.u8()?),
            op::LDSELF => Instruction::LdSelf,
            op::LDSECRET => {
                let len = reader.u16()? as usize;
                Instruction::LdSecret(reader.bytes(len)?.to_vec())
            }
            op::SLOT => Instruction::Slot(reader.u8()?),
            op::DIGEST => Instruction::Digest,
            op::XORSECRET => Instruction::XorSecret,
            op::ENCODE => Instruction::Encode,
            op::CALLNATIVE => Instruction::CallNative(reader.u16()?),
            op::RET => Instruction::Ret,
            op::PREFIX => Instruction::Other(0xFE00 | reader.u8()? as u16),
            other => Instruction::Other(other as u16),
        };
        out.push((offset, instruction));
    }
    Ok(out)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(len).ok_or(FormatError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(FormatError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FormatError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, FormatError> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| FormatError::InvalidText)
    }

    fn count(&mut self, what: &'static str) -> Result<usize, FormatError> {
        let n = self.u16()? as usize;
        if n > MAX_ITEMS {
            return Err(FormatError::TooLarge(what));
        }
        Ok(n)
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

impl HasherModule {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        put_string(&mut out, &self.name);

        out.extend_from_slice(&(self.imports.len() as u16).to_le_bytes());
        for import in &self.imports {
            put_string(&mut out, import);
        }

        out.extend_from_slice(&(self.natives.len() as u16).to_le_bytes());
        for native in &self.natives {
            put_string(&mut out, &native.library);
            put_string(&mut out, &native.entry);
        }

        out.extend_from_slice(&(self.types.len() as u16).to_le_bytes());
        for ty in &self.types {
            put_string(&mut out, &ty.namespace);
            put_string(&mut out, &ty.name);
            out.extend_from_slice(&ty.flags.to_le_bytes());
            out.extend_from_slice(&(ty.methods.len() as u16).to_le_bytes());
            for method in &ty.methods {
                put_string(&mut out, &method.name);
                out.extend_from_slice(&method.flags.to_le_bytes());
                out.extend_from_slice(&method.impl_flags.to_le_bytes());
                out.push(method.params.len() as u8);
                out.extend_from_slice(&method.params);
                out.extend_from_slice(&(method.body.len() as u32).to_le_bytes());
                out.extend_from_slice(&method.body);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut r = Reader::new(bytes);
        if r.bytes(4).map_err(|_| FormatError::BadMagic)? != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = r.u8()?;
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let name = r.string()?;

        let mut imports = Vec::new();
        for _ in 0..r.count("imports")? {
            imports.push(r.string()?);
        }

        let mut natives = Vec::new();
        for _ in 0..r.count("natives")? {
            natives.push(NativeImport {
                library: r.string()?,
                entry: r.string()?,
            });
        }

        let mut types = Vec::new();
        for _ in 0..r.count("types")? {
            let namespace = r.string()?;
            let type_name = r.string()?;
            let flags = r.u32()?;
            let mut methods = Vec::new();
            for _ in 0..r.count("methods")? {
                let method_name = r.string()?;
                let method_flags = r.u16()?;
                let impl_flags = r.u16()?;
                let param_count = r.u8()? as usize;
                let params = r.bytes(param_count)?.to_vec();
                let body_len = r.u32()? as usize;
                if body_len > MAX_BODY {
                    return Err(FormatError::TooLarge("method body"));
                }
                let body = r.bytes(body_len)?.to_vec();
                methods.push(MethodDef {
                    name: method_name,
                    flags: method_flags,
                    impl_flags,
                    params,
                    body,
                });
            }
            types.push(TypeDef {
                namespace,
                name: type_name,
                flags,
                methods,
            });
        }

        if !r.is_empty() {
            return Err(FormatError::TrailingBytes);
        }
        Ok(Self {
            name,
            imports,
            natives,
            types,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HasherModule {
        HasherModule {
            name: "attest".into(),
            imports: vec!["cshm.core".into()],
            natives: vec![],
            types: vec![TypeDef {
                namespace: "CleanSpace".into(),
                name: "Hasher".into(),
                flags: TYPE_PUBLIC,
                methods: vec![MethodDef {
                    name: "ComputeHash".into(),
                    flags: METHOD_PUBLIC | METHOD_STATIC,
                    impl_flags: 0,
                    params: vec![PARAM_MODULE],
                    body: encode_body(&[
                        Instruction::LdArg(0),
                        Instruction::Slot(2),
                        Instruction::Digest,
                        Instruction::Ret,
                    ]),
                }],
            }],
        }
    }

    #[test]
    fn container_decodes_what_it_encodes() {
        let module = sample();
        assert_eq!(HasherModule::decode(&module.encode()).unwrap(), module);
    }

    #[test]
    fn header_and_framing_errors() {
        assert_eq!(HasherModule::decode(b"MZ\x90\x00"), Err(FormatError::BadMagic));
        assert_eq!(HasherModule::decode(b"CS"), Err(FormatError::BadMagic));

        let mut bytes = sample().encode();
        bytes[4] = 9;
        assert_eq!(HasherModule::decode(&bytes), Err(FormatError::UnsupportedVersion(9)));

        let bytes = sample().encode();
        assert_eq!(
            HasherModule::decode(&bytes[..bytes.len() - 1]),
            Err(FormatError::Truncated)
        );

        let mut bytes = sample().encode();
        bytes.push(0);
        assert_eq!(HasherModule::decode(&bytes), Err(FormatError::TrailingBytes));
    }

    #[test]
    fn body_decoding_keeps_offsets() {
        let body = encode_body(&[
            Instruction::LdSecret(vec![1, 2, 3]),
            Instruction::Other(0xFE17),
            Instruction::Ret,
        ]);
        let decoded = decode_body(&body).unwrap();
        assert_eq!(decoded[0], (0, Instruction::LdSecret(vec![1, 2, 3])));
        assert_eq!(decoded[1], (6, Instruction::Other(0xFE17)));
        assert_eq!(decoded[2], (8, Instruction::Ret));
        assert_eq!(decode_body(&[op::LDSECRET, 5, 0, 1]), Err(FormatError::Truncated));
    }
}
