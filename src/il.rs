//! Textual normalization of method bodies.
//!
//! Raw bodies differ between processes in metadata-token row numbers, so
//! challenge answers are compared as `mnemonic operand` lines where tokens
//! render only by table and branches render as absolute targets.

use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    None,
    ShortInt,
    Int32,
    Int64,
    Float32,
    Float64,
    ShortVar,
    Var,
    ShortBranch,
    Branch,
    Token,
    Switch,
}

fn one_byte(code: u8) -> Option<(&'static str, Operand)> {
    use Operand::*;
    let entry = match code {
        0x00 => ("nop", None),
        0x01 => ("break", None),
        0x02 => ("ldarg.0", None),
        0x03 => ("ldarg.1", None),
        0x04 => ("ldarg.2", None),
        0x05 => ("ldarg.3", None),
        0x06 => ("ldloc.0", None),
        0x07 => ("ldloc.1", None),
        0x08 => ("ldloc.2", None),
        0x09 => ("ldloc.3", None),
        0x0A => ("stloc.0", None),
        0x0B => ("stloc.1", None),
        0x0C => ("stloc.2", None),
        0x0D => ("stloc.3", None),
        0x0E => ("ldarg.s", ShortVar),
        0x0F => ("ldarga.s", ShortVar),
        0x10 => ("starg.s", ShortVar),
        0x11 => ("ldloc.s", ShortVar),
        0x12 => ("ldloca.s", ShortVar),
        0x13 => ("stloc.s", ShortVar),
        0x14 => ("ldnull", None),
        0x15 => ("ldc.i4.m1", None),
        0x16 => ("ldc.i4.0", None),
        0x17 => ("ldc.i4.1", None),
        0x18 => ("ldc.i4.2", None),
        0x19 => ("ldc.i4.3", None),
        0x1A => ("ldc.i4.4", None),
        0x1B => ("ldc.i4.5", None),
        0x1C => ("ldc.i4.6", None),
        0x1D => ("ldc.i4.7", None),
        0x1E => ("ldc.i4.8", None),
        0x1F => ("ldc.i4.s", ShortInt),
        0x20 => ("ldc.i4", Int32),
        0x21 => ("ldc.i8", Int64),
        0x22 => ("ldc.r4", Float32),
        0x23 => ("ldc.r8", Float64),
        0x25 => ("dup", None),
        0x26 => ("pop", None),
        0x27 => ("jmp", Token),
        0x28 => ("call", Token),
        0x29 => ("calli", Token),
        0x2A => ("ret", None),
        0x2B => ("br.s", ShortBranch),
        0x2C => ("brfalse.s", ShortBranch),
        0x2D => ("brtrue.s", ShortBranch),
        0x2E => ("beq.s", ShortBranch),
        0x2F => ("bge.s", ShortBranch),
        0x30 => ("bgt.s", ShortBranch),
        0x31 => ("ble.s", ShortBranch),
        0x32 => ("blt.s", ShortBranch),
        0x33 => ("bne.un.s", ShortBranch),
        0x34 => ("bge.un.s", ShortBranch),
        0x35 => ("bgt.un.s", ShortBranch),
        0x36 => ("ble.un.s", ShortBranch),
        0x37 => ("blt.un.s", ShortBranch),
        0x38 => ("br", Branch),
        0x39 => ("brfalse", Branch),
        0x3A => ("brtrue", Branch),
        0x3B => ("beq", Branch),
        0x3C => ("bge", Branch),
        0x3D => ("bgt", Branch),
        0x3E => ("ble", Branch),
        0x3F => ("blt", Branch),
        0x40 => ("bne.un", Branch),
        0x41 => ("bge.un", Branch),
        0x42 => ("bgt.un", Branch),
        0x43 => ("ble.un", Branch),
        0x44 => ("blt.un", Branch),
        0x45 => ("switch", Switch),
        0x46 => ("ldind.i1", None),
        0x47 => ("ldind.u1", None),
        0x48 => ("ldind.i2", None),
        0x49 => ("ldind.u2", None),
        0x4A => ("ldind.i4", None),
        0x4B => ("ldind.u4", None),
        0x4C => ("ldind.i8", None),
        0x4D => ("ldind.i", None),
        0x4E => ("ldind.r4", None),
        0x4F => ("ldind.r8", None),
        0x50 => ("ldind.ref", None),
        0x51 => ("stind.ref", None),
        0x52 => ("stind.i1", None),
        0x53 => ("stind.i2", None),
        0x54 => ("stind.i4", None),
        0x55 => ("stind.i8", None),
        0x56 => ("stind.r4", None),
        0x57 => ("stind.r8", None),
        0x58 => ("add", None),
        0x59 => ("sub", None),
        0x5A => ("mul", None),
        0x5B => ("div", None),
        0x5C => ("div.un", None),
        0x5D => ("rem", None),
        0x5E => ("rem.un", None),
        0x5F => ("and", None),
        0x60 => ("or", None),
        0x61 => ("xor", None),
        0x62 => ("shl", None),
        0x63 => ("shr", None),
        0x64 => ("shr.un", None),
        0x65 => ("neg", None),
        0x66 => ("not", None),
        0x67 => ("conv.i1", None),
        0x68 => ("conv.i2", None),
        0x69 => ("conv.i4", None),
        0x6A => ("conv.i8", None),
        0x6B => ("conv.r4", None),
        0x6C => ("conv.r8", None),
        0x6D => ("conv.u4", None),
        0x6E => ("conv.u8", None),
        0x6F => ("callvirt", Token),
        0x70 => ("cpobj", Token),
        0x71 => ("ldobj", Token),
        0x72 => ("ldstr", Token),
        0x73 => ("newobj", Token),
        0x74 => ("castclass", Token),
        0x75 => ("isinst", Token),
        0x76 => ("conv.r.un", None),
        0x79 => ("unbox", Token),
        0x7A => ("throw", None),
        0x7B => ("ldfld", Token),
        0x7C => ("ldflda", Token),
        0x7D => ("stfld", Token),
        0x7E => ("ldsfld", Token),
        0x7F => ("ldsflda", Token),
        0x80 => ("stsfld", Token),
        0x81 => ("stobj", Token),
        0x82 => ("conv.ovf.i1.un", None),
        0x83 => ("conv.ovf.i2.un", None),
        0x84 => ("conv.ovf.i4.un", None),
        0x85 => ("conv.ovf.i8.un", None),
        0x86 => ("conv.ovf.u1.un", None),
        0x87 => ("conv.ovf.u2.un", None),
        0x88 => ("conv.ovf.u4.un", None),
        0x89 => ("conv.ovf.u8.un", None),
        0x8A => ("conv.ovf.i.un", None),
        0x8B => ("conv.ovf.u.un", None),
        0x8C => ("box", Token),
        0x8D => ("newarr", Token),
        0x8E => ("ldlen", None),
        0x8F => ("ldelema", Token),
        0x90 => ("ldelem.i1", None),
        0x91 => ("ldelem.u1", None),
        0x92 => ("ldelem.i2", None),
        0x93 => ("ldelem.u2", None),
        0x94 => ("ldelem.i4", None),
        0x95 => ("ldelem.u4", None),
        0x96 => ("ldelem.i8", None),
        0x97 => ("ldelem.i", None),
        0x98 => ("ldelem.r4", None),
        0x99 => ("ldelem.r8", None),
        0x9A => ("ldelem.ref", None),
        0x9B => ("stelem.i", None),
        0x9C => ("stelem.i1", None),
        0x9D => ("stelem.i2", None),
        0x9E => ("stelem.i4", None),
        0x9F => ("stelem.i8", None),
        0xA0 => ("stelem.r4", None),
        0xA1 => ("stelem.r8", None),
        0xA2 => ("stelem.ref", None),
        0xA3 => ("ldelem", Token),
        0xA4 => ("stelem", Token),
        0xA5 => ("unbox.any", Token),
        0xB3 => ("conv.ovf.i1", None),
        0xB4 => ("conv.ovf.u1", None),
        0xB5 => ("conv.ovf.i2", None),
        0xB6 => ("conv.ovf.u2", None),
        0xB7 => ("conv.ovf.i4", None),
        0xB8 => ("conv.ovf.u4", None),
        0xB9 => ("conv.ovf.i8", None),
        0xBA => ("conv.ovf.u8", None),
        0xC2 => ("refanyval", Token),
        0xC3 => ("ckfinite", None),
        0xC6 => ("mkrefany", Token),
        0xD0 => ("ldtoken", Token),
        0xD1 => ("conv.u2", None),
        0xD2 => ("conv.u1", None),
        0xD3 => ("conv.i", None),
        0xD4 => ("conv.ovf.i", None),
        0xD5 => ("conv.ovf.u", None),
        0xD6 => ("add.ovf", None),
        0xD7 => ("add.ovf.un", None),
        0xD8 => ("mul.ovf", None),
        0xD9 => ("mul.ovf.un", None),
        0xDA => ("sub.ovf", None),
        0xDB => ("sub.ovf.un", None),
        0xDC => ("endfinally", None),
        0xDD => ("leave", Branch),
        0xDE => ("leave.s", ShortBranch),
        0xDF => ("stind.i", None),
        0xE0 => ("conv.u", None),
        _ => return Option::None,
    };
    Some(entry)
}

fn two_byte(code: u8) -> Option<(&'static str, Operand)> {
    use Operand::*;
    let entry = match code {
        0x00 => ("arglist", None),
        0x01 => ("ceq", None),
        0x02 => ("cgt", None),
        0x03 => ("cgt.un", None),
        0x04 => ("clt", None),
        0x05 => ("clt.un", None),
        0x06 => ("ldftn", Token),
        0x07 => ("ldvirtftn", Token),
        0x09 => ("ldarg", Var),
        0x0A => ("ldarga", Var),
        0x0B => ("starg", Var),
        0x0C => ("ldloc", Var),
        0x0D => ("ldloca", Var),
        0x0E => ("stloc", Var),
        0x0F => ("localloc", None),
        0x11 => ("endfilter", None),
        0x12 => ("unaligned.", ShortInt),
        0x13 => ("volatile.", None),
        0x14 => ("tail.", None),
        0x15 => ("initobj", Token),
        0x16 => ("constrained.", Token),
        0x17 => ("cpblk", None),
        0x18 => ("initblk", None),
        0x19 => ("no.", ShortInt),
        0x1A => ("rethrow", None),
        0x1C => ("sizeof", Token),
        0x1D => ("refanytype", None),
        0x1E => ("readonly.", None),
        _ => return Option::None,
    };
    Some(entry)
}

fn table_name(token: u32) -> &'static str {
    match token >> 24 {
        0x01 => "typeref",
        0x02 => "typedef",
        0x04 => "field",
        0x06 => "method",
        0x0A => "memberref",
        0x11 => "signature",
        0x1B => "typespec",
        0x2B => "methodspec",
        0x70 => "string",
        _ => "token",
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        slice.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }
}

fn render_operand(kind: Operand, cursor: &mut Cursor<'_>, out: &mut String) -> Option<()> {
    match kind {
        Operand::None => {}
        Operand::ShortInt => {
            let _ = write!(out, " {}", cursor.take::<1>()?[0] as i8);
        }
        Operand::Int32 => {
            let _ = write!(out, " {}", i32::from_le_bytes(cursor.take::<4>()?));
        }
        Operand::Int64 => {
            let _ = write!(out, " {}", i64::from_le_bytes(cursor.take::<8>()?));
        }
        Operand::Float32 => {
            let _ = write!(out, " {}", f32::from_le_bytes(cursor.take::<4>()?));
        }
        Operand::Float64 => {
            let _ = write!(out, " {}", f64::from_le_bytes(cursor.take::<8>()?));
        }
        Operand::ShortVar => {
            let _ = write!(out, " V_{}", cursor.u8()?);
        }
        Operand::Var => {
            let _ = write!(out, " V_{}", u16::from_le_bytes(cursor.take::<2>()?));
        }
        Operand::ShortBranch => {
            let delta = cursor.take::<1>()?[0] as i8 as i64;
            let _ = write!(out, " IL_{:04x}", cursor.pos as i64 + delta);
        }
        Operand::Branch => {
            let delta = i32::from_le_bytes(cursor.take::<4>()?) as i64;
            let _ = write!(out, " IL_{:04x}", cursor.pos as i64 + delta);
        }
        Operand::Token => {
            let token = u32::from_le_bytes(cursor.take::<4>()?);
            let _ = write!(out, " <{}>", table_name(token));
        }
        Operand::Switch => {
            let count = u32::from_le_bytes(cursor.take::<4>()?) as usize;
            let base = cursor.pos as i64 + 4 * count as i64;
            let mut targets = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                let delta = i32::from_le_bytes(cursor.take::<4>()?) as i64;
                targets.push(format!("IL_{:04x}", base + delta));
            }
            let _ = write!(out, " ({})", targets.join(","));
        }
    }
    Some(())
}

/// One line per instruction. Truncated operands end the listing with
/// `<truncated>`, unknown opcodes render as `unknown.0xNN`.
pub fn normalize(body: &[u8]) -> String {
    let mut out = String::new();
    let mut cursor = Cursor { bytes: body, pos: 0 };
    while let Some(first) = cursor.u8() {
        let decoded = if first == 0xFE {
            match cursor.u8() {
                Some(second) => two_byte(second).ok_or(0xFE00 | second as u16),
                None => {
                    out.push_str("<truncated>\n");
                    break;
                }
            }
        } else {
            one_byte(first).ok_or(first as u16)
        };
        match decoded {
            Ok((mnemonic, operand)) => {
                out.push_str(mnemonic);
                if render_operand(operand, &mut cursor, &mut out).is_none() {
                    out.push_str(" <truncated>\n");
                    break;
                }
            }
            Err(code) => {
                let _ = write!(out, "unknown.0x{:02x}", code);
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_mnemonics_and_operands() {
        // ldarg.0; ldc.i4.s -3; ldc.i4 1000; ret
        let body = [0x02, 0x1F, 0xFD, 0x20, 0xE8, 0x03, 0x00, 0x00, 0x2A];
        assert_eq!(normalize(&body), "ldarg.0\nldc.i4.s -3\nldc.i4 1000\nret\n");
    }

    #[test]
    fn metadata_rows_do_not_matter() {
        // call <memberref row 5> vs call <memberref row 9>
        let a = [0x28, 0x05, 0x00, 0x00, 0x0A, 0x2A];
        let b = [0x28, 0x09, 0x00, 0x00, 0x0A, 0x2A];
        assert_eq!(normalize(&a), normalize(&b));
        assert_eq!(normalize(&a), "call <memberref>\nret\n");

        let field = [0x7B, 0x05, 0x00, 0x00, 0x04, 0x2A];
        assert_ne!(normalize(&a), normalize(&field));
    }

    #[test]
    fn branches_resolve_to_absolute_targets() {
        // br.s +1; nop; ret
        let body = [0x2B, 0x01, 0x00, 0x2A];
        assert_eq!(normalize(&body), "br.s IL_0003\nnop\nret\n");
    }

    #[test]
    fn switch_targets() {
        let body = [
            0x45, 0x02, 0x00, 0x00, 0x00, // switch, 2 targets
            0x00, 0x00, 0x00, 0x00, //
            0x01, 0x00, 0x00, 0x00, //
            0x00, 0x2A,
        ];
        assert_eq!(normalize(&body), "switch (IL_000d,IL_000e)\nnop\nret\n");
    }

    #[test]
    fn two_byte_and_unknown_opcodes() {
        let body = [0xFE, 0x01, 0xFE, 0x17, 0xFE, 0xFF, 0x24];
        assert_eq!(normalize(&body), "ceq\ncpblk\nunknown.0xfeff\nunknown.0x24\n");
    }

    #[test]
    fn truncation_is_reported() {
        assert_eq!(normalize(&[0x20, 0x01]), "ldc.i4 <truncated>\n");
        assert_eq!(normalize(&[0xFE]), "<truncated>\n");
        assert_eq!(normalize(&[]), "");
    }
}
