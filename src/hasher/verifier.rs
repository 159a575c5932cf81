use thiserror::Error;
use tracing::warn;

use super::factory::{ALLOWED_IMPORTS, ENTRY_METHOD, ENTRY_TYPE};
use super::module::{
    decode_body, FormatError, HasherModule, Instruction, IMPL_INTERNAL_CALL, IMPL_UNMANAGED,
    METHOD_PINVOKE,
};

/// Indirect calls, raw block memory, stack allocation and access prefixes.
pub const DISALLOWED_OPCODES: [u16; 8] = [
    0x0027, // jmp
    0x0029, // calli
    0xFE0F, // localloc
    0xFE12, // unaligned.
    0xFE13, // volatile.
    0xFE14, // tail.
    0xFE17, // cpblk
    0xFE18, // initblk
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("not a valid attestation module: {0}")]
    Malformed(#[from] FormatError),

    #[error("references disallowed module `{0}`")]
    DisallowedImport(String),

    #[error("performs a foreign call via `{0}`")]
    ForeignCall(String),

    #[error("unexpected shape: {0}")]
    UnexpectedShape(String),

    #[error("method `{0}` is implemented outside the module")]
    UnmanagedImplementation(String),

    #[error("disallowed opcode 0x{opcode:04x} at offset {offset}")]
    DisallowedOpcode { opcode: u16, offset: usize },

    #[error("unknown opcode 0x{opcode:04x} at offset {offset}")]
    UnknownOpcode { opcode: u16, offset: usize },
}

/// Checks raw module bytes against the attestation contract and returns the
/// parsed module. Every failure is a security violation.
pub fn verify(bytes: &[u8]) -> Result<HasherModule, VerifyError> {
    let result = check(bytes);
    if let Err(err) = &result {
        warn!(target: "security", error = %err, "attestation module failed verification");
    }
    result
}

fn check(bytes: &[u8]) -> Result<HasherModule, VerifyError> {
    let module = HasherModule::decode(bytes)?;

    if let Some(import) = module
        .imports
        .iter()
        .find(|name| !ALLOWED_IMPORTS.contains(&name.as_str()))
    {
        return Err(VerifyError::DisallowedImport(import.clone()));
    }

    if let Some(native) = module.natives.first() {
        return Err(VerifyError::ForeignCall(format!("{}!{}", native.library, native.entry)));
    }

    let [ty] = module.types.as_slice() else {
        return Err(VerifyError::UnexpectedShape(format!(
            "expected exactly one type, found {}",
            module.types.len()
        )));
    };
    if ty.name != ENTRY_TYPE {
        return Err(VerifyError::UnexpectedShape(format!("unexpected type `{}`", ty.name)));
    }
    let [method] = ty.methods.as_slice() else {
        return Err(VerifyError::UnexpectedShape(format!(
            "expected exactly one method, found {}",
            ty.methods.len()
        )));
    };
    if method.name != ENTRY_METHOD {
        return Err(VerifyError::UnexpectedShape(format!(
            "unexpected method `{}`",
            method.name
        )));
    }

    if method.flags & METHOD_PINVOKE != 0 {
        return Err(VerifyError::ForeignCall(method.name.clone()));
    }
    if method.impl_flags & (IMPL_UNMANAGED | IMPL_INTERNAL_CALL) != 0 {
        return Err(VerifyError::UnmanagedImplementation(method.name.clone()));
    }

    for (offset, instruction) in decode_body(&method.body)? {
        match instruction {
            Instruction::CallNative(idx) => {
                return Err(VerifyError::ForeignCall(format!("native #{}", idx)));
            }
            Instruction::Other(opcode) if DISALLOWED_OPCODES.contains(&opcode) => {
                return Err(VerifyError::DisallowedOpcode { opcode, offset });
            }
            Instruction::Other(opcode) => {
                return Err(VerifyError::UnknownOpcode { opcode, offset });
            }
            _ => {}
        }
    }

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::factory::compile;
    use crate::hasher::module::{encode_body, NativeImport, MethodDef, TypeDef};
    use crate::hasher::HasherFlavor;

    fn valid() -> HasherModule {
        let bytes = compile(b"secret", &[0, 2, 4], HasherFlavor::Server).unwrap();
        HasherModule::decode(&bytes).unwrap()
    }

    fn with_body(extra: Instruction) -> Vec<u8> {
        let mut module = valid();
        let method = &mut module.types[0].methods[0];
        let mut body = encode_body(&[extra]);
        body.extend_from_slice(&method.body);
        method.body = body;
        module.encode()
    }

    #[test]
    fn accepts_generated_module() {
        let module = verify(&valid().encode()).unwrap();
        assert_eq!(module.types[0].methods[0].name, ENTRY_METHOD);
    }

    #[test]
    fn rejects_raw_block_copy_but_accepts_same_module_without_it() {
        let err = verify(&with_body(Instruction::Other(0xFE17))).unwrap_err();
        assert_eq!(err, VerifyError::DisallowedOpcode { opcode: 0xFE17, offset: 0 });
        assert!(verify(&with_body(Instruction::Nop)).is_ok());
    }

    #[test]
    fn rejects_each_disallowed_opcode() {
        for opcode in DISALLOWED_OPCODES {
            assert!(matches!(
                verify(&with_body(Instruction::Other(opcode))),
                Err(VerifyError::DisallowedOpcode { .. })
            ));
        }
        assert!(matches!(
            verify(&with_body(Instruction::Other(0x99))),
            Err(VerifyError::UnknownOpcode { opcode: 0x99, .. })
        ));
    }

    #[test]
    fn rejects_foreign_calls() {
        assert!(matches!(
            verify(&with_body(Instruction::CallNative(0))),
            Err(VerifyError::ForeignCall(_))
        ));

        let mut module = valid();
        module.natives.push(NativeImport {
            library: "kernel32".into(),
            entry: "VirtualProtect".into(),
        });
        assert!(matches!(verify(&module.encode()), Err(VerifyError::ForeignCall(_))));

        let mut module = valid();
        module.types[0].methods[0].flags |= METHOD_PINVOKE;
        assert!(matches!(verify(&module.encode()), Err(VerifyError::ForeignCall(_))));

        let mut module = valid();
        module.types[0].methods[0].impl_flags |= IMPL_UNMANAGED;
        assert!(matches!(
            verify(&module.encode()),
            Err(VerifyError::UnmanagedImplementation(_))
        ));
    }

    #[test]
    fn rejects_imports_outside_allow_list() {
        let mut module = valid();
        module.imports.push("cshm.io".into());
        assert_eq!(
            verify(&module.encode()),
            Err(VerifyError::DisallowedImport("cshm.io".into()))
        );
    }

    #[test]
    fn rejects_unexpected_shapes() {
        let mut module = valid();
        let extra = module.types[0].methods[0].clone();
        module.types[0].methods.push(MethodDef {
            name: "Helper".into(),
            ..extra
        });
        assert!(matches!(verify(&module.encode()), Err(VerifyError::UnexpectedShape(_))));

        let mut module = valid();
        module.types.push(TypeDef {
            namespace: "X".into(),
            name: "Other".into(),
            flags: 0,
            methods: vec![],
        });
        assert!(matches!(verify(&module.encode()), Err(VerifyError::UnexpectedShape(_))));

        let mut module = valid();
        module.types[0].name = "Hashr".into();
        assert!(matches!(verify(&module.encode()), Err(VerifyError::UnexpectedShape(_))));

        assert!(matches!(verify(b"garbage"), Err(VerifyError::Malformed(_))));
    }
}
