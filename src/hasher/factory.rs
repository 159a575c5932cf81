use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use super::module::{
    encode_body, HasherModule, Instruction, MethodDef, TypeDef, METHOD_PUBLIC, METHOD_STATIC,
    PARAM_MODULE, TYPE_PUBLIC, TYPE_SEALED,
};
use super::slots::{Slot, SLOT_COUNT};
use super::AttestationError;

pub const ENTRY_NAMESPACE: &str = "CleanSpace";
pub const ENTRY_TYPE: &str = "Hasher";
pub const ENTRY_METHOD: &str = "ComputeHash";
pub const SLOTS_PER_HASHER: usize = 3;
pub const ALLOWED_IMPORTS: [&str; 3] = ["cshm.core", "cshm.digest", "cshm.text"];

/// Where the module finds the assembly it fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasherFlavor {
    /// Fingerprints the security module loaded next to it.
    Client,
    /// Fingerprints the module passed as argument 0.
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedHasher {
    pub bytes: Vec<u8>,
    pub slots: Vec<u8>,
    pub flavor: HasherFlavor,
}

/// Builds a client module over a random choice and order of slots.
pub fn make_hasher<R: Rng + ?Sized>(secret: &[u8], rng: &mut R) -> Result<GeneratedHasher, AttestationError> {
    let mut ids: Vec<u8> = (0..SLOT_COUNT).collect();
    ids.shuffle(rng);
    ids.truncate(SLOTS_PER_HASHER);
    let bytes = compile(secret, &ids, HasherFlavor::Client)?;
    debug!(slots = ?ids, len = bytes.len(), "generated attestation module");
    Ok(GeneratedHasher {
        bytes,
        slots: ids,
        flavor: HasherFlavor::Client,
    })
}

/// Rebuilds the server-side counterpart of a module made by [`make_hasher`].
pub fn make_server_equivalent(secret: &[u8], slots: &[u8]) -> Result<GeneratedHasher, AttestationError> {
    let bytes = compile(secret, slots, HasherFlavor::Server)?;
    Ok(GeneratedHasher {
        bytes,
        slots: slots.to_vec(),
        flavor: HasherFlavor::Server,
    })
}

pub fn compile(secret: &[u8], slots: &[u8], flavor: HasherFlavor) -> Result<Vec<u8>, AttestationError> {
    let mut diagnostics = Vec::new();
    if secret.is_empty() {
        diagnostics.push("secret is empty".to_string());
    }
    if secret.len() > u16::MAX as usize {
        diagnostics.push(format!("secret of {} bytes does not fit an operand", secret.len()));
    }
    if slots.len() != SLOTS_PER_HASHER {
        diagnostics.push(format!(
            "expected {} slots, got {}",
            SLOTS_PER_HASHER,
            slots.len()
        ));
    }
    for (i, id) in slots.iter().enumerate() {
        if Slot::from_id(*id).is_none() {
            diagnostics.push(format!("slot id {} out of range", id));
        }
        if slots[..i].contains(id) {
            diagnostics.push(format!("slot id {} selected twice", id));
        }
    }
    if !diagnostics.is_empty() {
        return Err(AttestationError::Compile(diagnostics));
    }

    let mut body = vec![
        Instruction::LdSecret(secret.to_vec()),
        match flavor {
            HasherFlavor::Client => Instruction::LdSelf,
            HasherFlavor::Server => Instruction::LdArg(0),
        },
    ];
    body.extend(slots.iter().map(|id| Instruction::Slot(*id)));
    body.extend([
        Instruction::Digest,
        Instruction::XorSecret,
        Instruction::Encode,
        Instruction::Ret,
    ]);

    let params = match flavor {
        HasherFlavor::Client => Vec::new(),
        HasherFlavor::Server => vec![PARAM_MODULE],
    };

    let module = HasherModule {
        name: format!("attest_{}", slots.iter().map(|s| s.to_string()).collect::<String>()),
        imports: ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect(),
        natives: Vec::new(),
        types: vec![TypeDef {
            namespace: ENTRY_NAMESPACE.to_string(),
            name: ENTRY_TYPE.to_string(),
            flags: TYPE_PUBLIC | TYPE_SEALED,
            methods: vec![MethodDef {
                name: ENTRY_METHOD.to_string(),
                flags: METHOD_PUBLIC | METHOD_STATIC,
                impl_flags: 0,
                params,
                body: encode_body(&body),
            }],
        }],
    };
    Ok(module.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::verifier::verify;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn picks_three_distinct_slots() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let hasher = make_hasher(b"secret", &mut rng).unwrap();
            assert_eq!(hasher.slots.len(), SLOTS_PER_HASHER);
            let mut sorted = hasher.slots.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), SLOTS_PER_HASHER);
            assert!(verify(&hasher.bytes).is_ok());
        }
    }

    #[test]
    fn selections_vary() {
        let mut rng = StdRng::seed_from_u64(1);
        let first = make_hasher(b"secret", &mut rng).unwrap();
        let differs = (0..20).any(|_| make_hasher(b"secret", &mut rng).unwrap().slots != first.slots);
        assert!(differs);
    }

    #[test]
    fn server_equivalent_is_deterministic() {
        let a = make_server_equivalent(b"secret", &[5, 1, 3]).unwrap();
        let b = make_server_equivalent(b"secret", &[5, 1, 3]).unwrap();
        assert_eq!(a.bytes, b.bytes);
        let client = compile(b"secret", &[5, 1, 3], HasherFlavor::Client).unwrap();
        assert_ne!(client, a.bytes);
    }

    #[test]
    fn compile_reports_all_diagnostics() {
        let err = compile(b"", &[1, 1, 9], HasherFlavor::Server).unwrap_err();
        let AttestationError::Compile(diagnostics) = err else {
            panic!("expected compile failure");
        };
        assert_eq!(diagnostics.len(), 3);
        assert!(compile(b"s", &[0, 1], HasherFlavor::Server).is_err());
    }
}
