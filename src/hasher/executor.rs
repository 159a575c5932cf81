use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use super::factory::{ENTRY_METHOD, ENTRY_TYPE};
use super::module::{decode_body, Instruction, MethodDef, PARAM_MODULE};
use super::slots::Slot;
use super::verifier::verify;
use super::AttestationError;
use crate::assembly::{ModuleCatalog, ModuleImage};
use crate::crypto;

pub enum HasherArg<'a> {
    Module(&'a ModuleImage),
}

/// What an executing module may see of the host process.
pub struct ExecutionEnv<'a> {
    pub catalog: &'a dyn ModuleCatalog,
    pub security_marker: &'a str,
}

/// Verifies `bytes`, then runs its entry point with `args`.
pub fn execute(bytes: &[u8], env: &ExecutionEnv<'_>, args: &[HasherArg<'_>]) -> Result<String, AttestationError> {
    let module = verify(bytes)?;
    let method = module
        .types
        .iter()
        .filter(|t| t.name == ENTRY_TYPE)
        .flat_map(|t| t.methods.iter())
        .find(|m| m.name == ENTRY_METHOD)
        .ok_or(AttestationError::MissingEntryPoint)?;
    check_arguments(method, args)?;
    run(method, env, args)
}

fn check_arguments(method: &MethodDef, args: &[HasherArg<'_>]) -> Result<(), AttestationError> {
    if method.params.len() != args.len() {
        return Err(AttestationError::ArgumentMismatch {
            expected: method.params.len(),
            got: args.len(),
        });
    }
    for (kind, arg) in method.params.iter().zip(args) {
        match (*kind, arg) {
            (PARAM_MODULE, HasherArg::Module(_)) => {}
            _ => {
                return Err(AttestationError::ArgumentMismatch {
                    expected: method.params.len(),
                    got: args.len(),
                })
            }
        }
    }
    Ok(())
}

fn run(method: &MethodDef, env: &ExecutionEnv<'_>, args: &[HasherArg<'_>]) -> Result<String, AttestationError> {
    let mut secret: Option<Vec<u8>> = None;
    let mut target: Option<ModuleImage> = None;
    let mut text = String::new();
    let mut digest: Option<Vec<u8>> = None;
    let mut encoded: Option<String> = None;

    let fail = |msg: &str| AttestationError::Execution(msg.to_string());

    for (_, instruction) in decode_body(&method.body).map_err(|e| AttestationError::Execution(e.to_string()))? {
        match instruction {
            Instruction::Nop => {}
            Instruction::LdSecret(bytes) => secret = Some(bytes),
            Instruction::LdSelf => {
                let own = env
                    .catalog
                    .find_by_marker(env.security_marker)
                    .ok_or_else(|| fail("security module is not loaded"))?;
                target = Some(own);
            }
            Instruction::LdArg(idx) => match args.get(idx as usize) {
                Some(HasherArg::Module(module)) => target = Some((*module).clone()),
                None => return Err(fail("argument index out of range")),
            },
            Instruction::Slot(id) => {
                let slot = Slot::from_id(id).ok_or_else(|| fail("unknown slot"))?;
                let module = target.as_ref().ok_or_else(|| fail("slot used before a target was loaded"))?;
                slot.render(module, &mut text);
            }
            Instruction::Digest => digest = Some(Sha256::digest(text.as_bytes()).to_vec()),
            Instruction::XorSecret => {
                let key = secret.as_deref().ok_or_else(|| fail("no secret loaded"))?;
                let value = digest.take().ok_or_else(|| fail("xor before digest"))?;
                digest = Some(crypto::xor_keystream(&value, key));
            }
            Instruction::Encode => {
                let value = digest.as_deref().ok_or_else(|| fail("encode before digest"))?;
                encoded = Some(STANDARD.encode(value));
            }
            Instruction::Ret => return encoded.ok_or_else(|| fail("returned without a value")),
            Instruction::CallNative(_) | Instruction::Other(_) => {
                return Err(fail("instruction outside the verified set"))
            }
        }
    }
    Err(fail("body ended without ret"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{StaticCatalog, TypeInfo, TYPE_PUBLIC};
    use crate::hasher::factory::{compile, make_hasher, make_server_equivalent};
    use crate::hasher::module::HasherModule;
    use crate::hasher::HasherFlavor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn security_module(body: Vec<u8>) -> ModuleImage {
        ModuleImage::new("CleanSpaceShared", "1.4.0").with_type(
            TypeInfo::new("CleanSpaceShared.Hasher.HasherRunner", TYPE_PUBLIC)
                .with_field("secret", "System.Byte[]", false)
                .with_attribute("CompilerGenerated")
                .with_property("Ready", "System.Boolean")
                .with_method("Run", &["System.Reflection.Assembly"], body),
        )
    }

    fn catalog(module: ModuleImage) -> StaticCatalog {
        StaticCatalog::new("Sandbox.Game", vec![module])
    }

    #[test]
    fn client_and_server_flavors_agree_on_same_module() {
        let mut rng = StdRng::seed_from_u64(42);
        let secret = b"per-session-secret";
        let client = make_hasher(secret, &mut rng).unwrap();
        let server = make_server_equivalent(secret, &client.slots).unwrap();

        let module = security_module(vec![0x02, 0x28, 0x01, 0x00, 0x00, 0x0A, 0x2A]);
        let client_catalog = catalog(module.clone());
        let env = ExecutionEnv {
            catalog: &client_catalog,
            security_marker: "CleanSpace",
        };
        let claimed = execute(&client.bytes, &env, &[]).unwrap();
        let expected = execute(&server.bytes, &env, &[HasherArg::Module(&module)]).unwrap();
        assert_eq!(claimed, expected);
    }

    #[test]
    fn tampered_module_changes_result() {
        let secret = b"per-session-secret";
        let server = compile(secret, &[1, 0, 2], HasherFlavor::Server).unwrap();
        let original = security_module(vec![0x02, 0x2A]);
        let patched = security_module(vec![0x03, 0x2A]);
        let empty = StaticCatalog::new("Sandbox.Game", vec![]);
        let env = ExecutionEnv {
            catalog: &empty,
            security_marker: "CleanSpace",
        };
        let a = execute(&server, &env, &[HasherArg::Module(&original)]).unwrap();
        let b = execute(&server, &env, &[HasherArg::Module(&patched)]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn secret_masks_the_digest() {
        let module = security_module(vec![0x2A]);
        let empty = StaticCatalog::new("Sandbox.Game", vec![]);
        let env = ExecutionEnv {
            catalog: &empty,
            security_marker: "CleanSpace",
        };
        let a = compile(b"one", &[0, 1, 2], HasherFlavor::Server).unwrap();
        let b = compile(b"two", &[0, 1, 2], HasherFlavor::Server).unwrap();
        assert_ne!(
            execute(&a, &env, &[HasherArg::Module(&module)]).unwrap(),
            execute(&b, &env, &[HasherArg::Module(&module)]).unwrap()
        );
    }

    #[test]
    fn client_flavor_needs_security_module() {
        let bytes = compile(b"s", &[0, 1, 2], HasherFlavor::Client).unwrap();
        let empty = StaticCatalog::new("Sandbox.Game", vec![]);
        let env = ExecutionEnv {
            catalog: &empty,
            security_marker: "CleanSpace",
        };
        assert!(matches!(
            execute(&bytes, &env, &[]),
            Err(AttestationError::Execution(_))
        ));
    }

    #[test]
    fn argument_count_must_match() {
        let bytes = compile(b"s", &[0, 1, 2], HasherFlavor::Server).unwrap();
        let empty = StaticCatalog::new("Sandbox.Game", vec![]);
        let env = ExecutionEnv {
            catalog: &empty,
            security_marker: "CleanSpace",
        };
        assert!(matches!(
            execute(&bytes, &env, &[]),
            Err(AttestationError::ArgumentMismatch { expected: 1, got: 0 })
        ));
    }

    #[test]
    fn verification_failures_surface_as_security_errors() {
        let bytes = compile(b"s", &[0, 1, 2], HasherFlavor::Server).unwrap();
        let mut module = HasherModule::decode(&bytes).unwrap();
        module.types[0].methods[0].body.insert(0, 0x29);
        let empty = StaticCatalog::new("Sandbox.Game", vec![]);
        let env = ExecutionEnv {
            catalog: &empty,
            security_marker: "CleanSpace",
        };
        let m = security_module(vec![]);
        assert!(matches!(
            execute(&module.encode(), &env, &[HasherArg::Module(&m)]),
            Err(AttestationError::Security(_))
        ));
    }

    #[test]
    fn body_without_ret_fails() {
        let bytes = compile(b"s", &[0, 1, 2], HasherFlavor::Server).unwrap();
        let mut module = HasherModule::decode(&bytes).unwrap();
        module.types[0].methods[0].body.pop();
        let empty = StaticCatalog::new("Sandbox.Game", vec![]);
        let env = ExecutionEnv {
            catalog: &empty,
            security_marker: "CleanSpace",
        };
        let m = security_module(vec![]);
        assert!(matches!(
            execute(&module.encode(), &env, &[HasherArg::Module(&m)]),
            Err(AttestationError::Execution(_))
        ));
    }
}
