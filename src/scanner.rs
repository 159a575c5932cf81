//! Plugin detection and structural fingerprints of loaded modules.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::assembly::{ModuleCatalog, ModuleImage};
use crate::config::{PluginListEntry, PolicySettings};
use crate::crypto;
use crate::token::unix_now;

/// Interface every loadable plugin entry type implements.
pub const PLUGIN_INTERFACE: &str = "VRage.Plugins.IPlugin";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("fingerprint is not valid base64")]
    Encoding,

    #[error("unscrambled fingerprint has the wrong length: {0}")]
    Length(usize),

    #[error("assembly store: {0}")]
    Store(#[from] std::io::Error),
}

pub fn is_plugin(module: &ModuleImage, core_module: &str) -> bool {
    if module.name == core_module {
        return false;
    }
    module
        .types
        .iter()
        .any(|t| t.is_public() && t.is_class() && !t.is_abstract() && t.implements(PLUGIN_INTERFACE))
}

pub fn plugin_modules(catalog: &dyn ModuleCatalog) -> Vec<ModuleImage> {
    let core = catalog.core_module_name().to_string();
    catalog
        .loaded_modules()
        .into_iter()
        .filter(|m| is_plugin(m, &core))
        .collect()
}

fn canonical_rendering(module: &ModuleImage) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}|{}|{}", module.name, module.version, hex(&module.public_key_token));

    let mut types: Vec<_> = module.types.iter().collect();
    types.sort_by(|a, b| a.full_name.cmp(&b.full_name));
    for ty in types {
        let _ = writeln!(out, "T:{}|{:08x}", ty.full_name, ty.flags);

        let mut attributes = ty.custom_attributes.clone();
        attributes.sort();
        for attribute in attributes {
            let _ = writeln!(out, "A:{}", attribute);
        }

        let mut fields: Vec<_> = ty.fields.iter().collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        for field in fields {
            let _ = writeln!(out, "F:{}|{}|{}", field.name, field.field_type, field.is_public);
        }

        let mut methods: Vec<_> = ty.methods.iter().filter(|m| m.is_public).collect();
        methods.sort_by(|a, b| a.signature.cmp(&b.signature));
        for method in methods {
            let body = method.body.as_deref().map(hex).unwrap_or_default();
            let _ = writeln!(out, "M:{}|{}", method.signature, body);
        }
    }
    out
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

pub fn fingerprint_bytes(module: &ModuleImage) -> [u8; 32] {
    Sha256::digest(canonical_rendering(module).as_bytes()).into()
}

pub fn fingerprint(module: &ModuleImage) -> String {
    STANDARD.encode(fingerprint_bytes(module))
}

/// Fingerprint XORed with a repeating `secret`.
pub fn secure_fingerprint(module: &ModuleImage, secret: &[u8]) -> String {
    STANDARD.encode(crypto::xor_keystream(&fingerprint_bytes(module), secret))
}

pub fn unscramble(encoded: &str, secret: &[u8]) -> Result<String, ScanError> {
    let scrambled = STANDARD.decode(encoded).map_err(|_| ScanError::Encoding)?;
    if scrambled.len() != 32 {
        return Err(ScanError::Length(scrambled.len()));
    }
    Ok(STANDARD.encode(crypto::xor_keystream(&scrambled, secret)))
}

/// Keeps copies of analyzed plugin files and records them in the policy list.
pub struct AssemblyManager {
    store_dir: PathBuf,
}

impl AssemblyManager {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, ScanError> {
        let store_dir = data_dir.as_ref().join("AssemblyStore");
        fs::create_dir_all(&store_dir)?;
        Ok(Self { store_dir })
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Fingerprints `module` and lists it, storing a copy of `file` when one
    /// is given.
    pub fn add_plugin(
        &self,
        module: &ModuleImage,
        file: Option<&Path>,
        policy: &mut PolicySettings,
    ) -> Result<PluginListEntry, ScanError> {
        let location = match file {
            Some(path) => Some(self.store_copy(path)?),
            None => module.location.clone(),
        };
        let entry = PluginListEntry {
            is_selected: false,
            name: module.name.clone(),
            assembly_name: module.name.clone(),
            version: module.version.clone(),
            hash: fingerprint(module),
            last_hashed: unix_now(),
            location,
        };
        if policy.add_entry(entry.clone()) {
            info!(plugin = %entry.name, hash = %entry.hash, "added plugin to analyzed list");
        }
        Ok(entry)
    }

    /// Removes the entry with `hash` and its stored copy.
    pub fn remove_plugin(
        &self,
        hash: &str,
        policy: &mut PolicySettings,
    ) -> Result<Option<PluginListEntry>, ScanError> {
        let Some(entry) = policy.remove_hash(hash) else {
            return Ok(None);
        };
        if let Some(location) = &entry.location {
            let path = Path::new(location);
            if path.starts_with(&self.store_dir) && path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(Some(entry))
    }

    fn store_copy(&self, file: &Path) -> Result<String, ScanError> {
        if file.starts_with(&self.store_dir) {
            return Ok(file.display().to_string());
        }
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin.dll".to_string());
        let target = self
            .store_dir
            .join(format!("{:016x}_{}", OsRng.next_u64(), file_name));
        fs::copy(file, &target)?;
        Ok(target.display().to_string())
    }
}
