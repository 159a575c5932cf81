//! Structural view of a loaded module, as supplied by the host.

use serde::{Deserialize, Serialize};

pub const TYPE_PUBLIC: u32 = 0x0000_0001;
pub const TYPE_INTERFACE: u32 = 0x0000_0020;
pub const TYPE_ABSTRACT: u32 = 0x0000_0080;
pub const TYPE_SEALED: u32 = 0x0000_0100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub name: String,
    pub version: String,
    pub public_key_token: Vec<u8>,
    pub scopes: Vec<ScopeInfo>,
    pub types: Vec<TypeInfo>,
    pub location: Option<String>,
}

/// One module scope inside an assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub scope_name: String,
    pub metadata_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub full_name: String,
    pub flags: u32,
    pub interfaces: Vec<String>,
    pub custom_attributes: Vec<String>,
    pub fields: Vec<FieldInfo>,
    pub properties: Vec<PropertyInfo>,
    pub methods: Vec<MethodInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: String,
    pub is_public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    pub property_type: String,
    pub can_read: bool,
    pub can_write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub signature: String,
    pub parameter_types: Vec<String>,
    pub is_public: bool,
    pub is_special_name: bool,
    pub body: Option<Vec<u8>>,
    /// Native entry point once prepared. Zero with a body present means the
    /// method was redirected.
    pub entry_point: Option<u64>,
}

impl TypeInfo {
    pub fn new(full_name: impl Into<String>, flags: u32) -> Self {
        Self {
            full_name: full_name.into(),
            flags,
            interfaces: Vec::new(),
            custom_attributes: Vec::new(),
            fields: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.flags & TYPE_PUBLIC != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.flags & TYPE_ABSTRACT != 0
    }

    pub fn is_class(&self) -> bool {
        self.flags & TYPE_INTERFACE == 0
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }

    /// Overload whose parameter types match exactly.
    pub fn find_method(&self, name: &str, parameter_types: &[String]) -> Option<&MethodInfo> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.parameter_types == parameter_types)
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.custom_attributes.push(attribute.into());
        self
    }

    pub fn with_field(mut self, name: &str, field_type: &str, is_public: bool) -> Self {
        self.fields.push(FieldInfo {
            name: name.to_string(),
            field_type: field_type.to_string(),
            is_public,
        });
        self
    }

    pub fn with_property(mut self, name: &str, property_type: &str) -> Self {
        self.properties.push(PropertyInfo {
            name: name.to_string(),
            property_type: property_type.to_string(),
            can_read: true,
            can_write: false,
        });
        self
    }

    pub fn with_method(mut self, name: &str, parameter_types: &[&str], body: Vec<u8>) -> Self {
        let params: Vec<String> = parameter_types.iter().map(|p| p.to_string()).collect();
        self.methods.push(MethodInfo {
            name: name.to_string(),
            signature: format!("Void {}({})", name, params.join(", ")),
            parameter_types: params,
            is_public: true,
            is_special_name: name.starts_with('.'),
            body: Some(body),
            entry_point: Some(0x7ff0_0000_1000 + self.methods.len() as u64 * 0x40),
        });
        self
    }
}

impl ModuleImage {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            scopes: vec![ScopeInfo {
                scope_name: format!("{}.dll", name),
                metadata_version: 0x0002_0000,
            }],
            name,
            version: version.into(),
            public_key_token: Vec::new(),
            types: Vec::new(),
            location: None,
        }
    }

    pub fn with_type(mut self, ty: TypeInfo) -> Self {
        self.types.push(ty);
        self
    }

    pub fn with_public_key_token(mut self, token: Vec<u8>) -> Self {
        self.public_key_token = token;
        self
    }

    pub fn find_type(&self, full_name: &str) -> Option<&TypeInfo> {
        self.types.iter().find(|t| t.full_name == full_name)
    }
}

/// Host enumeration of the modules loaded into the current process.
pub trait ModuleCatalog: Send + Sync {
    fn loaded_modules(&self) -> Vec<ModuleImage>;

    /// Name of the host engine's own core module.
    fn core_module_name(&self) -> &str;

    fn find_type(&self, full_name: &str) -> Option<(ModuleImage, TypeInfo)> {
        self.loaded_modules().into_iter().find_map(|module| {
            let ty = module.find_type(full_name).cloned()?;
            Some((module, ty))
        })
    }

    /// First loaded module whose name contains `marker`.
    fn find_by_marker(&self, marker: &str) -> Option<ModuleImage> {
        self.loaded_modules()
            .into_iter()
            .find(|m| m.name.contains(marker))
    }
}

/// Fixed module list, used for reference images and in-process peers.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    modules: Vec<ModuleImage>,
    core_module: String,
}

impl StaticCatalog {
    pub fn new(core_module: impl Into<String>, modules: Vec<ModuleImage>) -> Self {
        Self {
            modules,
            core_module: core_module.into(),
        }
    }
}

impl ModuleCatalog for StaticCatalog {
    fn loaded_modules(&self) -> Vec<ModuleImage> {
        self.modules.clone()
    }

    fn core_module_name(&self) -> &str {
        &self.core_module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookups() {
        let module = ModuleImage::new("CleanSpaceShared", "1.0.0").with_type(
            TypeInfo::new("CleanSpaceShared.Hasher.HasherRunner", TYPE_PUBLIC)
                .with_method("Run", &["System.String"], vec![0x00, 0x2A])
                .with_method("Run", &[], vec![0x2A]),
        );
        let catalog = StaticCatalog::new("Sandbox.Game", vec![module]);
        let (found, ty) = catalog
            .find_type("CleanSpaceShared.Hasher.HasherRunner")
            .unwrap();
        assert_eq!(found.name, "CleanSpaceShared");
        assert_eq!(
            ty.find_method("Run", &[]).and_then(|m| m.body.clone()),
            Some(vec![0x2A])
        );
        assert_eq!(
            ty.find_method("Run", &["System.String".to_string()]).and_then(|m| m.body.clone()),
            Some(vec![0x00, 0x2A])
        );
        assert!(ty.find_method("Run", &["System.Int32".to_string()]).is_none());
        assert!(catalog.find_by_marker("CleanSpace").is_some());
        assert!(catalog.find_by_marker("Torch").is_none());
    }

    #[test]
    fn type_flags() {
        let ty = TypeInfo::new("A", TYPE_PUBLIC | TYPE_ABSTRACT);
        assert!(ty.is_public() && ty.is_abstract() && ty.is_class());
        assert!(!TypeInfo::new("I", TYPE_INTERFACE).is_class());
    }
}
