use std::fmt::Write as _;

use crate::assembly::{ModuleImage, TypeInfo};

pub const SLOT_COUNT: u8 = 6;

/// Interchangeable structural views an attestation module can fold into its
/// digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Modules,
    MethodBodies,
    Fields,
    Attributes,
    Properties,
    Detours,
}

impl Slot {
    pub const ALL: [Slot; SLOT_COUNT as usize] = [
        Slot::Modules,
        Slot::MethodBodies,
        Slot::Fields,
        Slot::Attributes,
        Slot::Properties,
        Slot::Detours,
    ];

    pub fn from_id(id: u8) -> Option<Slot> {
        Slot::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn render(self, module: &ModuleImage, out: &mut String) {
        match self {
            Slot::Modules => {
                for scope in &module.scopes {
                    let _ = writeln!(out, "{}|{}", scope.scope_name, scope.metadata_version);
                }
            }
            Slot::MethodBodies => {
                for ty in sorted_types(module) {
                    for method in &ty.methods {
                        let _ = write!(out, "{}::{}:", ty.full_name, method.signature);
                        if let Some(body) = &method.body {
                            for b in body {
                                let _ = write!(out, "{:02x}", b);
                            }
                        }
                        out.push('\n');
                    }
                }
            }
            Slot::Fields => {
                for ty in sorted_types(module) {
                    let mut fields: Vec<_> = ty.fields.iter().collect();
                    fields.sort_by(|a, b| a.name.cmp(&b.name));
                    for field in fields {
                        let _ = writeln!(out, "{}.{}:{}", ty.full_name, field.name, field.field_type);
                    }
                }
            }
            Slot::Attributes => {
                for ty in sorted_types(module) {
                    for attribute in &ty.custom_attributes {
                        let _ = writeln!(out, "{}[{}]", ty.full_name, attribute);
                    }
                }
            }
            Slot::Properties => {
                for ty in sorted_types(module) {
                    for property in &ty.properties {
                        let _ = writeln!(
                            out,
                            "{}.{}:{}:{}{}",
                            ty.full_name,
                            property.name,
                            property.property_type,
                            if property.can_read { "r" } else { "-" },
                            if property.can_write { "w" } else { "-" },
                        );
                    }
                }
            }
            Slot::Detours => {
                for ty in sorted_types(module) {
                    for method in &ty.methods {
                        let has_body = method.body.as_ref().is_some_and(|b| !b.is_empty());
                        let detoured = has_body && method.entry_point.unwrap_or(0) == 0;
                        let _ = writeln!(
                            out,
                            "{}::{} :: Detoured={}",
                            ty.full_name, method.signature, detoured
                        );
                    }
                }
            }
        }
    }
}

fn sorted_types(module: &ModuleImage) -> Vec<&TypeInfo> {
    let mut types: Vec<_> = module.types.iter().collect();
    types.sort_by(|a, b| a.full_name.cmp(&b.full_name));
    types
}
