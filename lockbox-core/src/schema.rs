//! Schemas describe which attribute keys and value types are valid for a
//! class of secrets.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Attribute name that carries the schema name on stored items.
pub const SCHEMA_ATTRIBUTE: &str = "xdg:schema";

/// Attribute names with this prefix are reserved for the keyring daemon and
/// are accepted regardless of the schema.
pub const RESERVED_PREFIX: &str = "gkr:";

pub const NOTE_SCHEMA_NAME: &str = "org.gnome.keyring.Note";
pub const NETWORK_SCHEMA_NAME: &str = "org.gnome.keyring.NetworkPassword";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaAttributeType {
    String,
    Integer,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SchemaAttributeType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SchemaFlags(u8);

impl SchemaFlags {
    pub const NONE: Self = Self(0);
    /// Do not add `xdg:schema` to search tables.
    pub const DONT_MATCH_NAME: Self = Self(1 << 1);
    /// Accept attribute keys the schema does not list.
    pub const ALLOW_UNDEFINED: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SchemaFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub name: String,
    pub flags: SchemaFlags,
    pub attributes: Vec<SchemaAttribute>,
}

impl Schema {
    pub fn new(
        name: impl Into<String>,
        flags: SchemaFlags,
        attributes: &[(&str, SchemaAttributeType)],
    ) -> Self {
        Self {
            name: name.into(),
            flags,
            attributes: attributes
                .iter()
                .map(|(name, kind)| SchemaAttribute {
                    name: (*name).to_string(),
                    kind: *kind,
                })
                .collect(),
        }
    }

    /// Declared type of `name`, if the schema lists it.
    pub fn attribute_type(&self, name: &str) -> Option<SchemaAttributeType> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.kind)
    }

    pub fn allows_undefined(&self) -> bool {
        self.flags.contains(SchemaFlags::ALLOW_UNDEFINED)
    }

    pub fn matches_name(&self) -> bool {
        !self.flags.contains(SchemaFlags::DONT_MATCH_NAME)
    }

    /// Schema for free-form notes.  Takes no attributes.
    pub fn note() -> Self {
        Self::new(NOTE_SCHEMA_NAME, SchemaFlags::DONT_MATCH_NAME, &[])
    }

    /// Schema compatible with the keyring daemon's network passwords.
    pub fn compat_network() -> Self {
        use SchemaAttributeType::{Integer, String};
        Self::new(
            NETWORK_SCHEMA_NAME,
            SchemaFlags::DONT_MATCH_NAME,
            &[
                ("user", String),
                ("domain", String),
                ("object", String),
                ("protocol", String),
                ("port", Integer),
                ("server", String),
                ("authtype", String),
            ],
        )
    }
}
