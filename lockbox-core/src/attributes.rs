//! Attribute building, validation and the wire codec.
//!
//! On the wire an attribute table is a flat `a{ss}` map.  Integers travel in
//! decimal, booleans as `true`/`false`, and the schema name rides along under
//! [`SCHEMA_ATTRIBUTE`].

use std::fmt;

use crate::schema::{RESERVED_PREFIX, SCHEMA_ATTRIBUTE, Schema, SchemaAttributeType};
use crate::{Attributes, Error, Result};

/// A typed attribute value prior to encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl AttributeValue {
    pub fn kind(&self) -> SchemaAttributeType {
        match self {
            Self::String(_) => SchemaAttributeType::String,
            Self::Integer(_) => SchemaAttributeType::Integer,
            Self::Boolean(_) => SchemaAttributeType::Boolean,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Boolean(b) => f.write_str(if *b { "true" } else { "false" }),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Build an attribute table from typed values, checking each against the
/// schema's declared type.
pub fn build<K, I>(schema: &Schema, values: I) -> Result<Attributes>
where
    K: Into<String>,
    I: IntoIterator<Item = (K, AttributeValue)>,
{
    let mut attrs = Attributes::new();
    for (key, value) in values {
        let key = key.into();
        match schema.attribute_type(&key) {
            Some(kind) if kind != value.kind() => {
                return Err(Error::WrongType(key));
            }
            Some(_) => {}
            None if schema.allows_undefined() => {}
            None => return Err(Error::NoMatchingAttribute(key)),
        }
        attrs.insert(key, value.to_string());
    }
    Ok(attrs)
}

/// Check `attrs` against `schema`.
///
/// With `matching` set (searches, lookups, clears) an empty table under a
/// schema that does not match on its name is rejected, since it would match
/// every item.  Stores pass `matching = false` and accept an empty table.
pub fn validate(schema: &Schema, attrs: &Attributes, matching: bool) -> Result<()> {
    for (key, value) in attrs {
        if key == SCHEMA_ATTRIBUTE {
            if *value != schema.name {
                return Err(Error::MismatchedSchema(value.clone()));
            }
            continue;
        }

        if key.starts_with(RESERVED_PREFIX) {
            continue;
        }

        let Some(kind) = schema.attribute_type(key) else {
            if schema.allows_undefined() {
                continue;
            }
            return Err(Error::NoMatchingAttribute(key.clone()));
        };

        let ok = match kind {
            SchemaAttributeType::Boolean => value == "true" || value == "false",
            SchemaAttributeType::Integer => value.parse::<i64>().is_ok(),
            SchemaAttributeType::String => true,
        };
        if !ok {
            return Err(Error::WrongType(key.clone()));
        }
    }

    if matching && attrs.is_empty() && !schema.matches_name() {
        return Err(Error::EmptyAttributeTable);
    }
    Ok(())
}

/// Encode a table for the wire.  When `schema_name` is given it replaces any
/// `xdg:schema` entry already present.
pub fn to_wire(attrs: &Attributes, schema_name: Option<&str>) -> Attributes {
    let mut wire: Attributes = attrs
        .iter()
        .filter(|(k, _)| schema_name.is_none() || k.as_str() != SCHEMA_ATTRIBUTE)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(name) = schema_name {
        wire.insert(SCHEMA_ATTRIBUTE.to_string(), name.to_string());
    }
    wire
}

/// Decode a wire table.
pub fn from_wire<I>(wire: I) -> Attributes
where
    I: IntoIterator<Item = (String, String)>,
{
    wire.into_iter().collect()
}

/// Validate and encode a table for a store: the schema name is always
/// tagged.
pub fn for_store(schema: Option<&Schema>, attrs: &Attributes) -> Result<Attributes> {
    match schema {
        Some(schema) => {
            validate(schema, attrs, false)?;
            Ok(to_wire(attrs, Some(&schema.name)))
        }
        None => Ok(to_wire(attrs, None)),
    }
}

/// Validate and encode a table for a search, lookup or clear: the schema
/// name is tagged unless the schema opts out of name matching.
pub fn for_search(schema: Option<&Schema>, attrs: &Attributes) -> Result<Attributes> {
    match schema {
        Some(schema) => {
            validate(schema, attrs, true)?;
            let name = schema.matches_name().then_some(schema.name.as_str());
            Ok(to_wire(attrs, name))
        }
        None => Ok(to_wire(attrs, None)),
    }
}

/// The schema name recorded on an item, if any.
pub fn schema_name(attrs: &Attributes) -> Option<&str> {
    attrs.get(SCHEMA_ATTRIBUTE).map(String::as_str)
}
