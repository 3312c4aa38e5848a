use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub mod attributes;
pub mod config;
pub mod error;
pub mod paths;
pub mod schema;

pub use attributes::AttributeValue;
pub use error::{Error, Result};
pub use schema::{Schema, SchemaAttribute, SchemaAttributeType, SchemaFlags};

/// Crate-wide mutex used by tests that mutate config-related environment
/// variables (`LOCKBOX_CONFIG`, `XDG_CONFIG_HOME`).
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Attribute table as it travels over the wire: string keys, string values.
pub type Attributes = HashMap<String, String>;

/// Content type used for textual passwords.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Content type used for opaque binary secrets.
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// A secret payload plus its content type.
///
/// Cheap to clone: clones share one allocation.  The payload lives in a
/// `Zeroizing` buffer and is wiped when the last clone is dropped.
#[derive(Clone)]
pub struct SecretValue(Arc<SecretInner>);

struct SecretInner {
    bytes: Zeroizing<Vec<u8>>,
    content_type: String,
}

impl SecretValue {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self::from_zeroizing(Zeroizing::new(bytes), content_type)
    }

    /// Create from an already-zeroizing buffer (avoids a plain copy).
    pub fn from_zeroizing(bytes: Zeroizing<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self(Arc::new(SecretInner {
            bytes,
            content_type: content_type.into(),
        }))
    }

    /// A textual password with the `text/plain` content type.
    pub fn new_text(password: &str) -> Self {
        Self::new(password.as_bytes().to_vec(), CONTENT_TYPE_TEXT)
    }

    pub fn get(&self) -> &[u8] {
        &self.0.bytes
    }

    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }

    pub fn content_type(&self) -> &str {
        &self.0.content_type
    }

    /// The payload as text, if the content type is `text/plain` and the
    /// bytes are valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        if !self.is_text() {
            return None;
        }
        std::str::from_utf8(&self.0.bytes).ok()
    }

    /// Consume the value and return its payload as a zeroizing password
    /// string.  `None` for non-text payloads.
    pub fn into_password(self) -> Option<Zeroizing<String>> {
        self.text().map(|s| Zeroizing::new(s.to_string()))
    }

    /// Number of live clones sharing this payload.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    fn is_text(&self) -> bool {
        // Services commonly append parameters, e.g. "text/plain; charset=utf8".
        self.0
            .content_type
            .split(';')
            .next()
            .is_some_and(|base| base.trim().eq_ignore_ascii_case(CONTENT_TYPE_TEXT))
    }
}

impl PartialEq for SecretValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.content_type == other.0.content_type && *self.0.bytes == *other.0.bytes
    }
}

impl Eq for SecretValue {}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretValue")
            .field("content_type", &self.0.content_type)
            .field("bytes", &"[redacted]")
            .finish()
    }
}

impl Serialize for SecretValue {
    fn serialize<S>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Err(serde::ser::Error::custom("SecretValue cannot be serialized"))
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D>(_deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Err(serde::de::Error::custom("SecretValue cannot be deserialized"))
    }
}
