//! The capability the client engine needs from a Secret Service
//! implementation.
//!
//! [`crate::dbus::DbusTransport`] speaks D-Bus through zbus.  Everything
//! above this trait is independent of the bus: it sees path-addressed
//! objects, method replies, and three kinds of notification stream.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lockbox_core::{Attributes, Result};
use zeroize::Zeroizing;

/// Serial number of the message that carried a reply or a signal.
///
/// Replies and signals from the service are numbered by the same sender, so
/// a larger serial was sent later.  `Serial::LOCAL` sorts before everything
/// the service sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(pub u64);

impl Serial {
    pub const LOCAL: Self = Self(0);
}

/// A reply value tagged with the serial of the message it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub serial: Serial,
}

impl<T> Stamped<T> {
    pub fn new(value: T, serial: Serial) -> Self {
        Self { value, serial }
    }
}

/// A secret as it crosses the bus: `(oayays)`.
#[derive(Clone)]
pub struct WireSecret {
    pub session: String,
    pub parameters: Vec<u8>,
    pub value: Zeroizing<Vec<u8>>,
    pub content_type: String,
}

impl std::fmt::Debug for WireSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireSecret")
            .field("session", &self.session)
            .field("content_type", &self.content_type)
            .field("value", &"[redacted]")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionProps {
    pub label: String,
    pub locked: bool,
    pub created: u64,
    pub modified: u64,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemProps {
    pub label: String,
    pub attributes: Attributes,
    pub locked: bool,
    pub created: u64,
    pub modified: u64,
}

/// `SearchItems` reply: matches split by lock state, in service order.
/// `serial` stamps the lock state the split reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchReply {
    pub unlocked: Vec<String>,
    pub locked: Vec<String>,
    pub serial: Serial,
}

/// `Lock`/`Unlock` reply: objects handled immediately plus a prompt path
/// (`"/"` when none is needed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockReply {
    pub objects: Vec<String>,
    pub prompt: String,
}

/// Which interface a property write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Collection,
    Item,
}

/// The decoded variant carried by a prompt's `Completed` signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptResult {
    ObjectPath(String),
    ObjectPaths(Vec<String>),
    String(String),
    /// Any other value, kept as its type signature for diagnostics.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptEvent {
    Completed {
        dismissed: bool,
        result: PromptResult,
        serial: Serial,
    },
    /// A `Completed` signal whose body did not decode as `(bv)`.
    Malformed(String),
}

/// A cached property value from a `PropertiesChanged` notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Bool(bool),
    U64(u64),
    Paths(Vec<String>),
    Attributes(Attributes),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_paths(&self) -> Option<&[String]> {
        match self {
            Self::Paths(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_attributes(&self) -> Option<&Attributes> {
        match self {
            Self::Attributes(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub path: String,
    pub interface: String,
    pub changed: HashMap<String, PropertyValue>,
    pub invalidated: Vec<String>,
    pub serial: Serial,
}

#[async_trait]
pub trait SecretTransport: Send + Sync + 'static {
    /// Well-known bus name of the service.
    fn bus_name(&self) -> &str;

    /// `Service.OpenSession`: returns the algorithm output and session path.
    async fn open_session(&self, algorithm: &str, input: &[u8]) -> Result<(Vec<u8>, String)>;

    async fn close_session(&self, session: &str) -> Result<()>;

    /// The service's `Collections` property.
    async fn read_service(&self) -> Result<Stamped<Vec<String>>>;

    async fn read_collection(&self, path: &str) -> Result<Stamped<CollectionProps>>;

    async fn read_item(&self, path: &str) -> Result<Stamped<ItemProps>>;

    /// `Service.SearchItems`.
    async fn search_items(&self, attributes: &Attributes) -> Result<SearchReply>;

    /// `Collection.SearchItems`, which does not split by lock state.
    async fn search_collection(&self, collection: &str, attributes: &Attributes)
    -> Result<Vec<String>>;

    /// `Service.GetSecrets`.  Items the service skips are absent from the map.
    async fn get_secrets(
        &self,
        items: &[String],
        session: &str,
    ) -> Result<HashMap<String, WireSecret>>;

    async fn get_secret(&self, item: &str, session: &str) -> Result<WireSecret>;

    async fn set_secret(&self, item: &str, secret: &WireSecret) -> Result<()>;

    /// `Collection.CreateItem`: returns `(item, prompt)`.
    async fn create_item(
        &self,
        collection: &str,
        label: &str,
        attributes: &Attributes,
        secret: &WireSecret,
        replace: bool,
    ) -> Result<(String, String)>;

    /// `Service.CreateCollection`: returns `(collection, prompt)`.
    async fn create_collection(&self, label: &str, alias: &str) -> Result<(String, String)>;

    /// `Item.Delete` or `Collection.Delete`: returns a prompt path.
    async fn delete(&self, path: &str, kind: ObjectKind) -> Result<String>;

    async fn lock(&self, objects: &[String]) -> Result<Stamped<LockReply>>;

    async fn unlock(&self, objects: &[String]) -> Result<Stamped<LockReply>>;

    /// `Service.ReadAlias`: `None` when the alias is unset.
    async fn read_alias(&self, name: &str) -> Result<Option<String>>;

    async fn set_alias(&self, name: &str, collection: Option<&str>) -> Result<()>;

    async fn set_label(&self, path: &str, kind: ObjectKind, label: &str) -> Result<()>;

    async fn set_item_attributes(&self, item: &str, attributes: &Attributes) -> Result<()>;

    /// `Prompt.Prompt`.
    async fn prompt(&self, path: &str, window_id: &str) -> Result<()>;

    /// `Prompt.Dismiss`.
    async fn dismiss(&self, path: &str) -> Result<()>;

    /// `Completed` signals of the prompt at `path`.  Subscribed when the
    /// returned future resolves.
    async fn prompt_completions(&self, path: &str) -> Result<BoxStream<'static, PromptEvent>>;

    /// Yields once each time the service's bus name loses its owner.
    async fn owner_vanished(&self) -> Result<BoxStream<'static, ()>>;

    /// `PropertiesChanged` notifications for the object at `path`.
    async fn property_changes(&self, path: &str) -> Result<BoxStream<'static, PropertyChange>>;
}
