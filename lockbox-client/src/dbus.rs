//! [`SecretTransport`] over the D-Bus session bus.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use lockbox_core::paths::{
    COLLECTION_INTERFACE, ITEM_INTERFACE, NULL_PATH, PROMPT_INTERFACE, PROPERTIES_INTERFACE,
    SERVICE_INTERFACE, SERVICE_PATH, is_null,
};
use lockbox_core::{Attributes, Error, Result};
use tracing::{debug, warn};
use zbus::Connection;
use zeroize::Zeroizing;
use zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use crate::transport::{
    CollectionProps, ItemProps, LockReply, ObjectKind, PromptEvent, PromptResult,
    PropertyChange, PropertyValue, SearchReply, SecretTransport, Serial, Stamped, WireSecret,
};

const SESSION_INTERFACE: &str = "org.freedesktop.Secret.Session";
const DBUS_NAME: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";

/// `(oayays)` as received.
type WireTuple = (OwnedObjectPath, Vec<u8>, Vec<u8>, String);

pub struct DbusTransport {
    conn: Connection,
    bus_name: String,
}

impl DbusTransport {
    /// Connect to the session bus.
    pub async fn connect(bus_name: &str) -> Result<Self> {
        let conn = Connection::session().await.map_err(map_zbus_error)?;
        debug!(bus_name, "connected to session bus");
        Ok(Self::with_connection(conn, bus_name))
    }

    pub fn with_connection(conn: Connection, bus_name: &str) -> Self {
        Self {
            conn,
            bus_name: bus_name.to_string(),
        }
    }

    async fn call<B>(&self, path: &str, interface: &str, method: &str, body: &B) -> Result<zbus::Message>
    where
        B: serde::Serialize + zvariant::DynamicType,
    {
        let proxy = zbus::Proxy::new(&self.conn, self.bus_name.as_str(), path, interface)
            .await
            .map_err(map_zbus_error)?;
        proxy.call_method(method, body).await.map_err(map_zbus_error)
    }

    async fn get_all(&self, path: &str, interface: &str) -> Result<Stamped<HashMap<String, PropertyValue>>> {
        let msg = self.call(path, PROPERTIES_INTERFACE, "GetAll", &(interface,)).await?;
        let raw: HashMap<String, OwnedValue> = decode(&msg)?;
        Ok(Stamped::new(property_map(raw), serial_of(&msg)))
    }

    async fn set_property(&self, path: &str, interface: &str, name: &str, value: Value<'_>) -> Result<()> {
        self.call(path, PROPERTIES_INTERFACE, "Set", &(interface, name, value))
            .await
            .map(drop)
    }

    async fn signal_stream(
        &self,
        interface: &str,
        member: &str,
        path: &str,
    ) -> Result<zbus::MessageStream> {
        let rule = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(interface)
            .and_then(|b| b.member(member))
            .and_then(|b| b.path(path))
            .map_err(map_zbus_error)?
            .build();
        zbus::MessageStream::for_match_rule(rule, &self.conn, None)
            .await
            .map_err(map_zbus_error)
    }

    async fn lock_call(&self, method: &str, objects: &[String]) -> Result<Stamped<LockReply>> {
        let paths = object_paths(objects)?;
        let msg = self.call(SERVICE_PATH, SERVICE_INTERFACE, method, &(paths,)).await?;
        let (done, prompt): (Vec<OwnedObjectPath>, OwnedObjectPath) = decode(&msg)?;
        let reply = LockReply {
            objects: done.iter().map(|p| p.to_string()).collect(),
            prompt: prompt.to_string(),
        };
        Ok(Stamped::new(reply, serial_of(&msg)))
    }
}

#[async_trait]
impl SecretTransport for DbusTransport {
    fn bus_name(&self) -> &str {
        &self.bus_name
    }

    async fn open_session(&self, algorithm: &str, input: &[u8]) -> Result<(Vec<u8>, String)> {
        let input = if input.is_empty() {
            Value::from("")
        } else {
            Value::from(input.to_vec())
        };
        let msg = self
            .call(SERVICE_PATH, SERVICE_INTERFACE, "OpenSession", &(algorithm, input))
            .await?;
        let (output, path): (OwnedValue, OwnedObjectPath) = decode(&msg)?;
        let output = match &*output {
            Value::Array(arr) => arr
                .iter()
                .map(|v| match v {
                    Value::U8(b) => Ok(*b),
                    _ => Err(Error::Protocol("session output must be ay".to_string())),
                })
                .collect::<Result<Vec<u8>>>()?,
            _ => Vec::new(),
        };
        Ok((output, path.to_string()))
    }

    async fn close_session(&self, session: &str) -> Result<()> {
        self.call(session, SESSION_INTERFACE, "Close", &()).await.map(drop)
    }

    async fn read_service(&self) -> Result<Stamped<Vec<String>>> {
        let props = self.get_all(SERVICE_PATH, SERVICE_INTERFACE).await?;
        let collections = props
            .value
            .get("Collections")
            .and_then(PropertyValue::as_paths)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        Ok(Stamped::new(collections, props.serial))
    }

    async fn read_collection(&self, path: &str) -> Result<Stamped<CollectionProps>> {
        let props = self.get_all(path, COLLECTION_INTERFACE).await?;
        let map = &props.value;
        let value = CollectionProps {
            label: required(map, "Label", PropertyValue::as_str)?.to_string(),
            locked: required(map, "Locked", PropertyValue::as_bool)?,
            created: map.get("Created").and_then(PropertyValue::as_u64).unwrap_or(0),
            modified: map.get("Modified").and_then(PropertyValue::as_u64).unwrap_or(0),
            items: map
                .get("Items")
                .and_then(PropertyValue::as_paths)
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
        };
        Ok(Stamped::new(value, props.serial))
    }

    async fn read_item(&self, path: &str) -> Result<Stamped<ItemProps>> {
        let props = self.get_all(path, ITEM_INTERFACE).await?;
        let map = &props.value;
        let value = ItemProps {
            label: required(map, "Label", PropertyValue::as_str)?.to_string(),
            attributes: required(map, "Attributes", PropertyValue::as_attributes)?.clone(),
            locked: required(map, "Locked", PropertyValue::as_bool)?,
            created: map.get("Created").and_then(PropertyValue::as_u64).unwrap_or(0),
            modified: map.get("Modified").and_then(PropertyValue::as_u64).unwrap_or(0),
        };
        Ok(Stamped::new(value, props.serial))
    }

    async fn search_items(&self, attributes: &Attributes) -> Result<SearchReply> {
        let msg = self
            .call(SERVICE_PATH, SERVICE_INTERFACE, "SearchItems", &(attributes,))
            .await?;
        let (unlocked, locked): (Vec<OwnedObjectPath>, Vec<OwnedObjectPath>) = decode(&msg)?;
        Ok(SearchReply {
            unlocked: unlocked.iter().map(|p| p.to_string()).collect(),
            locked: locked.iter().map(|p| p.to_string()).collect(),
            serial: serial_of(&msg),
        })
    }

    async fn search_collection(
        &self,
        collection: &str,
        attributes: &Attributes,
    ) -> Result<Vec<String>> {
        let msg = self
            .call(collection, COLLECTION_INTERFACE, "SearchItems", &(attributes,))
            .await?;
        let results: Vec<OwnedObjectPath> = decode(&msg)?;
        Ok(results.iter().map(|p| p.to_string()).collect())
    }

    async fn get_secrets(
        &self,
        items: &[String],
        session: &str,
    ) -> Result<HashMap<String, WireSecret>> {
        let paths = object_paths(items)?;
        let session_path = object_path(session)?;
        let msg = self
            .call(SERVICE_PATH, SERVICE_INTERFACE, "GetSecrets", &(paths, session_path))
            .await?;
        let secrets: HashMap<OwnedObjectPath, WireTuple> = decode(&msg)?;
        Ok(secrets
            .into_iter()
            .map(|(path, wire)| (path.to_string(), wire_secret(wire)))
            .collect())
    }

    async fn get_secret(&self, item: &str, session: &str) -> Result<WireSecret> {
        let session_path = object_path(session)?;
        let msg = self
            .call(item, ITEM_INTERFACE, "GetSecret", &(session_path,))
            .await?;
        let wire: WireTuple = decode(&msg)?;
        Ok(wire_secret(wire))
    }

    async fn set_secret(&self, item: &str, secret: &WireSecret) -> Result<()> {
        let body = (outgoing(secret)?,);
        self.call(item, ITEM_INTERFACE, "SetSecret", &body).await.map(drop)
    }

    async fn create_item(
        &self,
        collection: &str,
        label: &str,
        attributes: &Attributes,
        secret: &WireSecret,
        replace: bool,
    ) -> Result<(String, String)> {
        let mut props: HashMap<&str, Value<'_>> = HashMap::new();
        props.insert("org.freedesktop.Secret.Item.Label", Value::from(label));
        props.insert(
            "org.freedesktop.Secret.Item.Attributes",
            Value::from(attributes.clone()),
        );
        let body = (props, outgoing(secret)?, replace);
        let msg = self
            .call(collection, COLLECTION_INTERFACE, "CreateItem", &body)
            .await?;
        let (item, prompt): (OwnedObjectPath, OwnedObjectPath) = decode(&msg)?;
        Ok((item.to_string(), prompt.to_string()))
    }

    async fn create_collection(&self, label: &str, alias: &str) -> Result<(String, String)> {
        let mut props: HashMap<&str, Value<'_>> = HashMap::new();
        props.insert("org.freedesktop.Secret.Collection.Label", Value::from(label));
        let msg = self
            .call(SERVICE_PATH, SERVICE_INTERFACE, "CreateCollection", &(props, alias))
            .await?;
        let (collection, prompt): (OwnedObjectPath, OwnedObjectPath) = decode(&msg)?;
        Ok((collection.to_string(), prompt.to_string()))
    }

    async fn delete(&self, path: &str, kind: ObjectKind) -> Result<String> {
        let interface = match kind {
            ObjectKind::Collection => COLLECTION_INTERFACE,
            ObjectKind::Item => ITEM_INTERFACE,
        };
        let msg = self.call(path, interface, "Delete", &()).await?;
        let prompt: OwnedObjectPath = decode(&msg)?;
        Ok(prompt.to_string())
    }

    async fn lock(&self, objects: &[String]) -> Result<Stamped<LockReply>> {
        self.lock_call("Lock", objects).await
    }

    async fn unlock(&self, objects: &[String]) -> Result<Stamped<LockReply>> {
        self.lock_call("Unlock", objects).await
    }

    async fn read_alias(&self, name: &str) -> Result<Option<String>> {
        let msg = self
            .call(SERVICE_PATH, SERVICE_INTERFACE, "ReadAlias", &(name,))
            .await?;
        let path: OwnedObjectPath = decode(&msg)?;
        Ok((!is_null(path.as_str())).then(|| path.to_string()))
    }

    async fn set_alias(&self, name: &str, collection: Option<&str>) -> Result<()> {
        let target = object_path(collection.unwrap_or(NULL_PATH))?;
        self.call(SERVICE_PATH, SERVICE_INTERFACE, "SetAlias", &(name, target))
            .await
            .map(drop)
    }

    async fn set_label(&self, path: &str, kind: ObjectKind, label: &str) -> Result<()> {
        let interface = match kind {
            ObjectKind::Collection => COLLECTION_INTERFACE,
            ObjectKind::Item => ITEM_INTERFACE,
        };
        self.set_property(path, interface, "Label", Value::from(label)).await
    }

    async fn set_item_attributes(&self, item: &str, attributes: &Attributes) -> Result<()> {
        self.set_property(item, ITEM_INTERFACE, "Attributes", Value::from(attributes.clone()))
            .await
    }

    async fn prompt(&self, path: &str, window_id: &str) -> Result<()> {
        self.call(path, PROMPT_INTERFACE, "Prompt", &(window_id,))
            .await
            .map(drop)
    }

    async fn dismiss(&self, path: &str) -> Result<()> {
        self.call(path, PROMPT_INTERFACE, "Dismiss", &()).await.map(drop)
    }

    async fn prompt_completions(&self, path: &str) -> Result<BoxStream<'static, PromptEvent>> {
        let stream = self.signal_stream(PROMPT_INTERFACE, "Completed", path).await?;
        Ok(stream
            .filter_map(|msg| async move {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Completed stream error (skipping): {e}");
                        return None;
                    }
                };
                let event = match msg.body().deserialize::<(bool, OwnedValue)>() {
                    Ok((dismissed, result)) => PromptEvent::Completed {
                        dismissed,
                        result: prompt_result(&result),
                        serial: serial_of(&msg),
                    },
                    Err(e) => PromptEvent::Malformed(e.to_string()),
                };
                Some(event)
            })
            .boxed())
    }

    async fn owner_vanished(&self) -> Result<BoxStream<'static, ()>> {
        let rule = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(DBUS_NAME)
            .and_then(|b| b.interface(DBUS_NAME))
            .and_then(|b| b.member("NameOwnerChanged"))
            .and_then(|b| b.path(DBUS_PATH))
            .and_then(|b| b.arg(0, self.bus_name.clone()))
            .map_err(map_zbus_error)?
            .build();
        let stream = zbus::MessageStream::for_match_rule(rule, &self.conn, None)
            .await
            .map_err(map_zbus_error)?;
        Ok(stream
            .filter_map(|msg| async move {
                let msg = msg.ok()?;
                // NameOwnerChanged(name, old_owner, new_owner)
                let (name, _old, new_owner) =
                    msg.body().deserialize::<(String, String, String)>().ok()?;
                if new_owner.is_empty() {
                    debug!(name = %name, "bus name lost its owner");
                    Some(())
                } else {
                    None
                }
            })
            .boxed())
    }

    async fn property_changes(&self, path: &str) -> Result<BoxStream<'static, PropertyChange>> {
        let stream = self
            .signal_stream(PROPERTIES_INTERFACE, "PropertiesChanged", path)
            .await?;
        let path = path.to_string();
        Ok(stream
            .filter_map(move |msg| {
                let path = path.clone();
                async move {
                    let msg = msg.ok()?;
                    match msg
                        .body()
                        .deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                    {
                        Ok((interface, changed, invalidated)) => Some(PropertyChange {
                            path,
                            interface,
                            changed: property_map(changed),
                            invalidated,
                            serial: serial_of(&msg),
                        }),
                        Err(e) => {
                            warn!(path = %path, error = %e, "malformed PropertiesChanged");
                            None
                        }
                    }
                }
            })
            .boxed())
    }
}

/// Map a zbus error onto the domain taxonomy.
pub fn map_zbus_error(e: zbus::Error) -> Error {
    match e {
        zbus::Error::MethodError(name, detail, _) => {
            Error::from_remote(name.as_str(), detail.unwrap_or_default())
        }
        zbus::Error::FDO(fdo) => match *fdo {
            zbus::fdo::Error::UnknownObject(_) | zbus::fdo::Error::UnknownMethod(_) => {
                Error::NoSuchObject
            }
            other => Error::Transport(other.to_string()),
        },
        other => Error::Transport(other.to_string()),
    }
}

fn decode<T>(msg: &zbus::Message) -> Result<T>
where
    T: for<'d> serde::Deserialize<'d> + zvariant::Type,
{
    msg.body()
        .deserialize::<T>()
        .map_err(|e| Error::Protocol(e.to_string()))
}

fn serial_of(msg: &zbus::Message) -> Serial {
    Serial(u64::from(msg.primary_header().serial_num().get()))
}

fn object_path(path: &str) -> Result<ObjectPath<'_>> {
    ObjectPath::try_from(path).map_err(|e| Error::Protocol(format!("bad object path {path:?}: {e}")))
}

fn object_paths(paths: &[String]) -> Result<Vec<ObjectPath<'_>>> {
    paths.iter().map(|p| object_path(p)).collect()
}

fn outgoing(secret: &WireSecret) -> Result<(ObjectPath<'_>, &[u8], &[u8], &str)> {
    Ok((
        object_path(&secret.session)?,
        secret.parameters.as_slice(),
        secret.value.as_slice(),
        secret.content_type.as_str(),
    ))
}

fn wire_secret((session, parameters, value, content_type): WireTuple) -> WireSecret {
    WireSecret {
        session: session.to_string(),
        parameters,
        value: Zeroizing::new(value),
        content_type,
    }
}

fn required<'a, T>(
    map: &'a HashMap<String, PropertyValue>,
    name: &str,
    get: impl Fn(&'a PropertyValue) -> Option<T>,
) -> Result<T> {
    map.get(name)
        .and_then(get)
        .ok_or_else(|| Error::Protocol(format!("missing or mistyped property {name}")))
}

fn property_map(raw: HashMap<String, OwnedValue>) -> HashMap<String, PropertyValue> {
    raw.into_iter()
        .filter_map(|(name, value)| property_value(&value).map(|v| (name, v)))
        .collect()
}

/// Decode the property types the Secret Service interfaces use.
fn property_value(value: &Value<'_>) -> Option<PropertyValue> {
    match value {
        Value::Value(inner) => property_value(inner),
        Value::Str(s) => Some(PropertyValue::Str(s.to_string())),
        Value::Bool(b) => Some(PropertyValue::Bool(*b)),
        Value::U64(n) => Some(PropertyValue::U64(*n)),
        Value::Array(arr) => arr
            .iter()
            .map(|v| match v {
                Value::ObjectPath(p) => Some(p.to_string()),
                _ => None,
            })
            .collect::<Option<Vec<String>>>()
            .map(PropertyValue::Paths),
        Value::Dict(_) => {
            let owned = value.try_clone().ok()?;
            HashMap::<String, String>::try_from(owned)
                .ok()
                .map(PropertyValue::Attributes)
        }
        _ => None,
    }
}

fn prompt_result(value: &Value<'_>) -> PromptResult {
    match value {
        Value::Value(inner) => prompt_result(inner),
        Value::ObjectPath(p) => PromptResult::ObjectPath(p.to_string()),
        Value::Str(s) => PromptResult::String(s.to_string()),
        Value::Array(arr) => arr
            .iter()
            .map(|v| match v {
                Value::ObjectPath(p) => Some(p.to_string()),
                _ => None,
            })
            .collect::<Option<Vec<String>>>()
            .map(PromptResult::ObjectPaths)
            .unwrap_or_else(|| PromptResult::Other(value.value_signature().to_string())),
        other => PromptResult::Other(other.value_signature().to_string()),
    }
}
