//! Proxy for `org.freedesktop.Secret.Item`.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use lockbox_core::attributes;
use lockbox_core::paths::parent_path;
use lockbox_core::{Attributes, Error, Result, Schema, SecretValue};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::collection::Collection;
use crate::service::{Service, ServiceInner, cancellable};
use crate::transport::{ItemProps, ObjectKind, PropertyChange, SecretTransport, Serial, Stamped};
use crate::watch::{Cached, Watched};

struct ItemState {
    label: Cached<String>,
    attributes: Cached<Attributes>,
    locked: Cached<bool>,
    created: Cached<u64>,
    modified: Cached<u64>,
}

impl ItemState {
    fn new(props: Stamped<ItemProps>) -> Self {
        let Stamped { value, serial } = props;
        Self {
            label: Cached::new(value.label, serial),
            attributes: Cached::new(value.attributes, serial),
            locked: Cached::new(value.locked, serial),
            created: Cached::new(value.created, serial),
            modified: Cached::new(value.modified, serial),
        }
    }
}

pub(crate) struct ItemInner {
    path: String,
    service: Weak<ServiceInner>,
    transport: Arc<dyn SecretTransport>,
    state: Mutex<ItemState>,
    secret: Mutex<Option<SecretValue>>,
    watch: Mutex<Option<DropGuard>>,
}

impl ItemInner {
    pub(crate) fn new(path: &str, service: &Arc<ServiceInner>, props: Stamped<ItemProps>) -> Self {
        Self {
            path: path.to_string(),
            service: Arc::downgrade(service),
            transport: Arc::clone(&service.transport),
            state: Mutex::new(ItemState::new(props)),
            secret: Mutex::new(None),
            watch: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ItemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn apply_props(&self, props: Stamped<ItemProps>) {
        let Stamped { value, serial } = props;
        let mut state = self.state();
        state.label.update(value.label, serial);
        state.attributes.update(value.attributes, serial);
        state.locked.update(value.locked, serial);
        state.created.update(value.created, serial);
        state.modified.update(value.modified, serial);
    }

    pub(crate) fn apply_change(&self, change: &PropertyChange) {
        let serial = change.serial;
        let mut state = self.state();
        for (name, value) in &change.changed {
            let applied = match name.as_str() {
                "Label" => value
                    .as_str()
                    .is_some_and(|v| state.label.update(v.to_string(), serial)),
                "Attributes" => value
                    .as_attributes()
                    .is_some_and(|v| state.attributes.update(v.clone(), serial)),
                "Locked" => value
                    .as_bool()
                    .is_some_and(|v| state.locked.update(v, serial)),
                "Created" => value
                    .as_u64()
                    .is_some_and(|v| state.created.update(v, serial)),
                "Modified" => value
                    .as_u64()
                    .is_some_and(|v| state.modified.update(v, serial)),
                _ => false,
            };
            if !applied {
                debug!(item = %self.path, property = %name, serial = serial.0, "property change skipped");
            }
        }
    }

    pub(crate) fn set_locked(&self, locked: bool, serial: Serial) {
        if self.state().locked.update(locked, serial) && locked {
            // A locked item's secret can no longer be trusted to be current.
            self.secret.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
    }

    fn cache_secret(&self, value: Option<SecretValue>) {
        *self.secret.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

#[async_trait]
impl Watched for ItemInner {
    fn watch_slot(&self) -> &Mutex<Option<DropGuard>> {
        &self.watch
    }

    async fn on_change(self: Arc<Self>, change: PropertyChange) {
        self.apply_change(&change);
    }
}

/// A remote secret item.  Clones share one proxy; the service hands out at
/// most one proxy per path.
#[derive(Clone)]
pub struct Item(pub(crate) Arc<ItemInner>);

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item").field("path", &self.0.path).finish()
    }
}

impl Item {
    pub fn path(&self) -> &str {
        &self.0.path
    }

    /// Path of the collection that contains this item.
    pub fn collection_path(&self) -> Option<&str> {
        parent_path(&self.0.path)
    }

    /// The owning service, if it is still alive.
    pub fn service(&self) -> Option<Service> {
        self.0.service.upgrade().map(Service)
    }

    fn require_service(&self) -> Result<Service> {
        self.service()
            .ok_or_else(|| Error::Transport("service handle has been dropped".to_string()))
    }

    pub fn label(&self) -> String {
        self.0.state().label.get().clone()
    }

    pub fn attributes(&self) -> Attributes {
        self.0.state().attributes.get().clone()
    }

    /// Name of the schema the item was stored with, if recorded.
    pub fn schema_name(&self) -> Option<String> {
        attributes::schema_name(self.0.state().attributes.get()).map(str::to_string)
    }

    pub fn locked(&self) -> bool {
        *self.0.state().locked.get()
    }

    pub fn created(&self) -> u64 {
        *self.0.state().created.get()
    }

    pub fn modified(&self) -> u64 {
        *self.0.state().modified.get()
    }

    /// The secret loaded by the last [`Item::load_secret`] or
    /// [`Item::load_secrets`], if any.
    pub fn secret(&self) -> Option<SecretValue> {
        self.0
            .secret
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn ptr_eq(&self, other: &Item) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub async fn set_label(&self, label: &str, cancel: Option<&CancellationToken>) -> Result<()> {
        cancellable(
            cancel,
            self.0.transport.set_label(&self.0.path, ObjectKind::Item, label),
        )
        .await?;
        self.0.state().label.set_local(label.to_string());
        Ok(())
    }

    /// Replace the item's attributes.  With a schema they are validated
    /// and tagged with the schema name.
    pub async fn set_attributes(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let wire = attributes::for_store(schema, attrs)?;
        cancellable(
            cancel,
            self.0.transport.set_item_attributes(&self.0.path, &wire),
        )
        .await?;
        self.0.state().attributes.set_local(wire);
        Ok(())
    }

    /// Fetch the secret and cache it.
    pub async fn load_secret(&self, cancel: Option<&CancellationToken>) -> Result<SecretValue> {
        let service = self.require_service()?;
        let session = service.ensure_session(cancel).await?;
        let wire = cancellable(cancel, self.0.transport.get_secret(&self.0.path, session.path()))
            .await?;
        let value = session.decode(wire)?;
        self.0.cache_secret(Some(value.clone()));
        Ok(value)
    }

    /// Fetch secrets for several items in one call.  Items the service
    /// skips (for example locked ones) keep no cached secret.
    pub async fn load_secrets(items: &[Item], cancel: Option<&CancellationToken>) -> Result<()> {
        let Some(first) = items.first() else {
            return Ok(());
        };
        let service = first.require_service()?;
        let paths: Vec<String> = items.iter().map(|i| i.path().to_string()).collect();
        let mut secrets = service.get_secrets_for_paths(&paths, cancel).await?;
        for item in items {
            item.0.cache_secret(secrets.remove(item.path()));
        }
        Ok(())
    }

    pub async fn set_secret(
        &self,
        value: &SecretValue,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let service = self.require_service()?;
        let session = service.ensure_session(cancel).await?;
        let wire = session.encode(value);
        cancellable(cancel, self.0.transport.set_secret(&self.0.path, &wire)).await?;
        self.0.cache_secret(Some(value.clone()));
        Ok(())
    }

    /// Create an item in `collection`.  `Ok(None)` when the service's prompt
    /// was dismissed.
    pub async fn create(
        collection: &Collection,
        schema: Option<&Schema>,
        attrs: &Attributes,
        label: &str,
        value: &SecretValue,
        replace: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Item>> {
        let wire_attrs = attributes::for_store(schema, attrs)?;
        let service = collection
            .service()
            .ok_or_else(|| Error::Transport("service handle has been dropped".to_string()))?;
        let Some(path) = service
            .create_item_at_path(collection.path(), label, &wire_attrs, value, replace, cancel)
            .await?
        else {
            return Ok(None);
        };
        let item = service.item_for_path(&path).await?;
        item.0.cache_secret(Some(value.clone()));
        Ok(Some(item))
    }

    /// Re-read all properties from the service.
    pub async fn refresh(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let props = cancellable(cancel, self.0.transport.read_item(&self.0.path)).await?;
        self.0.apply_props(props);
        Ok(())
    }

    /// Delete the item.  `Ok(false)` when a prompt was dismissed.
    pub async fn delete(&self, cancel: Option<&CancellationToken>) -> Result<bool> {
        let service = self.require_service()?;
        service
            .delete_path(&self.0.path, ObjectKind::Item, cancel)
            .await
    }
}
