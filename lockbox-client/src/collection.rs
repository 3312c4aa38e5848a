//! Proxy for `org.freedesktop.Secret.Collection`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use lockbox_core::{Attributes, Error, Result, Schema, attributes};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::item::{Item, ItemInner};
use crate::methods::{SearchFlags, select_matches};
use crate::registry::{ObjectRegistry, Retention};
use crate::service::{Service, ServiceInner, cancellable};
use crate::transport::{
    CollectionProps, ObjectKind, PropertyChange, SecretTransport, Serial, Stamped,
};
use crate::watch::{Cached, Watched};

struct CollectionState {
    label: Cached<String>,
    locked: Cached<bool>,
    created: Cached<u64>,
    modified: Cached<u64>,
    item_paths: Cached<Vec<String>>,
}

/// What a notification changed that other proxies must follow.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct AppliedChange {
    /// The new item list.
    pub(crate) items: Option<Vec<String>>,
    pub(crate) locked: Option<bool>,
}

pub(crate) struct CollectionInner {
    path: String,
    service: Weak<ServiceInner>,
    transport: Arc<dyn SecretTransport>,
    state: Mutex<CollectionState>,
    /// Items of this collection, owned once loaded.
    items: ObjectRegistry<ItemInner>,
    items_loaded: AtomicBool,
    watch: Mutex<Option<DropGuard>>,
}

impl CollectionInner {
    pub(crate) fn new(
        path: &str,
        service: &Arc<ServiceInner>,
        props: Stamped<CollectionProps>,
    ) -> Self {
        let Stamped { value, serial } = props;
        Self {
            path: path.to_string(),
            service: Arc::downgrade(service),
            transport: Arc::clone(&service.transport),
            state: Mutex::new(CollectionState {
                label: Cached::new(value.label, serial),
                locked: Cached::new(value.locked, serial),
                created: Cached::new(value.created, serial),
                modified: Cached::new(value.modified, serial),
                item_paths: Cached::new(value.items, serial),
            }),
            items: ObjectRegistry::new(Retention::Owned),
            items_loaded: AtomicBool::new(false),
            watch: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CollectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn apply_props(&self, props: Stamped<CollectionProps>) {
        let Stamped { value, serial } = props;
        let mut state = self.state();
        state.label.update(value.label, serial);
        state.locked.update(value.locked, serial);
        state.created.update(value.created, serial);
        state.modified.update(value.modified, serial);
        state.item_paths.update(value.items, serial);
    }

    /// Apply a notification.  Reports the item list and lock state if
    /// either changed.
    pub(crate) fn apply_change(&self, change: &PropertyChange) -> AppliedChange {
        let serial = change.serial;
        let mut state = self.state();
        let mut applied = AppliedChange::default();
        for (name, value) in &change.changed {
            match name.as_str() {
                "Label" => {
                    if let Some(v) = value.as_str() {
                        state.label.update(v.to_string(), serial);
                    }
                }
                "Locked" => {
                    if let Some(v) = value.as_bool()
                        && state.locked.update(v, serial)
                    {
                        applied.locked = Some(v);
                    }
                }
                "Created" => {
                    if let Some(v) = value.as_u64() {
                        state.created.update(v, serial);
                    }
                }
                "Modified" => {
                    if let Some(v) = value.as_u64() {
                        state.modified.update(v, serial);
                    }
                }
                "Items" => {
                    if let Some(paths) = value.as_paths()
                        && state.item_paths.update(paths.to_vec(), serial)
                    {
                        applied.items = Some(paths.to_vec());
                    }
                }
                other => debug!(collection = %self.path, property = other, "ignoring property"),
            }
        }
        applied
    }

    pub(crate) fn set_locked(&self, locked: bool, serial: Serial) {
        self.state().locked.update(locked, serial);
    }

    pub(crate) fn forget_item(&self, path: &str) {
        self.items.remove(path);
    }

    /// Materialize proxies for `paths` and install them as the item table.
    async fn install_items(&self, paths: &[String]) -> Result<Vec<Item>> {
        let service = self
            .service
            .upgrade()
            .map(Service)
            .ok_or_else(|| Error::Transport("service handle has been dropped".to_string()))?;
        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            match service.item_for_path(path).await {
                Ok(item) => items.push(item),
                // Deleted between the listing and the read.
                Err(Error::NoSuchObject) => debug!(item = %path, "item vanished while loading"),
                Err(e) => return Err(e),
            }
        }
        self.items.replace_all(
            items
                .iter()
                .map(|item| (item.path().to_string(), Arc::clone(&item.0))),
        );
        self.items_loaded.store(true, Ordering::SeqCst);
        Ok(items)
    }
}

#[async_trait]
impl Watched for CollectionInner {
    fn watch_slot(&self) -> &Mutex<Option<DropGuard>> {
        &self.watch
    }

    async fn on_change(self: Arc<Self>, change: PropertyChange) {
        let applied = self.apply_change(&change);
        if let Some(locked) = applied.locked
            && let Some(service) = self.service.upgrade()
        {
            let collections = HashSet::from([self.path.as_str()]);
            Service(service).items_follow_collections(&collections, locked, change.serial);
        }
        let Some(paths) = applied.items else {
            return;
        };
        if !self.items_loaded.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.install_items(&paths).await {
            warn!(collection = %self.path, error = %e, "failed to reload items");
        }
    }
}

/// A remote collection.  Clones share one proxy.
#[derive(Clone)]
pub struct Collection(pub(crate) Arc<CollectionInner>);

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("path", &self.0.path)
            .finish()
    }
}

impl Collection {
    pub fn path(&self) -> &str {
        &self.0.path
    }

    pub fn service(&self) -> Option<Service> {
        self.0.service.upgrade().map(Service)
    }

    pub fn label(&self) -> String {
        self.0.state().label.get().clone()
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

    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Items in service order, or `None` before [`Collection::load_items`].
    pub fn items(&self) -> Option<Vec<Item>> {
        if !self.0.items_loaded.load(Ordering::SeqCst) {
            return None;
        }
        let paths = self.0.state().item_paths.get().clone();
        Some(
            paths
                .iter()
                .filter_map(|p| self.0.items.find(p))
                .map(Item)
                .collect(),
        )
    }

    /// Read the item list and materialize a proxy per item.
    pub async fn load_items(&self, cancel: Option<&CancellationToken>) -> Result<Vec<Item>> {
        let props = cancellable(cancel, self.0.transport.read_collection(&self.0.path)).await?;
        let paths = props.value.items.clone();
        self.0.apply_props(props);
        self.0.install_items(&paths).await
    }

    pub async fn refresh(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let props = cancellable(cancel, self.0.transport.read_collection(&self.0.path)).await?;
        let paths = props.value.items.clone();
        self.0.apply_props(props);
        if self.0.items_loaded.load(Ordering::SeqCst) {
            self.0.install_items(&paths).await?;
        }
        Ok(())
    }

    pub async fn set_label(&self, label: &str, cancel: Option<&CancellationToken>) -> Result<()> {
        cancellable(
            cancel,
            self.0
                .transport
                .set_label(&self.0.path, ObjectKind::Collection, label),
        )
        .await?;
        self.0.state().label.set_local(label.to_string());
        Ok(())
    }

    /// Delete the collection and everything in it.  `Ok(false)` when a
    /// prompt was dismissed.
    pub async fn delete(&self, cancel: Option<&CancellationToken>) -> Result<bool> {
        let service = self
            .service()
            .ok_or_else(|| Error::Transport("service handle has been dropped".to_string()))?;
        service
            .delete_path(&self.0.path, ObjectKind::Collection, cancel)
            .await
    }

    /// Search this collection only.  Flags behave as for
    /// [`Service::search`].
    pub async fn search(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
        flags: SearchFlags,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Item>> {
        let wire = attributes::for_search(schema, attrs)?;
        let service = self
            .service()
            .ok_or_else(|| Error::Transport("service handle has been dropped".to_string()))?;
        let paths = cancellable(
            cancel,
            self.0.transport.search_collection(&self.0.path, &wire),
        )
        .await?;

        let mut unlocked = Vec::new();
        let mut locked = Vec::new();
        for path in &paths {
            let item = service.refreshed_item_for_path(path).await?;
            if item.locked() {
                locked.push(item);
            } else {
                unlocked.push(item);
            }
        }
        select_matches(&service, unlocked, locked, flags, cancel).await
    }
}
