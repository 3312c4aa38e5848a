//! The service handle: session, proxy registries, path-level calls and the
//! process-wide default instance.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use lockbox_core::config::Config;
use lockbox_core::paths::{SERVICE_PATH, is_null, parent_path};
use lockbox_core::{Attributes, Error, Result, SecretValue};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::collection::{Collection, CollectionInner};
use crate::dbus::DbusTransport;
use crate::item::{Item, ItemInner};
use crate::prompt::{ExpectedResult, Prompt, PromptOutcome};
use crate::registry::{ObjectRegistry, Retention};
use crate::session::{Session, SessionSlot};
use crate::transport::{ObjectKind, PropertyChange, SearchReply, SecretTransport, Serial, WireSecret};
use crate::watch::{self, Watched};

/// What to do eagerly when a handle is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags {
    pub open_session: bool,
    pub load_collections: bool,
}

impl ServiceFlags {
    pub const NONE: Self = Self {
        open_session: false,
        load_collections: false,
    };
    pub const OPEN_SESSION: Self = Self {
        open_session: true,
        load_collections: false,
    };
    pub const LOAD_COLLECTIONS: Self = Self {
        open_session: false,
        load_collections: true,
    };
}

impl std::ops::BitOr for ServiceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            open_session: self.open_session || rhs.open_session,
            load_collections: self.load_collections || rhs.load_collections,
        }
    }
}

pub(crate) struct ServiceInner {
    pub(crate) transport: Arc<dyn SecretTransport>,
    pub(crate) config: Config,
    session: SessionSlot,
    /// Collections, owned by the service.
    pub(crate) collections: ObjectRegistry<CollectionInner>,
    /// Every live item proxy, so a path never gets two.
    pub(crate) items: ObjectRegistry<ItemInner>,
    collections_loaded: AtomicBool,
    watch: Mutex<Option<DropGuard>>,
    vanish_watch: Mutex<Option<DropGuard>>,
}

#[async_trait]
impl Watched for ServiceInner {
    fn watch_slot(&self) -> &Mutex<Option<DropGuard>> {
        &self.watch
    }

    async fn on_change(self: Arc<Self>, change: PropertyChange) {
        if !change.changed.contains_key("Collections")
            || !self.collections_loaded.load(Ordering::SeqCst)
        {
            return;
        }
        debug!("collection list changed, reloading");
        if let Err(e) = Service(self).load_collections(None).await {
            warn!(error = %e, "failed to reload collections");
        }
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        let Some(session) = self.session.get() else {
            return;
        };
        // Outside a runtime the session ends with the connection.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let path = session.path().to_string();
        handle.spawn(async move {
            match transport.close_session(&path).await {
                Ok(()) => debug!(session = %path, "session closed"),
                Err(e) => debug!(session = %path, error = %e, "failed to close session"),
            }
        });
    }
}

/// A connection to the Secret Service.  Clones share one handle.
#[derive(Clone)]
pub struct Service(pub(crate) Arc<ServiceInner>);

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("bus_name", &self.0.transport.bus_name())
            .field("session", &self.0.session.get().map(|s| s.path().to_string()))
            .finish()
    }
}

/// Run `fut`, giving up with [`Error::Cancelled`] when `cancel` fires.
pub(crate) async fn cancellable<T, F>(cancel: Option<&CancellationToken>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match cancel {
        None => fut.await,
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                res = fut => res,
            }
        }
    }
}

fn default_slot() -> &'static tokio::sync::Mutex<Option<Service>> {
    static SLOT: OnceLock<tokio::sync::Mutex<Option<Service>>> = OnceLock::new();
    SLOT.get_or_init(|| tokio::sync::Mutex::new(None))
}

impl Service {
    // -- lifecycle ---------------------------------------------------------

    /// The process-wide default handle, opened on first use.  Concurrent
    /// callers all receive the same instance.
    pub async fn get(flags: ServiceFlags) -> Result<Service> {
        acquire_default(flags, || Service::open(flags)).await
    }

    /// Drop the process-wide default handle, if any.
    pub async fn disconnect() {
        if default_slot().lock().await.take().is_some() {
            info!("default service handle released");
        }
    }

    /// Open an independent handle using the configuration file.
    pub async fn open(flags: ServiceFlags) -> Result<Service> {
        let config = Config::load()?;
        let transport = DbusTransport::connect(&config.service.bus_name).await?;
        Service::open_with(Arc::new(transport), config, flags).await
    }

    /// Open a handle over an existing transport.
    pub async fn open_with(
        transport: Arc<dyn SecretTransport>,
        config: Config,
        flags: ServiceFlags,
    ) -> Result<Service> {
        let changes = transport.property_changes(SERVICE_PATH).await?;
        let inner = Arc::new(ServiceInner {
            session: SessionSlot::new(config.service.session_algorithm.clone()),
            transport,
            config,
            collections: ObjectRegistry::new(Retention::Owned),
            items: ObjectRegistry::new(Retention::Tracked),
            collections_loaded: AtomicBool::new(false),
            watch: Mutex::new(None),
            vanish_watch: Mutex::new(None),
        });
        watch::start(&inner, changes);

        let service = Service(inner);
        let config = &service.0.config.service;
        let flags = flags
            | ServiceFlags {
                open_session: config.open_session,
                load_collections: config.load_collections,
            };
        service.apply_flags(flags).await?;
        debug!(bus_name = service.0.transport.bus_name(), "service handle opened");
        Ok(service)
    }

    async fn apply_flags(&self, flags: ServiceFlags) -> Result<()> {
        if flags.open_session {
            self.ensure_session(None).await?;
        }
        if flags.load_collections && !self.0.collections_loaded.load(Ordering::SeqCst) {
            self.load_collections(None).await?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn transport(&self) -> &Arc<dyn SecretTransport> {
        &self.0.transport
    }

    pub fn ptr_eq(&self, other: &Service) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // -- session -----------------------------------------------------------

    /// Negotiate the transfer session if that has not happened yet.
    pub async fn ensure_session(&self, cancel: Option<&CancellationToken>) -> Result<Arc<Session>> {
        cancellable(cancel, self.0.session.ensure(&*self.0.transport)).await
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.0.session.get()
    }

    /// Algorithm of the established session, if any.
    pub fn session_algorithm(&self) -> Option<&'static str> {
        self.0.session.get().map(|s| s.algorithm().as_str())
    }

    // -- collections ---------------------------------------------------------

    /// Read the collection list and materialize a proxy per collection.
    pub async fn load_collections(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Collection>> {
        let paths = cancellable(cancel, self.0.transport.read_service()).await?.value;
        let mut collections = Vec::with_capacity(paths.len());
        for path in &paths {
            match self.collection_for_path(path).await {
                Ok(c) => collections.push(c),
                Err(Error::NoSuchObject) => debug!(collection = %path, "collection vanished while loading"),
                Err(e) => return Err(e),
            }
        }
        self.0.collections.replace_all(
            collections
                .iter()
                .map(|c| (c.path().to_string(), Arc::clone(&c.0))),
        );
        self.0.collections_loaded.store(true, Ordering::SeqCst);
        Ok(collections)
    }

    /// Loaded collections, or `None` before [`Service::load_collections`].
    pub fn collections(&self) -> Option<Vec<Collection>> {
        if !self.0.collections_loaded.load(Ordering::SeqCst) {
            return None;
        }
        let mut all: Vec<Collection> = self.0.collections.values().into_iter().map(Collection).collect();
        all.sort_by(|a, b| a.path().cmp(b.path()));
        Some(all)
    }

    /// The proxy for the collection at `path`, reusing a live one.
    pub async fn collection_for_path(&self, path: &str) -> Result<Collection> {
        if let Some(inner) = self.0.collections.find(path) {
            return Ok(Collection(inner));
        }
        let changes = self.0.transport.property_changes(path).await?;
        let props = self.0.transport.read_collection(path).await?;
        let mut built = false;
        let inner = self.0.collections.insert_or_get(path, || {
            built = true;
            Arc::new(CollectionInner::new(path, &self.0, props.clone()))
        });
        if built {
            watch::start(&inner, changes);
        } else {
            inner.apply_props(props);
        }
        Ok(Collection(inner))
    }

    /// The proxy for the item at `path`, reusing a live one.
    pub async fn item_for_path(&self, path: &str) -> Result<Item> {
        if let Some(inner) = self.0.items.find(path) {
            return Ok(Item(inner));
        }
        let changes = self.0.transport.property_changes(path).await?;
        let props = self.0.transport.read_item(path).await?;
        let mut built = false;
        let inner = self.0.items.insert_or_get(path, || {
            built = true;
            Arc::new(ItemInner::new(path, &self.0, props.clone()))
        });
        if built {
            watch::start(&inner, changes);
        } else {
            inner.apply_props(props);
        }
        Ok(Item(inner))
    }

    /// Like [`Service::item_for_path`], but a reused proxy re-reads its
    /// properties first.
    pub(crate) async fn refreshed_item_for_path(&self, path: &str) -> Result<Item> {
        let Some(inner) = self.0.items.find(path) else {
            return self.item_for_path(path).await;
        };
        let props = self.0.transport.read_item(path).await?;
        inner.apply_props(props);
        Ok(Item(inner))
    }

    pub async fn read_alias(
        &self,
        name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<String>> {
        cancellable(cancel, self.0.transport.read_alias(name)).await
    }

    /// Point `name` at `collection`, or clear it with `None`.
    pub async fn set_alias(
        &self,
        name: &str,
        collection: Option<&Collection>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        cancellable(
            cancel,
            self.0.transport.set_alias(name, collection.map(Collection::path)),
        )
        .await
    }

    /// The collection behind alias `name`, if the alias is set.
    pub async fn collection_for_alias(
        &self,
        name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Collection>> {
        match self.read_alias(name, cancel).await? {
            Some(path) => self.collection_for_path(&path).await.map(Some),
            None => Ok(None),
        }
    }

    /// Create a collection, optionally under `alias`.  `Ok(None)` when the
    /// service's prompt was dismissed.
    pub async fn create_collection(
        &self,
        label: &str,
        alias: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Collection>> {
        let (path, prompt) = cancellable(
            cancel,
            self.0
                .transport
                .create_collection(label, alias.unwrap_or_default()),
        )
        .await?;
        let path = if is_null(&prompt) {
            path
        } else {
            match self
                .prompt_at_path(&prompt, ExpectedResult::ObjectPath, cancel)
                .await?
                .into_path()
            {
                Some(path) => path,
                None => return Ok(None),
            }
        };
        info!(collection = %path, label, alias = alias.unwrap_or(""), "collection created");
        self.collection_for_path(&path).await.map(Some)
    }

    // -- path-level operations ---------------------------------------------

    /// `SearchItems` with an already encoded attribute table.
    pub async fn search_for_paths(
        &self,
        attrs: &Attributes,
        cancel: Option<&CancellationToken>,
    ) -> Result<SearchReply> {
        cancellable(cancel, self.0.transport.search_items(attrs)).await
    }

    /// Secret of one item.  `None` if the service returned nothing for it.
    pub async fn get_secret_for_path(
        &self,
        path: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<SecretValue>> {
        let mut all = self
            .get_secrets_for_paths(&[path.to_string()], cancel)
            .await?;
        Ok(all.remove(path))
    }

    /// Secrets of several items in one call, keyed by item path.
    pub async fn get_secrets_for_paths(
        &self,
        paths: &[String],
        cancel: Option<&CancellationToken>,
    ) -> Result<HashMap<String, SecretValue>> {
        let session = self.ensure_session(cancel).await?;
        let wire = cancellable(cancel, self.0.transport.get_secrets(paths, session.path())).await?;
        wire.into_iter()
            .map(|(path, secret)| Ok((path, session.decode(secret)?)))
            .collect()
    }

    pub async fn lock_paths(
        &self,
        paths: &[String],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>> {
        self.lock_or_unlock(paths, true, cancel).await
    }

    pub async fn unlock_paths(
        &self,
        paths: &[String],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>> {
        self.lock_or_unlock(paths, false, cancel).await
    }

    /// One batched `Lock`/`Unlock` call, prompting if the service asks.
    /// The local `Locked` cache of every affected proxy is updated before
    /// returning.
    pub(crate) async fn lock_or_unlock(
        &self,
        paths: &[String],
        lock: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>> {
        let transport = &self.0.transport;
        let reply = if lock {
            cancellable(cancel, transport.lock(paths)).await?
        } else {
            cancellable(cancel, transport.unlock(paths)).await?
        };
        let mut objects = reply.value.objects;
        let mut serial = reply.serial;

        if !is_null(&reply.value.prompt) {
            let outcome = self
                .prompt_at_path(&reply.value.prompt, ExpectedResult::ObjectPaths, cancel)
                .await?;
            serial = serial.max(outcome.serial);
            match outcome.into_paths() {
                Some(more) => objects.extend(more),
                None => debug!(lock, "lock prompt declined"),
            }
        }

        self.update_locked(&objects, lock, serial);
        debug!(lock, requested = paths.len(), affected = objects.len(), "lock state changed");
        Ok(objects)
    }

    fn update_locked(&self, paths: &[String], locked: bool, serial: Serial) {
        let affected: HashSet<&str> = paths.iter().map(String::as_str).collect();
        for path in paths {
            if let Some(collection) = self.0.collections.find(path) {
                collection.set_locked(locked, serial);
            }
            if let Some(item) = self.0.items.find(path) {
                item.set_locked(locked, serial);
            }
        }
        self.items_follow_collections(&affected, locked, serial);
    }

    /// Give every live item proxy inside `collections` the collection's
    /// lock state.
    pub(crate) fn items_follow_collections(
        &self,
        collections: &HashSet<&str>,
        locked: bool,
        serial: Serial,
    ) {
        for item in self.0.items.values() {
            let item = Item(item);
            if item.collection_path().is_some_and(|c| collections.contains(c)) {
                item.0.set_locked(locked, serial);
            }
        }
    }

    /// Delete the object at `path`.  `Ok(false)` when a prompt was dismissed.
    pub async fn delete_path(
        &self,
        path: &str,
        kind: ObjectKind,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        let prompt = cancellable(cancel, self.0.transport.delete(path, kind)).await?;
        if !is_null(&prompt) {
            let outcome = self
                .prompt_at_path(&prompt, ExpectedResult::Any, cancel)
                .await?;
            if outcome.is_dismissed() {
                return Ok(false);
            }
        }
        match kind {
            ObjectKind::Collection => {
                self.0.collections.remove(path);
            }
            ObjectKind::Item => {
                if let Some(parent) = parent_path(path)
                    && let Some(collection) = self.0.collections.find(parent)
                {
                    collection.forget_item(path);
                }
            }
        }
        debug!(path, "deleted");
        Ok(true)
    }

    /// `CreateItem` with an already encoded attribute table.  Returns the
    /// new item's path, or `None` when a prompt was dismissed.
    pub async fn create_item_at_path(
        &self,
        collection: &str,
        label: &str,
        attrs: &Attributes,
        value: &SecretValue,
        replace: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<String>> {
        let session = self.ensure_session(cancel).await?;
        let wire = session.encode(value);
        self.create_item_wire(collection, label, attrs, &wire, replace, cancel)
            .await
    }

    pub(crate) async fn create_item_wire(
        &self,
        collection: &str,
        label: &str,
        attrs: &Attributes,
        wire: &WireSecret,
        replace: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<String>> {
        let (path, prompt) = cancellable(
            cancel,
            self.0
                .transport
                .create_item(collection, label, attrs, wire, replace),
        )
        .await?;
        if is_null(&prompt) {
            return Ok(Some(path));
        }
        Ok(self
            .prompt_at_path(&prompt, ExpectedResult::ObjectPath, cancel)
            .await?
            .into_path())
    }

    /// Drive the prompt at `path` to completion.
    pub async fn prompt_at_path(
        &self,
        path: &str,
        expected: ExpectedResult,
        cancel: Option<&CancellationToken>,
    ) -> Result<PromptOutcome> {
        Prompt::new(path)
            .perform(
                &*self.0.transport,
                &self.0.config.prompt.window_id,
                expected,
                cancel,
            )
            .await
    }
}

/// Return the default handle, opening it with `open` if there is none.
pub(crate) async fn acquire_default<F, Fut>(flags: ServiceFlags, open: F) -> Result<Service>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Service>>,
{
    let mut slot = default_slot().lock().await;
    if let Some(service) = slot.as_ref() {
        let service = service.clone();
        drop(slot);
        service.apply_flags(flags).await?;
        return Ok(service);
    }
    let service = open().await?;
    watch_vanish(&service).await;
    *slot = Some(service.clone());
    Ok(service)
}

/// Release the default handle when its service leaves the bus.
async fn watch_vanish(service: &Service) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let mut vanished = match service.0.transport.owner_vanished().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot watch the service's bus name");
            return;
        }
    };
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let weak: Weak<ServiceInner> = Arc::downgrade(&service.0);
    handle.spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            event = vanished.next() => {
                if event.is_none() {
                    return;
                }
                let mut slot = default_slot().lock().await;
                if slot.as_ref().is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s.0), weak.as_ptr())) {
                    slot.take();
                    info!("secret service left the bus, default handle released");
                }
            }
        }
    });
    *service
        .0
        .vanish_watch
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(token.drop_guard());
}

#[cfg(test)]
pub(crate) static DEFAULT_TEST_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());
