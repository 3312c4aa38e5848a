//! High-level operations on a [`Service`]: store, lookup, clear, search,
//! lock and unlock.

use lockbox_core::paths::{ALIAS_PREFIX, DEFAULT_ALIAS, collection_path, is_alias_path};
use lockbox_core::{Attributes, Error, Result, Schema, SecretValue, attributes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collection::Collection;
use crate::item::Item;
use crate::service::Service;
use crate::transport::{ObjectKind, Serial};

/// Controls how much a search returns and what it does on the way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SearchFlags(u8);

impl SearchFlags {
    pub const NONE: Self = Self(0);
    /// Return every match instead of the best one.
    pub const ALL: Self = Self(1 << 1);
    /// Unlock locked matches before returning them.
    pub const UNLOCK: Self = Self(1 << 2);
    /// Load secrets of the unlocked matches.
    pub const LOAD_SECRETS: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SearchFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Anything that names a remote collection or item.
pub trait SecretObject {
    fn object_path(&self) -> &str;
}

impl SecretObject for str {
    fn object_path(&self) -> &str {
        self
    }
}

impl SecretObject for String {
    fn object_path(&self) -> &str {
        self
    }
}

impl SecretObject for Collection {
    fn object_path(&self) -> &str {
        self.path()
    }
}

impl SecretObject for Item {
    fn object_path(&self) -> &str {
        self.path()
    }
}

impl<T: SecretObject + ?Sized> SecretObject for &T {
    fn object_path(&self) -> &str {
        (**self).object_path()
    }
}

/// Without `ALL`, keep the first unlocked match or else the first locked
/// one.
fn narrow<T>(mut unlocked: Vec<T>, mut locked: Vec<T>, flags: SearchFlags) -> (Vec<T>, Vec<T>) {
    if !flags.contains(SearchFlags::ALL) {
        if unlocked.is_empty() {
            locked.truncate(1);
        } else {
            unlocked.truncate(1);
            locked.clear();
        }
    }
    (unlocked, locked)
}

/// Best-effort unlock.  Only cancellation is reported.
async fn unlock_candidates(
    service: &Service,
    paths: &[String],
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    match service.unlock_paths(paths, cancel).await {
        Ok(done) => {
            debug!(requested = paths.len(), unlocked = done.len(), "unlocked search matches");
            Ok(())
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            debug!(error = %e, "unlocking search matches failed, continuing");
            Ok(())
        }
    }
}

/// Best-effort secret load.  Every item is asked for; the service skips
/// the ones that are locked.
async fn load_selected(items: &[Item], cancel: Option<&CancellationToken>) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    match Item::load_secrets(items, cancel).await {
        Ok(()) => Ok(()),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            debug!(error = %e, "loading secrets of search matches failed, continuing");
            Ok(())
        }
    }
}

/// Apply `flags` to already materialized matches.  The result lists the
/// originally unlocked matches first, then the originally locked ones, each
/// in the order the service returned them.
pub(crate) async fn select_matches(
    service: &Service,
    unlocked: Vec<Item>,
    locked: Vec<Item>,
    flags: SearchFlags,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<Item>> {
    let (unlocked, locked) = narrow(unlocked, locked, flags);
    if flags.contains(SearchFlags::UNLOCK) {
        let paths: Vec<String> = locked.iter().map(|i| i.path().to_string()).collect();
        unlock_candidates(service, &paths, cancel).await?;
    }
    let mut selected = unlocked;
    selected.extend(locked);
    if flags.contains(SearchFlags::LOAD_SECRETS) {
        load_selected(&selected, cancel).await?;
    }
    Ok(selected)
}

impl Service {
    /// Store a secret, replacing an item with the same attributes.
    ///
    /// `collection` is an alias or an object path; `None` means the
    /// configured default alias.  A missing default collection is created
    /// and a locked collection is unlocked, each at most once per call.
    /// Returns `false` when the user dismissed a prompt.
    pub async fn store(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
        collection: Option<&str>,
        label: &str,
        value: &SecretValue,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        let wire_attrs = attributes::for_store(schema, attrs)?;
        let target =
            collection_path(collection.unwrap_or(&self.config().service.default_collection));
        let session = self.ensure_session(cancel).await?;
        let secret = session.encode(value);

        let mut created_default = false;
        let mut unlocked = false;
        loop {
            let err = match self
                .create_item_wire(&target, label, &wire_attrs, &secret, true, cancel)
                .await
            {
                Ok(Some(path)) => {
                    debug!(item = %path, collection = %target, "secret stored");
                    return Ok(true);
                }
                Ok(None) => {
                    debug!(collection = %target, "store prompt dismissed");
                    return Ok(false);
                }
                Err(e) => e,
            };
            match err {
                Error::NoSuchObject if !created_default && is_alias_path(&target, DEFAULT_ALIAS) => {
                    created_default = true;
                    let label = &self.config().store.default_collection_label;
                    info!(label = %label, "default collection missing, creating it");
                    if self
                        .create_collection(label, Some(DEFAULT_ALIAS), cancel)
                        .await?
                        .is_none()
                    {
                        return Ok(false);
                    }
                }
                Error::IsLocked if !unlocked => {
                    unlocked = true;
                    let path = self.resolve_collection(&target, cancel).await?;
                    info!(collection = %path, "collection locked, unlocking before store");
                    self.unlock_paths(&[path], cancel).await?;
                }
                e => return Err(e),
            }
        }
    }

    /// Alias paths resolve to the collection they point at.
    async fn resolve_collection(
        &self,
        path: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let Some(alias) = path.strip_prefix(ALIAS_PREFIX) else {
            return Ok(path.to_string());
        };
        Ok(self
            .read_alias(alias, cancel)
            .await?
            .unwrap_or_else(|| path.to_string()))
    }

    /// Secret of the first match, unlocking it if every match is locked.
    /// `None` when nothing matches or the unlock did not succeed.
    pub async fn lookup(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<SecretValue>> {
        let wire = attributes::for_search(schema, attrs)?;
        let reply = self.search_for_paths(&wire, cancel).await?;

        let path = if let Some(path) = reply.unlocked.into_iter().next() {
            path
        } else if let Some(path) = reply.locked.into_iter().next() {
            match self.unlock_paths(std::slice::from_ref(&path), cancel).await {
                Ok(done) if done.contains(&path) => path,
                Ok(_) => {
                    debug!(item = %path, "lookup match stayed locked");
                    return Ok(None);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    debug!(item = %path, error = %e, "unlocking lookup match failed");
                    return Ok(None);
                }
            }
        } else {
            return Ok(None);
        };

        self.get_secret_for_path(&path, cancel).await
    }

    /// Delete every unlocked match and return how many were removed.
    ///
    /// Locked matches are skipped.  A failed delete does not stop the batch;
    /// the first failure is returned once every match has been tried.
    pub async fn clear(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        let wire = attributes::for_search(schema, attrs)?;
        let reply = self.search_for_paths(&wire, cancel).await?;
        if !reply.locked.is_empty() {
            debug!(skipped = reply.locked.len(), "clear skips locked matches");
        }

        let mut removed = 0;
        let mut first_error = None;
        for path in &reply.unlocked {
            match self
                .delete_path(path, ObjectKind::Item, cancel)
                .await
            {
                Ok(true) => removed += 1,
                Ok(false) => debug!(item = %path, "delete prompt dismissed"),
                Err(e) => {
                    warn!(item = %path, error = %e, "failed to delete item");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Search every collection.  See [`SearchFlags`].
    pub async fn search(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
        flags: SearchFlags,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Item>> {
        let wire = attributes::for_search(schema, attrs)?;
        let reply = self.search_for_paths(&wire, cancel).await?;
        let serial = reply.serial;
        let (unlocked, locked) = narrow(reply.unlocked, reply.locked, flags);

        // Unlock by path first so the proxies are built with fresh state.
        if flags.contains(SearchFlags::UNLOCK) {
            unlock_candidates(self, &locked, cancel).await?;
        }
        let unlocked = self.materialize(&unlocked, false, serial).await?;
        let locked = self.materialize(&locked, true, serial).await?;
        let flags = SearchFlags(flags.0 & !SearchFlags::UNLOCK.0);
        select_matches(self, unlocked, locked, flags, cancel).await
    }

    /// Proxies for `paths`, given the lock state a search reported at
    /// `serial`.  Proxies holding newer state keep it.
    async fn materialize(&self, paths: &[String], locked: bool, serial: Serial) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let item = self.item_for_path(path).await?;
            item.0.set_locked(locked, serial);
            items.push(item);
        }
        Ok(items)
    }

    /// Lock collections or items.  Returns the paths that were locked.
    pub async fn lock<O: SecretObject>(
        &self,
        objects: &[O],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>> {
        let paths: Vec<String> = objects.iter().map(|o| o.object_path().to_string()).collect();
        self.lock_paths(&paths, cancel).await
    }

    /// Unlock collections or items, prompting if the service asks.
    /// Returns the paths that were unlocked.
    pub async fn unlock<O: SecretObject>(
        &self,
        objects: &[O],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>> {
        let paths: Vec<String> = objects.iter().map(|o| o.object_path().to_string()).collect();
        self.unlock_paths(&paths, cancel).await
    }
}
