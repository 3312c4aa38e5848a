//! In-memory Secret Service used by the unit tests.
//!
//! Models collections, aliases, items and lock state, optionally answers
//! unlock/create/delete with prompts, and broadcasts `Completed`,
//! `PropertiesChanged` and name-owner-vanished events.  Item lock state is
//! the lock state of the item's collection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use lockbox_core::paths::{ALIAS_PREFIX, COLLECTION_INTERFACE, COLLECTION_PREFIX, ITEM_INTERFACE};
use lockbox_core::{Attributes, Error, Result};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

use crate::transport::{
    CollectionProps, ItemProps, LockReply, ObjectKind, PromptEvent, PromptResult,
    PropertyChange, PropertyValue, SearchReply, SecretTransport, Serial, Stamped, WireSecret,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPolicy {
    /// Perform the pending action and report success.
    Complete,
    /// Report that the user dismissed the dialog.
    Dismiss,
    /// Never answer until `Dismiss()` is called.
    Hold,
    /// Answer with a `Completed` signal that fails to decode.
    Malformed,
}

#[derive(Default)]
pub struct MockCounters {
    open_session: AtomicUsize,
    close_session: AtomicUsize,
    create_collection: AtomicUsize,
    create_item: AtomicUsize,
    search: AtomicUsize,
    get_secrets: AtomicUsize,
    lock: AtomicUsize,
    unlock: AtomicUsize,
    delete: AtomicUsize,
    prompt: AtomicUsize,
    dismiss: AtomicUsize,
}

macro_rules! counter {
    ($($name:ident),*) => {
        impl MockCounters {
            $(pub fn $name(&self) -> usize {
                self.$name.load(Ordering::SeqCst)
            })*
        }
    };
}

counter!(
    open_session,
    close_session,
    create_collection,
    create_item,
    search,
    get_secrets,
    lock,
    unlock,
    delete,
    prompt,
    dismiss
);

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

struct MockCollection {
    label: String,
    locked: bool,
}

struct MockItem {
    collection: String,
    label: String,
    attributes: Attributes,
    secret: Vec<u8>,
    content_type: String,
}

enum PendingAction {
    Unlock(Vec<String>),
    CreateItem {
        collection: String,
        label: String,
        attributes: Attributes,
        secret: WireSecret,
        replace: bool,
    },
    Delete(String),
}

struct MockState {
    collections: BTreeMap<String, MockCollection>,
    aliases: HashMap<String, String>,
    items: BTreeMap<String, MockItem>,
    sessions: HashSet<String>,
    prompts: HashMap<String, PendingAction>,
    next_id: u64,
    policy: PromptPolicy,
    prompt_unlock: bool,
    prompt_create: bool,
    prompt_delete: bool,
    vanish_on_dismiss: bool,
    fail_open_session: bool,
    fail_delete: HashSet<String>,
    session_delay: Duration,
}

pub struct MockService {
    state: Mutex<MockState>,
    serial: AtomicU64,
    counters: MockCounters,
    prompts_tx: broadcast::Sender<(String, PromptEvent)>,
    vanish_tx: broadcast::Sender<()>,
    props_tx: broadcast::Sender<PropertyChange>,
    vanished: AtomicBool,
}

impl MockService {
    pub fn new() -> Arc<Self> {
        let (prompts_tx, _) = broadcast::channel(64);
        let (vanish_tx, _) = broadcast::channel(8);
        let (props_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(MockState {
                collections: BTreeMap::new(),
                aliases: HashMap::new(),
                items: BTreeMap::new(),
                sessions: HashSet::new(),
                prompts: HashMap::new(),
                next_id: 1,
                policy: PromptPolicy::Complete,
                prompt_unlock: false,
                prompt_create: false,
                prompt_delete: false,
                vanish_on_dismiss: false,
                fail_open_session: false,
                fail_delete: HashSet::new(),
                session_delay: Duration::ZERO,
            }),
            serial: AtomicU64::new(1),
            counters: MockCounters::default(),
            prompts_tx,
            vanish_tx,
            props_tx,
            vanished: AtomicBool::new(false),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counters(&self) -> &MockCounters {
        &self.counters
    }

    pub fn next_serial(&self) -> Serial {
        Serial(self.serial.fetch_add(1, Ordering::SeqCst))
    }

    // -- scenario setup ----------------------------------------------------

    pub fn add_collection(&self, id: &str, label: &str, locked: bool) -> String {
        let path = format!("{COLLECTION_PREFIX}{id}");
        self.state().collections.insert(
            path.clone(),
            MockCollection {
                label: label.to_string(),
                locked,
            },
        );
        path
    }

    pub fn alias(&self, name: &str, collection: &str) {
        self.state()
            .aliases
            .insert(name.to_string(), collection.to_string());
    }

    pub fn add_item(
        &self,
        collection: &str,
        label: &str,
        attributes: &[(&str, &str)],
        secret: &str,
    ) -> String {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        let path = format!("{collection}/{id}");
        state.items.insert(
            path.clone(),
            MockItem {
                collection: collection.to_string(),
                label: label.to_string(),
                attributes: attributes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                secret: secret.as_bytes().to_vec(),
                content_type: "text/plain".to_string(),
            },
        );
        path
    }

    pub fn set_collection_locked(&self, collection: &str, locked: bool) {
        if let Some(c) = self.state().collections.get_mut(collection) {
            c.locked = locked;
        }
    }

    pub fn set_prompt_policy(&self, policy: PromptPolicy) {
        self.state().policy = policy;
    }

    pub fn require_prompt_for_unlock(&self, on: bool) {
        self.state().prompt_unlock = on;
    }

    pub fn require_prompt_for_create(&self, on: bool) {
        self.state().prompt_create = on;
    }

    pub fn require_prompt_for_delete(&self, on: bool) {
        self.state().prompt_delete = on;
    }

    pub fn vanish_on_dismiss(&self, on: bool) {
        self.state().vanish_on_dismiss = on;
    }

    pub fn set_session_delay(&self, delay: Duration) {
        self.state().session_delay = delay;
    }

    pub fn fail_next_open_session(&self) {
        self.state().fail_open_session = true;
    }

    /// Make every `Delete` of `path` fail with a remote error.
    pub fn fail_delete_of(&self, path: &str) {
        self.state().fail_delete.insert(path.to_string());
    }

    // -- inspection ------------------------------------------------------------

    pub fn collection_count(&self) -> usize {
        self.state().collections.len()
    }

    pub fn item_count(&self) -> usize {
        self.state().items.len()
    }

    pub fn has_item(&self, path: &str) -> bool {
        self.state().items.contains_key(path)
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn is_locked(&self, path: &str) -> bool {
        let state = self.state();
        collection_of(&state, path)
            .and_then(|c| state.collections.get(&c))
            .is_some_and(|c| c.locked)
    }

    pub fn resolve_alias(&self, name: &str) -> Option<String> {
        self.state().aliases.get(name).cloned()
    }

    pub async fn wait_for_prompt_calls(&self, n: usize) {
        while self.counters.prompt() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // -- events ----------------------------------------------------------------

    /// The service's bus name loses its owner.
    pub fn vanish(&self) {
        self.vanished.store(true, Ordering::SeqCst);
        let _ = self.vanish_tx.send(());
    }

    pub fn emit_property_change(&self, change: PropertyChange) {
        let _ = self.props_tx.send(change);
    }

    fn emit_locked(&self, state: &MockState, collection: &str, locked: bool) {
        let mut paths = vec![(collection.to_string(), COLLECTION_INTERFACE)];
        paths.extend(
            state
                .items
                .iter()
                .filter(|(_, i)| i.collection == collection)
                .map(|(p, _)| (p.clone(), ITEM_INTERFACE)),
        );
        for (path, interface) in paths {
            self.emit_property_change(PropertyChange {
                path,
                interface: interface.to_string(),
                changed: HashMap::from([("Locked".to_string(), PropertyValue::Bool(locked))]),
                invalidated: Vec::new(),
                serial: self.next_serial(),
            });
        }
    }

    fn emit_items_changed(&self, state: &MockState, collection: &str) {
        self.emit_property_change(PropertyChange {
            path: collection.to_string(),
            interface: COLLECTION_INTERFACE.to_string(),
            changed: HashMap::from([(
                "Items".to_string(),
                PropertyValue::Paths(items_of(state, collection)),
            )]),
            invalidated: Vec::new(),
            serial: self.next_serial(),
        });
    }

    fn emit_prompt(&self, path: &str, event: PromptEvent) {
        let _ = self.prompts_tx.send((path.to_string(), event));
    }

    fn new_prompt(&self, state: &mut MockState, action: PendingAction) -> String {
        let path = format!(
            "/org/freedesktop/secrets/prompt/p{}",
            uuid::Uuid::new_v4().simple()
        );
        state.prompts.insert(path.clone(), action);
        path
    }

    // -- actions shared by direct calls and prompts ------------------------

    fn do_unlock(&self, state: &mut MockState, objects: &[String]) -> Vec<String> {
        let mut done = Vec::new();
        for path in objects {
            let Some(collection) = collection_of(state, path) else {
                continue;
            };
            if let Some(c) = state.collections.get_mut(&collection) {
                if c.locked {
                    c.locked = false;
                    self.emit_locked(state, &collection, false);
                }
                done.push(path.clone());
            }
        }
        done
    }

    fn do_create_item(
        &self,
        state: &mut MockState,
        collection: &str,
        label: &str,
        attributes: &Attributes,
        secret: &WireSecret,
        replace: bool,
    ) -> Result<String> {
        if !state.sessions.contains(&secret.session) {
            return Err(Error::from_remote(
                "org.freedesktop.Secret.Error.NoSession",
                "no such session",
            ));
        }
        if replace
            && let Some((path, item)) = state
                .items
                .iter_mut()
                .find(|(_, i)| i.collection == collection && i.attributes == *attributes)
        {
            item.label = label.to_string();
            item.secret = secret.value.to_vec();
            item.content_type = secret.content_type.clone();
            return Ok(path.clone());
        }
        let id = state.next_id;
        state.next_id += 1;
        let path = format!("{collection}/{id}");
        state.items.insert(
            path.clone(),
            MockItem {
                collection: collection.to_string(),
                label: label.to_string(),
                attributes: attributes.clone(),
                secret: secret.value.to_vec(),
                content_type: secret.content_type.clone(),
            },
        );
        self.emit_items_changed(state, collection);
        Ok(path)
    }

    fn do_delete(&self, state: &mut MockState, path: &str) -> Result<()> {
        if let Some(item) = state.items.remove(path) {
            self.emit_items_changed(state, &item.collection);
            return Ok(());
        }
        if state.collections.remove(path).is_some() {
            state.items.retain(|_, i| i.collection != path);
            state.aliases.retain(|_, c| c != path);
            return Ok(());
        }
        Err(Error::NoSuchObject)
    }

    fn resolve(&self, state: &MockState, path: &str) -> Option<String> {
        match path.strip_prefix(ALIAS_PREFIX) {
            Some(alias) => state.aliases.get(alias).cloned(),
            None => state.collections.contains_key(path).then(|| path.to_string()),
        }
    }

    fn check_present(&self) -> Result<()> {
        if self.vanished.load(Ordering::SeqCst) {
            return Err(Error::Transport("service is not on the bus".to_string()));
        }
        Ok(())
    }
}

fn collection_of(state: &MockState, path: &str) -> Option<String> {
    if state.collections.contains_key(path) {
        return Some(path.to_string());
    }
    state.items.get(path).map(|i| i.collection.clone())
}

fn items_of(state: &MockState, collection: &str) -> Vec<String> {
    state
        .items
        .iter()
        .filter(|(_, i)| i.collection == collection)
        .map(|(p, _)| p.clone())
        .collect()
}

fn matches(item: &MockItem, attributes: &Attributes) -> bool {
    attributes
        .iter()
        .all(|(k, v)| item.attributes.get(k) == Some(v))
}

fn subscribe<T: Clone + Send + 'static>(tx: &broadcast::Sender<T>) -> BoxStream<'static, T> {
    let rx = tx.subscribe();
    futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(v) => return Some((v, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl SecretTransport for MockService {
    fn bus_name(&self) -> &str {
        "org.freedesktop.secrets"
    }

    async fn open_session(&self, algorithm: &str, _input: &[u8]) -> Result<(Vec<u8>, String)> {
        bump(&self.counters.open_session);
        let delay = self.state().session_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if std::mem::take(&mut state.fail_open_session) {
            return Err(Error::Transport("connection reset".to_string()));
        }
        if algorithm != "plain" {
            return Err(Error::from_remote(
                "org.freedesktop.DBus.Error.NotSupported",
                "algorithm not supported",
            ));
        }
        let path = format!(
            "/org/freedesktop/secrets/session/s{}",
            uuid::Uuid::new_v4().simple()
        );
        state.sessions.insert(path.clone());
        Ok((Vec::new(), path))
    }

    async fn close_session(&self, session: &str) -> Result<()> {
        bump(&self.counters.close_session);
        self.state().sessions.remove(session);
        Ok(())
    }

    async fn read_service(&self) -> Result<Stamped<Vec<String>>> {
        self.check_present()?;
        let paths = self.state().collections.keys().cloned().collect();
        Ok(Stamped::new(paths, self.next_serial()))
    }

    async fn read_collection(&self, path: &str) -> Result<Stamped<CollectionProps>> {
        self.check_present()?;
        let state = self.state();
        let real = self.resolve(&state, path).ok_or(Error::NoSuchObject)?;
        let c = state.collections.get(&real).ok_or(Error::NoSuchObject)?;
        let props = CollectionProps {
            label: c.label.clone(),
            locked: c.locked,
            created: 1_700_000_000,
            modified: 1_700_000_000,
            items: items_of(&state, &real),
        };
        Ok(Stamped::new(props, self.next_serial()))
    }

    async fn read_item(&self, path: &str) -> Result<Stamped<ItemProps>> {
        self.check_present()?;
        let state = self.state();
        let item = state.items.get(path).ok_or(Error::NoSuchObject)?;
        let locked = state
            .collections
            .get(&item.collection)
            .is_some_and(|c| c.locked);
        let props = ItemProps {
            label: item.label.clone(),
            attributes: item.attributes.clone(),
            locked,
            created: 1_700_000_100,
            modified: 1_700_000_200,
        };
        Ok(Stamped::new(props, self.next_serial()))
    }

    async fn search_items(&self, attributes: &Attributes) -> Result<SearchReply> {
        self.check_present()?;
        bump(&self.counters.search);
        let state = self.state();
        let mut reply = SearchReply {
            serial: self.next_serial(),
            ..SearchReply::default()
        };
        for (path, item) in &state.items {
            if !matches(item, attributes) {
                continue;
            }
            let locked = state
                .collections
                .get(&item.collection)
                .is_some_and(|c| c.locked);
            if locked {
                reply.locked.push(path.clone());
            } else {
                reply.unlocked.push(path.clone());
            }
        }
        Ok(reply)
    }

    async fn search_collection(
        &self,
        collection: &str,
        attributes: &Attributes,
    ) -> Result<Vec<String>> {
        self.check_present()?;
        bump(&self.counters.search);
        let state = self.state();
        let real = self.resolve(&state, collection).ok_or(Error::NoSuchObject)?;
        Ok(state
            .items
            .iter()
            .filter(|(_, i)| i.collection == real && matches(i, attributes))
            .map(|(p, _)| p.clone())
            .collect())
    }

    async fn get_secrets(
        &self,
        items: &[String],
        session: &str,
    ) -> Result<HashMap<String, WireSecret>> {
        self.check_present()?;
        bump(&self.counters.get_secrets);
        let state = self.state();
        if !state.sessions.contains(session) {
            return Err(Error::from_remote(
                "org.freedesktop.Secret.Error.NoSession",
                "no such session",
            ));
        }
        let mut out = HashMap::new();
        for path in items {
            let Some(item) = state.items.get(path) else {
                continue;
            };
            if state
                .collections
                .get(&item.collection)
                .is_some_and(|c| c.locked)
            {
                continue;
            }
            out.insert(
                path.clone(),
                WireSecret {
                    session: session.to_string(),
                    parameters: Vec::new(),
                    value: Zeroizing::new(item.secret.clone()),
                    content_type: item.content_type.clone(),
                },
            );
        }
        Ok(out)
    }

    async fn get_secret(&self, item: &str, session: &str) -> Result<WireSecret> {
        if self.is_locked(item) {
            return Err(Error::IsLocked);
        }
        let mut all = self.get_secrets(&[item.to_string()], session).await?;
        all.remove(item).ok_or(Error::NoSuchObject)
    }

    async fn set_secret(&self, item: &str, secret: &WireSecret) -> Result<()> {
        self.check_present()?;
        let locked = self.is_locked(item);
        let mut state = self.state();
        if !state.sessions.contains(&secret.session) {
            return Err(Error::from_remote(
                "org.freedesktop.Secret.Error.NoSession",
                "no such session",
            ));
        }
        let entry = state.items.get_mut(item).ok_or(Error::NoSuchObject)?;
        if locked {
            return Err(Error::IsLocked);
        }
        entry.secret = secret.value.to_vec();
        entry.content_type = secret.content_type.clone();
        Ok(())
    }

    async fn create_item(
        &self,
        collection: &str,
        label: &str,
        attributes: &Attributes,
        secret: &WireSecret,
        replace: bool,
    ) -> Result<(String, String)> {
        self.check_present()?;
        bump(&self.counters.create_item);
        let mut state = self.state();
        let real = self.resolve(&state, collection).ok_or(Error::NoSuchObject)?;
        if state.collections.get(&real).is_some_and(|c| c.locked) {
            return Err(Error::IsLocked);
        }
        if state.prompt_create {
            let prompt = self.new_prompt(
                &mut state,
                PendingAction::CreateItem {
                    collection: real,
                    label: label.to_string(),
                    attributes: attributes.clone(),
                    secret: secret.clone(),
                    replace,
                },
            );
            return Ok(("/".to_string(), prompt));
        }
        let path = self.do_create_item(&mut state, &real, label, attributes, secret, replace)?;
        Ok((path, "/".to_string()))
    }

    async fn create_collection(&self, label: &str, alias: &str) -> Result<(String, String)> {
        self.check_present()?;
        bump(&self.counters.create_collection);
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        let path = format!("{COLLECTION_PREFIX}c{id}");
        state.collections.insert(
            path.clone(),
            MockCollection {
                label: label.to_string(),
                locked: false,
            },
        );
        if !alias.is_empty() {
            state.aliases.insert(alias.to_string(), path.clone());
        }
        Ok((path, "/".to_string()))
    }

    async fn delete(&self, path: &str, _kind: ObjectKind) -> Result<String> {
        self.check_present()?;
        bump(&self.counters.delete);
        if self.is_locked(path) {
            return Err(Error::IsLocked);
        }
        let mut state = self.state();
        if state.fail_delete.contains(path) {
            return Err(Error::from_remote(
                "org.example.Error.Busy",
                "item is in use",
            ));
        }
        if state.prompt_delete {
            if collection_of(&state, path).is_none() {
                return Err(Error::NoSuchObject);
            }
            return Ok(self.new_prompt(&mut state, PendingAction::Delete(path.to_string())));
        }
        self.do_delete(&mut state, path)?;
        Ok("/".to_string())
    }

    async fn lock(&self, objects: &[String]) -> Result<Stamped<LockReply>> {
        self.check_present()?;
        bump(&self.counters.lock);
        let mut state = self.state();
        let mut done = Vec::new();
        for path in objects {
            let Some(collection) = collection_of(&state, path) else {
                continue;
            };
            if let Some(c) = state.collections.get_mut(&collection) {
                if !c.locked {
                    c.locked = true;
                    self.emit_locked(&state, &collection, true);
                }
                done.push(path.clone());
            }
        }
        let reply = LockReply {
            objects: done,
            prompt: "/".to_string(),
        };
        Ok(Stamped::new(reply, self.next_serial()))
    }

    async fn unlock(&self, objects: &[String]) -> Result<Stamped<LockReply>> {
        self.check_present()?;
        bump(&self.counters.unlock);
        let mut state = self.state();
        let (locked, open): (Vec<String>, Vec<String>) = objects
            .iter()
            .filter(|p| collection_of(&state, p).is_some())
            .cloned()
            .partition(|p| {
                collection_of(&state, p)
                    .and_then(|c| state.collections.get(&c))
                    .is_some_and(|c| c.locked)
            });
        let reply = if state.prompt_unlock && !locked.is_empty() {
            let prompt = self.new_prompt(&mut state, PendingAction::Unlock(locked));
            LockReply {
                objects: open,
                prompt,
            }
        } else {
            let mut done = open;
            done.extend(self.do_unlock(&mut state, &locked));
            LockReply {
                objects: done,
                prompt: "/".to_string(),
            }
        };
        Ok(Stamped::new(reply, self.next_serial()))
    }

    async fn read_alias(&self, name: &str) -> Result<Option<String>> {
        self.check_present()?;
        Ok(self.state().aliases.get(name).cloned())
    }

    async fn set_alias(&self, name: &str, collection: Option<&str>) -> Result<()> {
        self.check_present()?;
        let mut state = self.state();
        match collection {
            Some(path) => {
                if !state.collections.contains_key(path) {
                    return Err(Error::NoSuchObject);
                }
                state.aliases.insert(name.to_string(), path.to_string());
            }
            None => {
                state.aliases.remove(name);
            }
        }
        Ok(())
    }

    async fn set_label(&self, path: &str, kind: ObjectKind, label: &str) -> Result<()> {
        self.check_present()?;
        let mut state = self.state();
        match kind {
            ObjectKind::Collection => {
                let real = self.resolve(&state, path).ok_or(Error::NoSuchObject)?;
                let c = state.collections.get_mut(&real).ok_or(Error::NoSuchObject)?;
                c.label = label.to_string();
            }
            ObjectKind::Item => {
                let item = state.items.get_mut(path).ok_or(Error::NoSuchObject)?;
                item.label = label.to_string();
            }
        }
        Ok(())
    }

    async fn set_item_attributes(&self, item: &str, attributes: &Attributes) -> Result<()> {
        self.check_present()?;
        let mut state = self.state();
        let entry = state.items.get_mut(item).ok_or(Error::NoSuchObject)?;
        entry.attributes = attributes.clone();
        Ok(())
    }

    async fn prompt(&self, path: &str, _window_id: &str) -> Result<()> {
        self.check_present()?;
        bump(&self.counters.prompt);
        let mut state = self.state();
        if !state.prompts.contains_key(path) {
            return Err(Error::NoSuchObject);
        }
        match state.policy {
            PromptPolicy::Hold => return Ok(()),
            PromptPolicy::Malformed => {
                state.prompts.remove(path);
                self.emit_prompt(path, PromptEvent::Malformed("expected (bv)".to_string()));
                return Ok(());
            }
            PromptPolicy::Dismiss => {
                state.prompts.remove(path);
                self.emit_prompt(
                    path,
                    PromptEvent::Completed {
                        dismissed: true,
                        result: PromptResult::String(String::new()),
                        serial: self.next_serial(),
                    },
                );
                return Ok(());
            }
            PromptPolicy::Complete => {}
        }
        let Some(action) = state.prompts.remove(path) else {
            return Err(Error::NoSuchObject);
        };
        let result = match action {
            PendingAction::Unlock(objects) => {
                PromptResult::ObjectPaths(self.do_unlock(&mut state, &objects))
            }
            PendingAction::CreateItem {
                collection,
                label,
                attributes,
                secret,
                replace,
            } => PromptResult::ObjectPath(self.do_create_item(
                &mut state,
                &collection,
                &label,
                &attributes,
                &secret,
                replace,
            )?),
            PendingAction::Delete(target) => {
                self.do_delete(&mut state, &target)?;
                PromptResult::String(String::new())
            }
        };
        self.emit_prompt(
            path,
            PromptEvent::Completed {
                dismissed: false,
                result,
                serial: self.next_serial(),
            },
        );
        Ok(())
    }

    async fn dismiss(&self, path: &str) -> Result<()> {
        bump(&self.counters.dismiss);
        let vanish = {
            let mut state = self.state();
            if state.prompts.remove(path).is_none() {
                return Err(Error::NoSuchObject);
            }
            state.vanish_on_dismiss
        };
        if vanish {
            self.vanish();
        }
        self.emit_prompt(
            path,
            PromptEvent::Completed {
                dismissed: true,
                result: PromptResult::String(String::new()),
                serial: self.next_serial(),
            },
        );
        Ok(())
    }

    async fn prompt_completions(&self, path: &str) -> Result<BoxStream<'static, PromptEvent>> {
        let path = path.to_string();
        Ok(subscribe(&self.prompts_tx)
            .filter_map(move |(p, event)| {
                let keep = (p == path).then_some(event);
                async move { keep }
            })
            .boxed())
    }

    async fn owner_vanished(&self) -> Result<BoxStream<'static, ()>> {
        Ok(subscribe(&self.vanish_tx))
    }

    async fn property_changes(&self, path: &str) -> Result<BoxStream<'static, PropertyChange>> {
        let path = path.to_string();
        Ok(subscribe(&self.props_tx)
            .filter(move |c| futures_util::future::ready(c.path == path))
            .boxed())
    }
}
