//! Path-keyed table of live proxy handles.
//!
//! Every code path that is about to materialize a proxy for a remote path
//! goes through [`ObjectRegistry::insert_or_get`], so a path never has two
//! live proxies.  The table itself is an `Arc<HashMap>` swapped
//! copy-on-write: readers take a snapshot and never block a bulk
//! replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Whether the registry keeps its entries alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Entries are owned: they live until removed or replaced.
    Owned,
    /// Entries are weak: they disappear when the last caller reference drops.
    Tracked,
}

enum Entry<T> {
    Owned(Arc<T>),
    Tracked(Weak<T>),
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Owned(a) => Self::Owned(Arc::clone(a)),
            Self::Tracked(w) => Self::Tracked(Weak::clone(w)),
        }
    }
}

impl<T> Entry<T> {
    fn new(retention: Retention, value: &Arc<T>) -> Self {
        match retention {
            Retention::Owned => Self::Owned(Arc::clone(value)),
            Retention::Tracked => Self::Tracked(Arc::downgrade(value)),
        }
    }

    fn get(&self) -> Option<Arc<T>> {
        match self {
            Self::Owned(a) => Some(Arc::clone(a)),
            Self::Tracked(w) => w.upgrade(),
        }
    }
}

pub struct ObjectRegistry<T> {
    retention: Retention,
    table: Mutex<Arc<HashMap<String, Entry<T>>>>,
}

impl<T> ObjectRegistry<T> {
    pub fn new(retention: Retention) -> Self {
        Self {
            retention,
            table: Mutex::new(Arc::new(HashMap::new())),
        }
    }

    fn snapshot(&self) -> Arc<HashMap<String, Entry<T>>> {
        Arc::clone(&self.table.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// The live handle for `path`, if any.
    pub fn find(&self, path: &str) -> Option<Arc<T>> {
        self.snapshot().get(path).and_then(Entry::get)
    }

    /// Return the live handle for `path`, constructing and registering one
    /// with `make` if there is none.  `make` runs under the registry lock,
    /// so of two racing callers exactly one constructs.
    pub fn insert_or_get(&self, path: &str, make: impl FnOnce() -> Arc<T>) -> Arc<T> {
        let mut guard = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = guard.get(path).and_then(Entry::get) {
            return existing;
        }
        let value = make();
        let table = Arc::make_mut(&mut *guard);
        if self.retention == Retention::Tracked {
            table.retain(|_, e| e.get().is_some());
        }
        table.insert(path.to_string(), Entry::new(self.retention, &value));
        value
    }

    /// Install `entries` as the whole table.  The most recent call wins;
    /// handles already given out stay valid.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (String, Arc<T>)>) {
        let table: HashMap<String, Entry<T>> = entries
            .into_iter()
            .map(|(path, value)| {
                let entry = Entry::new(self.retention, &value);
                (path, entry)
            })
            .collect();
        *self.table.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
    }

    pub fn remove(&self, path: &str) -> Option<Arc<T>> {
        let mut guard = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(path) {
            return None;
        }
        Arc::make_mut(&mut *guard).remove(path).and_then(|e| e.get())
    }

    /// Live handles, in no particular order.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.snapshot().values().filter_map(Entry::get).collect()
    }

    /// Paths with a live handle.
    pub fn paths(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|(_, e)| e.get().is_some())
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().values().filter(|e| e.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
