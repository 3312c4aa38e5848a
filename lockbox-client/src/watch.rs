//! Serial-stamped property cache and the per-proxy change watcher.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::transport::{PropertyChange, Serial};

/// A cached property value and the serial of the message that set it.
///
/// Updates from messages older than the current stamp are dropped, so a
/// late notification never overwrites newer state.
#[derive(Debug, Clone)]
pub(crate) struct Cached<T> {
    value: T,
    serial: Serial,
}

impl<T> Cached<T> {
    pub(crate) fn new(value: T, serial: Serial) -> Self {
        Self { value, serial }
    }

    pub(crate) fn get(&self) -> &T {
        &self.value
    }

    /// Apply `value` if `serial` is not older than the current stamp.
    pub(crate) fn update(&mut self, value: T, serial: Serial) -> bool {
        if serial < self.serial {
            return false;
        }
        self.value = value;
        self.serial = serial;
        true
    }

    /// Record a change this client made itself.  Keeps the stamp, so any
    /// later notification from the service still applies.
    pub(crate) fn set_local(&mut self, value: T) {
        self.value = value;
    }
}

/// A proxy that follows `PropertiesChanged` for its object.
#[async_trait]
pub(crate) trait Watched: Send + Sync + 'static {
    fn watch_slot(&self) -> &Mutex<Option<DropGuard>>;

    async fn on_change(self: Arc<Self>, change: PropertyChange);
}

/// Consume `changes` on a background task for as long as `target` lives.
/// Does nothing outside a tokio runtime.
pub(crate) fn start<T: Watched>(target: &Arc<T>, mut changes: BoxStream<'static, PropertyChange>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("no runtime, property changes will not be followed");
        return;
    };
    let token = CancellationToken::new();
    let weak = Arc::downgrade(target);
    let cancelled = token.clone();
    handle.spawn(async move {
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                change = changes.next() => {
                    let Some(change) = change else { break };
                    let Some(target) = weak.upgrade() else { break };
                    target.on_change(change).await;
                }
            }
        }
    });
    *target
        .watch_slot()
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(token.drop_guard());
}
