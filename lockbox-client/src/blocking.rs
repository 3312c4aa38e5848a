//! Synchronous wrappers.  Each runs the async operation to completion on the
//! calling thread.

use std::future::Future;
use std::sync::OnceLock;

use lockbox_core::{Attributes, Error, Result, Schema, SecretValue};
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};

use crate::collection::Collection;
use crate::item::Item;
use crate::methods::{SearchFlags, SecretObject};
use crate::service::{Service, ServiceFlags};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Runtime used by callers that have none.  It outlives every call so the
/// bus connection and the proxies' watch tasks keep running between calls.
fn runtime() -> Result<&'static Runtime> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("lockbox-rt")
        .enable_all()
        .build()
        .map_err(|e| Error::Transport(format!("failed to start runtime: {e}")))?;
    Ok(RUNTIME.get_or_init(|| rt))
}

/// Drive `fut` to completion, blocking the calling thread.
///
/// Inside a multi-threaded tokio runtime the worker is handed off with
/// `block_in_place`.  A current-thread runtime cannot be blocked and yields
/// an error.
pub fn block_on<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match Handle::try_current() {
        Ok(handle) => match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| handle.block_on(fut)),
            _ => Err(Error::Other(anyhow::anyhow!(
                "blocking calls are not supported inside a current-thread runtime"
            ))),
        },
        Err(_) => runtime()?.block_on(fut),
    }
}

impl Service {
    pub fn get_sync(flags: ServiceFlags) -> Result<Service> {
        block_on(Service::get(flags))
    }

    pub fn open_sync(flags: ServiceFlags) -> Result<Service> {
        block_on(Service::open(flags))
    }

    pub fn disconnect_sync() -> Result<()> {
        block_on(async {
            Service::disconnect().await;
            Ok(())
        })
    }

    pub fn ensure_session_sync(&self) -> Result<()> {
        block_on(self.ensure_session(None)).map(|_| ())
    }

    pub fn load_collections_sync(&self) -> Result<Vec<Collection>> {
        block_on(self.load_collections(None))
    }

    pub fn collection_for_alias_sync(&self, name: &str) -> Result<Option<Collection>> {
        block_on(self.collection_for_alias(name, None))
    }

    pub fn create_collection_sync(
        &self,
        label: &str,
        alias: Option<&str>,
    ) -> Result<Option<Collection>> {
        block_on(self.create_collection(label, alias, None))
    }

    pub fn store_sync(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
        collection: Option<&str>,
        label: &str,
        value: &SecretValue,
    ) -> Result<bool> {
        block_on(self.store(schema, attrs, collection, label, value, None))
    }

    pub fn lookup_sync(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
    ) -> Result<Option<SecretValue>> {
        block_on(self.lookup(schema, attrs, None))
    }

    pub fn clear_sync(&self, schema: Option<&Schema>, attrs: &Attributes) -> Result<usize> {
        block_on(self.clear(schema, attrs, None))
    }

    pub fn search_sync(
        &self,
        schema: Option<&Schema>,
        attrs: &Attributes,
        flags: SearchFlags,
    ) -> Result<Vec<Item>> {
        block_on(self.search(schema, attrs, flags, None))
    }

    pub fn lock_sync<O: SecretObject>(&self, objects: &[O]) -> Result<Vec<String>> {
        block_on(self.lock(objects, None))
    }

    pub fn unlock_sync<O: SecretObject>(&self, objects: &[O]) -> Result<Vec<String>> {
        block_on(self.unlock(objects, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockService;
    use lockbox_core::config::Config;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn works_without_a_runtime() {
        let mock = MockService::new();
        let login = mock.add_collection("login", "Login", true);
        mock.alias("default", &login);
        let service =
            block_on(Service::open_with(mock.clone(), Config::default(), ServiceFlags::NONE))
                .unwrap();

        let a = attrs(&[("app", "sync")]);
        assert!(service.store_sync(None, &a, None, "Sync", &SecretValue::new_text("s")).unwrap());
        let found = service.lookup_sync(None, &a).unwrap().unwrap();
        assert_eq!(found.text(), Some("s"));

        let locked = service.lock_sync(&[login.as_str()]).unwrap();
        assert_eq!(locked, vec![login.clone()]);
        let items = service.search_sync(None, &a, SearchFlags::ALL).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].locked());

        service.unlock_sync(&[login.as_str()]).unwrap();
        assert_eq!(service.clear_sync(None, &a).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn works_inside_a_multi_thread_runtime() {
        let mock = MockService::new();
        let login = mock.add_collection("login", "Login", false);
        mock.add_item(&login, "A", &[("app", "x")], "a");
        let service = Service::open_with(mock.clone(), Config::default(), ServiceFlags::NONE)
            .await
            .unwrap();

        let found = service.lookup_sync(None, &attrs(&[("app", "x")])).unwrap();
        assert_eq!(found.unwrap().text(), Some("a"));
    }

    #[tokio::test]
    async fn current_thread_runtime_is_refused() {
        let err = block_on(async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }
}
