//! Password shortcuts on the process-wide default service.

use lockbox_core::{Attributes, Result, Schema, SecretValue};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::blocking::block_on;
use crate::item::Item;
use crate::methods::SearchFlags;
use crate::service::{Service, ServiceFlags};

async fn default_service() -> Result<Service> {
    Service::get(ServiceFlags::OPEN_SESSION).await
}

/// Store a textual password.  `collection` is an alias or object path;
/// `None` uses the default collection.
pub async fn store(
    schema: Option<&Schema>,
    attrs: &Attributes,
    collection: Option<&str>,
    label: &str,
    password: &str,
    cancel: Option<&CancellationToken>,
) -> Result<bool> {
    let service = default_service().await?;
    let value = SecretValue::new(
        password.as_bytes().to_vec(),
        service.config().store.content_type.clone(),
    );
    service
        .store(schema, attrs, collection, label, &value, cancel)
        .await
}

pub async fn store_binary(
    schema: Option<&Schema>,
    attrs: &Attributes,
    collection: Option<&str>,
    label: &str,
    value: &SecretValue,
    cancel: Option<&CancellationToken>,
) -> Result<bool> {
    default_service()
        .await?
        .store(schema, attrs, collection, label, value, cancel)
        .await
}

/// The matching password, or `None` if there is none or it is not text.
pub async fn lookup(
    schema: Option<&Schema>,
    attrs: &Attributes,
    cancel: Option<&CancellationToken>,
) -> Result<Option<Zeroizing<String>>> {
    Ok(lookup_binary(schema, attrs, cancel)
        .await?
        .and_then(SecretValue::into_password))
}

pub async fn lookup_binary(
    schema: Option<&Schema>,
    attrs: &Attributes,
    cancel: Option<&CancellationToken>,
) -> Result<Option<SecretValue>> {
    default_service().await?.lookup(schema, attrs, cancel).await
}

/// Remove matching unlocked passwords.  `true` if anything was removed.
pub async fn clear(
    schema: Option<&Schema>,
    attrs: &Attributes,
    cancel: Option<&CancellationToken>,
) -> Result<bool> {
    Ok(default_service().await?.clear(schema, attrs, cancel).await? > 0)
}

pub async fn search(
    schema: Option<&Schema>,
    attrs: &Attributes,
    flags: SearchFlags,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<Item>> {
    default_service()
        .await?
        .search(schema, attrs, flags, cancel)
        .await
}

pub fn store_sync(
    schema: Option<&Schema>,
    attrs: &Attributes,
    collection: Option<&str>,
    label: &str,
    password: &str,
) -> Result<bool> {
    block_on(store(schema, attrs, collection, label, password, None))
}

pub fn store_binary_sync(
    schema: Option<&Schema>,
    attrs: &Attributes,
    collection: Option<&str>,
    label: &str,
    value: &SecretValue,
) -> Result<bool> {
    block_on(store_binary(schema, attrs, collection, label, value, None))
}

pub fn lookup_sync(schema: Option<&Schema>, attrs: &Attributes) -> Result<Option<Zeroizing<String>>> {
    block_on(lookup(schema, attrs, None))
}

pub fn lookup_binary_sync(schema: Option<&Schema>, attrs: &Attributes) -> Result<Option<SecretValue>> {
    block_on(lookup_binary(schema, attrs, None))
}

pub fn clear_sync(schema: Option<&Schema>, attrs: &Attributes) -> Result<bool> {
    block_on(clear(schema, attrs, None))
}

pub fn search_sync(
    schema: Option<&Schema>,
    attrs: &Attributes,
    flags: SearchFlags,
) -> Result<Vec<Item>> {
    block_on(search(schema, attrs, flags, None))
}
