//! Client engine for the freedesktop Secret Service.
//!
//! [`Service`] is the entry point.  It keeps one proxy per remote
//! collection or item, negotiates the transfer session once, and drives
//! prompts when the service asks the user for consent.  Every async
//! operation has a blocking `_sync` twin.

pub mod blocking;
pub mod collection;
pub mod dbus;
pub mod item;
pub mod methods;
pub mod password;
pub mod prompt;
pub mod registry;
pub mod service;
pub mod session;
pub mod transport;

mod watch;

#[cfg(test)]
mod mock;

pub use collection::Collection;
pub use dbus::DbusTransport;
pub use item::Item;
pub use methods::{SearchFlags, SecretObject};
pub use prompt::{ExpectedResult, Prompt, PromptOutcome, PromptState};
pub use service::{Service, ServiceFlags};
pub use session::{Session, SessionAlgorithm};
pub use transport::SecretTransport;

pub use lockbox_core::{
    AttributeValue, Attributes, Error, Result, Schema, SchemaAttributeType, SchemaFlags,
    SecretValue,
};
