//! Well-known bus names, object paths and interface names.

pub const SERVICE_BUS_NAME: &str = "org.freedesktop.secrets";
pub const SERVICE_PATH: &str = "/org/freedesktop/secrets";
pub const ALIAS_PREFIX: &str = "/org/freedesktop/secrets/aliases/";
pub const COLLECTION_PREFIX: &str = "/org/freedesktop/secrets/collection/";

pub const SERVICE_INTERFACE: &str = "org.freedesktop.Secret.Service";
pub const COLLECTION_INTERFACE: &str = "org.freedesktop.Secret.Collection";
pub const ITEM_INTERFACE: &str = "org.freedesktop.Secret.Item";
pub const PROMPT_INTERFACE: &str = "org.freedesktop.Secret.Prompt";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Alias of the collection used when the caller names none.
pub const DEFAULT_ALIAS: &str = "default";

/// The "no object" path used for empty prompt and item replies.
pub const NULL_PATH: &str = "/";

/// Path under which the service exposes the collection for `alias`.
pub fn alias_path(alias: &str) -> String {
    format!("{ALIAS_PREFIX}{alias}")
}

/// Accept either a bare alias (`default`) or an object path and return the
/// object path.
pub fn collection_path(alias_or_path: &str) -> String {
    if alias_or_path.starts_with('/') {
        alias_or_path.to_string()
    } else {
        alias_path(alias_or_path)
    }
}

/// `true` when `path` is the alias path for `alias`.
pub fn is_alias_path(path: &str, alias: &str) -> bool {
    path.strip_prefix(ALIAS_PREFIX) == Some(alias)
}

/// Treat `"/"` and `""` as "no object".
pub fn is_null(path: &str) -> bool {
    path.is_empty() || path == NULL_PATH
}

/// Parent collection path of an item path (`.../collection/login/42` →
/// `.../collection/login`).
pub fn parent_path(item_path: &str) -> Option<&str> {
    let (parent, leaf) = item_path.rsplit_once('/')?;
    if parent.is_empty() || leaf.is_empty() {
        return None;
    }
    Some(parent)
}
