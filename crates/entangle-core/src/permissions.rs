//! Per-key read/write permission resolution.
//!
//! A [`PermissionTable`] is resolved once when an object is registered and
//! never recomputed. Keys that appear on the object later are resolved on
//! demand with the same rule, so the outcome only depends on the
//! [`ExposeOptions`] given at registration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::selection::KeySelection;

/// Explicit permission override for one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPermission {
    /// Key the override applies to.
    pub key: String,
    /// Defaults to `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readable: Option<bool>,
    /// Defaults to `readable`, then `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
}

impl KeyPermission {
    /// Override with both flags set explicitly.
    pub fn new(key: impl Into<String>, readable: bool, writable: bool) -> Self {
        Self {
            key: key.into(),
            readable: Some(readable),
            writable: Some(writable),
        }
    }
}

/// Exposure configuration supplied with a registration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExposeOptions {
    /// Pick/omit/readonly lists.
    #[serde(flatten)]
    pub selection: KeySelection,
    /// No key is writable by clients.
    pub client_readonly: bool,
    /// Per-key overrides.
    pub permissions: Vec<KeyPermission>,
}

impl ExposeOptions {
    /// Options with no restrictions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only expose `keys`.
    #[must_use]
    pub fn pick<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = self.selection.pick(keys);
        self
    }

    /// Never expose `keys`.
    #[must_use]
    pub fn omit<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = self.selection.omit(keys);
        self
    }

    /// Expose `keys` without letting clients write them.
    #[must_use]
    pub fn readonly<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = self.selection.readonly(keys);
        self
    }

    /// Forbid client writes on every key.
    #[must_use]
    pub fn client_readonly(mut self, value: bool) -> Self {
        self.client_readonly = value;
        self
    }

    /// Add a per-key override.
    #[must_use]
    pub fn permission(mut self, permission: KeyPermission) -> Self {
        self.permissions.push(permission);
        self
    }
}

/// Effective flags for one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Key may be sent to clients and called.
    pub readable: bool,
    /// Clients may write or delete the key.
    pub writable: bool,
}

impl Permission {
    /// Neither readable nor writable.
    pub const HIDDEN: Self = Self {
        readable: false,
        writable: false,
    };
}

/// Resolved permissions for one registered object.
#[derive(Clone, Debug, Default)]
pub struct PermissionTable {
    options: ExposeOptions,
    resolved: HashMap<String, Permission>,
}

impl PermissionTable {
    /// Resolve every key of `object_keys` plus every key the options mention.
    pub fn resolve<'a, I>(options: ExposeOptions, object_keys: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut resolved = HashMap::new();
        let mentioned = options
            .selection
            .mentioned_keys()
            .into_iter()
            .chain(options.permissions.iter().map(|p| p.key.as_str()))
            .map(str::to_owned)
            .collect::<Vec<_>>();
        for key in object_keys
            .into_iter()
            .map(str::to_owned)
            .chain(mentioned)
        {
            if resolved.contains_key(&key) {
                continue;
            }
            let permission = resolve_key(&options, &key);
            let _ = resolved.insert(key, permission);
        }
        Self { options, resolved }
    }

    /// Effective permission for `key`.
    pub fn get(&self, key: &str) -> Permission {
        self.resolved
            .get(key)
            .copied()
            .unwrap_or_else(|| resolve_key(&self.options, key))
    }

    /// Whether `key` may be sent to clients.
    pub fn is_readable(&self, key: &str) -> bool {
        self.get(key).readable
    }

    /// Whether clients may write `key`.
    pub fn is_writable(&self, key: &str) -> bool {
        self.get(key).writable
    }

    /// Options this table was resolved from.
    pub fn options(&self) -> &ExposeOptions {
        &self.options
    }
}

fn resolve_key(options: &ExposeOptions, key: &str) -> Permission {
    if !options.selection.is_exposed(key) {
        return Permission::HIDDEN;
    }
    let locked = options.client_readonly || options.selection.is_readonly(key);
    match options.permissions.iter().find(|p| p.key == key) {
        Some(explicit) => Permission {
            readable: explicit.readable.unwrap_or(true),
            writable: !locked && explicit.writable.or(explicit.readable).unwrap_or(true),
        },
        None => Permission {
            readable: true,
            writable: !locked,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(options: ExposeOptions, keys: &[&str]) -> PermissionTable {
        PermissionTable::resolve(options, keys.iter().copied())
    }

    #[test]
    fn unrestricted_keys_are_read_write() {
        let t = table(ExposeOptions::new(), &["count"]);
        assert_eq!(
            t.get("count"),
            Permission {
                readable: true,
                writable: true
            }
        );
    }

    #[test]
    fn omitted_key_is_hidden() {
        let t = table(ExposeOptions::new().omit(["adminKey"]), &["adminKey", "x"]);
        assert_eq!(t.get("adminKey"), Permission::HIDDEN);
        assert!(t.is_readable("x"));
    }

    #[test]
    fn key_missing_from_pick_list_is_hidden() {
        let t = table(ExposeOptions::new().pick(["a"]), &["a", "b"]);
        assert!(t.is_readable("a"));
        assert_eq!(t.get("b"), Permission::HIDDEN);
    }

    #[test]
    fn client_readonly_blocks_writes() {
        let t = table(ExposeOptions::new().client_readonly(true), &["a"]);
        assert!(t.is_readable("a"));
        assert!(!t.is_writable("a"));
    }

    #[test]
    fn readonly_list_blocks_writes() {
        let t = table(ExposeOptions::new().readonly(["a"]), &["a", "b"]);
        assert!(t.is_readable("a"));
        assert!(!t.is_writable("a"));
        assert!(t.is_writable("b"));
    }

    #[test]
    fn explicit_permission_defaults() {
        let opts = ExposeOptions::new().permission(KeyPermission {
            key: "a".into(),
            readable: None,
            writable: None,
        });
        assert_eq!(
            table(opts, &["a"]).get("a"),
            Permission {
                readable: true,
                writable: true
            }
        );
    }

    #[test]
    fn explicit_writable_falls_back_to_readable() {
        let opts = ExposeOptions::new().permission(KeyPermission {
            key: "a".into(),
            readable: Some(false),
            writable: None,
        });
        assert_eq!(table(opts, &["a"]).get("a"), Permission::HIDDEN);
    }

    #[test]
    fn explicit_write_forced_off_by_readonly_list() {
        let opts = ExposeOptions::new()
            .readonly(["a"])
            .permission(KeyPermission::new("a", true, true));
        assert!(!table(opts, &["a"]).is_writable("a"));
    }

    #[test]
    fn keys_added_later_use_the_same_rule() {
        let t = table(ExposeOptions::new().omit(["later"]), &[]);
        assert_eq!(t.get("later"), Permission::HIDDEN);
        assert!(t.is_writable("other"));
    }

    #[test]
    fn options_parse_from_json() {
        let opts: ExposeOptions = serde_json::from_str(
            r#"{"omittedKeys":["adminKey"],"clientReadonly":true,"permissions":[{"key":"x","readable":true}]}"#,
        )
        .unwrap();
        assert!(opts.client_readonly);
        assert!(!opts.selection.is_exposed("adminKey"));
        assert_eq!(opts.permissions.len(), 1);
    }

    proptest! {
        #[test]
        fn omitted_is_never_readable(
            key in "[a-z]{1,6}",
            readable in proptest::option::of(any::<bool>()),
            writable in proptest::option::of(any::<bool>()),
            client_readonly in any::<bool>(),
        ) {
            let opts = ExposeOptions::new()
                .omit([key.clone()])
                .client_readonly(client_readonly)
                .permission(KeyPermission { key: key.clone(), readable, writable });
            let t = PermissionTable::resolve(opts, [key.as_str()]);
            prop_assert_eq!(t.get(&key), Permission::HIDDEN);
        }

        #[test]
        fn client_readonly_means_nothing_writable(
            keys in proptest::collection::vec("[a-z]{1,4}", 1..8),
            overrides in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..8),
        ) {
            let mut opts = ExposeOptions::new().client_readonly(true);
            for (key, (r, w)) in keys.iter().zip(overrides) {
                opts = opts.permission(KeyPermission::new(key.clone(), r, w));
            }
            let t = PermissionTable::resolve(opts, keys.iter().map(String::as_str));
            for key in &keys {
                prop_assert!(!t.is_writable(key));
            }
        }
    }
}
