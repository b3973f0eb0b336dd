//! Key selection: pick/omit/readonly filtering over a key list.
//!
//! Used by the server when resolving permissions and by clients that want a
//! narrowed snapshot of a mirror. The rules are the same on both sides:
//! a key is exposed when it is in the picked list (if one is given) and not in
//! the omitted list.

use serde::{Deserialize, Serialize};

/// Pick/omit/readonly key lists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySelection {
    /// When set, only these keys are exposed.
    #[serde(rename = "pickedKeys", skip_serializing_if = "Option::is_none")]
    pub picked: Option<Vec<String>>,
    /// Keys that are never exposed.
    #[serde(rename = "omittedKeys", skip_serializing_if = "Option::is_none")]
    pub omitted: Option<Vec<String>>,
    /// Keys clients may read but never write.
    #[serde(rename = "readonlyKeys", skip_serializing_if = "Vec::is_empty")]
    pub readonly: Vec<String>,
}

impl KeySelection {
    /// Selection that exposes everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict exposure to `keys`.
    #[must_use]
    pub fn pick<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.picked
            .get_or_insert_with(Vec::new)
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Hide `keys`.
    #[must_use]
    pub fn omit<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.omitted
            .get_or_insert_with(Vec::new)
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Mark `keys` read-only.
    #[must_use]
    pub fn readonly<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.readonly.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Whether `key` passes the pick and omit lists.
    pub fn is_exposed(&self, key: &str) -> bool {
        if self
            .omitted
            .as_ref()
            .is_some_and(|o| o.iter().any(|k| k == key))
        {
            return false;
        }
        self.picked
            .as_ref()
            .is_none_or(|p| p.iter().any(|k| k == key))
    }

    /// Whether `key` is in the readonly list.
    pub fn is_readonly(&self, key: &str) -> bool {
        self.readonly.iter().any(|k| k == key)
    }

    /// Filter `keys` down to the exposed ones, preserving order.
    pub fn select<'a, I>(&self, keys: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter().filter(|k| self.is_exposed(k)).collect()
    }

    /// Every key any list mentions, in first-seen order.
    pub fn mentioned_keys(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let lists = self
            .picked
            .iter()
            .flatten()
            .chain(self.omitted.iter().flatten())
            .chain(self.readonly.iter());
        for key in lists {
            if !out.contains(&key.as_str()) {
                out.push(key);
            }
        }
        out
    }
}
