// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session attributes.

use parley_common::Rev;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A key/value attribute. Once frozen with a non-empty value it can no longer
/// change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attr {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub is_frozen: bool,
}

impl Attr {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_frozen: false,
        }
    }

    pub fn frozen(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            is_frozen: true,
            ..Self::new(key, value)
        }
    }

    /// The value of a key that was never set.
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, "")
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_immutable(&self) -> bool {
        self.is_frozen && !self.value.is_empty()
    }

    /// Whether writing `next` over this attribute would leave it unchanged.
    pub fn is_same(&self, next: &Attr) -> bool {
        self.value == next.value && self.is_frozen == next.is_frozen
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_frozen, self.value.is_empty()) {
            (false, false) => write!(f, "{}={}", self.key, self.value),
            (true, false) => write!(f, "{}@{}", self.key, self.value),
            (false, true) => write!(f, "-{}", self.key),
            (true, true) => write!(f, "!{}", self.key),
        }
    }
}

/// An attribute with the revisions at which it was created and last changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrMeta {
    #[serde(flatten)]
    pub attr: Attr,
    pub created_at: Rev,
    pub updated_at: Rev,
}

impl AttrMeta {
    /// Metadata for a key that does not exist.
    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            attr: Attr::empty(key),
            created_at: 0,
            updated_at: 0,
        }
    }
}

impl fmt::Display for AttrMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}..{}]", self.attr, self.created_at, self.updated_at)
    }
}

/// Attributes of one namespace, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrTable(BTreeMap<String, Attr>);

impl AttrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The attribute for `key`; unset keys read as empty.
    pub fn get(&self, key: &str) -> Attr {
        self.0.get(key).cloned().unwrap_or_else(|| Attr::empty(key))
    }

    /// The value for `key`, empty if unset.
    pub fn value(&self, key: &str) -> &str {
        self.0.get(key).map(|a| a.value.as_str()).unwrap_or("")
    }

    pub fn insert(&mut self, attr: Attr) {
        self.0.insert(attr.key.clone(), attr);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.0.values()
    }
}

impl FromIterator<Attr> for AttrTable {
    fn from_iter<I: IntoIterator<Item = Attr>>(iter: I) -> Self {
        let mut table = Self::new();
        for attr in iter {
            table.insert(attr);
        }
        table
    }
}

impl IntoIterator for AttrTable {
    type Item = Attr;
    type IntoIter = std::collections::btree_map::IntoValues<String, Attr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

impl fmt::Display for AttrTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, attr) in self.0.values().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{attr}")?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub namespace: String,
    pub meta: AttrMeta,
    /// The key did not exist before this change.
    pub is_created: bool,
}

/// Attributes changed by a series of updates and clears, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff(Vec<DiffEntry>);

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, namespace: &str, meta: AttrMeta, is_created: bool) {
        self.0.push(DiffEntry {
            namespace: namespace.to_string(),
            meta,
            is_created,
        });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiffEntry> {
        self.0.iter()
    }
}

/// Renders as `{ns::+a=1, b@2}`: the namespace prefixes the first entry of
/// each run and `+` marks created keys.
impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let mut namespace: Option<&str> = None;
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if namespace != Some(entry.namespace.as_str()) {
                write!(f, "{}::", entry.namespace)?;
                namespace = Some(entry.namespace.as_str());
            }
            if entry.is_created {
                f.write_str("+")?;
            }
            write!(f, "{}", entry.meta.attr)?;
        }
        f.write_str("}")
    }
}
