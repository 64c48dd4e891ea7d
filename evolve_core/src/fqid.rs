//! Fully qualified ids.
//!
//! An FQID is the primary key of a model instance: `{collection}/{id}` where the collection is
//! an ASCII identifier and the id a positive integer.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Separator between collection and id.
pub const KEYSEPARATOR: char = '/';

/// A fully qualified id, `collection/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fqid {
    collection: String,
    id: u64,
}

/// The string could not be parsed as an FQID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bad fqid {input:?}: {reason}")]
pub struct BadFqid {
    /// The rejected input.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl Fqid {
    /// Builds an FQID from its parts, validating the collection name and id.
    pub fn new(collection: impl Into<String>, id: u64) -> Result<Self, BadFqid> {
        let collection = collection.into();
        if id == 0 {
            return Err(BadFqid {
                input: format!("{collection}{KEYSEPARATOR}{id}"),
                reason: "id must be positive",
            });
        }
        if !is_collection_name(&collection) {
            return Err(BadFqid {
                input: format!("{collection}{KEYSEPARATOR}{id}"),
                reason: "collection must be an ASCII identifier",
            });
        }
        Ok(Self { collection, id })
    }

    /// The collection part.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The numeric id part.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` when this FQID belongs to `collection`.
    pub fn is_in(&self, collection: &str) -> bool {
        self.collection == collection
    }
}

/// `true` for non-empty ASCII identifiers (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_collection_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for Fqid {
    type Err = BadFqid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason| BadFqid {
            input: s.to_string(),
            reason,
        };
        let mut parts = s.split(KEYSEPARATOR);
        let (collection, id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(collection), Some(id), None) => (collection, id),
            _ => return Err(bad("expected exactly one separator")),
        };
        if collection.is_empty() || id.is_empty() {
            return Err(bad("empty collection or id"));
        }
        if !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad("id is not an integer"));
        }
        let id: u64 = id.parse().map_err(|_| bad("id out of range"))?;
        Fqid::new(collection, id).map_err(|e| bad(e.reason))
    }
}

impl fmt::Display for Fqid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.collection, KEYSEPARATOR, self.id)
    }
}

impl Serialize for Fqid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fqid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Test shorthand for literal fqids.
#[cfg(test)]
pub(crate) fn fqid(collection: &str, id: u64) -> Fqid {
    Fqid::new(collection, id).unwrap()
}
