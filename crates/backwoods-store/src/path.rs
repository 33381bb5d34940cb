//! Slash-delimited storage paths that round-trip arbitrary bytes.
//!
//! Backend keys are byte strings rather than `String` so file names that are
//! not valid UTF-8 survive a store/list/restore cycle unchanged.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Path separator used by every backend.
pub const SEPARATOR: u8 = b'/';

/// A relative (or, for restore targets, absolute) slash-delimited path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StoragePath(Vec<u8>);

impl StoragePath {
    /// Wrap raw path bytes. A single trailing separator is dropped.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let mut bytes = bytes.into();
        while bytes.len() > 1 && bytes.last() == Some(&SEPARATOR) {
            bytes.pop();
        }
        Self(bytes)
    }

    /// Raw path bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True if the path is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if the first component is the root separator.
    pub fn is_absolute(&self) -> bool {
        self.0.first() == Some(&SEPARATOR)
    }

    /// Append `other`. Joining an absolute path returns it unchanged.
    pub fn join(&self, other: impl AsRef<[u8]>) -> Self {
        let other = other.as_ref();
        if other.first() == Some(&SEPARATOR) || self.0.is_empty() {
            return Self::new(other);
        }
        let mut joined = self.0.clone();
        if joined.last() != Some(&SEPARATOR) {
            joined.push(SEPARATOR);
        }
        joined.extend_from_slice(other);
        Self::new(joined)
    }

    /// Join an absolute path beneath this one (`/a`.join_relative(`/b`) is `/a/b`).
    pub fn join_relative(&self, other: &StoragePath) -> Self {
        match other.relative_from_root() {
            Some(relative) => self.join(relative.as_bytes()),
            None => self.join(other.as_bytes()),
        }
    }

    /// Strip the root separator from an absolute path.
    pub fn relative_from_root(&self) -> Option<Self> {
        if !self.is_absolute() {
            return None;
        }
        let start = self.0.iter().position(|b| *b != SEPARATOR).unwrap_or(self.0.len());
        Some(Self(self.0[start..].to_vec()))
    }

    /// Non-empty components between separators.
    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        self.0.split(|b| *b == SEPARATOR).filter(|c| !c.is_empty())
    }

    /// Last component, or an empty slice for an empty path.
    pub fn basename(&self) -> &[u8] {
        self.components().last().unwrap_or(&[])
    }

    /// Everything before the last component.
    pub fn parent(&self) -> Option<Self> {
        let idx = self.0.iter().rposition(|b| *b == SEPARATOR)?;
        if idx == 0 {
            return Some(Self(vec![SEPARATOR]));
        }
        Some(Self(self.0[..idx].to_vec()))
    }

    /// True if `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &StoragePath) -> bool {
        if prefix.is_empty() {
            return true;
        }
        self.0.starts_with(&prefix.0)
            && (self.0.len() == prefix.0.len() || self.0[prefix.0.len()] == SEPARATOR)
    }

    /// Number of components below `ancestor`, if `ancestor` is a prefix.
    pub fn depth_below(&self, ancestor: &StoragePath) -> Option<usize> {
        if !self.starts_with(ancestor) {
            return None;
        }
        Some(self.components().count() - ancestor.components().count())
    }

    /// The first `depth` components below `ancestor`, joined onto it.
    pub fn truncate_below(&self, ancestor: &StoragePath, depth: usize) -> Option<Self> {
        let skip = ancestor.components().count();
        let wanted: Vec<&[u8]> = self.components().skip(skip).take(depth).collect();
        if wanted.len() < depth || !self.starts_with(ancestor) {
            return None;
        }
        Some(wanted.into_iter().fold(ancestor.clone(), |acc, c| acc.join(c)))
    }

    /// Lossy UTF-8 rendering for logs.
    pub fn to_string_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<&str> for StoragePath {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<String> for StoragePath {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

impl AsRef<[u8]> for StoragePath {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lossy())
    }
}

impl fmt::Debug for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoragePath({:?})", self.to_string_lossy())
    }
}

// Stored pointers (block maps, key-wrapper targets) are JSON strings.
impl Serialize for StoragePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(s) => serializer.serialize_str(s),
            Err(_) => Err(serde::ser::Error::custom(format!(
                "storage path is not valid UTF-8: {}",
                self.to_string_lossy()
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for StoragePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(StoragePath::from(s))
    }
}
