//! Fixed-capacity strings.
//!
//! Tag identifiers, timestamps and display text all live in
//! [`heapless::String`] storage so a reader never allocates per scan.
//! Construction truncates at the last character boundary that fits; it
//! never fails and never splits a UTF-8 sequence.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A string of at most `N` bytes.
#[derive(Clone)]
pub struct Bounded<const N: usize>(heapless::String<N>);

impl<const N: usize> Bounded<N> {
    /// Maximum length in bytes.
    pub const CAPACITY: usize = N;

    /// An empty string.
    #[must_use]
    pub const fn new() -> Self {
        Self(heapless::String::new())
    }

    /// Copy `s`, dropping whole characters from the end until it fits.
    #[must_use]
    pub fn truncated(s: &str) -> Self {
        let mut out = heapless::String::new();
        for c in s.chars() {
            if out.push(c).is_err() {
                break;
            }
        }
        Self(out)
    }

    /// Returns `true` if `s` fits without truncation.
    #[must_use]
    pub const fn fits(s: &str) -> bool {
        s.len() <= N
    }

    /// The stored text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the string is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> Default for Bounded<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> From<&str> for Bounded<N> {
    fn from(s: &str) -> Self {
        Self::truncated(s)
    }
}

impl<const N: usize> PartialEq for Bounded<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<const N: usize> Eq for Bounded<N> {}

impl<const N: usize> PartialEq<&str> for Bounded<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl<const N: usize> Hash for Bounded<N> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl<const N: usize> fmt::Debug for Bounded<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for Bounded<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> Serialize for Bounded<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de, const N: usize> Deserialize<'de> for Bounded<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::truncated(&s))
    }
}
