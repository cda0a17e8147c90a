//! Resource keys: single keys, key lists, and aliases.

use std::fmt::Debug;
use std::hash::Hash;

use harbor_core::{ConnectionKey, KeyError};

use super::alias::ResourceAlias;

/// A key type usable by [`KeyedCache`](super::KeyedCache).
///
/// Equality is the key type's own `Eq`, which for composite keys is
/// field-by-field. Two keys built from the same field values address the
/// same entry.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Reject malformed keys. Operations on a rejected key are no-ops.
    fn validate(&self) -> Result<(), KeyError> {
        Ok(())
    }
}

impl CacheKey for ConnectionKey {
    fn validate(&self) -> Result<(), KeyError> {
        ConnectionKey::validate(self)
    }
}

impl CacheKey for String {
    fn validate(&self) -> Result<(), KeyError> {
        if self.is_empty() {
            return Err(KeyError::Malformed {
                key: String::new(),
                reason: "key must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Addresses one or more cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey<K> {
    /// Exactly one entry.
    One(K),
    /// An ordered list of entries.
    List(Vec<K>),
    /// A named virtual key, resolved to a list at access time.
    Alias(ResourceAlias),
}

impl<K> ResourceKey<K> {
    pub fn one(key: K) -> Self {
        Self::One(key)
    }

    pub fn list(keys: impl IntoIterator<Item = K>) -> Self {
        Self::List(keys.into_iter().collect())
    }

    pub fn alias(alias: ResourceAlias) -> Self {
        Self::Alias(alias)
    }

    /// Every entry in the cache.
    pub fn all() -> Self {
        Self::Alias(ResourceAlias::all())
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, Self::Alias(_))
    }

    pub fn as_alias(&self) -> Option<&ResourceAlias> {
        match self {
            Self::Alias(alias) => Some(alias),
            _ => None,
        }
    }
}
