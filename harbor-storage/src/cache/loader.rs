//! Entity and loader traits.
//!
//! This module defines what a cached entity must provide and how the cache
//! fetches entities it does not hold yet.

use async_trait::async_trait;
use harbor_core::{Connection, ConnectionKey, LoadError};
use serde_json::{Map, Value as JsonValue};

use super::alias::ResourceAlias;
use super::key::CacheKey;
use super::metadata::IncludeSet;

/// A value that can live in a [`KeyedCache`](super::KeyedCache).
///
/// # Implementation Requirements
///
/// - `key()` must be stable for the lifetime of the entity
/// - `merge()` overlays `incoming` on `previous`; the cache never replaces a
///   value blindly
/// - `closed_transition()` reports domain flips that get a dedicated
///   [`ResourceEvent::Closed`](super::ResourceEvent::Closed) notification
pub trait CacheEntity: Clone + Send + Sync + 'static {
    type Key: CacheKey;

    fn key(&self) -> Self::Key;

    fn merge(previous: Option<&Self>, incoming: Self) -> Self;

    fn closed_transition(previous: &Self, next: &Self) -> bool {
        let _ = (previous, next);
        false
    }

    /// Include groups present on this value.
    fn includes(&self) -> IncludeSet {
        IncludeSet::empty()
    }
}

impl CacheEntity for Connection {
    type Key = ConnectionKey;

    fn key(&self) -> ConnectionKey {
        Connection::key(self)
    }

    fn merge(previous: Option<&Self>, incoming: Self) -> Self {
        Connection::merge(previous, incoming)
    }

    fn closed_transition(previous: &Self, next: &Self) -> bool {
        previous.connected && !next.connected
    }

    fn includes(&self) -> IncludeSet {
        self.loaded_includes()
            .into_iter()
            .map(|include| include.variable())
            .collect()
    }
}

/// Untyped JSON object keyed by its `"id"` field. Merges field by field.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonEntity(pub Map<String, JsonValue>);

impl JsonEntity {
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }
}

impl CacheEntity for JsonEntity {
    type Key = String;

    fn key(&self) -> String {
        match self.0.get("id") {
            Some(JsonValue::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    fn merge(previous: Option<&Self>, incoming: Self) -> Self {
        let mut merged = previous.map(|p| p.0.clone()).unwrap_or_default();
        merged.extend(incoming.0);
        Self(merged)
    }
}

/// Fetches entities on behalf of the cache.
#[async_trait]
pub trait ResourceLoader<V: CacheEntity>: Send + Sync + 'static {
    /// Fetch one entity with the given include groups.
    async fn load_key(&self, key: &V::Key, includes: &IncludeSet) -> Result<V, LoadError>;

    /// Fetch the collection an alias stands for. Keys the alias resolved to
    /// before the fetch but missing from the result are removed from the cache.
    async fn load_alias(
        &self,
        alias: &ResourceAlias,
        includes: &IncludeSet,
    ) -> Result<Vec<V>, LoadError> {
        let _ = includes;
        Err(LoadError::UnsupportedAlias(alias.to_string()))
    }
}

/// Synchronous hooks run inside cache mutations, for secondary indices.
pub trait CacheObserver<V: CacheEntity>: Send + Sync {
    fn on_set(&self, key: &V::Key, value: &V) {
        let _ = (key, value);
    }

    fn on_delete(&self, key: &V::Key, previous: Option<&V>) {
        let _ = (key, previous);
    }

    fn on_clear(&self) {}

    /// A key or alias load finished and its result is fully applied,
    /// including removal of keys the alias no longer returns.
    fn on_loaded(&self) {}
}
