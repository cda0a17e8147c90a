//! Harbor Storage - Keyed Resource Cache
//!
//! Client-side cache of remote entities addressed by composite keys.
//! Entries can be marked outdated without being dropped, loads are
//! deduplicated per key, and every mutation publishes a notification.

pub mod cache;

pub use cache::{
    AliasRegistry, CacheConfig, CacheEntity, CacheKey, CacheObserver, CacheStats, EntryMetadata,
    IncludeSet, Interrupter, JsonEntity, KeyedCache, ResourceAlias, ResourceEvent, ResourceKey,
    ResourceLoader, ResourceNotifier, ALL_KEYS_ALIAS,
};
