//! Keyed resource cache.
//!
//! # Design
//!
//! A [`KeyedCache`] maps a composite key to one entity plus per-entry
//! metadata. Readers address entries with a [`ResourceKey`]: a single key,
//! an ordered key list, or a named [`ResourceAlias`] that is resolved against
//! the current contents on every access.
//!
//! Staleness is explicit. `mark_outdated` only flags entries; the stale
//! value stays readable until a later `load` replaces it. `load` deduplicates
//! concurrent fetches of the same key, so two callers asking for the same
//! entry at the same time share one loader invocation.
//!
//! # Example
//!
//! ```ignore
//! let cache = KeyedCache::<Connection, ConnectionMetadata>::new(loader, CacheConfig::default());
//! let connection = cache.load_one(&key, &IncludeSet::empty()).await?;
//! cache.mark_outdated(&ResourceKey::one(key.clone()));
//! assert!(cache.get(&key).is_some()); // still readable
//! ```

pub mod alias;
pub mod key;
pub mod keyed;
pub mod loader;
pub mod metadata;
pub mod notify;

pub use alias::{AliasRegistry, ResourceAlias, ALL_KEYS_ALIAS};
pub use key::{CacheKey, ResourceKey};
pub use keyed::{CacheConfig, CacheStats, KeyedCache};
pub use loader::{CacheEntity, CacheObserver, JsonEntity, ResourceLoader};
pub use metadata::{EntryMetadata, IncludeSet};
pub use notify::{Interrupter, ResourceEvent, ResourceNotifier};
