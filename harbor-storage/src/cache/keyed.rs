//! Keyed cache with single-flight loads and explicit staleness.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::mapref::entry::Entry as InflightEntry;
use dashmap::DashMap;
use futures_util::future::{try_join_all, BoxFuture, FutureExt, Shared};
use harbor_core::LoadError;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::alias::{AliasRegistry, ResourceAlias};
use super::key::{CacheKey, ResourceKey};
use super::loader::{CacheEntity, CacheObserver, ResourceLoader};
use super::metadata::{EntryMetadata, IncludeSet};
use super::notify::{ResourceEvent, ResourceNotifier};

/// Configuration for a keyed cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of the notification channel per subscriber.
    pub notify_capacity: usize,
    /// How many times a caller re-joins in-flight loads before giving up on
    /// getting a value that satisfies its include groups.
    pub max_load_rounds: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            notify_capacity: 256,
            max_load_rounds: 3,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity;
        self
    }

    pub fn with_max_load_rounds(mut self, rounds: usize) -> Self {
        self.max_load_rounds = rounds.max(1);
        self
    }
}

/// Counters for cache behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Loads served from fresh entries.
    pub hits: u64,
    /// Loads that started a fetch.
    pub misses: u64,
    /// Loads that joined a fetch already in flight.
    pub joined: u64,
    /// Entries currently holding a value.
    pub entries: usize,
}

type SharedLoad = Shared<BoxFuture<'static, Result<(), LoadError>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum InflightKey<K> {
    Key(K),
    Alias(ResourceAlias),
}

struct Entry<V, X> {
    value: Option<V>,
    meta: EntryMetadata<X>,
}

impl<V, X: Default> Default for Entry<V, X> {
    fn default() -> Self {
        Self {
            value: None,
            meta: EntryMetadata::default(),
        }
    }
}

struct Inner<V: CacheEntity, X> {
    data: RwLock<HashMap<V::Key, Entry<V, X>>>,
    alias_state: RwLock<HashMap<ResourceAlias, EntryMetadata<()>>>,
    aliases: AliasRegistry<V::Key>,
    loader: Arc<dyn ResourceLoader<V>>,
    inflight: DashMap<InflightKey<V::Key>, SharedLoad>,
    notifier: ResourceNotifier<V::Key>,
    observers: RwLock<Vec<Arc<dyn CacheObserver<V>>>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
}

/// Client-side cache of remote entities addressed by composite keys.
///
/// Cloning is cheap; clones share the same state.
///
/// # Type Parameters
///
/// - `V`: the cached entity, keyed by `V::Key`
/// - `X`: extension fields stored in every entry's metadata
pub struct KeyedCache<V: CacheEntity, X = ()> {
    inner: Arc<Inner<V, X>>,
}

impl<V: CacheEntity, X> Clone for KeyedCache<V, X> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, X> KeyedCache<V, X>
where
    V: CacheEntity,
    X: Clone + Default + Send + Sync + 'static,
{
    pub fn new(loader: Arc<dyn ResourceLoader<V>>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(HashMap::new()),
                alias_state: RwLock::new(HashMap::new()),
                aliases: AliasRegistry::new(),
                loader,
                inflight: DashMap::new(),
                notifier: ResourceNotifier::new(config.notify_capacity),
                observers: RwLock::new(Vec::new()),
                config,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                joined: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_defaults(loader: Arc<dyn ResourceLoader<V>>) -> Self {
        Self::new(loader, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Alias resolvers understood by this cache.
    pub fn aliases(&self) -> &AliasRegistry<V::Key> {
        &self.inner.aliases
    }

    pub fn is_key_equal(&self, a: &V::Key, b: &V::Key) -> bool {
        a == b
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get(&self, key: &V::Key) -> Option<V> {
        self.inner
            .read_data()
            .get(key)
            .and_then(|entry| entry.value.clone())
    }

    /// Values present for `key`, in resolution order. Missing keys are skipped.
    pub fn get_many(&self, key: &ResourceKey<V::Key>) -> Vec<V> {
        let keys = self.resolve(key);
        let data = self.inner.read_data();
        keys.iter()
            .filter_map(|key| data.get(key).and_then(|entry| entry.value.clone()))
            .collect()
    }

    pub fn has(&self, key: &V::Key) -> bool {
        self.inner
            .read_data()
            .get(key)
            .map(|entry| entry.value.is_some())
            .unwrap_or(false)
    }

    /// Keys that currently hold a value.
    pub fn keys(&self) -> Vec<V::Key> {
        self.inner.present_keys()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner
            .read_data()
            .values()
            .filter_map(|entry| entry.value.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read_data()
            .values()
            .filter(|entry| entry.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concrete keys addressed by `key`. Aliases are resolved against the
    /// current contents every time.
    pub fn resolve(&self, key: &ResourceKey<V::Key>) -> Vec<V::Key> {
        self.inner.resolve(key)
    }

    // ========================================================================
    // LOADS
    // ========================================================================

    /// Return the values for `key`, fetching entries that are missing,
    /// outdated, or lack some of the `includes` groups.
    pub async fn load(
        &self,
        key: &ResourceKey<V::Key>,
        includes: &IncludeSet,
    ) -> Result<Vec<V>, LoadError> {
        match key {
            ResourceKey::One(key) => Ok(vec![self.load_one(key, includes).await?]),
            ResourceKey::List(keys) => {
                try_join_all(keys.iter().map(|key| self.load_one(key, includes))).await
            }
            ResourceKey::Alias(alias) => self.load_alias(alias, includes).await,
        }
    }

    /// Load a single entry. Concurrent calls for the same key share one
    /// fetch; a fetch keeps running even if every caller goes away.
    pub async fn load_one(&self, key: &V::Key, includes: &IncludeSet) -> Result<V, LoadError> {
        if let Err(err) = key.validate() {
            warn!(key = ?key, error = %err, "Refusing to load malformed key");
            return Err(err.into());
        }

        for _ in 0..self.inner.config.max_load_rounds {
            if let Some(value) = self.inner.fresh_value(key, includes) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = ?key, "Cache hit");
                return Ok(value);
            }
            let (load, started) = self.join_or_start_key(key, includes);
            load.await?;
            if started {
                break;
            }
        }

        self.get(key)
            .ok_or_else(|| LoadError::NotFound(format!("Resource is not found ({key:?})")))
    }

    /// Mark `key` outdated and load it again.
    pub async fn refresh(
        &self,
        key: &ResourceKey<V::Key>,
        includes: &IncludeSet,
    ) -> Result<Vec<V>, LoadError> {
        self.mark_outdated(key);
        self.load(key, includes).await
    }

    async fn load_alias(
        &self,
        alias: &ResourceAlias,
        includes: &IncludeSet,
    ) -> Result<Vec<V>, LoadError> {
        let key = ResourceKey::Alias(alias.clone());
        for _ in 0..self.inner.config.max_load_rounds {
            if self.inner.alias_fresh(alias, includes) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.get_many(&key));
            }
            let (load, started) = self.join_or_start_alias(alias, includes);
            load.await?;
            if started {
                break;
            }
        }
        Ok(self.get_many(&key))
    }

    fn join_or_start_key(&self, key: &V::Key, requested: &IncludeSet) -> (SharedLoad, bool) {
        let inflight_key = InflightKey::Key(key.clone());
        let load = match self.inner.inflight.entry(inflight_key.clone()) {
            InflightEntry::Occupied(occupied) => {
                self.inner.joined.fetch_add(1, Ordering::Relaxed);
                return (occupied.get().clone(), false);
            }
            InflightEntry::Vacant(vacant) => {
                let fetch = self.inner.begin_key_load(key, requested);
                let inner = Arc::clone(&self.inner);
                let key = key.clone();
                let load = async move {
                    debug!(key = ?key, includes = ?fetch, "Loading resource");
                    let result = inner.loader.load_key(&key, &fetch).await;
                    let outcome = inner.finish_key_load(&key, &fetch, result);
                    inner.inflight.remove(&inflight_key);
                    outcome
                }
                .boxed()
                .shared();
                vacant.insert(load.clone());
                load
            }
        };
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        drive(load.clone());
        (load, true)
    }

    fn join_or_start_alias(&self, alias: &ResourceAlias, requested: &IncludeSet) -> (SharedLoad, bool) {
        let inflight_key = InflightKey::Alias(alias.clone());
        let load = match self.inner.inflight.entry(inflight_key.clone()) {
            InflightEntry::Occupied(occupied) => {
                self.inner.joined.fetch_add(1, Ordering::Relaxed);
                return (occupied.get().clone(), false);
            }
            InflightEntry::Vacant(vacant) => {
                let fetch = self.inner.begin_alias_load(alias, requested);
                let inner = Arc::clone(&self.inner);
                let alias = alias.clone();
                let load = async move {
                    debug!(alias = %alias, includes = ?fetch, "Loading resource alias");
                    let previous = inner.resolve(&ResourceKey::Alias(alias.clone()));
                    let result = inner.loader.load_alias(&alias, &fetch).await;
                    let outcome = inner.finish_alias_load(&alias, &fetch, previous, result);
                    inner.inflight.remove(&inflight_key);
                    outcome
                }
                .boxed()
                .shared();
                vacant.insert(load.clone());
                load
            }
        };
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        drive(load.clone());
        (load, true)
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Merge `value` into its entry and mark it loaded. Returns `None` when
    /// the value's key is malformed.
    pub fn set(&self, value: V) -> Option<V> {
        self.set_many(vec![value]).pop()
    }

    /// Merge every value into its entry. Returns the merged values.
    pub fn set_many(&self, values: Vec<V>) -> Vec<V> {
        self.inner.store(values, &IncludeSet::empty())
    }

    /// Apply `update` to the current value in place and publish an update.
    /// Does nothing when the key holds no value.
    pub fn modify<F>(&self, key: &V::Key, update: F) -> Option<V>
    where
        F: FnOnce(&mut V),
    {
        let updated = {
            let mut data = self.inner.write_data();
            let value = data.get_mut(key)?.value.as_mut()?;
            update(value);
            value.clone()
        };
        self.inner.notify_set(&[(key.clone(), updated.clone())]);
        self.inner.notifier.publish(ResourceEvent::Updated(key.clone()));
        Some(updated)
    }

    /// Remove the addressed entries. Returns the keys that held a value.
    pub fn delete(&self, key: &ResourceKey<V::Key>) -> Vec<V::Key> {
        let keys = self.inner.valid_keys(self.resolve(key));
        self.inner.remove_keys(&keys)
    }

    /// Flag the addressed entries as stale. Values stay readable.
    pub fn mark_outdated(&self, key: &ResourceKey<V::Key>) {
        if let ResourceKey::Alias(alias) = key {
            self.inner
                .write_alias_state()
                .entry(alias.clone())
                .or_default()
                .outdated = true;
        }

        let keys = self.inner.valid_keys(self.resolve(key));
        let mut marked = Vec::with_capacity(keys.len());
        {
            let mut data = self.inner.write_data();
            for key in keys {
                if let Some(entry) = data.get_mut(&key) {
                    entry.meta.outdated = true;
                    marked.push(key);
                }
            }
        }
        for key in marked {
            self.inner.notifier.publish(ResourceEvent::Outdated(key));
        }
    }

    /// Flag every entry and alias as stale.
    pub fn mark_all_outdated(&self) {
        for entry in self.inner.write_data().values_mut() {
            entry.meta.outdated = true;
        }
        for state in self.inner.write_alias_state().values_mut() {
            state.outdated = true;
        }
        self.inner.notifier.publish(ResourceEvent::AllOutdated);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.write_data().clear();
        self.inner.write_alias_state().clear();
        for observer in self.inner.observers() {
            observer.on_clear();
        }
        self.inner.notifier.publish(ResourceEvent::Cleared);
    }

    // ========================================================================
    // METADATA
    // ========================================================================

    /// Metadata for `key`, or defaults when the key is unknown.
    pub fn metadata(&self, key: &V::Key) -> EntryMetadata<X> {
        self.inner
            .read_data()
            .get(key)
            .map(|entry| entry.meta.clone())
            .unwrap_or_default()
    }

    pub fn update_metadata<F>(&self, key: &V::Key, update: F)
    where
        F: FnOnce(&mut EntryMetadata<X>),
    {
        if key.validate().is_err() {
            return;
        }
        update(&mut self.inner.write_data().entry(key.clone()).or_default().meta);
    }

    pub fn is_outdated(&self, key: &ResourceKey<V::Key>) -> bool {
        if let ResourceKey::Alias(alias) = key {
            let alias_outdated = self
                .inner
                .read_alias_state()
                .get(alias)
                .map(|state| state.outdated)
                .unwrap_or(false);
            if alias_outdated {
                return true;
            }
        }
        let keys = self.resolve(key);
        let data = self.inner.read_data();
        keys.iter()
            .any(|key| data.get(key).map(|entry| entry.meta.outdated).unwrap_or(false))
    }

    pub fn is_loaded(&self, key: &V::Key) -> bool {
        self.inner
            .read_data()
            .get(key)
            .map(|entry| entry.meta.loaded)
            .unwrap_or(false)
    }

    pub fn is_loading(&self, key: &V::Key) -> bool {
        self.inner
            .inflight
            .contains_key(&InflightKey::Key(key.clone()))
            || self
                .inner
                .read_data()
                .get(key)
                .map(|entry| entry.meta.loading)
                .unwrap_or(false)
    }

    /// Run a remote mutation for `key`, flagging the entry as loading for the
    /// duration and recording a failure in its metadata.
    pub async fn perform_update<T, Fut>(&self, key: &V::Key, update: Fut) -> Result<T, LoadError>
    where
        Fut: Future<Output = Result<T, LoadError>>,
    {
        self.update_metadata(key, |meta| meta.loading = true);
        let result = update.await;
        self.update_metadata(key, |meta| {
            meta.loading = false;
            meta.exception = result.as_ref().err().cloned();
        });
        result
    }

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent<V::Key>> {
        self.inner.notifier.subscribe()
    }

    /// Publish `event` without touching any entry, e.g. to tell dependents
    /// that data derived from a key changed on the server.
    pub fn notify(&self, event: ResourceEvent<V::Key>) -> bool {
        self.inner.notifier.publish(event)
    }

    /// Suppress notifications for which `interrupter` returns `true`.
    pub fn add_interrupter<F>(&self, interrupter: F)
    where
        F: Fn(&ResourceEvent<V::Key>) -> bool + Send + Sync + 'static,
    {
        self.inner.notifier.add_interrupter(interrupter);
    }

    pub fn add_observer(&self, observer: Arc<dyn CacheObserver<V>>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            joined: self.inner.joined.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<V, X> Inner<V, X>
where
    V: CacheEntity,
    X: Clone + Default + Send + Sync + 'static,
{
    fn read_data(&self) -> RwLockReadGuard<'_, HashMap<V::Key, Entry<V, X>>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_data(&self) -> RwLockWriteGuard<'_, HashMap<V::Key, Entry<V, X>>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_alias_state(&self) -> RwLockReadGuard<'_, HashMap<ResourceAlias, EntryMetadata<()>>> {
        self.alias_state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_alias_state(&self) -> RwLockWriteGuard<'_, HashMap<ResourceAlias, EntryMetadata<()>>> {
        self.alias_state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> Vec<Arc<dyn CacheObserver<V>>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn present_keys(&self) -> Vec<V::Key> {
        self.read_data()
            .iter()
            .filter(|(_, entry)| entry.value.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn resolve(&self, key: &ResourceKey<V::Key>) -> Vec<V::Key> {
        match key {
            ResourceKey::One(key) => vec![key.clone()],
            ResourceKey::List(keys) => keys.clone(),
            ResourceKey::Alias(alias) => self.aliases.resolve(alias, &self.present_keys()),
        }
    }

    fn valid_keys(&self, keys: Vec<V::Key>) -> Vec<V::Key> {
        keys.into_iter()
            .filter(|key| match key.validate() {
                Ok(()) => true,
                Err(err) => {
                    warn!(key = ?key, error = %err, "Ignoring malformed key");
                    false
                }
            })
            .collect()
    }

    fn fresh_value(&self, key: &V::Key, includes: &IncludeSet) -> Option<V> {
        let data = self.read_data();
        let entry = data.get(key)?;
        if entry.meta.satisfies(includes) {
            entry.value.clone()
        } else {
            None
        }
    }

    fn alias_fresh(&self, alias: &ResourceAlias, includes: &IncludeSet) -> bool {
        let state_fresh = self
            .read_alias_state()
            .get(alias)
            .map(|state| state.satisfies(includes))
            .unwrap_or(false);
        if !state_fresh {
            return false;
        }
        let keys = self.resolve(&ResourceKey::Alias(alias.clone()));
        let data = self.read_data();
        keys.iter()
            .all(|key| data.get(key).map(|entry| !entry.meta.outdated).unwrap_or(false))
    }

    /// Flag the entry as loading and work out which include groups to fetch.
    fn begin_key_load(&self, key: &V::Key, requested: &IncludeSet) -> IncludeSet {
        let mut data = self.write_data();
        let entry = data.entry(key.clone()).or_default();
        entry.meta.loading = true;
        entry.meta.includes_to_fetch(requested)
    }

    fn begin_alias_load(&self, alias: &ResourceAlias, requested: &IncludeSet) -> IncludeSet {
        let mut states = self.write_alias_state();
        let state = states.entry(alias.clone()).or_default();
        state.loading = true;
        state.includes_to_fetch(requested)
    }

    fn finish_key_load(
        &self,
        key: &V::Key,
        fetched: &IncludeSet,
        result: Result<V, LoadError>,
    ) -> Result<(), LoadError> {
        match result {
            Ok(value) => {
                self.store(vec![value], fetched);
                if let Some(entry) = self.write_data().get_mut(key) {
                    entry.meta.loading = false;
                    entry.meta.exception = None;
                }
                self.notify_loaded();
                Ok(())
            }
            Err(err) => {
                warn!(key = ?key, error = %err, "Resource load failed");
                if let Some(entry) = self.write_data().get_mut(key) {
                    entry.meta.loading = false;
                    entry.meta.exception = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    fn finish_alias_load(
        &self,
        alias: &ResourceAlias,
        fetched: &IncludeSet,
        previous: Vec<V::Key>,
        result: Result<Vec<V>, LoadError>,
    ) -> Result<(), LoadError> {
        let values = match result {
            Ok(values) => values,
            Err(err) => {
                warn!(alias = %alias, error = %err, "Resource alias load failed");
                if let Some(state) = self.write_alias_state().get_mut(alias) {
                    state.loading = false;
                    state.exception = Some(err.clone());
                }
                return Err(err);
            }
        };

        let stored = self.store(values, fetched);
        let present: HashSet<V::Key> = stored.iter().map(|value| value.key()).collect();
        let stale: Vec<V::Key> = previous
            .into_iter()
            .filter(|key| !present.contains(key))
            .collect();
        if !stale.is_empty() {
            debug!(alias = %alias, removed = stale.len(), "Dropping keys missing from alias result");
            self.remove_keys(&stale);
        }

        let mut states = self.write_alias_state();
        let state = states.entry(alias.clone()).or_default();
        state.loading = false;
        state.loaded = true;
        state.outdated = false;
        state.exception = None;
        state.includes.extend(fetched);
        drop(states);
        self.notify_loaded();
        Ok(())
    }

    fn store(&self, values: Vec<V>, fetched: &IncludeSet) -> Vec<V> {
        let mut stored = Vec::with_capacity(values.len());
        let mut events = Vec::with_capacity(values.len());
        {
            let mut data = self.write_data();
            for incoming in values {
                let key = incoming.key();
                if let Err(err) = key.validate() {
                    warn!(key = ?key, error = %err, "Skipping value with malformed key");
                    continue;
                }
                let entry = data.entry(key.clone()).or_default();
                let merged = V::merge(entry.value.as_ref(), incoming);
                let closed = entry
                    .value
                    .as_ref()
                    .map(|previous| V::closed_transition(previous, &merged))
                    .unwrap_or(false);

                let includes = entry.meta.includes.union(&merged.includes()).union(fetched);
                entry.meta.includes = includes;
                entry.meta.loaded = true;
                entry.meta.outdated = false;
                entry.meta.exception = None;
                entry.value = Some(merged.clone());

                events.push(ResourceEvent::Updated(key.clone()));
                if closed {
                    events.push(ResourceEvent::Closed(key.clone()));
                }
                stored.push((key, merged));
            }
        }

        self.notify_set(&stored);
        for event in events {
            self.notifier.publish(event);
        }
        stored.into_iter().map(|(_, value)| value).collect()
    }

    fn notify_set(&self, stored: &[(V::Key, V)]) {
        let observers = self.observers();
        if observers.is_empty() {
            return;
        }
        for (key, value) in stored {
            for observer in &observers {
                observer.on_set(key, value);
            }
        }
    }

    fn notify_loaded(&self) {
        for observer in self.observers() {
            observer.on_loaded();
        }
    }

    fn remove_keys(&self, keys: &[V::Key]) -> Vec<V::Key> {
        let mut removed = Vec::with_capacity(keys.len());
        {
            let mut data = self.write_data();
            for key in keys {
                if let Some(entry) = data.remove(key) {
                    if let Some(value) = entry.value {
                        removed.push((key.clone(), value));
                    }
                }
            }
        }

        let observers = self.observers();
        for (key, value) in &removed {
            for observer in &observers {
                observer.on_delete(key, Some(value));
            }
        }
        removed
            .into_iter()
            .map(|(key, _)| {
                self.notifier.publish(ResourceEvent::Deleted(key.clone()));
                key
            })
            .collect()
    }
}

/// Keep a started load running independently of its callers.
fn drive(load: SharedLoad) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(load);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::loader::JsonEntity;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Duration;

    // ========================================================================
    // Mock loader
    // ========================================================================

    #[derive(Default)]
    struct MockLoader {
        calls: AtomicUsize,
        requested: Mutex<Vec<IncludeSet>>,
        fail: AtomicBool,
        alias_ids: Mutex<Vec<&'static str>>,
    }

    impl MockLoader {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn entity(id: &str, version: usize, includes: &IncludeSet) -> JsonEntity {
            let mut value = json!({"id": id, "version": version});
            for include in includes.iter() {
                value[include] = json!(true);
            }
            JsonEntity::from_value(value).unwrap()
        }
    }

    #[async_trait]
    impl ResourceLoader<JsonEntity> for MockLoader {
        async fn load_key(&self, key: &String, includes: &IncludeSet) -> Result<JsonEntity, LoadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.requested.lock().unwrap().push(includes.clone());
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(LoadError::Remote("boom".to_string()));
            }
            Ok(Self::entity(key, call, includes))
        }

        async fn load_alias(
            &self,
            _alias: &ResourceAlias,
            includes: &IncludeSet,
        ) -> Result<Vec<JsonEntity>, LoadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let ids = self.alias_ids.lock().unwrap().clone();
            Ok(ids
                .into_iter()
                .map(|id| Self::entity(id, call, includes))
                .collect())
        }
    }

    fn cache() -> (KeyedCache<JsonEntity>, Arc<MockLoader>) {
        let loader = Arc::new(MockLoader::default());
        let cache = KeyedCache::with_defaults(loader.clone() as Arc<dyn ResourceLoader<JsonEntity>>);
        (cache, loader)
    }

    fn key(id: &str) -> String {
        id.to_string()
    }

    fn version(value: &JsonEntity) -> u64 {
        value.get("version").and_then(|v| v.as_u64()).unwrap()
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_share_one_fetch() {
        let (cache, loader) = cache();
        let none = IncludeSet::empty();

        let (key_a, key_b) = (key("k"), key("k"));
        let (a, b) = tokio::join!(cache.load_one(&key_a, &none), cache.load_one(&key_b, &none));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(loader.calls(), 1);
        assert_eq!(cache.stats().joined, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_is_served_from_cache() {
        let (cache, loader) = cache();
        let none = IncludeSet::empty();

        cache.load_one(&key("k"), &none).await.unwrap();
        cache.load_one(&key("k"), &none).await.unwrap();

        assert_eq!(loader.calls(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outdated_entry_stays_readable_until_reload() {
        let (cache, loader) = cache();
        let none = IncludeSet::empty();
        let mut events = cache.subscribe();

        cache.load_one(&key("k"), &none).await.unwrap();
        cache.mark_outdated(&ResourceKey::one(key("k")));

        assert!(cache.is_outdated(&ResourceKey::one(key("k"))));
        assert_eq!(version(&cache.get(&key("k")).unwrap()), 1);

        let reloaded = cache.load_one(&key("k"), &none).await.unwrap();
        assert_eq!(version(&reloaded), 2);
        assert_eq!(loader.calls(), 2);
        assert!(!cache.is_outdated(&ResourceKey::one(key("k"))));

        assert_eq!(events.recv().await.unwrap(), ResourceEvent::Updated(key("k")));
        assert_eq!(events.recv().await.unwrap(), ResourceEvent::Outdated(key("k")));
        assert_eq!(events.recv().await.unwrap(), ResourceEvent::Updated(key("k")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_missing_includes_are_fetched() {
        let (cache, loader) = cache();
        let props: IncludeSet = ["props"].into_iter().collect();
        let both: IncludeSet = ["auth", "props"].into_iter().collect();

        cache.load_one(&key("k"), &props).await.unwrap();
        let value = cache.load_one(&key("k"), &both).await.unwrap();

        let requested = loader.requested.lock().unwrap().clone();
        assert_eq!(requested[1], ["auth"].into_iter().collect::<IncludeSet>());
        // Merge kept the group loaded by the first fetch.
        assert_eq!(value.get("props"), Some(&json!(true)));
        assert_eq!(value.get("auth"), Some(&json!(true)));
        assert!(cache.metadata(&key("k")).includes.is_subset(&both));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outdated_entry_refetches_with_previous_includes() {
        let (cache, loader) = cache();
        let props: IncludeSet = ["props"].into_iter().collect();

        cache.load_one(&key("k"), &props).await.unwrap();
        cache.mark_outdated(&ResourceKey::one(key("k")));
        cache.load_one(&key("k"), &IncludeSet::empty()).await.unwrap();

        let requested = loader.requested.lock().unwrap().clone();
        assert_eq!(requested[1], props);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_load_keeps_previous_value() {
        let (cache, loader) = cache();
        let none = IncludeSet::empty();

        cache.load_one(&key("k"), &none).await.unwrap();
        cache.mark_outdated(&ResourceKey::one(key("k")));
        loader.fail.store(true, Ordering::SeqCst);

        let err = cache.load_one(&key("k"), &none).await.unwrap_err();
        assert_eq!(err, LoadError::Remote("boom".to_string()));
        assert_eq!(version(&cache.get(&key("k")).unwrap()), 1);

        let meta = cache.metadata(&key("k"));
        assert_eq!(meta.exception, Some(err));
        assert!(meta.outdated);
        assert!(!meta.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_key_is_rejected_without_fetch() {
        let (cache, loader) = cache();

        let err = cache.load_one(&key(""), &IncludeSet::empty()).await.unwrap_err();
        assert!(matches!(err, LoadError::InvalidKey(_)));
        assert_eq!(loader.calls(), 0);

        cache.mark_outdated(&ResourceKey::one(key("")));
        assert!(cache.delete(&ResourceKey::one(key(""))).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_survives_dropped_caller() {
        let (cache, loader) = cache();
        let background = cache.clone();

        let caller = tokio::spawn(async move {
            background.load_one(&key("k"), &IncludeSet::empty()).await
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(loader.calls(), 1);
        assert!(cache.has(&key("k")));
        assert!(!cache.is_loading(&key("k")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_load_drops_keys_missing_from_result() {
        let (cache, loader) = cache();
        *loader.alias_ids.lock().unwrap() = vec!["a", "b"];
        let all = ResourceKey::all();

        let first = cache.load(&all, &IncludeSet::empty()).await.unwrap();
        assert_eq!(first.len(), 2);

        cache.mark_outdated(&all);
        *loader.alias_ids.lock().unwrap() = vec!["b"];
        let mut events = cache.subscribe();
        let second = cache.load(&all, &IncludeSet::empty()).await.unwrap();

        assert_eq!(second.len(), 1);
        assert!(!cache.has(&key("a")));
        assert!(cache.has(&key("b")));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ResourceEvent::Deleted(key("a"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_alias_is_not_refetched() {
        let (cache, loader) = cache();
        *loader.alias_ids.lock().unwrap() = vec!["a"];
        let all = ResourceKey::all();

        cache.load(&all, &IncludeSet::empty()).await.unwrap();
        cache.load(&all, &IncludeSet::empty()).await.unwrap();
        assert_eq!(loader.calls(), 1);

        cache.mark_outdated(&ResourceKey::one(key("a")));
        cache.load(&all, &IncludeSet::empty()).await.unwrap();
        assert_eq!(loader.calls(), 2);
    }

    #[test]
    fn test_parametrized_alias_reflects_later_sets() {
        let (cache, _) = cache();
        cache.aliases().add("@test/prefix", |alias, keys| {
            let prefix = &alias.params()[0];
            let mut keys: Vec<String> = keys.iter().filter(|k| k.starts_with(prefix.as_str())).cloned().collect();
            keys.sort();
            keys
        });
        let alias = ResourceKey::alias(ResourceAlias::with_params("@test/prefix", ["x"]));

        cache.set(JsonEntity::from_value(json!({"id": "x1"})).unwrap());
        assert_eq!(cache.resolve(&alias), vec![key("x1")]);

        cache.set(JsonEntity::from_value(json!({"id": "x2"})).unwrap());
        cache.set(JsonEntity::from_value(json!({"id": "y1"})).unwrap());
        assert_eq!(cache.resolve(&alias), vec![key("x1"), key("x2")]);
    }

    #[test]
    fn test_set_merges_with_previous_value() {
        let (cache, _) = cache();
        cache.set(JsonEntity::from_value(json!({"id": "k", "a": 1, "b": 2})).unwrap());
        let merged = cache
            .set(JsonEntity::from_value(json!({"id": "k", "b": 3, "c": 4})).unwrap())
            .unwrap();

        assert_eq!(merged, JsonEntity::from_value(json!({"id": "k", "a": 1, "b": 3, "c": 4})).unwrap());
        assert!(cache.is_loaded(&key("k")));
    }

    #[test]
    fn test_interrupter_suppresses_deletions() {
        let (cache, _) = cache();
        let mut events = cache.subscribe();
        cache.add_interrupter(|event| matches!(event, ResourceEvent::Deleted(_)));

        cache.set(JsonEntity::from_value(json!({"id": "k"})).unwrap());
        assert_eq!(cache.delete(&ResourceKey::one(key("k"))), vec![key("k")]);

        assert_eq!(events.try_recv().unwrap(), ResourceEvent::Updated(key("k")));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_modify_updates_in_place() {
        let (cache, _) = cache();
        cache.set(JsonEntity::from_value(json!({"id": "k", "flag": true})).unwrap());

        let updated = cache.modify(&key("k"), |value| {
            value.0.insert("flag".to_string(), json!(false));
        });
        assert_eq!(updated.unwrap().get("flag"), Some(&json!(false)));
        assert!(cache.modify(&key("missing"), |_| {}).is_none());
    }

    #[test]
    fn test_clear_and_mark_all_outdated() {
        let (cache, _) = cache();
        cache.set(JsonEntity::from_value(json!({"id": "a"})).unwrap());
        cache.set(JsonEntity::from_value(json!({"id": "b"})).unwrap());

        cache.mark_all_outdated();
        assert!(cache.is_outdated(&ResourceKey::all()));
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_perform_update_records_failure() {
        let (cache, _) = cache();
        let result: Result<(), LoadError> = cache
            .perform_update(&key("k"), async { Err(LoadError::Validation("bad".to_string())) })
            .await;

        assert!(result.is_err());
        let meta = cache.metadata(&key("k"));
        assert!(!meta.loading);
        assert_eq!(meta.exception, Some(LoadError::Validation("bad".to_string())));
    }
}
