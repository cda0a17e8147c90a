//! Property-Based Tests for the Keyed Resource Cache
//!
//! **Property 1: Structural Merge**
//! Setting a partial value over an existing one keeps fields the partial
//! value omits and overwrites fields it carries.
//!
//! **Property 2: Single Flight**
//! Any number of concurrent loads of one key invoke the loader once.
//!
//! **Property 3: Outdated Values Stay Readable**
//! Marking keys outdated never removes their values.
//!
//! **Property 4: Live Alias Resolution**
//! The all-keys alias always resolves to exactly the keys holding a value.

use async_trait::async_trait;
use harbor_core::LoadError;
use harbor_storage::{
    CacheEntity, IncludeSet, JsonEntity, KeyedCache, ResourceAlias, ResourceKey, ResourceLoader,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// TEST LOADER
// ============================================================================

#[derive(Default)]
struct SlowLoader {
    calls: AtomicUsize,
}

#[async_trait]
impl ResourceLoader<JsonEntity> for SlowLoader {
    async fn load_key(&self, key: &String, _includes: &IncludeSet) -> Result<JsonEntity, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(JsonEntity::from_value(json!({ "id": key })).unwrap())
    }
}

fn new_cache() -> (KeyedCache<JsonEntity>, Arc<SlowLoader>) {
    let loader = Arc::new(SlowLoader::default());
    let cache = KeyedCache::with_defaults(loader.clone() as Arc<dyn ResourceLoader<JsonEntity>>);
    (cache, loader)
}

fn entity(id: &str, fields: &BTreeMap<String, i64>) -> JsonEntity {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(id.to_string()));
    for (field, value) in fields {
        map.insert(field.clone(), json!(value));
    }
    JsonEntity(map)
}

// ============================================================================
// GENERATORS
// ============================================================================

fn field_map_strategy() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("[a-f]", any::<i64>(), 0..6)
}

fn key_set_strategy() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[a-z]{1,6}", 0..12)
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 1: Structural Merge**
    #[test]
    fn prop_set_merges_structurally(
        first in field_map_strategy(),
        second in field_map_strategy(),
    ) {
        let (cache, _) = new_cache();
        cache.set(entity("k", &first));
        let merged = cache.set(entity("k", &second));

        let mut expected = first.clone();
        expected.extend(second.clone());
        prop_assert_eq!(merged, Some(entity("k", &expected)));
    }

    /// **Property 2: Single Flight**
    #[test]
    fn prop_concurrent_loads_invoke_loader_once(callers in 1usize..16) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;

        let (calls, values) = rt.block_on(async {
            let (cache, loader) = new_cache();
            let key = "k".to_string();
            let none = IncludeSet::empty();
            let loads = (0..callers).map(|_| cache.load_one(&key, &none));
            let values = futures_util::future::join_all(loads).await;
            (loader.calls.load(Ordering::SeqCst), values)
        });

        prop_assert_eq!(calls, 1);
        prop_assert!(values.iter().all(|value| value.is_ok()));
    }

    /// **Property 3: Outdated Values Stay Readable**
    #[test]
    fn prop_mark_outdated_keeps_values(keys in key_set_strategy()) {
        let (cache, _) = new_cache();
        for key in &keys {
            cache.set(entity(key, &BTreeMap::new()));
        }

        cache.mark_outdated(&ResourceKey::list(keys.iter().cloned()));

        for key in &keys {
            prop_assert!(cache.get(key).is_some());
            prop_assert!(cache.metadata(key).outdated);
        }
        prop_assert_eq!(cache.len(), keys.len());
    }

    /// **Property 4: Live Alias Resolution**
    #[test]
    fn prop_all_alias_tracks_contents(
        initial in key_set_strategy(),
        removed in key_set_strategy(),
    ) {
        let (cache, _) = new_cache();
        for key in &initial {
            cache.set(entity(key, &BTreeMap::new()));
        }
        cache.delete(&ResourceKey::list(removed.iter().cloned()));

        let resolved: BTreeSet<String> = cache
            .resolve(&ResourceKey::alias(ResourceAlias::all()))
            .into_iter()
            .collect();
        let expected: BTreeSet<String> = initial.difference(&removed).cloned().collect();
        prop_assert_eq!(resolved, expected);
    }

    /// Equal keys built independently address the same entry.
    #[test]
    fn prop_equal_keys_share_entry(id in "[a-z]{1,8}", value in any::<i64>()) {
        let (cache, _) = new_cache();
        let mut fields = BTreeMap::new();
        fields.insert("v".to_string(), value);
        let stored = entity(&id, &fields);

        cache.set(stored.clone());
        let lookup = String::from(id.as_str());
        prop_assert!(cache.is_key_equal(&stored.key(), &lookup));
        prop_assert_eq!(cache.get(&lookup), Some(stored));
    }
}
