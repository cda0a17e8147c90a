//! Named, parametrized virtual keys.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

/// Name of the built-in alias that resolves to every key in the cache.
pub const ALL_KEYS_ALIAS: &str = "@resource/all";

/// A named virtual key such as "all connections in projects p1, p2".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceAlias {
    name: Cow<'static, str>,
    params: Vec<String>,
}

impl ResourceAlias {
    pub fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            params: Vec::new(),
        }
    }

    pub fn with_params<I, S>(name: &'static str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: Cow::Borrowed(name),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn all() -> Self {
        Self::new(ALL_KEYS_ALIAS)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn is_all(&self) -> bool {
        self.name == ALL_KEYS_ALIAS
    }
}

impl fmt::Display for ResourceAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}({})", self.name, self.params.join(","))
        }
    }
}

type AliasResolver<K> = Arc<dyn Fn(&ResourceAlias, &[K]) -> Vec<K> + Send + Sync>;

/// Resolvers for the aliases a cache understands.
///
/// A resolver receives the alias (with its parameters) and the keys
/// currently present, and returns the concrete key list. Results are never
/// memoized: the same alias can expand differently after any mutation.
pub struct AliasRegistry<K> {
    resolvers: RwLock<HashMap<String, AliasResolver<K>>>,
}

impl<K: Clone> AliasRegistry<K> {
    pub fn new() -> Self {
        Self {
            resolvers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a resolver for `name`, replacing any previous one.
    pub fn add<F>(&self, name: &'static str, resolver: F)
    where
        F: Fn(&ResourceAlias, &[K]) -> Vec<K> + Send + Sync + 'static,
    {
        self.resolvers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(resolver));
    }

    pub fn contains(&self, name: &str) -> bool {
        name == ALL_KEYS_ALIAS
            || self
                .resolvers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(name)
    }

    /// Expand `alias` against the keys currently present.
    pub fn resolve(&self, alias: &ResourceAlias, current: &[K]) -> Vec<K> {
        if alias.is_all() {
            return current.to_vec();
        }
        let resolver = self
            .resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias.name())
            .cloned();
        match resolver {
            Some(resolver) => resolver(alias, current),
            None => {
                warn!(alias = %alias, "Unknown resource alias, resolving to no keys");
                Vec::new()
            }
        }
    }
}

impl<K: Clone> Default for AliasRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_resolves_every_key() {
        let registry: AliasRegistry<u32> = AliasRegistry::new();
        assert_eq!(registry.resolve(&ResourceAlias::all(), &[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn test_parametrized_alias_is_reevaluated() {
        let registry: AliasRegistry<u32> = AliasRegistry::new();
        registry.add("@test/above", |alias, keys| {
            let min: u32 = alias.params()[0].parse().unwrap_or(0);
            keys.iter().copied().filter(|k| *k > min).collect()
        });

        let alias = ResourceAlias::with_params("@test/above", ["1"]);
        assert_eq!(registry.resolve(&alias, &[1, 2]), vec![2]);
        assert_eq!(registry.resolve(&alias, &[1, 2, 5]), vec![2, 5]);
    }

    #[test]
    fn test_unknown_alias_is_empty() {
        let registry: AliasRegistry<u32> = AliasRegistry::new();
        assert!(registry.resolve(&ResourceAlias::new("@missing"), &[1]).is_empty());
        assert!(!registry.contains("@missing"));
        assert!(registry.contains(ALL_KEYS_ALIAS));
    }

    #[test]
    fn test_display_includes_params() {
        let alias = ResourceAlias::with_params("@connection-info/projects", ["p1", "p2"]);
        assert_eq!(alias.to_string(), "@connection-info/projects(p1,p2)");
    }
}
