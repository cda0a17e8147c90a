//! Per-entry metadata and include groups.

use std::collections::BTreeSet;

use harbor_core::LoadError;

/// Ordered set of include-group names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct IncludeSet(BTreeSet<String>);

impl IncludeSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, include: impl Into<String>) -> bool {
        self.0.insert(include.into())
    }

    pub fn contains(&self, include: &str) -> bool {
        self.0.contains(include)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Groups requested by `self` that `loaded` does not have yet.
    pub fn missing_from(&self, loaded: &IncludeSet) -> IncludeSet {
        IncludeSet(self.0.difference(&loaded.0).cloned().collect())
    }

    pub fn union(&self, other: &IncludeSet) -> IncludeSet {
        IncludeSet(self.0.union(&other.0).cloned().collect())
    }

    pub fn is_subset(&self, other: &IncludeSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn extend(&mut self, other: &IncludeSet) {
        self.0.extend(other.0.iter().cloned());
    }
}

impl<S: Into<String>> FromIterator<S> for IncludeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        IncludeSet(iter.into_iter().map(Into::into).collect())
    }
}

/// Metadata kept next to every cache entry.
///
/// `X` carries domain-specific extension fields (for connections: whether a
/// connect is in progress).
#[derive(Debug, Clone, Default)]
pub struct EntryMetadata<X> {
    /// Value is stale; the next `load` refetches it.
    pub outdated: bool,
    /// A load or update is in flight.
    pub loading: bool,
    /// At least one load or set completed.
    pub loaded: bool,
    /// Error of the last failed load, cleared on success.
    pub exception: Option<LoadError>,
    /// Include groups present on the cached value.
    pub includes: IncludeSet,
    pub ext: X,
}

impl<X> EntryMetadata<X> {
    /// Fresh enough to serve `requested` without a fetch.
    pub fn satisfies(&self, requested: &IncludeSet) -> bool {
        self.loaded && !self.outdated && requested.is_subset(&self.includes)
    }

    /// Include groups a fetch has to ask for to satisfy `requested`.
    ///
    /// Outdated entries refetch everything they had plus the request; fresh
    /// entries only ask for what is missing.
    pub fn includes_to_fetch(&self, requested: &IncludeSet) -> IncludeSet {
        if self.loaded && !self.outdated {
            requested.missing_from(&self.includes)
        } else {
            requested.union(&self.includes)
        }
    }
}
