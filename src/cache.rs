//! Route cache: resolved dynamic-path results, computed once and replicated.
//!
//! Exactly one worker populates the cache while discovering static paths.
//! The cache is then sealed, serialized into a structural wire form and
//! hydrated into every other worker before any of them accepts render
//! requests. A write to a sealed cache is a programming error and panics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::route::{Params, RouteKey};

/// One entry returned by a path-generation callback, already validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathItem {
    pub params: Params,
    /// Arbitrary props forwarded to the later render of this page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<serde_json::Value>,
}

/// The full callback result for one route
pub type ResolvedPaths = Vec<PathItem>;

/// Map from route identity to previously computed dynamic-path results
#[derive(Debug, Default, PartialEq)]
pub struct RouteCache {
    entries: BTreeMap<RouteKey, ResolvedPaths>,
    sealed: bool,
}

/// Wire-transferable form of a `RouteCache`: an ordered list of entries with
/// no worker-local references, suitable for a structural copy across a
/// thread or process boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedRouteCache {
    pub entries: Vec<(RouteKey, ResolvedPaths)>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&ResolvedPaths> {
        self.entries.get(key)
    }

    /// Record a callback result.
    ///
    /// # Panics
    ///
    /// Panics if the cache has been sealed. Recomputing dynamic paths after
    /// discovery could silently diverge between workers mid-build.
    pub fn insert(&mut self, key: RouteKey, paths: ResolvedPaths) {
        assert!(
            !self.sealed,
            "route cache is sealed; dynamic paths must not be recomputed after discovery"
        );
        self.entries.insert(key, paths);
    }

    /// Make the cache permanently read-only.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pure structural transform into the wire form (ordered entry list).
    pub fn to_serialized(&self) -> SerializedRouteCache {
        SerializedRouteCache {
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Reconstruct a cache from its wire form. Hydrated caches arrive
    /// sealed: only the discovery run on the first worker ever writes.
    pub fn hydrate(serialized: &SerializedRouteCache) -> Self {
        Self {
            entries: serialized
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            sealed: true,
        }
    }
}
