//! Route definitions and deterministic route identity.
//!
//! A `RouteDefinition` is created once by the build configuration layer and
//! treated as read-only afterwards. Because route objects cannot cross the
//! worker boundary by reference, both sides derive a `RouteKey` from the
//! route's structural identity and use it as the join key.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Deterministic string identity for a route, stable across process
/// boundaries. Derived from the route's structure, never from memory
/// identity, so every worker computes the same key for the same route.
pub type RouteKey = String;

/// Route params produced by path-generation callbacks, keyed by segment name
pub type Params = BTreeMap<String, String>;

/// What kind of page a route produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteKind {
    /// A regular component-backed page
    Page,
    /// A redirect to another route, identified by its pattern
    Redirect { target: String },
    /// An alternate tried when the primary route's content is unavailable
    /// (e.g. a missing localization); `origin` is the pattern of the nearest
    /// non-fallback ancestor route
    Fallback { origin: String },
}

/// Immutable descriptor for a single route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Path template, e.g. `/about` or `/blog/[id]` or `/docs/[...slug]`
    pub pattern: String,
    /// Identifier of the component module inside the render entrypoint
    pub component: String,
    /// Whether this route participates in static prerendering
    pub prerender: bool,
    pub kind: RouteKind,
    /// Alternate definitions tried in order (e.g. i18n fallback pages)
    #[serde(default)]
    pub fallback_routes: Vec<RouteDefinition>,
}

impl RouteDefinition {
    /// Convenience constructor for a plain prerendered page route
    pub fn page(pattern: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            component: component.into(),
            prerender: true,
            kind: RouteKind::Page,
            fallback_routes: Vec::new(),
        }
    }

    /// Derive the route's stable key from its structural identity.
    pub fn key(&self) -> RouteKey {
        let mut hasher = Sha256::new();
        hasher.update(self.pattern.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.component.as_bytes());
        hasher.update([0u8]);
        match &self.kind {
            RouteKind::Page => hasher.update(b"page"),
            RouteKind::Redirect { target } => {
                hasher.update(b"redirect");
                hasher.update([0u8]);
                hasher.update(target.as_bytes());
            }
            RouteKind::Fallback { origin } => {
                hasher.update(b"fallback");
                hasher.update([0u8]);
                hasher.update(origin.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// True when the pattern contains `[param]` or `[...rest]` segments
    pub fn is_dynamic(&self) -> bool {
        self.segments().any(|s| !matches!(s, Segment::Static(_)))
    }

    /// The concrete pathname of a static route, or `None` for dynamic ones
    pub fn static_pathname(&self) -> Option<String> {
        if self.is_dynamic() {
            return None;
        }
        let parts: Vec<&str> = self
            .segments()
            .map(|s| match s {
                Segment::Static(v) => v,
                _ => unreachable!(),
            })
            .collect();
        Some(format!("/{}", parts.join("/")))
    }

    /// Expand the pattern into a concrete pathname using `params`.
    ///
    /// Rest segments (`[...name]`) may span multiple path parts and may be
    /// absent or empty, in which case they are omitted. A missing value for
    /// a plain `[name]` segment is a configuration error.
    pub fn pathname_for(&self, params: &Params) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();
        for segment in self.segments() {
            match segment {
                Segment::Static(v) => parts.push(v.to_string()),
                Segment::Param(name) => {
                    let value = params.get(name).ok_or_else(|| {
                        Error::ConfigError(format!(
                            "route '{}' is missing a value for param '{}'",
                            self.pattern, name
                        ))
                    })?;
                    parts.push(value.clone());
                }
                Segment::Rest(name) => {
                    if let Some(value) = params.get(name) {
                        let trimmed = value.trim_matches('/');
                        if !trimmed.is_empty() {
                            parts.extend(trimmed.split('/').map(str::to_string));
                        }
                    }
                }
            }
        }
        Ok(format!("/{}", parts.join("/")))
    }

    fn segments(&self) -> impl Iterator<Item = Segment<'_>> {
        self.pattern.split('/').filter(|s| !s.is_empty()).map(|s| {
            if let Some(name) = s.strip_prefix("[...").and_then(|v| v.strip_suffix(']')) {
                Segment::Rest(name)
            } else if let Some(name) = s.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
                Segment::Param(name)
            } else {
                Segment::Static(s)
            }
        })
    }
}

enum Segment<'a> {
    Static(&'a str),
    Param(&'a str),
    Rest(&'a str),
}

/// Normalize a pathname for de-duplication: trailing slashes removed, the
/// root collapses to `/`.
pub fn normalize_pathname(pathname: &str) -> String {
    let trimmed = pathname.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A concrete page to prerender, produced during path discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticPath {
    pub pathname: String,
    pub route_key: RouteKey,
    #[serde(default)]
    pub params: Params,
}
