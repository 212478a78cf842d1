//! The seam between this subsystem and the compiled render entrypoint.
//!
//! The concrete loading mechanism (dynamic linking, embedded registry, a
//! separate process) is swappable: workers receive a `ModuleLoader`
//! capability at spawn time and ask it for the entrypoint named in the
//! `Init` message. `ModuleRegistry` and `FnModule` provide an in-memory
//! implementation for embedders and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::assets::SerializedAsset;
use crate::cache::PathItem;
use crate::error::{Error, Result};
use crate::resolver::Paginator;
use crate::route::RouteDefinition;
use crate::{lock, LogLevel, RuntimeMode};

/// A single page render request as seen by the entrypoint
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub origin: String,
}

/// Explicit per-worker render state.
///
/// Anything a render might want to share across calls on the same worker
/// (like the generated-image cache) lives here instead of in ambient
/// globals, so a render call is a function of its inputs plus this context.
#[derive(Debug)]
pub struct RenderContext {
    pub runtime_mode: RuntimeMode,
    pub log_level: LogLevel,
    pub build_settings: serde_json::Value,
    /// Worker-local cache of generated image payloads, keyed by asset key
    pub image_cache: HashMap<String, Vec<u8>>,
}

impl RenderContext {
    pub fn new(
        runtime_mode: RuntimeMode,
        log_level: LogLevel,
        build_settings: serde_json::Value,
    ) -> Self {
        Self {
            runtime_mode,
            log_level,
            build_settings,
            image_cache: HashMap::new(),
        }
    }
}

impl Default for RenderContext {
    fn default() -> Self {
        Self::new(RuntimeMode::default(), LogLevel::default(), serde_json::Value::Null)
    }
}

/// Result of rendering one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPage {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<SerializedAsset>,
}

impl RenderedPage {
    /// A 200 HTML response with the given body
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: vec![(
                "content-type".to_string(),
                "text/html; charset=utf-8".to_string(),
            )],
            body: Some(body.into().into_bytes()),
            assets: Vec::new(),
        }
    }

    pub fn with_asset(mut self, asset: SerializedAsset) -> Self {
        self.assets.push(asset);
        self
    }
}

/// A loaded render entrypoint.
///
/// `static_paths` is the user-supplied path-generation callback for a
/// dynamic route. Its return value is deliberately loosely typed (raw JSON
/// items); the resolver validates the shape and treats a malformed result
/// as a fatal configuration error.
pub trait RenderableModule: Send + Sync {
    fn render(
        &self,
        route: &RouteDefinition,
        request: &RenderRequest,
        resolved: Option<&[PathItem]>,
        ctx: &mut RenderContext,
    ) -> Result<RenderedPage>;

    fn static_paths(
        &self,
        route: &RouteDefinition,
        _paginate: &Paginator,
    ) -> Result<Vec<serde_json::Value>> {
        Err(Error::ConfigError(format!(
            "route '{}' does not provide a static path generator",
            route.pattern
        )))
    }
}

impl std::fmt::Debug for dyn RenderableModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RenderableModule")
    }
}

/// Capability for loading a compiled render entrypoint inside a worker
pub trait ModuleLoader: Send + Sync {
    fn load_entrypoint(&self, location: &str) -> Result<Arc<dyn RenderableModule>>;
}

/// In-memory `ModuleLoader`: entrypoints registered under a location string.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Mutex<HashMap<String, Arc<dyn RenderableModule>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, location: impl Into<String>, module: Arc<dyn RenderableModule>) {
        lock(&self.modules).insert(location.into(), module);
    }
}

impl ModuleLoader for ModuleRegistry {
    fn load_entrypoint(&self, location: &str) -> Result<Arc<dyn RenderableModule>> {
        lock(&self.modules).get(location).cloned().ok_or_else(|| {
            Error::InitializationError(format!("no module registered at '{location}'"))
        })
    }
}

type RenderFn = Box<
    dyn Fn(
            &RouteDefinition,
            &RenderRequest,
            Option<&[PathItem]>,
            &mut RenderContext,
        ) -> Result<RenderedPage>
        + Send
        + Sync,
>;

type StaticPathsFn =
    Box<dyn Fn(&RouteDefinition, &Paginator) -> Result<Vec<serde_json::Value>> + Send + Sync>;

/// Closure-backed `RenderableModule` for embedders and tests
pub struct FnModule {
    render: RenderFn,
    static_paths: Option<StaticPathsFn>,
}

impl FnModule {
    pub fn new<F>(render: F) -> Self
    where
        F: Fn(
                &RouteDefinition,
                &RenderRequest,
                Option<&[PathItem]>,
                &mut RenderContext,
            ) -> Result<RenderedPage>
            + Send
            + Sync
            + 'static,
    {
        Self {
            render: Box::new(render),
            static_paths: None,
        }
    }

    pub fn with_static_paths<F>(mut self, static_paths: F) -> Self
    where
        F: Fn(&RouteDefinition, &Paginator) -> Result<Vec<serde_json::Value>>
            + Send
            + Sync
            + 'static,
    {
        self.static_paths = Some(Box::new(static_paths));
        self
    }
}

impl RenderableModule for FnModule {
    fn render(
        &self,
        route: &RouteDefinition,
        request: &RenderRequest,
        resolved: Option<&[PathItem]>,
        ctx: &mut RenderContext,
    ) -> Result<RenderedPage> {
        (self.render)(route, request, resolved, ctx)
    }

    fn static_paths(
        &self,
        route: &RouteDefinition,
        paginate: &Paginator,
    ) -> Result<Vec<serde_json::Value>> {
        match &self.static_paths {
            Some(callback) => callback(route, paginate),
            None => Err(Error::ConfigError(format!(
                "route '{}' does not provide a static path generator",
                route.pattern
            ))),
        }
    }
}
