//! Prerender: a concurrent static-rendering engine.
//!
//! Turns a set of route definitions into a complete set of pre-rendered
//! page outputs by farming work out to a pool of isolated worker threads.
//! Startup is strictly two-phase: worker 0 is initialized alone and runs
//! path discovery once, producing a sealed route cache that is hydrated
//! into every other worker before any of them accepts a render request.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use prerender::{FnModule, ModuleRegistry, PrerenderConfig, Prerenderer, RenderedPage, RouteDefinition};
//!
//! # #[tokio::main]
//! # async fn main() -> prerender::Result<()> {
//! let registry = ModuleRegistry::new();
//! registry.register(
//!     "dist/server/entry.mjs",
//!     Arc::new(FnModule::new(|_, request, _, _| {
//!         Ok(RenderedPage::html(format!("<h1>{}</h1>", request.url)))
//!     })),
//! );
//!
//! let config = PrerenderConfig {
//!     entrypoint: "dist/server/entry.mjs".to_string(),
//!     concurrency: 4,
//!     ..Default::default()
//! };
//! let routes = vec![RouteDefinition::page("/about", "pages/about")];
//!
//! let mut engine = Prerenderer::new(config, routes, Arc::new(registry));
//! engine.setup().await?;
//! for path in engine.get_static_paths().await? {
//!     let response = engine.render(&path.pathname, &path.route).await?;
//!     assert_eq!(response.status, 200);
//! }
//! engine.teardown().await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod assets;
pub mod cache;
pub mod error;
pub mod loader;
pub mod pool;
pub mod prerenderer;
pub mod protocol;
pub mod resolver;
pub mod route;

mod worker;

pub use assets::{AssetKind, AssetRegistry, SerializedAsset};
pub use cache::{PathItem, RouteCache, SerializedRouteCache};
pub use error::{Error, Result};
pub use loader::{
    FnModule, ModuleLoader, ModuleRegistry, RenderContext, RenderRequest, RenderableModule,
    RenderedPage,
};
pub use pool::{StaticPathsOutput, WorkerPool, WorkerStatus};
pub use prerenderer::{PageResponse, PathWithRoute, Phase, Prerenderer};
pub use protocol::{InitPayload, Message, MessageId, WireError};
pub use resolver::Paginator;
pub use route::{Params, RouteDefinition, RouteKey, RouteKind, StaticPath};

/// How the render entrypoint should behave at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RuntimeMode {
    #[default]
    Production,
    Development,
}

/// Log verbosity forwarded to workers and the render entrypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

/// Configuration for the prerendering engine
///
/// The defaults are conservative: one worker per logical CPU, fallback page
/// generation enabled, and a 30 second per-request timeout so a hung worker
/// can never stall the whole build.
#[derive(Debug, Clone)]
pub struct PrerenderConfig {
    /// Location of the compiled render entrypoint, resolved by the
    /// worker-side `ModuleLoader`
    pub entrypoint: String,
    /// Requested worker count; resolved to a minimum of 1
    pub concurrency: usize,
    /// Origin used to build absolute request URLs inside workers
    pub origin: String,
    pub runtime_mode: RuntimeMode,
    pub log_level: LogLevel,
    /// Opaque build settings forwarded verbatim to the render context
    pub build_settings: serde_json::Value,
    /// Whether fallback routes generate pages of their own
    pub generate_fallback_pages: bool,
    /// Default page size for the pagination helper
    pub page_size: usize,
    /// Timeout applied to every coordinator-to-worker request
    pub request_timeout_ms: u64,
}

impl Default for PrerenderConfig {
    fn default() -> Self {
        Self {
            entrypoint: String::new(),
            concurrency: num_cpus::get(),
            origin: "http://localhost:3000".to_string(),
            runtime_mode: RuntimeMode::Production,
            log_level: LogLevel::Info,
            build_settings: serde_json::Value::Null,
            generate_fallback_pages: true,
            page_size: 10,
            request_timeout_ms: 30_000,
        }
    }
}

impl PrerenderConfig {
    /// The effective worker count (never below 1).
    pub fn resolved_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
