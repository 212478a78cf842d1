//! The top-level prerender driver.
//!
//! Owns the pool and runs the two-phase startup: worker 0 is initialized
//! alone, discovers every static path (producing the sealed route cache),
//! and only then are the remaining workers brought up with the hydrated
//! cache. After that, renders fan out across all ready workers and their
//! assets fold into a single coordinator-owned registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::assets::AssetRegistry;
use crate::cache::SerializedRouteCache;
use crate::error::{Error, Result};
use crate::loader::ModuleLoader;
use crate::pool::WorkerPool;
use crate::protocol::InitPayload;
use crate::route::{Params, RouteDefinition, RouteKey};
use crate::{lock, PrerenderConfig};

/// Orchestrator lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    SetUp,
    PathsDiscovered,
    TornDown,
}

/// A discovered page joined back to its full route definition
#[derive(Debug, Clone, PartialEq)]
pub struct PathWithRoute {
    pub pathname: String,
    pub params: Params,
    pub route: RouteDefinition,
}

/// Response value handed back to the build pipeline for one page
#[derive(Debug, Clone, PartialEq)]
pub struct PageResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// The prerenderer orchestrator
pub struct Prerenderer {
    config: PrerenderConfig,
    routes: Vec<RouteDefinition>,
    loader: Arc<dyn ModuleLoader>,
    pool: Option<WorkerPool>,
    phase: Mutex<Phase>,
    routes_by_key: HashMap<RouteKey, RouteDefinition>,
    assets: Mutex<AssetRegistry>,
    hydrated: AtomicBool,
}

impl Prerenderer {
    pub fn new(
        config: PrerenderConfig,
        routes: Vec<RouteDefinition>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Self {
        let mut routes_by_key = HashMap::new();
        index_routes(&routes, &mut routes_by_key);
        Self {
            config,
            routes,
            loader,
            pool: None,
            phase: Mutex::new(Phase::Created),
            routes_by_key,
            assets: Mutex::new(AssetRegistry::new()),
            hydrated: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// The pool, for callers that need worker-level introspection.
    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    /// Construct the pool and initialize worker 0.
    pub async fn setup(&mut self) -> Result<()> {
        if self.phase() != Phase::Created {
            return Err(Error::InitializationError(
                "prerenderer has already been set up".into(),
            ));
        }
        let concurrency = self.config.resolved_concurrency();
        debug!("starting prerender pool with {concurrency} worker(s)");
        let pool = WorkerPool::new(
            concurrency,
            Arc::clone(&self.loader),
            Duration::from_millis(self.config.request_timeout_ms),
        );
        pool.init_worker(0, self.init_payload(None)).await?;
        self.pool = Some(pool);
        *lock(&self.phase) = Phase::SetUp;
        Ok(())
    }

    /// Discover every static path, hydrate the remaining workers with the
    /// resulting cache, and join each path back to its route definition.
    ///
    /// # Panics
    ///
    /// Panics unless called exactly once, in the `SetUp` phase.
    pub async fn get_static_paths(&mut self) -> Result<Vec<PathWithRoute>> {
        assert_eq!(
            self.phase(),
            Phase::SetUp,
            "get_static_paths() must be called exactly once, after setup()"
        );
        let pool = self.pool_ref()?;
        let output = pool.get_static_paths().await?;

        if !self.hydrated.swap(true, Ordering::SeqCst) && pool.size() > 1 {
            pool.init_remaining_workers(self.init_payload(Some(output.route_cache.clone())))
                .await?;
        }
        *lock(&self.phase) = Phase::PathsDiscovered;

        output
            .paths
            .into_iter()
            .map(|path| {
                let route = self
                    .routes_by_key
                    .get(&path.route_key)
                    .cloned()
                    .ok_or_else(|| {
                        Error::ProtocolError(format!(
                            "worker returned unknown route key '{}' for '{}'",
                            path.route_key, path.pathname
                        ))
                    })?;
                Ok(PathWithRoute {
                    pathname: path.pathname,
                    params: path.params,
                    route,
                })
            })
            .collect()
    }

    /// Render one page and fold its assets into the global registry.
    ///
    /// A failure rejects only this page; whether that aborts the build is
    /// the caller's decision.
    ///
    /// # Panics
    ///
    /// Panics when called before paths have been discovered.
    pub async fn render(&self, url: &str, route: &RouteDefinition) -> Result<PageResponse> {
        assert_eq!(
            self.phase(),
            Phase::PathsDiscovered,
            "render() requires discovered paths"
        );
        let pool = self.pool_ref()?;
        let page = pool.render(url.to_string(), route.key()).await?;
        lock(&self.assets).merge(page.assets);
        Ok(PageResponse {
            status: page.status,
            headers: page.headers,
            body: page.body,
        })
    }

    /// Hand the accumulated asset registry over to the build pipeline.
    pub fn take_assets(&self) -> AssetRegistry {
        std::mem::take(&mut lock(&self.assets))
    }

    /// Close the pool and release its workers. Idempotent.
    pub async fn teardown(&mut self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.close().await?;
        }
        *lock(&self.phase) = Phase::TornDown;
        Ok(())
    }

    fn pool_ref(&self) -> Result<&WorkerPool> {
        self.pool.as_ref().ok_or_else(|| {
            Error::InitializationError("prerenderer has not been set up".into())
        })
    }

    fn init_payload(&self, route_cache: Option<SerializedRouteCache>) -> InitPayload {
        InitPayload {
            entrypoint: self.config.entrypoint.clone(),
            build_settings: self.config.build_settings.clone(),
            routes: self.routes.clone(),
            runtime_mode: self.config.runtime_mode,
            origin: self.config.origin.clone(),
            log_level: self.config.log_level,
            generate_fallback_pages: self.config.generate_fallback_pages,
            page_size: self.config.page_size,
            route_cache,
        }
    }
}

/// Index routes and their fallback chains by key for the join step.
fn index_routes(routes: &[RouteDefinition], by_key: &mut HashMap<RouteKey, RouteDefinition>) {
    for route in routes {
        by_key.insert(route.key(), route.clone());
        index_routes(&route.fallback_routes, by_key);
    }
}
