//! An isolated worker execution unit.
//!
//! Each worker is a dedicated OS thread that loads the render entrypoint
//! once during `Init` and then answers protocol messages from its command
//! channel. Panics are caught at the message-handling boundary and turned
//! into `Error` messages so a bad render never takes the worker down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use crate::cache::RouteCache;
use crate::error::{Error, Result};
use crate::loader::{ModuleLoader, RenderContext, RenderRequest, RenderableModule};
use crate::protocol::{Message, WireError};
use crate::resolver::{effective_route, resolve_static_paths, ResolveOptions};
use crate::route::RouteDefinition;

pub(crate) struct WorkerHandle {
    pub(crate) tx: Sender<Message>,
    pub(crate) join: Mutex<Option<JoinHandle<()>>>,
}

/// Spawn a worker thread. Requests arrive on the returned handle's sender;
/// responses and errors flow back through `outbound`.
pub(crate) fn spawn(
    index: usize,
    loader: Arc<dyn ModuleLoader>,
    outbound: UnboundedSender<Message>,
) -> WorkerHandle {
    let (tx, rx) = std::sync::mpsc::channel::<Message>();
    let join = std::thread::spawn(move || worker_main(index, loader, rx, outbound));
    WorkerHandle {
        tx,
        join: Mutex::new(Some(join)),
    }
}

fn worker_main(
    index: usize,
    loader: Arc<dyn ModuleLoader>,
    rx: Receiver<Message>,
    outbound: UnboundedSender<Message>,
) {
    let mut state = WorkerState::new(index, loader);
    while let Ok(message) = rx.recv() {
        if matches!(message, Message::Shutdown) {
            break;
        }
        let Some(id) = message.id() else {
            continue;
        };
        let reply = match catch_unwind(AssertUnwindSafe(|| state.handle(message))) {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => Message::Error {
                id,
                error: WireError::from_error(&err),
            },
            Err(panic) => Message::Error {
                id,
                error: WireError::from_panic(panic.as_ref()),
            },
        };
        // The coordinator hanging up means the pool is gone; stop quietly.
        if outbound.send(reply).is_err() {
            break;
        }
    }
    debug!("worker {index} stopped");
}

/// Look a route up by key, descending into fallback chains.
fn find_route<'a>(routes: &'a [RouteDefinition], key: &str) -> Option<&'a RouteDefinition> {
    for route in routes {
        if route.key() == key {
            return Some(route);
        }
        if let Some(found) = find_route(&route.fallback_routes, key) {
            return Some(found);
        }
    }
    None
}

struct WorkerState {
    index: usize,
    loader: Arc<dyn ModuleLoader>,
    module: Option<Arc<dyn RenderableModule>>,
    routes: Vec<RouteDefinition>,
    origin: String,
    options: ResolveOptions,
    route_cache: RouteCache,
    ctx: RenderContext,
}

impl WorkerState {
    fn new(index: usize, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            index,
            loader,
            module: None,
            routes: Vec::new(),
            origin: String::new(),
            options: ResolveOptions::default(),
            route_cache: RouteCache::new(),
            ctx: RenderContext::default(),
        }
    }

    fn module(&self) -> Result<Arc<dyn RenderableModule>> {
        self.module.clone().ok_or_else(|| {
            Error::ProtocolError(format!("worker {} has not been initialized", self.index))
        })
    }

    fn handle(&mut self, message: Message) -> Result<Message> {
        match message {
            Message::Init { id, payload } => {
                if self.module.is_some() {
                    return Err(Error::ProtocolError(format!(
                        "worker {} initialized twice",
                        self.index
                    )));
                }
                let module = self.loader.load_entrypoint(&payload.entrypoint)?;
                self.module = Some(module);
                self.routes = payload.routes;
                self.origin = payload.origin;
                self.options = ResolveOptions {
                    generate_fallback_pages: payload.generate_fallback_pages,
                    page_size: payload.page_size,
                };
                self.ctx = RenderContext::new(
                    payload.runtime_mode,
                    payload.log_level,
                    payload.build_settings,
                );
                if let Some(serialized) = &payload.route_cache {
                    self.route_cache = RouteCache::hydrate(serialized);
                }
                debug!("worker {} initialized ({} routes)", self.index, self.routes.len());
                Ok(Message::InitResult { id })
            }
            Message::GetStaticPaths { id } => {
                let module = self.module()?;
                let paths = resolve_static_paths(
                    &self.routes,
                    module.as_ref(),
                    &self.options,
                    &mut self.route_cache,
                )?;
                self.route_cache.seal();
                debug!(
                    "worker {} discovered {} static paths",
                    self.index,
                    paths.len()
                );
                Ok(Message::StaticPathsResult {
                    id,
                    paths,
                    route_cache: self.route_cache.to_serialized(),
                })
            }
            Message::Render { id, url, route_key } => {
                let module = self.module()?;
                let route = find_route(&self.routes, &route_key).ok_or_else(|| {
                    Error::ProtocolError(format!(
                        "render request for unknown route key '{route_key}'"
                    ))
                })?;
                let request = RenderRequest {
                    url,
                    origin: self.origin.clone(),
                };
                // Discovery caches callback results under the effective
                // route, so a redirect or fallback alias reads its target's
                // entry.
                let resolved = effective_route(route, &self.routes)
                    .ok()
                    .and_then(|effective| self.route_cache.get(&effective.key()))
                    .map(Vec::as_slice);
                let page = module.render(route, &request, resolved, &mut self.ctx)?;
                Ok(Message::RenderResult { id, page })
            }
            // Response kinds never arrive at a worker; this is a version
            // mismatch between coordinator and worker code.
            other => Err(Error::ProtocolError(format!(
                "worker {} received unexpected message '{}'",
                self.index,
                other.kind()
            ))),
        }
    }
}
