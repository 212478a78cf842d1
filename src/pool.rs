//! The worker pool: lifecycle management, request dispatch and response
//! correlation.
//!
//! The pool owns N workers and a map of pending requests keyed by
//! correlation id, each holding a one-shot completion handle. Responses may
//! arrive in any order; the id pairs each one with its caller. A worker
//! thread exiting settles every request still assigned to it with a
//! transport error so callers never hang on a crashed worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::cache::SerializedRouteCache;
use crate::lock;
use crate::error::{Error, Result};
use crate::loader::{ModuleLoader, RenderedPage};
use crate::protocol::{InitPayload, Message, MessageId};
use crate::route::{RouteKey, StaticPath};
use crate::worker::{self, WorkerHandle};

/// Lifecycle state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

struct PendingRequest {
    worker: usize,
    reply: oneshot::Sender<Result<Message>>,
}

struct WorkerSlot {
    handle: WorkerHandle,
    status: Arc<Mutex<WorkerStatus>>,
}

/// Result of the one-time path discovery call
#[derive(Debug, Clone, PartialEq)]
pub struct StaticPathsOutput {
    pub paths: Vec<StaticPath>,
    pub route_cache: SerializedRouteCache,
}

/// A fixed pool of worker threads plus the coordinator-side bookkeeping to
/// talk to them. Must be created inside a tokio runtime.
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    pending: Arc<Mutex<HashMap<MessageId, PendingRequest>>>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
    paths_requested: AtomicBool,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl WorkerPool {
    pub fn new(size: usize, loader: Arc<dyn ModuleLoader>, request_timeout: Duration) -> Self {
        let size = size.max(1);
        let pending: Arc<Mutex<HashMap<MessageId, PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let handle = worker::spawn(index, Arc::clone(&loader), outbound_tx);
            let status = Arc::new(Mutex::new(WorkerStatus::Uninitialized));
            tokio::spawn(drain_responses(
                index,
                outbound_rx,
                Arc::clone(&pending),
                Arc::clone(&status),
            ));
            slots.push(WorkerSlot { handle, status });
        }
        Self {
            slots,
            pending,
            next_id: AtomicU64::new(1),
            cursor: AtomicUsize::new(0),
            paths_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            request_timeout,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn status(&self, index: usize) -> WorkerStatus {
        *lock(&self.slots[index].status)
    }

    pub fn is_ready(&self, index: usize) -> bool {
        self.status(index) == WorkerStatus::Ready
    }

    /// Initialize one worker: send `Init`, await `InitResult`.
    ///
    /// Fails if the worker has left the `Uninitialized` state already, or if
    /// no settlement arrives within the request timeout.
    pub async fn init_worker(&self, index: usize, payload: InitPayload) -> Result<()> {
        {
            let mut status = lock(&self.slots[index].status);
            match *status {
                WorkerStatus::Uninitialized => *status = WorkerStatus::Initializing,
                other => {
                    return Err(Error::InitializationError(format!(
                        "worker {index} cannot be initialized from state {other:?}"
                    )))
                }
            }
        }
        match self
            .request(index, |id| Message::Init { id, payload })
            .await
        {
            Ok(Message::InitResult { .. }) => {
                *lock(&self.slots[index].status) = WorkerStatus::Ready;
                debug!("worker {index} ready");
                Ok(())
            }
            Ok(other) => {
                *lock(&self.slots[index].status) = WorkerStatus::Closed;
                Err(Error::ProtocolError(format!(
                    "expected InitResult from worker {index}, got {}",
                    other.kind()
                )))
            }
            Err(err) => {
                *lock(&self.slots[index].status) = WorkerStatus::Closed;
                Err(err)
            }
        }
    }

    /// Initialize workers 1..N-1 in parallel, each receiving the sealed
    /// route cache so none of them re-runs path discovery.
    pub async fn init_remaining_workers(&self, payload: InitPayload) -> Result<()> {
        let inits: Vec<_> = (1..self.slots.len())
            .map(|index| self.init_worker(index, payload.clone()))
            .collect();
        futures::future::try_join_all(inits).await?;
        Ok(())
    }

    /// Run path discovery on worker 0.
    ///
    /// # Panics
    ///
    /// Panics when called twice, or before `init_worker(0)` has settled
    /// successfully. Both are ordering bugs in the caller, not races.
    pub async fn get_static_paths(&self) -> Result<StaticPathsOutput> {
        assert!(
            !self.paths_requested.swap(true, Ordering::SeqCst),
            "get_static_paths() may only be called once per build"
        );
        assert_eq!(
            self.status(0),
            WorkerStatus::Ready,
            "get_static_paths() requires worker 0 to be ready"
        );
        match self.request(0, |id| Message::GetStaticPaths { id }).await? {
            Message::StaticPathsResult {
                paths, route_cache, ..
            } => Ok(StaticPathsOutput { paths, route_cache }),
            other => Err(Error::ProtocolError(format!(
                "expected StaticPathsResult, got {}",
                other.kind()
            ))),
        }
    }

    /// Render one page on the next ready worker (round-robin).
    pub async fn render(&self, url: String, route_key: RouteKey) -> Result<RenderedPage> {
        let worker = self
            .next_ready_worker()
            .ok_or_else(|| Error::TransportError("no ready workers available".into()))?;
        match self
            .request(worker, |id| Message::Render { id, url, route_key })
            .await?
        {
            Message::RenderResult { page, .. } => Ok(page),
            other => Err(Error::ProtocolError(format!(
                "expected RenderResult, got {}",
                other.kind()
            ))),
        }
    }

    /// Signal every worker to terminate and wait for the threads to finish.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for slot in &self.slots {
            let _ = slot.handle.tx.send(Message::Shutdown);
        }
        for (index, slot) in self.slots.iter().enumerate() {
            let join = lock(&slot.handle.join).take();
            if let Some(join) = join {
                let joined = tokio::task::spawn_blocking(move || join.join())
                    .await
                    .map_err(|e| Error::TransportError(format!("join task failed: {e}")))?;
                if joined.is_err() {
                    warn!("worker {index} panicked during shutdown");
                }
            }
            *lock(&slot.status) = WorkerStatus::Closed;
        }
        debug!("pool closed");
        Ok(())
    }

    /// Dispatch one request and suspend until its settlement arrives.
    async fn request(
        &self,
        worker: usize,
        build: impl FnOnce(MessageId) -> Message,
    ) -> Result<Message> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingRequest {
                worker,
                reply: reply_tx,
            },
        );
        if self.slots[worker].handle.tx.send(build(id)).is_err() {
            lock(&self.pending).remove(&id);
            return Err(Error::TransportError(format!(
                "worker {worker} is no longer accepting messages"
            )));
        }
        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::TransportError(format!(
                "worker {worker} dropped request {id}"
            ))),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(Error::Timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }

    fn next_ready_worker(&self) -> Option<usize> {
        let size = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..size)
            .map(|offset| (start + offset) % size)
            .find(|&index| self.is_ready(index))
    }
}

/// Per-worker response loop: settle pending requests as messages arrive,
/// and reject everything still assigned to the worker if it terminates.
async fn drain_responses(
    index: usize,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    pending: Arc<Mutex<HashMap<MessageId, PendingRequest>>>,
    status: Arc<Mutex<WorkerStatus>>,
) {
    while let Some(message) = outbound_rx.recv().await {
        let Some(id) = message.id() else {
            continue;
        };
        let entry = lock(&pending).remove(&id);
        match entry {
            Some(request) => {
                let result = match message {
                    Message::Error { error, .. } => Err(Error::Worker(error)),
                    other => Ok(other),
                };
                // The caller may have timed out and dropped its receiver.
                let _ = request.reply.send(result);
            }
            None => warn!("worker {index} sent a late or unknown response for request {id}"),
        }
    }

    // Channel closed: the worker thread is gone.
    let stale: Vec<MessageId> = {
        let map = lock(&pending);
        map.iter()
            .filter(|(_, request)| request.worker == index)
            .map(|(id, _)| *id)
            .collect()
    };
    if !stale.is_empty() {
        warn!(
            "worker {index} terminated with {} request(s) in flight",
            stale.len()
        );
    }
    for id in stale {
        if let Some(request) = lock(&pending).remove(&id) {
            let _ = request.reply.send(Err(Error::TransportError(format!(
                "worker {index} terminated before responding to request {id}"
            ))));
        }
    }
    *lock(&status) = WorkerStatus::Closed;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::loader::{FnModule, ModuleRegistry, RenderedPage};
    use crate::route::RouteDefinition;
    use crate::{LogLevel, RuntimeMode};

    const ENTRYPOINT: &str = "dist/server/entry.mjs";

    fn test_loader() -> Arc<ModuleRegistry> {
        let registry = ModuleRegistry::new();
        let module = FnModule::new(|route, request, _, _| {
            if request.url == "/broken" {
                return Err(Error::RenderError("broken page".into()));
            }
            Ok(RenderedPage::html(format!(
                "<h1>{} via {}</h1>",
                request.url, route.component
            )))
        })
        .with_static_paths(|_, _| {
            Ok((1..=3)
                .map(|id| json!({ "params": { "id": id.to_string() } }))
                .collect())
        });
        registry.register(ENTRYPOINT, Arc::new(module));
        Arc::new(registry)
    }

    fn payload(routes: Vec<RouteDefinition>, cache: Option<SerializedRouteCache>) -> InitPayload {
        InitPayload {
            entrypoint: ENTRYPOINT.into(),
            build_settings: serde_json::Value::Null,
            routes,
            runtime_mode: RuntimeMode::Production,
            origin: "http://localhost:3000".into(),
            log_level: LogLevel::Silent,
            generate_fallback_pages: true,
            page_size: 10,
            route_cache: cache,
        }
    }

    fn routes() -> Vec<RouteDefinition> {
        vec![
            RouteDefinition::page("/about", "pages/about"),
            RouteDefinition::page("/blog/[id]", "pages/blog"),
        ]
    }

    fn pool(size: usize) -> WorkerPool {
        WorkerPool::new(size, test_loader(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn worker_lifecycle_states() {
        let pool = pool(2);
        assert_eq!(pool.status(0), WorkerStatus::Uninitialized);
        pool.init_worker(0, payload(routes(), None)).await.unwrap();
        assert_eq!(pool.status(0), WorkerStatus::Ready);
        assert_eq!(pool.status(1), WorkerStatus::Uninitialized);
        pool.close().await.unwrap();
        assert_eq!(pool.status(0), WorkerStatus::Closed);
    }

    #[tokio::test]
    async fn init_twice_is_an_error() {
        let pool = pool(1);
        pool.init_worker(0, payload(routes(), None)).await.unwrap();
        let err = pool.init_worker(0, payload(routes(), None)).await.unwrap_err();
        assert!(matches!(err, Error::InitializationError(_)));
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn init_failure_rejects_and_marks_worker_closed() {
        let registry = ModuleRegistry::new(); // nothing registered
        let pool = WorkerPool::new(1, Arc::new(registry), Duration::from_secs(5));
        let err = pool.init_worker(0, payload(routes(), None)).await.unwrap_err();
        assert!(matches!(err, Error::Worker(_)));
        assert_eq!(pool.status(0), WorkerStatus::Closed);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn discovery_then_hydrated_renders_everywhere() {
        let pool = pool(3);
        pool.init_worker(0, payload(routes(), None)).await.unwrap();
        let output = pool.get_static_paths().await.unwrap();
        assert_eq!(output.paths.len(), 4);
        assert!(!output.route_cache.entries.is_empty());

        assert!(!pool.is_ready(1));
        assert!(!pool.is_ready(2));
        pool.init_remaining_workers(payload(routes(), Some(output.route_cache)))
            .await
            .unwrap();
        assert!(pool.is_ready(1));
        assert!(pool.is_ready(2));

        // Every worker can answer render requests now.
        let blog = &routes()[1];
        for path in output.paths.iter().filter(|p| p.route_key == blog.key()) {
            let page = pool.render(path.pathname.clone(), blog.key()).await.unwrap();
            assert_eq!(page.status, 200);
        }
        pool.close().await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "may only be called once per build")]
    async fn get_static_paths_twice_panics() {
        let pool = pool(1);
        pool.init_worker(0, payload(routes(), None)).await.unwrap();
        pool.get_static_paths().await.unwrap();
        let _ = pool.get_static_paths().await;
    }

    #[tokio::test]
    #[should_panic(expected = "requires worker 0 to be ready")]
    async fn get_static_paths_before_init_panics() {
        let pool = pool(1);
        let _ = pool.get_static_paths().await;
    }

    #[tokio::test]
    async fn render_with_no_ready_workers_is_a_transport_error() {
        let pool = pool(1);
        let err = pool
            .render("/about".into(), routes()[0].key())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportError(_)));
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_renders_correlate_to_their_callers() {
        let pool = pool(2);
        pool.init_worker(0, payload(routes(), None)).await.unwrap();
        let output = pool.get_static_paths().await.unwrap();
        pool.init_remaining_workers(payload(routes(), Some(output.route_cache)))
            .await
            .unwrap();

        let blog_key = routes()[1].key();
        let urls: Vec<String> = (1..=3).map(|id| format!("/blog/{id}")).collect();
        let futures: Vec<_> = urls
            .iter()
            .map(|url| pool.render(url.clone(), blog_key.clone()))
            .collect();
        let pages = futures::future::join_all(futures).await;
        for (url, page) in urls.iter().zip(pages) {
            let body = String::from_utf8(page.unwrap().body.unwrap()).unwrap();
            assert!(body.contains(url.as_str()), "body should echo {url}");
        }
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn render_error_is_isolated_to_its_request() {
        let pool = pool(2);
        pool.init_worker(0, payload(routes(), None)).await.unwrap();
        let output = pool.get_static_paths().await.unwrap();
        pool.init_remaining_workers(payload(routes(), Some(output.route_cache)))
            .await
            .unwrap();

        let about_key = routes()[0].key();
        let (broken, ok) = tokio::join!(
            pool.render("/broken".into(), about_key.clone()),
            pool.render("/about".into(), about_key.clone()),
        );
        let err = broken.unwrap_err();
        assert!(matches!(err, Error::Worker(ref wire) if wire.name == "RenderError"));
        assert_eq!(ok.unwrap().status, 200);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn module_panic_becomes_an_error_message() {
        let registry = ModuleRegistry::new();
        registry.register(
            ENTRYPOINT,
            Arc::new(FnModule::new(|_, request, _, _| {
                if request.url == "/panic" {
                    panic!("render blew up");
                }
                Ok(RenderedPage::html("ok"))
            })),
        );
        let pool = WorkerPool::new(1, Arc::new(registry), Duration::from_secs(5));
        let only_static = vec![RouteDefinition::page("/about", "pages/about")];
        pool.init_worker(0, payload(only_static.clone(), None))
            .await
            .unwrap();
        let output = pool.get_static_paths().await.unwrap();
        assert_eq!(output.paths.len(), 1);

        let key = only_static[0].key();
        let err = pool.render("/panic".into(), key.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Worker(ref wire) if wire.name == "Panic"));
        // The worker survives the panic and keeps serving.
        let page = pool.render("/about".into(), key).await.unwrap();
        assert_eq!(page.status, 200);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pool = pool(2);
        pool.init_worker(0, payload(routes(), None)).await.unwrap();
        pool.close().await.unwrap();
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn worker_termination_settles_in_flight_requests() {
        let pending: Arc<Mutex<HashMap<MessageId, PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let status = Arc::new(Mutex::new(WorkerStatus::Ready));
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&pending).insert(
            7,
            PendingRequest {
                worker: 0,
                reply: reply_tx,
            },
        );
        // A request assigned to another worker must be left alone.
        let (other_tx, mut other_rx) = oneshot::channel();
        lock(&pending).insert(
            8,
            PendingRequest {
                worker: 1,
                reply: other_tx,
            },
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        drop(outbound_tx); // the worker thread is gone
        drain_responses(0, outbound_rx, Arc::clone(&pending), Arc::clone(&status)).await;

        let err = reply_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::TransportError(_)));
        assert_eq!(*lock(&status), WorkerStatus::Closed);
        assert!(lock(&pending).contains_key(&8));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hung_render_settles_with_a_timeout() {
        let registry = ModuleRegistry::new();
        registry.register(
            ENTRYPOINT,
            Arc::new(FnModule::new(|_, request, _, _| {
                if request.url == "/slow" {
                    std::thread::sleep(Duration::from_millis(500));
                }
                Ok(RenderedPage::html("ok"))
            })),
        );
        let pool = WorkerPool::new(1, Arc::new(registry), Duration::from_millis(100));
        let only_static = vec![RouteDefinition::page("/about", "pages/about")];
        pool.init_worker(0, payload(only_static.clone(), None))
            .await
            .unwrap();
        pool.get_static_paths().await.unwrap();

        let err = pool
            .render("/slow".into(), only_static[0].key())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(100)));
        // Once the worker finishes its sleep it keeps serving.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let page = pool
            .render("/about".into(), only_static[0].key())
            .await
            .unwrap();
        assert_eq!(page.status, 200);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_route_key_is_a_protocol_error() {
        let pool = pool(1);
        pool.init_worker(0, payload(routes(), None)).await.unwrap();
        pool.get_static_paths().await.unwrap();
        let err = pool
            .render("/about".into(), "not-a-real-key".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Worker(ref wire) if wire.name == "ProtocolError"));
        pool.close().await.unwrap();
    }
}
