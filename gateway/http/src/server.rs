//! Shared HTTP listeners for webhook sources.
//!
//! Several sources may listen on the same port as long as their paths differ.
//! The first route registered on a port opens the listener; dropping the last
//! route on a port shuts it down.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use futures_util::Stream;
use gateway_core::adapter::RawMessage;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Default address listeners bind to.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
/// Default number of requests buffered per route before callers wait.
pub const DEFAULT_ROUTE_BUFFER: usize = 64;
/// Time a closing listener gets to finish in-flight requests before a new
/// listener on the same port takes over.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Route {path} is already registered on port {port}")]
    RouteTaken { port: u16, path: String },
    #[error("Error binding port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

type Routes = Arc<RwLock<HashMap<String, RouteEntry>>>;

#[derive(Debug, Clone)]
struct RouteEntry {
    token: u64,
    method: Method,
    tx: mpsc::Sender<RawMessage>,
}

#[derive(Debug)]
struct Listener {
    routes: Routes,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Ports {
    listeners: HashMap<u16, Listener>,
    closing: HashMap<u16, JoinHandle<()>>,
}

/// Registry of listeners keyed by port.
#[derive(Debug, Clone)]
pub struct PortRegistry {
    state: Arc<Mutex<Ports>>,
    next_token: Arc<AtomicU64>,
    bind_host: String,
    buffer: usize,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<Ports>) -> MutexGuard<'_, Ports> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(Ports::default())),
            next_token: Arc::new(AtomicU64::new(0)),
            bind_host: DEFAULT_BIND_HOST.to_string(),
            buffer: DEFAULT_ROUTE_BUFFER,
        }
    }

    /// Sets the address listeners bind to.
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Sets the per-route request buffer.
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Ports with an open listener, sorted.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = lock(&self.state).listeners.keys().copied().collect();
        ports.sort();
        ports
    }

    /// Registers `path` on `port` and returns the stream of requests it receives.
    ///
    /// Opens the port's listener if this is its first route.
    #[tracing::instrument(skip(self), name = "http.register")]
    pub async fn register(&self, port: u16, path: &str, method: Method) -> Result<Route, Error> {
        // A listener still shutting down holds the port; wait for it first.
        let closing = lock(&self.state).closing.remove(&port);
        if let Some(mut handle) = closing {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                warn!(port, "Listener did not close in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let entry = RouteEntry { token, method, tx };

        let mut state = lock(&self.state);
        let routes = match state.listeners.get(&port) {
            Some(listener) => Arc::clone(&listener.routes),
            None => {
                let listener = self.open(port)?;
                let routes = Arc::clone(&listener.routes);
                state.listeners.insert(port, listener);
                routes
            }
        };

        {
            let mut routes = routes.write().unwrap_or_else(|p| p.into_inner());
            if routes.contains_key(path) {
                return Err(Error::RouteTaken {
                    port,
                    path: path.to_string(),
                });
            }
            routes.insert(path.to_string(), entry);
        }
        info!(port, path, "Registered HTTP route");

        Ok(Route {
            port,
            path: path.to_string(),
            token,
            rx: ReceiverStream::new(rx),
            state: Arc::clone(&self.state),
        })
    }

    /// Binds the port and spawns its server.
    fn open(&self, port: u16) -> Result<Listener, Error> {
        let bind = |source| Error::Bind { port, source };
        let std_listener =
            std::net::TcpListener::bind((self.bind_host.as_str(), port)).map_err(bind)?;
        std_listener.set_nonblocking(true).map_err(bind)?;
        let listener = tokio::net::TcpListener::from_std(std_listener).map_err(bind)?;

        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let router = Router::new()
            .fallback(handle_request)
            .with_state(Arc::clone(&routes));
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!(port, error = %e, "HTTP listener failed");
            }
            debug!(port, "HTTP listener closed");
        });
        info!(port, host = %self.bind_host, "Opened HTTP listener");

        Ok(Listener {
            routes,
            shutdown,
            handle,
        })
    }
}

/// Routes a request to the source registered for its path.
async fn handle_request(
    State(routes): State<Routes>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let entry = routes
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .get(uri.path())
        .cloned();
    let Some(entry) = entry else {
        return StatusCode::NOT_FOUND;
    };
    if method != entry.method {
        return StatusCode::METHOD_NOT_ALLOWED;
    }

    let mut message = RawMessage::new(body);
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    {
        message = message.content_type(content_type);
    }

    match entry.tx.send(message).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Registration of one path on one port.
///
/// Yields the requests received on the path. Dropping the route releases the
/// path and, if it was the port's last route, closes the listener.
#[derive(Debug)]
pub struct Route {
    port: u16,
    path: String,
    token: u64,
    rx: ReceiverStream<RawMessage>,
    state: Arc<Mutex<Ports>>,
}

impl Route {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Stream for Route {
    type Item = RawMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Route {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        let Some(listener) = state.listeners.get(&self.port) else {
            return;
        };

        let empty = {
            let mut routes = listener.routes.write().unwrap_or_else(|p| p.into_inner());
            // A newer registration of the same path is not ours to remove.
            if routes.get(&self.path).map(|entry| entry.token) == Some(self.token) {
                routes.remove(&self.path);
            }
            routes.is_empty()
        };
        debug!(port = self.port, path = %self.path, "Released HTTP route");

        if empty {
            if let Some(listener) = state.listeners.remove(&self.port) {
                let _ = listener.shutdown.send(());
                state.closing.insert(self.port, listener.handle);
                info!(port = self.port, "Closing HTTP listener");
            }
        }
    }
}
