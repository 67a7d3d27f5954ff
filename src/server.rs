//! HTTP listener and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! On [`ServerHandle::shutdown`] the server:
//! 1. Immediately stops `listener.accept()`, so no new connections are made.
//! 2. Asks every open connection to finish its in-flight request and close.
//! 3. Returns from [`Server::serve`] once all connection tasks are gone.
//!
//! The caller bounds step 2 with a deadline. Expiry is reported as an
//! error; lingering connections are not force-closed.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::{DeadlineExceeded, Result};
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// Smallest HTTP/1 read buffer hyper accepts.
const MIN_BUF_SIZE: usize = 8192;

/// Listener settings.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    /// Time allowed to receive request headers (and the TLS handshake).
    pub read_timeout: Duration,
    /// Time allowed to produce a response. Zero disables the limit.
    pub write_timeout: Duration,
    /// HTTP/2 keep-alive ping interval.
    pub idle_timeout: Duration,
    pub max_header_size: usize,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl ServerSettings {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            max_header_size: 1 << 20,
            tls: None,
        }
    }
}

struct State {
    shutdown: watch::Sender<bool>,
    bound: watch::Sender<Option<SocketAddr>>,
    done: watch::Sender<bool>,
    connections: AtomicUsize,
}

/// The HTTP server.
pub struct Server {
    settings: ServerSettings,
    state: Arc<State>,
}

/// Controls a running [`Server`] from another task.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<State>,
}

impl Server {
    pub fn new(settings: ServerSettings) -> Self {
        let state = State {
            shutdown: watch::Sender::new(false),
            bound: watch::Sender::new(None),
            done: watch::Sender::new(false),
            connections: AtomicUsize::new(0),
        };
        Self { settings, state: Arc::new(state) }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle { state: Arc::clone(&self.state) }
    }

    /// Binds, then accepts connections and dispatches them through `router`.
    ///
    /// Returns after [`ServerHandle::shutdown`] once every connection task
    /// has finished, or immediately if binding fails.
    pub async fn serve(self, router: Router) -> Result<()> {
        let result = self.run(router).await;
        self.state.done.send_replace(true);
        result
    }

    async fn run(&self, router: Router) -> Result<()> {
        let listener = TcpListener::bind(self.settings.addr).await?;
        let local_addr = listener.local_addr()?;
        self.state.bound.send_replace(Some(local_addr));

        let router = Arc::new(router);
        let tls = self.settings.tls.clone().map(TlsAcceptor::from);
        let settings = Arc::new(self.settings.clone());

        info!(addr = %local_addr, tls = tls.is_some(), "listening");

        let mut tasks = tokio::task::JoinSet::new();
        let mut shutdown = self.state.shutdown.subscribe();

        loop {
            tokio::select! {
                // Check shutdown first so a signal stops accepting even if
                // more connections are queued.
                biased;

                _ = shutdown.wait_for(|stop| *stop) => {
                    info!(in_flight = tasks.len(), "shutdown requested, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let settings = Arc::clone(&settings);
                    let tls = tls.clone();
                    let state = Arc::clone(&self.state);
                    let guard = ConnectionGuard::acquire(&state);

                    tasks.spawn(async move {
                        let _guard = guard;
                        let Some(acceptor) = tls else {
                            serve_connection(stream, remote_addr, router, &settings, &state).await;
                            return;
                        };
                        match tokio::time::timeout(settings.read_timeout, acceptor.accept(stream)).await {
                            Ok(Ok(stream)) => {
                                serve_connection(stream, remote_addr, router, &settings, &state).await;
                            }
                            Ok(Err(e)) => debug!(peer = %remote_addr, "tls handshake failed: {e}"),
                            Err(_) => debug!(peer = %remote_addr, "tls handshake timed out"),
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        while tasks.join_next().await.is_some() {}

        info!("server stopped");
        Ok(())
    }
}

impl ServerHandle {
    /// Address the listener bound to, once it has.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.state.bound.borrow()
    }

    /// Waits until the listener is bound. `None` if the server stopped
    /// without binding.
    pub async fn bound(&self) -> Option<SocketAddr> {
        let mut bound = self.state.bound.subscribe();
        let mut done = self.state.done.subscribe();
        tokio::select! {
            res = bound.wait_for(Option::is_some) => res.ok().and_then(|addr| *addr),
            _ = done.wait_for(|d| *d) => self.local_addr(),
        }
    }

    /// Stops accepting, asks open connections to close once idle, and
    /// waits for them until `deadline`.
    pub async fn shutdown(&self, deadline: Instant) -> std::result::Result<(), DeadlineExceeded> {
        self.state.shutdown.send_replace(true);
        let mut done = self.state.done.subscribe();
        match tokio::time::timeout_at(deadline, done.wait_for(|d| *d)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(DeadlineExceeded { in_flight: self.state.connections.load(Ordering::SeqCst) }),
        }
    }
}

/// Counts an open connection until dropped.
struct ConnectionGuard(Arc<State>);

impl ConnectionGuard {
    fn acquire(state: &Arc<State>) -> Self {
        state.connections.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_connection<I>(
    io: I,
    remote_addr: SocketAddr,
    router: Arc<Router>,
    settings: &ServerSettings,
    state: &State,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let write_timeout = settings.write_timeout;
    // The closure is called once per request on the connection.
    let svc = service_fn(move |req| {
        let router = Arc::clone(&router);
        async move { dispatch(router, req, remote_addr, write_timeout).await }
    });

    // `auto::Builder` handles both HTTP/1.1 and HTTP/2, whatever the client
    // negotiates.
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.read_timeout)
        .max_buf_size(settings.max_header_size.max(MIN_BUF_SIZE));
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(settings.idle_timeout)
        .max_header_list_size(u32::try_from(settings.max_header_size).unwrap_or(u32::MAX));

    let conn = builder.serve_connection(TokioIo::new(io), svc);
    tokio::pin!(conn);

    let mut shutdown = state.shutdown.subscribe();
    let mut closing = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(peer = %remote_addr, "connection error: {e}");
                }
                break;
            }
            _ = shutdown.wait_for(|stop| *stop), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Buffers one request, runs it through the router and bounds the time
/// spent producing the response.
///
/// The error type is [`Infallible`]: failures become HTTP responses so
/// hyper never sees an error.
async fn dispatch(
    router: Arc<Router>,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
    write_timeout: Duration,
) -> std::result::Result<http::Response<Full<Bytes>>, Infallible> {
    let req = match Request::from_hyper(req, remote_addr).await {
        Ok(req) => req,
        Err(e) => {
            debug!(peer = %remote_addr, "reading request body: {e}");
            return Ok(Response::status(StatusCode::BAD_REQUEST).into_inner());
        }
    };

    let fut = router.call(req);
    let response = if write_timeout.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(write_timeout, fut).await {
            Ok(res) => res,
            Err(_) => {
                warn!(peer = %remote_addr, ?write_timeout, "response not produced within write timeout");
                Response::status(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    };
    Ok(response.into_inner())
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by `kubectl` and the
/// Kubernetes control plane) and **SIGINT** (Ctrl-C, for local dev).
/// On Windows only Ctrl-C is available. A handler that cannot be installed
/// is logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` is a future that never resolves, so on non-Unix platforms
    // the SIGTERM arm is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
