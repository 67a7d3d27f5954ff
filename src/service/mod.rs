//! Service lifecycle: construction, start and bounded graceful shutdown.
//!
//! ```text
//! New ──Service::new──▶ Initialized ──start──▶ Running ──shutdown──▶ Stopped
//! ```
//!
//! [`Service::new`] validates the options and builds every collaborator
//! and the router up front; a failure returns an error and no service.
//! [`Service::start`] blocks until the listener closes, so it is usually
//! spawned, with [`Service::shutdown`] called from the signal handler.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsu_bootstrap::{Dependencies, Service, ServiceOptions, shutdown_signal};
//!
//! # async fn run() -> tsu_bootstrap::Result<()> {
//! let service = Arc::new(Service::new(ServiceOptions::new("orders"), Dependencies::default())?);
//! let running = tokio::spawn({
//!     let service = Arc::clone(&service);
//!     async move { service.start().await }
//! });
//!
//! shutdown_signal().await;
//! service.shutdown().await?;
//! # let _ = running.await;
//! # Ok(())
//! # }
//! ```

mod init;
mod options;

pub use options::{DEFAULT_EXCLUSIONS, PreStartHook, ServerOptions, ServiceOptions, TlsOptions};

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{ConfigFactory, ConfigHandle, MemoryStoreFactory, Store};
use crate::error::{BoxError, Error, Result, ShutdownError};
use crate::fields;
use crate::handler::BoxFuture;
use crate::logging::{Logger, LoggerFactory, LoggerHandle, TracingLoggerFactory};
use crate::metrics::{MetricsCollector, MetricsFactory};
use crate::router::Router;
use crate::server::{Server, ServerHandle, ServerSettings};
use crate::tls::{self, TlsVersion};
use crate::tracer::{TracerFactory, TracingProvider};

/// Replaces the listener's serve step.
pub type ServeHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Replaces the listener's shutdown step. Receives the effective deadline.
pub type ShutdownHook = Arc<dyn Fn(Instant) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Optional overrides of the transport, for tests and custom listeners.
#[derive(Clone, Default)]
pub struct TransportHooks {
    pub serve: Option<ServeHook>,
    pub shutdown: Option<ShutdownHook>,
}

/// Collaborator factories, chosen by the composition root.
#[derive(Clone)]
pub struct Dependencies {
    pub config: Arc<dyn ConfigFactory>,
    pub logger: Arc<dyn LoggerFactory>,
    /// Required when a tracing endpoint is configured.
    pub tracer: Option<Arc<dyn TracerFactory>>,
    pub metrics: Option<Arc<dyn MetricsFactory>>,
    pub hooks: TransportHooks,
}

impl Default for Dependencies {
    /// In-memory config store and `tracing` logger; no tracer, no metrics.
    fn default() -> Self {
        Self {
            config: Arc::new(MemoryStoreFactory),
            logger: Arc::new(TracingLoggerFactory::default()),
            tracer: None,
            metrics: None,
            hooks: TransportHooks::default(),
        }
    }
}

/// Listener configuration read from the store on every start and shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_header_size: usize,
    pub shutdown_timeout: Duration,
    pub tls_enabled: bool,
    pub tls_cert_file: String,
    pub tls_key_file: String,
}

impl ServerConfig {
    /// Reads `server.http.*` and `server.tls.*`. Only the port is required.
    pub fn load(store: &dyn Store) -> Result<Self> {
        let port = store
            .get_int("server.http.port")
            .ok_or_else(|| Error::Configuration("server port not configured".into()))?;
        let port = u16::try_from(port)
            .map_err(|_| Error::Configuration(format!("server port out of range: {port}")))?;

        let tls_enabled = store.get_bool("server.tls.enabled").unwrap_or(false);
        let (tls_cert_file, tls_key_file) = if tls_enabled {
            (
                store.get_string("server.tls.cert_file").unwrap_or_default(),
                store.get_string("server.tls.key_file").unwrap_or_default(),
            )
        } else {
            Default::default()
        };

        Ok(Self {
            port,
            read_timeout: store.get_duration("server.http.read_timeout").unwrap_or(Duration::from_secs(15)),
            write_timeout: store.get_duration("server.http.write_timeout").unwrap_or(Duration::from_secs(15)),
            idle_timeout: store.get_duration("server.http.idle_timeout").unwrap_or(Duration::from_secs(60)),
            max_header_size: store
                .get_int("server.http.max_header_size")
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(1 << 20),
            shutdown_timeout: store
                .get_duration("server.http.shutdown_timeout")
                .unwrap_or(Duration::from_secs(15)),
            tls_enabled,
            tls_cert_file,
            tls_key_file,
        })
    }
}

/// A bootstrapped HTTP service.
pub struct Service {
    config: ConfigHandle,
    logger: LoggerHandle,
    tracer: Option<Arc<dyn TracingProvider>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    router: Router,
    hooks: TransportHooks,
    pre_start: Option<PreStartHook>,
    tls_min_version: Option<TlsVersion>,
    server: Mutex<Option<ServerHandle>>,
}

impl Service {
    /// Validates `options` and builds the config store, logger, tracer,
    /// metrics collector and router, in that order.
    ///
    /// Errors name the failing stage (e.g. `creating logger: ...`).
    pub fn new(options: ServiceOptions, deps: Dependencies) -> Result<Self> {
        let started_at = (std::time::Instant::now(), Utc::now());
        let resolved = options.resolve()?;

        let config = init::config(&options, &resolved, &deps)?;
        let logger = init::logger(&options, &resolved, &deps)?;
        let tracer = init::tracer(&options, &resolved, &deps)?;
        let metrics = init::metrics(&options, &deps)?;
        let router = init::router(
            &options,
            &resolved,
            init::RouterParts {
                config: &config,
                logger: &logger,
                tracer: tracer.as_ref(),
                metrics: metrics.as_ref(),
                started_at,
            },
        )?;

        Ok(Self {
            config,
            logger,
            tracer,
            metrics,
            router,
            hooks: deps.hooks,
            pre_start: options.server.pre_start.clone(),
            tls_min_version: options.server.tls.as_ref().and_then(|t| t.min_version),
            server: Mutex::new(None),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Add application routes here before calling [`Service::start`].
    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn config(&self) -> &Arc<dyn Store> {
        &self.config.store
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger.logger
    }

    pub fn tracer(&self) -> Option<&Arc<dyn TracingProvider>> {
        self.tracer.as_ref()
    }

    pub fn metrics(&self) -> Option<&Arc<dyn MetricsCollector>> {
        self.metrics.as_ref()
    }

    /// Address of the running listener, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().and_then(ServerHandle::local_addr)
    }

    pub fn load_server_config(&self) -> Result<ServerConfig> {
        ServerConfig::load(self.config.store.as_ref())
    }

    /// Serves until [`Service::shutdown`] closes the listener.
    ///
    /// Fails before binding if the port is not configured, the TLS files
    /// cannot be loaded or the pre-start hook rejects the settings.
    pub async fn start(&self) -> Result<()> {
        let cfg = self.load_server_config()?;

        let mut settings = ServerSettings {
            addr: SocketAddr::from(([0, 0, 0, 0], cfg.port)),
            read_timeout: cfg.read_timeout,
            write_timeout: cfg.write_timeout,
            idle_timeout: cfg.idle_timeout,
            max_header_size: cfg.max_header_size,
            tls: None,
        };
        if cfg.tls_enabled {
            if cfg.tls_cert_file.is_empty() || cfg.tls_key_file.is_empty() {
                return Err(Error::Tls("tls enabled but cert_file or key_file is not configured".into()));
            }
            settings.tls = Some(tls::load_server_config(
                Path::new(&cfg.tls_cert_file),
                Path::new(&cfg.tls_key_file),
                self.tls_min_version,
            )?);
        }
        if let Some(hook) = &self.pre_start {
            hook(&mut settings).map_err(|e| Error::construction("running pre-start hook", e))?;
        }

        self.logger.logger.info_with(
            "Starting server",
            fields! {
                "address" => settings.addr.to_string(),
                "tls_enabled" => cfg.tls_enabled,
                "tls_cert" => cfg.tls_cert_file,
                "tls_key" => cfg.tls_key_file,
            },
        );

        if let Some(serve) = &self.hooks.serve {
            return serve().await.map_err(Error::Serve);
        }

        let server = Server::new(settings);
        *self.server.lock() = Some(server.handle());
        server.serve(self.router.clone()).await
    }

    /// Graceful shutdown bounded by the configured shutdown timeout.
    ///
    /// Every failure is an [`Error::Shutdown`]. A server config that cannot
    /// be read is reported as [`ShutdownError::Transport`].
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with(None).await
    }

    /// Graceful shutdown bounded by whichever comes first: `deadline` or
    /// the configured shutdown timeout.
    pub async fn shutdown_by(&self, deadline: Instant) -> Result<()> {
        self.shutdown_with(Some(deadline)).await
    }

    async fn shutdown_with(&self, parent: Option<Instant>) -> Result<()> {
        let logger = &self.logger.logger;
        logger.info("Starting graceful shutdown");

        let cfg = self.load_server_config().map_err(|e| {
            logger.error_with("Shutdown error", fields! { "error" => e.to_string() });
            ShutdownError::Transport(Box::new(e))
        })?;
        let bounded = Instant::now() + cfg.shutdown_timeout;
        let deadline = parent.map_or(bounded, |p| p.min(bounded));

        let transport = match &self.hooks.shutdown {
            Some(hook) => hook(deadline).await,
            None => {
                let handle = self.server.lock().clone();
                let Some(handle) = handle else {
                    return Err(ShutdownError::NotStarted.into());
                };
                handle.shutdown(deadline).await.map_err(BoxError::from)
            }
        };
        if let Err(e) = transport {
            logger.error_with("Shutdown error", fields! { "error" => e.to_string() });
            return Err(ShutdownError::Transport(e).into());
        }

        if let Some(tracer) = &self.tracer {
            let flushed = match tokio::time::timeout_at(deadline, tracer.shutdown(deadline)).await {
                Ok(res) => res,
                Err(_) => Err("deadline exceeded".into()),
            };
            if let Err(e) = flushed {
                logger.error_with("Tracer shutdown error", fields! { "error" => e.to_string() });
                return Err(ShutdownError::Tracer(e).into());
            }
        }

        if let Some(metrics) = &self.metrics {
            if let Err(e) = metrics.close() {
                logger.warn_with("Metrics close error", fields! { "error" => e.to_string() });
            }
        }

        logger.info("Server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::Value;

    use super::*;
    use crate::config::MemoryStore;
    use crate::request::Request;

    fn service(options: ServiceOptions, deps: Dependencies) -> Service {
        Service::new(options, deps).unwrap()
    }

    #[test]
    fn server_config_defaults_and_port_checks() {
        let store = MemoryStore::new(&Default::default());
        let err = ServerConfig::load(&store).unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m == "server port not configured"));

        store.set("server.http.port", Value::from(70000));
        assert!(matches!(ServerConfig::load(&store), Err(Error::Configuration(_))));

        store.set("server.http.port", Value::from(8081));
        store.set("server.tls.cert_file", Value::from("ignored.pem"));
        let cfg = ServerConfig::load(&store).unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.read_timeout, Duration::from_secs(15));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_header_size, 1 << 20);
        assert!(!cfg.tls_enabled);
        assert!(cfg.tls_cert_file.is_empty());
    }

    #[test]
    fn options_are_seeded_into_the_store() {
        let mut opts = ServiceOptions::new("seeded");
        opts.server.port = 9123;
        let svc = service(opts, Dependencies::default());
        assert_eq!(svc.config().get_int("server.http.port"), Some(9123));
        assert_eq!(svc.load_server_config().unwrap().shutdown_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn internal_endpoints_are_mounted() {
        let opts = ServiceOptions {
            enable_config_viewer: true,
            enable_log_config: true,
            config_defaults: [("database.password".to_owned(), Value::from("hunter2"))].into(),
            ..ServiceOptions::new("mounted")
        };
        let svc = service(opts, Dependencies::default());
        let call = |path: &str| svc.router().call(Request::new(http::Method::GET, path));

        let health: Value = serde_json::from_slice(call("/internal/health").await.body()).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["details"]["version"], "dev");

        let ready: Value = serde_json::from_slice(call("/internal/ready").await.body()).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ready["details"]["startup_time"].as_str().unwrap()).is_ok());

        let config: Value = serde_json::from_slice(call("/internal/config").await.body()).unwrap();
        assert_eq!(config["database"]["password"], "******");

        let level = call("/internal/logging").await;
        assert_eq!(level.body(), br#"{"level":"info"}"#);

        assert_eq!(call("/metrics").await.status_code(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn viewer_and_level_endpoints_are_opt_in() {
        let svc = service(ServiceOptions::new("plain"), Dependencies::default());
        let res = svc.router().call(Request::new(http::Method::GET, "/internal/config")).await;
        assert_eq!(res.status_code(), http::StatusCode::NOT_FOUND);
        let res = svc.router().call(Request::new(http::Method::GET, "/internal/logging")).await;
        assert_eq!(res.status_code(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_before_start_is_reported() {
        let svc = service(ServiceOptions::new("idle"), Dependencies::default());
        let err = svc.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown(ShutdownError::NotStarted)));
    }

    #[tokio::test]
    async fn serve_hook_replaces_listener() {
        let served = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&served);
        let deps = Dependencies {
            hooks: TransportHooks {
                serve: Some(Arc::new(move || -> BoxFuture<'static, Result<(), BoxError>> {
                    let flag = Arc::clone(&flag);
                    Box::pin(async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                })),
                shutdown: None,
            },
            ..Dependencies::default()
        };
        let svc = service(ServiceOptions::new("hooked"), deps);
        svc.start().await.unwrap();
        assert!(served.load(Ordering::SeqCst));
        assert_eq!(svc.local_addr(), None);
    }

    #[tokio::test]
    async fn tls_without_files_fails_before_binding() {
        let mut opts = ServiceOptions::new("tls");
        opts.server.tls = Some(TlsOptions::default());
        let svc = service(opts, Dependencies::default());
        assert!(matches!(svc.start().await, Err(Error::Tls(_))));
        assert_eq!(svc.local_addr(), None);
    }
}
