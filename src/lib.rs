//! # tsu-bootstrap
//!
//! Bootstrap for HTTP services: one options value in, a running service
//! with configuration, structured logging, tracing, metrics, probes and
//! graceful shutdown out.
//!
//! ## What it wires
//!
//! - Layered configuration (defaults, file, environment, overrides) with an
//!   optional masked view at `/internal/config`
//! - A leveled logger, adjustable at runtime via `/internal/logging`
//! - Middleware in four categories (Core, Security, Application,
//!   Observability) whose order is configurable and validated
//! - Per-category path exclusions (`/internal/*`, `/metrics` by default)
//! - Liveness, readiness and startup probes under `/internal`
//! - A hyper listener with header, write and idle timeouts, optional TLS
//!   and a shutdown bounded by a deadline
//!
//! Routing is a radix tree per method via [`matchit`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsu_bootstrap::{Dependencies, Method, Request, Response, Service, ServiceOptions, shutdown_signal};
//!
//! #[tokio::main]
//! async fn main() -> tsu_bootstrap::Result<()> {
//!     let mut service = Service::new(ServiceOptions::new("users"), Dependencies::default())?;
//!     service.router_mut().route(Method::Get, "/users/{id}", get_user)?;
//!
//!     let service = Arc::new(service);
//!     let running = tokio::spawn({
//!         let service = Arc::clone(&service);
//!         async move { service.start().await }
//!     });
//!
//!     shutdown_signal().await;
//!     service.shutdown().await?;
//!     # let _ = running.await;
//!     Ok(())
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//! ```

pub mod config;
mod error;
mod handler;
pub mod logging;
pub mod matcher;
mod method;
pub mod metrics;
pub mod middleware;
pub mod probe;
mod request;
mod response;
mod router;
mod server;
mod service;
pub mod tls;
pub mod tracer;

pub use error::{BoxError, DeadlineExceeded, Error, Result, ShutdownError};
pub use handler::{BoxFuture, BoxedHandler, Handler};
pub use method::Method;
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::{MatchedPath, Router};
pub use server::{Server, ServerHandle, ServerSettings, shutdown_signal};
pub use service::{
    DEFAULT_EXCLUSIONS, Dependencies, PreStartHook, ServeHook, ServerConfig, ServerOptions, Service,
    ServiceOptions, ShutdownHook, TlsOptions, TransportHooks,
};

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
