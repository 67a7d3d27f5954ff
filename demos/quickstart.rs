//! A bootstrapped service with one application route, Prometheus metrics
//! and the internal endpoints switched on.
//!
//! Run with:
//!   cargo run --example quickstart
//!
//! Try:
//!   curl http://localhost:8080/orders/42
//!   curl http://localhost:8080/internal/health
//!   curl http://localhost:8080/internal/config
//!   curl -X PUT http://localhost:8080/internal/logging -d '{"level":"debug"}'
//!   curl http://localhost:8080/metrics
//!
//! Override the port with `QUICKSTART_SERVER_HTTP_PORT=9000`.

use std::sync::Arc;

use serde_json::Value;
use tsu_bootstrap::logging::{self, Level, TracingLoggerFactory};
use tsu_bootstrap::metrics::PrometheusFactory;
use tsu_bootstrap::middleware::{MiddlewareCategory, MiddlewareOrdering, from_fn};
use tsu_bootstrap::{Dependencies, Method, Request, Response, Service, ServiceOptions, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), tsu_bootstrap::BoxError> {
    let filter = logging::init_subscriber(Level::Info)?;

    let ordering = MiddlewareOrdering::new([
        MiddlewareCategory::Core,
        MiddlewareCategory::Security,
        MiddlewareCategory::Observability,
        MiddlewareCategory::Application,
    ])
    .with(
        MiddlewareCategory::Security,
        from_fn(|req, next| async move {
            let mut res = next.run(req).await;
            res.headers_mut().insert("x-content-type-options", http::HeaderValue::from_static("nosniff"));
            res
        }),
    );

    let options = ServiceOptions {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        enable_config_viewer: true,
        enable_log_config: true,
        middleware_ordering: Some(ordering),
        config_defaults: [("database.password".to_owned(), Value::from("change-me"))].into(),
        ..ServiceOptions::new("quickstart")
    };
    let deps = Dependencies {
        logger: Arc::new(TracingLoggerFactory::with_filter(filter)),
        metrics: Some(Arc::new(PrometheusFactory)),
        ..Dependencies::default()
    };

    let mut service = Service::new(options, deps)?;
    service.router_mut().route(Method::Get, "/orders/{id}", get_order)?;

    let service = Arc::new(service);
    let running = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.start().await }
    });

    tokio::select! {
        res = running => return Ok(res??),
        _ = shutdown_signal() => {}
    }
    service.shutdown().await?;
    Ok(())
}

async fn get_order(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}","status":"shipped"}}"#))
}
