//! Built-in middleware of the Observability category.
//!
//! Each layer checks its own [`ExclusionList`] independently, so a path
//! can be traced but not logged (or the reverse).

use std::sync::Arc;
use std::time::Instant;

use tracing::{Instrument, info_span};

use super::base::RequestId;
use super::{Middleware, from_fn};
use crate::fields;
use crate::logging::{LogContext, Logger};
use crate::matcher::ExclusionList;
use crate::metrics::MetricsCollector;
use crate::router::MatchedPath;
use crate::tracer::TracingProvider;

/// Opens a span named `"<service>.http <METHOD> <path>"` around the rest
/// of the chain. Skipped for excluded paths and while the provider reports
/// itself disabled.
pub fn tracing(
    service_name: &str,
    provider: Arc<dyn TracingProvider>,
    exclusions: ExclusionList,
) -> Middleware {
    let service_name: Arc<str> = Arc::from(service_name);
    let exclusions = Arc::new(exclusions);
    from_fn(move |req, next| {
        let skip = !provider.is_enabled() || exclusions.matches(req.path());
        let service_name = Arc::clone(&service_name);
        async move {
            if skip {
                return next.run(req).await;
            }
            let span = info_span!(
                "http.request",
                otel.name = %format!("{service_name}.http {} {}", req.method(), req.path()),
                http.method = %req.method(),
                http.target = %req.path(),
                http.status_code = tracing::field::Empty,
            );
            let res = next.run(req).instrument(span.clone()).await;
            span.record("http.status_code", res.status_code().as_u16());
            res
        }
    })
}

/// Logs one `"HTTP Request"` record per request with method, path, status,
/// duration, body size and request id.
pub fn logging(logger: Arc<dyn Logger>, exclusions: ExclusionList) -> Middleware {
    let exclusions = Arc::new(exclusions);
    from_fn(move |req, next| {
        let skip = exclusions.matches(req.path());
        let logger = Arc::clone(&logger);
        async move {
            if skip {
                return next.run(req).await;
            }
            let start = Instant::now();
            let method = req.method().to_string();
            let path = req.path().to_owned();
            let mut ctx = LogContext::current();
            if let Some(RequestId(id)) = req.extensions().get::<RequestId>() {
                ctx = ctx.with_request_id(id.clone());
            }

            let res = next.run(req).await;

            logger.with_context(&ctx).info_with(
                "HTTP Request",
                fields! {
                    "method" => method,
                    "path" => path,
                    "status" => res.status_code().as_u16(),
                    "duration" => format!("{:?}", start.elapsed()),
                    "size" => res.body().len(),
                    "request_id" => ctx.request_id.clone().unwrap_or_default(),
                },
            );
            res
        }
    })
}

/// Records method, route pattern (or raw path when no route matched),
/// status and duration.
pub fn metrics(collector: Arc<dyn MetricsCollector>, exclusions: ExclusionList) -> Middleware {
    let exclusions = Arc::new(exclusions);
    from_fn(move |req, next| {
        let skip = exclusions.matches(req.path());
        let collector = Arc::clone(&collector);
        async move {
            if skip {
                return next.run(req).await;
            }
            let start = Instant::now();
            let method = req.method().to_string();
            let raw_path = req.path().to_owned();

            let res = next.run(req).await;

            let path = res
                .extensions()
                .get::<MatchedPath>()
                .map(|p| p.as_str().to_owned())
                .unwrap_or(raw_path);
            collector.collect_request_metrics(
                &method,
                &path,
                res.status_code().as_u16(),
                start.elapsed().as_secs_f64(),
            );
            res
        }
    })
}
