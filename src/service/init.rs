//! Construction stages run by [`Service::new`](super::Service::new), in
//! order: config store, logger, tracer, metrics collector, router.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};

use super::Dependencies;
use super::options::{Resolved, ServiceOptions};
use crate::config::{ConfigHandle, StoreOptions};
use crate::error::{Error, Result};
use crate::fields;
use crate::logging::{LoggerHandle, LoggerOptions};
use crate::method::Method;
use crate::metrics::{self, MetricsCollector, MetricsOptions};
use crate::middleware::{MiddlewareCategory, PipelineBuilder, base, observability};
use crate::probe::{self, ProbeHandlers, ProbeResponse};
use crate::router::Router;
use crate::tracer::TracingProvider;

pub(super) const STAGE_CONFIG: &str = "creating config store";
pub(super) const STAGE_LOGGER: &str = "creating logger";
pub(super) const STAGE_TRACER: &str = "creating tracer";
pub(super) const STAGE_METRICS: &str = "creating metrics collector";
pub(super) const STAGE_ROUTER: &str = "creating router";

pub(super) fn config(opts: &ServiceOptions, resolved: &Resolved, deps: &Dependencies) -> Result<ConfigHandle> {
    let store_opts = StoreOptions {
        config_file: opts.config_file.clone(),
        env_prefix: Some(resolved.env_prefix.clone()),
        defaults: opts.store_defaults(),
    };
    deps.config.new_store(&store_opts).map_err(|e| Error::construction(STAGE_CONFIG, e))
}

pub(super) fn logger(opts: &ServiceOptions, resolved: &Resolved, deps: &Dependencies) -> Result<LoggerHandle> {
    let mut fields = fields! { "version" => resolved.version };
    fields.extend(opts.log_fields.clone());
    let logger_opts = LoggerOptions {
        level: opts.log_level,
        service_name: opts.service_name.clone(),
        fields,
    };
    deps.logger.new_logger(&logger_opts).map_err(|e| Error::construction(STAGE_LOGGER, e))
}

/// Skipped entirely when no collector endpoint is configured.
pub(super) fn tracer(
    opts: &ServiceOptions,
    resolved: &Resolved,
    deps: &Dependencies,
) -> Result<Option<Arc<dyn TracingProvider>>> {
    let Some(endpoint) = opts.tracing_endpoint.as_deref().filter(|e| !e.is_empty()) else {
        return Ok(None);
    };
    let Some(factory) = &deps.tracer else {
        return Err(Error::construction(
            STAGE_TRACER,
            "tracing endpoint configured without a tracer factory",
        ));
    };
    factory
        .new_provider(&opts.tracing_options(resolved, endpoint))
        .map(Some)
        .map_err(|e| Error::construction(STAGE_TRACER, e))
}

pub(super) fn metrics(opts: &ServiceOptions, deps: &Dependencies) -> Result<Option<Arc<dyn MetricsCollector>>> {
    let Some(factory) = &deps.metrics else {
        return Ok(None);
    };
    let metrics_opts = MetricsOptions { service_name: opts.service_name.clone(), ..Default::default() };
    factory
        .new_collector(&metrics_opts)
        .map(Some)
        .map_err(|e| Error::construction(STAGE_METRICS, e))
}

/// Collaborators the router stage wires into middleware and endpoints.
pub(super) struct RouterParts<'a> {
    pub config: &'a ConfigHandle,
    pub logger: &'a LoggerHandle,
    pub tracer: Option<&'a Arc<dyn TracingProvider>>,
    pub metrics: Option<&'a Arc<dyn MetricsCollector>>,
    pub started_at: (Instant, DateTime<Utc>),
}

pub(super) fn router(opts: &ServiceOptions, resolved: &Resolved, parts: RouterParts<'_>) -> Result<Router> {
    let mut pipeline = PipelineBuilder::new()
        .builtin(MiddlewareCategory::Core, base::request_id())
        .builtin(MiddlewareCategory::Core, base::real_ip())
        .builtin(MiddlewareCategory::Core, base::recover())
        .builtin(MiddlewareCategory::Core, base::timeout(opts.server.request_timeout));

    if let Some(tracer) = parts.tracer {
        pipeline = pipeline.builtin(
            MiddlewareCategory::Observability,
            observability::tracing(&opts.service_name, Arc::clone(tracer), resolved.exclude_from_tracing.clone()),
        );
    }
    pipeline = pipeline.builtin(
        MiddlewareCategory::Observability,
        observability::logging(Arc::clone(&parts.logger.logger), resolved.exclude_from_logging.clone()),
    );
    if let Some(collector) = parts.metrics {
        pipeline = pipeline.builtin(
            MiddlewareCategory::Observability,
            observability::metrics(Arc::clone(collector), resolved.exclude_from_metrics.clone()),
        );
    }

    let pipeline = pipeline.build(opts.middleware_ordering.as_ref())?;
    let mut router = Router::new().with_pipeline(pipeline);
    mount(&mut router, opts, resolved, &parts).map_err(|e| Error::construction(STAGE_ROUTER, e))?;
    Ok(router)
}

fn mount(router: &mut Router, opts: &ServiceOptions, resolved: &Resolved, parts: &RouterParts<'_>) -> Result<()> {
    let probes = opts
        .probe_handlers
        .clone()
        .unwrap_or_else(|| default_probes(resolved.version.clone(), parts.started_at));
    router
        .route(Method::Get, "/internal/health", probe::handler(probes.liveness))?
        .route(Method::Get, "/internal/ready", probe::handler(probes.readiness))?
        .route(Method::Get, "/internal/startup", probe::handler(probes.startup))?;

    if let Some(collector) = parts.metrics {
        router.route(Method::Get, "/metrics", metrics::handler(Arc::clone(collector)))?;
    }

    let logger = &parts.logger.logger;
    if opts.enable_log_config {
        if let Some(runtime) = &parts.logger.runtime {
            router.any("/internal/logging", runtime.config_handler())?;
            logger.info_with("Registered logger config endpoint", fields! { "path" => "/internal/logging" });
        }
    }
    if opts.enable_config_viewer {
        if let Some(masked) = &parts.config.masked {
            router.any("/internal/config", masked.config_handler(opts.mask_strategy.clone()))?;
            logger.info_with("Registered config viewing endpoint", fields! { "path" => "/internal/config" });
        }
    }
    Ok(())
}

/// Liveness reports version and uptime, readiness the startup time.
fn default_probes(version: String, (started, started_at): (Instant, DateTime<Utc>)) -> ProbeHandlers {
    let startup_time = started_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    ProbeHandlers {
        liveness: Arc::new(move || {
            ProbeResponse::ok()
                .with_detail("version", version.clone())
                .with_detail("uptime", format!("{:?}", started.elapsed()))
        }),
        readiness: Arc::new(move || ProbeResponse::ok().with_detail("startup_time", startup_time.clone())),
        startup: Arc::new(ProbeResponse::ok),
    }
}
