//! Request metrics collaborator and its Prometheus backend.
//!
//! Each [`PrometheusCollector`] owns its own [`Registry`]; nothing is
//! registered process-wide, so two services (or two tests) in one process
//! never see each other's series.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::StatusCode;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

use crate::error::BoxError;
use crate::handler::{BoxedHandler, Handler};
use crate::request::Request;
use crate::response::{ContentType, Response};

const LABELS: [&str; 3] = ["method", "path", "status"];

/// Records per-request metrics.
pub trait MetricsCollector: Send + Sync {
    fn collect_request_metrics(&self, method: &str, path: &str, status: u16, duration_secs: f64);

    /// Releases backend resources. Later collections are dropped.
    fn close(&self) -> Result<(), BoxError>;

    /// Text exposition served at `/metrics`.
    fn render(&self) -> Result<String, BoxError>;
}

/// Options handed to a [`MetricsFactory`].
#[derive(Clone, Debug, Default)]
pub struct MetricsOptions {
    pub service_name: String,
    /// Histogram buckets; empty selects the Prometheus defaults.
    pub buckets: Vec<f64>,
    /// Constant labels added to every series.
    pub labels: HashMap<String, String>,
    pub subsystem: Option<String>,
}

pub trait MetricsFactory: Send + Sync {
    fn new_collector(&self, opts: &MetricsOptions) -> Result<Arc<dyn MetricsCollector>, BoxError>;
}

/// Collector exporting `http_request_duration_seconds`,
/// `http_requests_total` and `http_errors_total`.
pub struct PrometheusCollector {
    registry: Registry,
    request_duration: HistogramVec,
    requests_total: IntCounterVec,
    errors_total: IntCounterVec,
    closed: AtomicBool,
}

impl PrometheusCollector {
    pub fn new(opts: &MetricsOptions) -> Result<Self, BoxError> {
        if opts.service_name.is_empty() {
            return Err("service name is required".into());
        }

        let buckets = if opts.buckets.is_empty() {
            prometheus::DEFAULT_BUCKETS.to_vec()
        } else {
            opts.buckets.clone()
        };
        if buckets.windows(2).any(|w| w[1] <= w[0]) {
            return Err(format!("buckets must be in increasing order: {buckets:?}").into());
        }

        let mut labels = opts.labels.clone();
        labels.insert("service".to_owned(), opts.service_name.clone());
        let subsystem = opts.subsystem.clone().unwrap_or_default();

        let request_duration = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request duration in seconds")
                .subsystem(subsystem.clone())
                .const_labels(labels.clone())
                .buckets(buckets),
            &LABELS,
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests")
                .subsystem(subsystem.clone())
                .const_labels(labels.clone()),
            &LABELS,
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("http_errors_total", "Total number of HTTP errors")
                .subsystem(subsystem)
                .const_labels(labels),
            &LABELS,
        )?;

        let registry = Registry::new();
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            request_duration,
            requests_total,
            errors_total,
            closed: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl MetricsCollector for PrometheusCollector {
    fn collect_request_metrics(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let status_label = status.to_string();
        let values = [method, path, status_label.as_str()];
        self.request_duration.with_label_values(&values[..]).observe(duration_secs);
        self.requests_total.with_label_values(&values[..]).inc();
        if status >= 400 {
            self.errors_total.with_label_values(&values[..]).inc();
        }
    }

    fn close(&self) -> Result<(), BoxError> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.registry.unregister(Box::new(self.request_duration.clone()))?;
        self.registry.unregister(Box::new(self.requests_total.clone()))?;
        self.registry.unregister(Box::new(self.errors_total.clone()))?;
        Ok(())
    }

    fn render(&self) -> Result<String, BoxError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

/// Builds a fresh [`PrometheusCollector`] per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrometheusFactory;

impl MetricsFactory for PrometheusFactory {
    fn new_collector(&self, opts: &MetricsOptions) -> Result<Arc<dyn MetricsCollector>, BoxError> {
        Ok(Arc::new(PrometheusCollector::new(opts)?))
    }
}

/// Serves [`MetricsCollector::render`] at `/metrics`.
pub fn handler(collector: Arc<dyn MetricsCollector>) -> BoxedHandler {
    (move |_req: Request| {
        let rendered = collector.render();
        async move {
            match rendered {
                Ok(text) => Response::builder().bytes(ContentType::OpenMetrics, text),
                Err(e) => {
                    error!(error = %e, "failed to render metrics");
                    Response::status(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
    })
    .into_boxed_handler()
}
