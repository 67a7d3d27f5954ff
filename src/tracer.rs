//! Distributed-tracing collaborator.
//!
//! The exporter and propagators live in the tracing SDK behind
//! [`TracingProvider`]; this crate only decides when spans are opened (see
//! [`middleware::observability::tracing`](crate::middleware::observability::tracing))
//! and asks the provider to flush on shutdown.

use std::sync::Arc;

use tokio::time::Instant;

use crate::error::BoxError;
use crate::handler::BoxFuture;

pub const PROPAGATOR_TRACE_CONTEXT: &str = "tracecontext";
pub const PROPAGATOR_BAGGAGE: &str = "baggage";
pub const PROPAGATOR_B3: &str = "b3";
pub const PROPAGATOR_JAEGER: &str = "jaeger";

/// A running tracer pipeline.
pub trait TracingProvider: Send + Sync {
    /// Flushes pending spans and stops the exporter. Must give up at
    /// `deadline`.
    fn shutdown(&self, deadline: Instant) -> BoxFuture<'_, Result<(), BoxError>>;

    fn is_enabled(&self) -> bool;
}

/// Options handed to a [`TracerFactory`].
#[derive(Clone, Debug, PartialEq)]
pub struct TracingOptions {
    pub service_name: String,
    pub service_version: String,
    pub collector_endpoint: String,
    pub sampling_rate: f64,
    pub propagators: Vec<String>,
    pub insecure: bool,
}

impl TracingOptions {
    /// W3C trace context and baggage.
    pub fn default_propagators() -> Vec<String> {
        vec![PROPAGATOR_TRACE_CONTEXT.to_owned(), PROPAGATOR_BAGGAGE.to_owned()]
    }
}

pub trait TracerFactory: Send + Sync {
    fn new_provider(&self, opts: &TracingOptions) -> Result<Arc<dyn TracingProvider>, BoxError>;
}
