use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::MaskStrategy;
use crate::error::{BoxError, Error, Result};
use crate::logging::{Fields, Level};
use crate::matcher::ExclusionList;
use crate::middleware::MiddlewareOrdering;
use crate::probe::ProbeHandlers;
use crate::server::ServerSettings;
use crate::tls::TlsVersion;
use crate::tracer::TracingOptions;

/// Paths skipped by logging, tracing and metrics when no list is given.
pub const DEFAULT_EXCLUSIONS: [&str; 2] = ["/internal/*", "/metrics"];

/// Runs after the listener settings are assembled and before binding.
pub type PreStartHook = Arc<dyn Fn(&mut ServerSettings) -> Result<(), BoxError> + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub cert_file: String,
    pub key_file: String,
    /// `None` selects TLS 1.2.
    pub min_version: Option<TlsVersion>,
}

/// Listener defaults. Every value is seeded into the configuration store
/// under `server.http.*` / `server.tls.*`, where files and environment
/// variables can override it.
#[derive(Clone)]
pub struct ServerOptions {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_header_size: usize,
    /// Base timeout applied by the Core middleware.
    pub request_timeout: Duration,
    pub tls: Option<TlsOptions>,
    pub pre_start: Option<PreStartHook>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(15),
            max_header_size: 1 << 20,
            request_timeout: Duration::from_secs(30),
            tls: None,
            pre_start: None,
        }
    }
}

/// Everything [`Service::new`](super::Service::new) needs besides its
/// collaborators.
///
/// ```rust
/// use tsu_bootstrap::ServiceOptions;
///
/// let opts = ServiceOptions {
///     enable_config_viewer: true,
///     ..ServiceOptions::new("orders")
/// };
/// assert!(opts.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct ServiceOptions {
    pub service_name: String,
    /// Defaults to `"dev"`.
    pub version: String,

    pub config_file: Option<String>,
    /// Defaults to the service name.
    pub env_prefix: Option<String>,
    /// Extra store defaults, keyed by dotted path.
    pub config_defaults: BTreeMap<String, Value>,
    pub enable_config_viewer: bool,
    pub mask_strategy: MaskStrategy,

    pub log_level: Level,
    pub log_fields: Fields,
    pub enable_log_config: bool,

    pub server: ServerOptions,

    pub middleware_ordering: Option<MiddlewareOrdering>,
    /// Empty selects [`DEFAULT_EXCLUSIONS`].
    pub exclude_from_logging: Vec<String>,
    /// Empty selects [`DEFAULT_EXCLUSIONS`].
    pub exclude_from_tracing: Vec<String>,
    /// `None` reuses the logging list.
    pub exclude_from_metrics: Option<Vec<String>>,
    pub probe_handlers: Option<ProbeHandlers>,

    /// Collector endpoint; the tracer is only built when this is set.
    pub tracing_endpoint: Option<String>,
    pub tracing_sample_rate: f64,
    pub tracing_propagators: Vec<String>,
}

impl ServiceOptions {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), ..Self::default() }
    }

    /// Checks every option without building anything.
    pub fn validate(&self) -> Result<()> {
        self.resolve().map(drop)
    }

    pub(crate) fn resolve(&self) -> Result<Resolved> {
        if self.service_name.trim().is_empty() {
            return Err(Error::Configuration("service name is required".into()));
        }
        let rate = self.tracing_sample_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::Configuration(format!(
                "tracing sample rate must be within 0.0..=1.0, got {rate}"
            )));
        }
        if let Some(ordering) = &self.middleware_ordering {
            ordering.validate()?;
        }

        let logging = exclusions(&self.exclude_from_logging)?;
        let tracing = exclusions(&self.exclude_from_tracing)?;
        let metrics = match &self.exclude_from_metrics {
            Some(paths) => exclusions(paths)?,
            None => logging.clone(),
        };

        Ok(Resolved {
            version: non_empty(&self.version).unwrap_or("dev").to_owned(),
            env_prefix: self
                .env_prefix
                .as_deref()
                .and_then(non_empty)
                .unwrap_or(&self.service_name)
                .to_owned(),
            exclude_from_logging: logging,
            exclude_from_tracing: tracing,
            exclude_from_metrics: metrics,
        })
    }

    /// Store defaults derived from the server options, overlaid with
    /// [`config_defaults`](Self::config_defaults).
    pub(crate) fn store_defaults(&self) -> BTreeMap<String, Value> {
        let s = &self.server;
        let tls = s.tls.clone().unwrap_or_default();
        let mut defaults = BTreeMap::from([
            ("server.http.port".to_owned(), Value::from(s.port)),
            ("server.http.read_timeout".to_owned(), duration_value(s.read_timeout)),
            ("server.http.write_timeout".to_owned(), duration_value(s.write_timeout)),
            ("server.http.idle_timeout".to_owned(), duration_value(s.idle_timeout)),
            ("server.http.shutdown_timeout".to_owned(), duration_value(s.shutdown_timeout)),
            ("server.http.max_header_size".to_owned(), Value::from(s.max_header_size)),
            ("server.tls.enabled".to_owned(), Value::from(s.tls.is_some())),
            ("server.tls.cert_file".to_owned(), Value::from(tls.cert_file)),
            ("server.tls.key_file".to_owned(), Value::from(tls.key_file)),
        ]);
        defaults.extend(self.config_defaults.clone());
        defaults
    }

    pub(crate) fn tracing_options(&self, resolved: &Resolved, endpoint: &str) -> TracingOptions {
        let propagators = if self.tracing_propagators.is_empty() {
            TracingOptions::default_propagators()
        } else {
            self.tracing_propagators.clone()
        };
        TracingOptions {
            service_name: self.service_name.clone(),
            service_version: resolved.version.clone(),
            collector_endpoint: endpoint.to_owned(),
            sampling_rate: self.tracing_sample_rate,
            propagators,
            insecure: true,
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            version: "dev".to_owned(),
            config_file: None,
            env_prefix: None,
            config_defaults: BTreeMap::new(),
            enable_config_viewer: false,
            mask_strategy: MaskStrategy::default(),
            log_level: Level::Info,
            log_fields: Fields::new(),
            enable_log_config: false,
            server: ServerOptions::default(),
            middleware_ordering: None,
            exclude_from_logging: Vec::new(),
            exclude_from_tracing: Vec::new(),
            exclude_from_metrics: None,
            probe_handlers: None,
            tracing_endpoint: None,
            tracing_sample_rate: 1.0,
            tracing_propagators: TracingOptions::default_propagators(),
        }
    }
}

/// Options after defaults are filled in and lists are validated.
pub(crate) struct Resolved {
    pub version: String,
    pub env_prefix: String,
    pub exclude_from_logging: ExclusionList,
    pub exclude_from_tracing: ExclusionList,
    pub exclude_from_metrics: ExclusionList,
}

fn exclusions(paths: &[String]) -> Result<ExclusionList> {
    if paths.is_empty() {
        ExclusionList::new(DEFAULT_EXCLUSIONS)
    } else {
        ExclusionList::new(paths)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    Some(s).filter(|s| !s.trim().is_empty())
}

/// Whole seconds as `"15s"`, anything finer as milliseconds.
fn duration_value(d: Duration) -> Value {
    if d.subsec_nanos() == 0 {
        Value::from(format!("{}s", d.as_secs()))
    } else {
        Value::from(format!("{}ms", d.as_millis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewareCategory;

    #[test]
    fn empty_name_is_a_configuration_error() {
        let err = ServiceOptions::default().validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m == "service name is required"));
    }

    #[test]
    fn sample_rate_must_be_a_ratio() {
        for rate in [-0.1, 1.5, f64::NAN] {
            let opts = ServiceOptions { tracing_sample_rate: rate, ..ServiceOptions::new("svc") };
            assert!(matches!(opts.validate(), Err(Error::Configuration(_))), "{rate}");
        }
        let opts = ServiceOptions { tracing_sample_rate: 0.0, ..ServiceOptions::new("svc") };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn exclusion_lists_default_and_validate() {
        let resolved = ServiceOptions::new("svc").resolve().unwrap();
        assert_eq!(resolved.exclude_from_logging.patterns(), DEFAULT_EXCLUSIONS);
        assert_eq!(resolved.exclude_from_metrics.patterns(), DEFAULT_EXCLUSIONS);

        let opts = ServiceOptions {
            exclude_from_logging: vec!["/healthz".into()],
            ..ServiceOptions::new("svc")
        };
        let resolved = opts.resolve().unwrap();
        assert_eq!(resolved.exclude_from_metrics.patterns(), ["/healthz"]);
        assert_eq!(resolved.exclude_from_tracing.patterns(), DEFAULT_EXCLUSIONS);

        let bad = ServiceOptions { exclude_from_tracing: vec!["health".into()], ..ServiceOptions::new("svc") };
        assert!(matches!(bad.validate(), Err(Error::PathValidation(_))));
    }

    #[test]
    fn invalid_ordering_is_rejected_before_construction() {
        let opts = ServiceOptions {
            middleware_ordering: Some(MiddlewareOrdering::new([MiddlewareCategory::Core])),
            ..ServiceOptions::new("svc")
        };
        assert!(matches!(opts.validate(), Err(Error::OrderingValidation(_))));
    }

    #[test]
    fn identity_defaults() {
        let opts = ServiceOptions { version: String::new(), ..ServiceOptions::new("orders") };
        let resolved = opts.resolve().unwrap();
        assert_eq!(resolved.version, "dev");
        assert_eq!(resolved.env_prefix, "orders");
    }

    #[test]
    fn server_options_seed_store_defaults() {
        let mut opts = ServiceOptions::new("svc");
        opts.server.port = 9000;
        opts.server.shutdown_timeout = Duration::from_millis(2500);
        opts.config_defaults.insert("server.http.port".into(), Value::from(9100));

        let defaults = opts.store_defaults();
        assert_eq!(defaults["server.http.port"], 9100);
        assert_eq!(defaults["server.http.read_timeout"], "15s");
        assert_eq!(defaults["server.http.shutdown_timeout"], "2500ms");
        assert_eq!(defaults["server.tls.enabled"], false);
    }
}
