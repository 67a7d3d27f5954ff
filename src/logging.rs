//! Structured logging collaborator.
//!
//! The service logs through the [`Logger`] trait so the backend can be
//! swapped. [`TracingLogger`] is the default backend: it forwards records
//! to `tracing` and keeps its own minimum level, which the
//! `/internal/logging` endpoint can read and change at runtime.
//!
//! For a level change to reach the subscriber as well, install the
//! subscriber with a reloadable filter and hand its [`FilterHandle`] to
//! the factory:
//!
//! ```rust,no_run
//! use tsu_bootstrap::logging::{self, Level, TracingLoggerFactory};
//!
//! let filter = logging::init_subscriber(Level::Info).unwrap();
//! let factory = TracingLoggerFactory::with_filter(filter);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Registry, reload};

use crate::error::BoxError;
use crate::handler::{BoxedHandler, Handler};
use crate::request::Request;
use crate::response::Response;

/// Structured key/value pairs attached to a log record.
pub type Fields = BTreeMap<String, Value>;

/// Builds [`Fields`] from `key => value` pairs. Values may be anything
/// `serde_json::json!` accepts.
///
/// ```rust
/// let f = tsu_bootstrap::fields! { "status" => 200, "path" => "/users" };
/// assert_eq!(f["status"], 200);
/// ```
#[macro_export]
macro_rules! fields {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut fields = $crate::logging::Fields::new();
        $( fields.insert(($key).to_string(), $crate::__private::serde_json::json!($value)); )*
        fields
    }};
}

// ── Level ─────────────────────────────────────────────────────────────────────

/// Logging severity, lowest first.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info  => "info",
            Self::Warn  => "warn",
            Self::Error => "error",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info"  => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unrecognized level: {other:?}")),
        }
    }
}

// ── Collaborator interfaces ───────────────────────────────────────────────────

/// Request-scoped correlation data handed to [`Logger::with_context`].
#[derive(Clone, Debug, Default)]
pub struct LogContext {
    pub request_id: Option<String>,
    pub span_id: Option<u64>,
}

impl LogContext {
    /// Context of the current `tracing` span, if one is entered.
    pub fn current() -> Self {
        Self {
            request_id: None,
            span_id: tracing::Span::current().id().map(|id| id.into_u64()),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        if let Some(id) = &self.request_id {
            fields.insert("request_id".into(), json!(id));
        }
        if let Some(id) = self.span_id {
            fields.insert("span_id".into(), json!(id));
        }
        fields
    }
}

/// Leveled, structured logger.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, msg: &str, fields: Fields);

    /// A derived logger that adds `fields` to every record.
    fn with(&self, fields: Fields) -> Arc<dyn Logger>;

    /// A derived logger carrying request correlation fields.
    fn with_context(&self, ctx: &LogContext) -> Arc<dyn Logger>;

    fn debug(&self, msg: &str) { self.log(Level::Debug, msg, Fields::new()) }
    fn info(&self, msg: &str) { self.log(Level::Info, msg, Fields::new()) }
    fn warn(&self, msg: &str) { self.log(Level::Warn, msg, Fields::new()) }
    fn error(&self, msg: &str) { self.log(Level::Error, msg, Fields::new()) }

    fn debug_with(&self, msg: &str, fields: Fields) { self.log(Level::Debug, msg, fields) }
    fn info_with(&self, msg: &str, fields: Fields) { self.log(Level::Info, msg, fields) }
    fn warn_with(&self, msg: &str, fields: Fields) { self.log(Level::Warn, msg, fields) }
    fn error_with(&self, msg: &str, fields: Fields) { self.log(Level::Error, msg, fields) }
}

/// Runtime level control, exposed over HTTP when enabled.
pub trait RuntimeConfigurable: Send + Sync {
    fn level(&self) -> Level;
    fn set_level(&self, level: Level);
    /// Handler mounted at `/internal/logging`.
    fn config_handler(&self) -> BoxedHandler;
}

/// Options handed to a [`LoggerFactory`].
#[derive(Clone, Debug, Default)]
pub struct LoggerOptions {
    pub level: Level,
    pub service_name: String,
    pub fields: Fields,
}

/// A constructed logger and the optional capabilities it supports.
#[derive(Clone)]
pub struct LoggerHandle {
    pub logger: Arc<dyn Logger>,
    pub runtime: Option<Arc<dyn RuntimeConfigurable>>,
}

pub trait LoggerFactory: Send + Sync {
    fn new_logger(&self, opts: &LoggerOptions) -> Result<LoggerHandle, BoxError>;
}

// ── Level endpoint ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LevelUpdate {
    level: String,
}

/// `GET` reports the level, `PUT {"level":"debug"}` changes it.
pub fn level_handler(target: Arc<dyn RuntimeConfigurable>) -> BoxedHandler {
    (move |req: Request| {
        let target = Arc::clone(&target);
        async move {
            match *req.method() {
                http::Method::GET => {
                    Response::json_value(StatusCode::OK, &json!({ "level": target.level() }))
                }
                http::Method::PUT => {
                    let update = serde_json::from_slice::<LevelUpdate>(req.body())
                        .map_err(|e| e.to_string())
                        .and_then(|u| u.level.parse::<Level>());
                    match update {
                        Ok(level) => {
                            target.set_level(level);
                            Response::json_value(StatusCode::OK, &json!({ "level": level }))
                        }
                        Err(e) => Response::json_value(StatusCode::BAD_REQUEST, &json!({ "error": e })),
                    }
                }
                _ => Response::json_value(
                    StatusCode::METHOD_NOT_ALLOWED,
                    &json!({ "error": "Only GET and PUT are supported." }),
                ),
            }
        }
    })
    .into_boxed_handler()
}

// ── tracing backend ───────────────────────────────────────────────────────────

impl From<Level> for LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Debug => LevelFilter::DEBUG,
            Level::Info  => LevelFilter::INFO,
            Level::Warn  => LevelFilter::WARN,
            Level::Error => LevelFilter::ERROR,
        }
    }
}

/// The reloadable level filter layer paired with a [`FilterHandle`].
pub type FilterLayer = reload::Layer<LevelFilter, Registry>;

/// Changes the level filter of an installed subscriber.
#[derive(Clone)]
pub struct FilterHandle(reload::Handle<LevelFilter, Registry>);

impl fmt::Debug for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterHandle").finish_non_exhaustive()
    }
}

impl FilterHandle {
    /// A filter layer starting at `level` and the handle controlling it.
    /// The layer must be the first one added to a
    /// [`tracing_subscriber::registry()`].
    pub fn new(level: Level) -> (FilterLayer, Self) {
        let (layer, handle) = reload::Layer::new(LevelFilter::from(level));
        (layer, Self(handle))
    }

    pub fn set_level(&self, level: Level) -> Result<(), BoxError> {
        self.0.reload(LevelFilter::from(level))?;
        Ok(())
    }
}

/// Installs a global `fmt` subscriber filtered at `level`.
pub fn init_subscriber(level: Level) -> Result<FilterHandle, BoxError> {
    let (filter, handle) = FilterHandle::new(level);
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).try_init()?;
    Ok(handle)
}

struct Shared {
    level: AtomicU8,
    service: String,
    filter: Option<FilterHandle>,
}

/// [`Logger`] backed by the `tracing` macros.
///
/// Derived loggers share the level of the logger they came from.
#[derive(Clone)]
pub struct TracingLogger {
    shared: Arc<Shared>,
    fields: Fields,
}

impl TracingLogger {
    pub fn new(opts: &LoggerOptions) -> Self {
        Self::build(opts, None)
    }

    /// Like [`new`](Self::new), but level changes are also applied to the
    /// subscriber behind `filter`.
    pub fn with_filter(opts: &LoggerOptions, filter: FilterHandle) -> Self {
        let logger = Self::build(opts, Some(filter));
        logger.apply_filter(opts.level);
        logger
    }

    fn build(opts: &LoggerOptions, filter: Option<FilterHandle>) -> Self {
        Self {
            shared: Arc::new(Shared {
                level: AtomicU8::new(opts.level as u8),
                service: opts.service_name.clone(),
                filter,
            }),
            fields: opts.fields.clone(),
        }
    }

    fn apply_filter(&self, level: Level) {
        if let Some(filter) = &self.shared.filter {
            if let Err(e) = filter.set_level(level) {
                tracing::warn!(%level, "updating subscriber level filter: {e}");
            }
        }
    }

    fn enabled(&self, level: Level) -> bool {
        level >= self.level()
    }

    fn derive(&self, extra: Fields) -> Self {
        let mut fields = self.fields.clone();
        fields.extend(extra);
        Self { shared: Arc::clone(&self.shared), fields }
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, msg: &str, fields: Fields) {
        if !self.enabled(level) {
            return;
        }
        let mut merged = self.fields.clone();
        merged.extend(fields);
        let rendered = Value::Object(merged.into_iter().collect());
        let service = self.shared.service.as_str();
        match level {
            Level::Debug => tracing::debug!(service, fields = %rendered, "{msg}"),
            Level::Info  => tracing::info!(service, fields = %rendered, "{msg}"),
            Level::Warn  => tracing::warn!(service, fields = %rendered, "{msg}"),
            Level::Error => tracing::error!(service, fields = %rendered, "{msg}"),
        }
    }

    fn with(&self, fields: Fields) -> Arc<dyn Logger> {
        Arc::new(self.derive(fields))
    }

    fn with_context(&self, ctx: &LogContext) -> Arc<dyn Logger> {
        Arc::new(self.derive(ctx.fields()))
    }
}

impl RuntimeConfigurable for TracingLogger {
    fn level(&self) -> Level {
        Level::from_u8(self.shared.level.load(Ordering::Relaxed))
    }

    fn set_level(&self, level: Level) {
        self.shared.level.store(level as u8, Ordering::Relaxed);
        self.apply_filter(level);
    }

    fn config_handler(&self) -> BoxedHandler {
        level_handler(Arc::new(self.clone()))
    }
}

/// Builds [`TracingLogger`]s with the runtime level capability.
#[derive(Clone, Debug, Default)]
pub struct TracingLoggerFactory {
    filter: Option<FilterHandle>,
}

impl TracingLoggerFactory {
    /// Loggers built by this factory drive `filter` on level changes.
    pub fn with_filter(filter: FilterHandle) -> Self {
        Self { filter: Some(filter) }
    }
}

impl LoggerFactory for TracingLoggerFactory {
    fn new_logger(&self, opts: &LoggerOptions) -> Result<LoggerHandle, BoxError> {
        let logger = match &self.filter {
            Some(filter) => TracingLogger::with_filter(opts, filter.clone()),
            None => TracingLogger::new(opts),
        };
        Ok(LoggerHandle {
            logger: Arc::new(logger.clone()),
            runtime: Some(Arc::new(logger)),
        })
    }
}
