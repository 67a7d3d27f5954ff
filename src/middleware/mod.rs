//! Middleware pipeline.
//!
//! Middleware intercepts requests and responses and is the place for
//! cross-cutting concerns. Every middleware belongs to one of four
//! [`MiddlewareCategory`] groups, and a [`MiddlewareOrdering`] decides in
//! which order the groups run:
//!
//! ```text
//! request ─▶ Core ─▶ Security ─▶ Application ─▶ Observability ─▶ route
//! ```
//!
//! The first category in the order is the outermost layer. Within a
//! category the built-in middleware runs first, then custom middleware in
//! registration order.
//!
//! A pipeline is assembled once, when the router is constructed, and is
//! read-only afterwards.
//!
//! ```rust
//! use tsu_bootstrap::middleware::{self, MiddlewareCategory, MiddlewareOrdering, PipelineBuilder};
//!
//! let audit = middleware::from_fn(|req, next| async move { next.run(req).await });
//! let ordering = MiddlewareOrdering::default().with(MiddlewareCategory::Application, audit);
//! let pipeline = PipelineBuilder::new().build(Some(&ordering)).unwrap();
//! assert_eq!(pipeline.len(), 1);
//! ```

pub mod base;
pub mod observability;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::handler::{BoxFuture, BoxedHandler};
use crate::request::Request;
use crate::response::Response;

/// A type-erased middleware function.
///
/// It receives the request and the rest of the chain; calling
/// [`Next::run`] passes control inward.
pub type Middleware = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;

/// Wraps an async function or closure into a [`Middleware`].
pub fn from_fn<F, Fut>(f: F) -> Middleware
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req, next| Box::pin(f(req, next)))
}

// ── Categories ────────────────────────────────────────────────────────────────

/// The fixed middleware groupings.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum MiddlewareCategory {
    /// Request id, client IP, panic recovery, base timeout.
    Core,
    /// Authentication, CORS, rate limiting hooks.
    Security,
    /// Business-specific middleware. Optional in an ordering.
    Application,
    /// Tracing, request logging, metrics.
    Observability,
}

impl MiddlewareCategory {
    /// Categories every ordering must contain exactly once.
    pub const REQUIRED: [MiddlewareCategory; 3] = [Self::Core, Self::Security, Self::Observability];

    pub const ALL: [MiddlewareCategory; 4] = [Self::Core, Self::Security, Self::Application, Self::Observability];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core          => "core",
            Self::Security      => "security",
            Self::Application   => "application",
            Self::Observability => "observability",
        }
    }
}

impl fmt::Display for MiddlewareCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MiddlewareCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "core"          => Ok(Self::Core),
            "security"      => Ok(Self::Security),
            "application"   => Ok(Self::Application),
            "observability" => Ok(Self::Observability),
            other => Err(Error::OrderingValidation(format!(
                "invalid middleware category for custom middleware: {other}"
            ))),
        }
    }
}

/// `[Core, Security, Application, Observability]`.
pub const DEFAULT_ORDER: [MiddlewareCategory; 4] = [
    MiddlewareCategory::Core,
    MiddlewareCategory::Security,
    MiddlewareCategory::Application,
    MiddlewareCategory::Observability,
];

// ── Ordering ──────────────────────────────────────────────────────────────────

/// Category order plus custom middleware registered per category.
#[derive(Clone)]
pub struct MiddlewareOrdering {
    order: Vec<MiddlewareCategory>,
    custom: HashMap<MiddlewareCategory, Vec<Middleware>>,
}

impl MiddlewareOrdering {
    /// An ordering with no custom middleware. Not validated until
    /// [`validate`](Self::validate) or a pipeline build.
    pub fn new(order: impl Into<Vec<MiddlewareCategory>>) -> Self {
        Self { order: order.into(), custom: HashMap::new() }
    }

    /// Registers `middleware` at the end of `category`'s custom list.
    pub fn with(mut self, category: MiddlewareCategory, middleware: Middleware) -> Self {
        self.custom.entry(category).or_default().push(middleware);
        self
    }

    /// Registers custom middleware under a category given by name, as read
    /// from configuration. Unknown names are rejected.
    pub fn register(&mut self, category: &str, middleware: Middleware) -> Result<()> {
        let category = category.parse()?;
        self.custom.entry(category).or_default().push(middleware);
        Ok(())
    }

    pub fn order(&self) -> &[MiddlewareCategory] {
        &self.order
    }

    pub fn custom(&self, category: MiddlewareCategory) -> &[Middleware] {
        self.custom.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    /// Checks the ordering invariants: non-empty, no duplicates, all of
    /// Core/Security/Observability present. Custom middleware for a
    /// category left out of the order is never run.
    pub fn validate(&self) -> Result<()> {
        if self.order.is_empty() {
            return Err(Error::OrderingValidation("middleware order cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for category in &self.order {
            if !seen.insert(*category) {
                return Err(Error::OrderingValidation(format!(
                    "duplicate middleware category: {category}"
                )));
            }
        }

        let missing: Vec<&str> = MiddlewareCategory::REQUIRED
            .iter()
            .filter(|c| !seen.contains(*c))
            .map(|c| c.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::OrderingValidation(format!(
                "missing required middleware categories: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }
}

impl Default for MiddlewareOrdering {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER)
    }
}

impl fmt::Debug for MiddlewareOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let custom: HashMap<_, _> = self.custom.iter().map(|(c, l)| (*c, l.len())).collect();
        f.debug_struct("MiddlewareOrdering")
            .field("order", &self.order)
            .field("custom", &custom)
            .finish()
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Assembles a [`Pipeline`] from the composition root's built-in
/// middleware and a caller-supplied ordering.
#[derive(Default)]
pub struct PipelineBuilder {
    builtins: HashMap<MiddlewareCategory, Vec<Middleware>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a built-in middleware for `category`.
    pub fn builtin(mut self, category: MiddlewareCategory, middleware: Middleware) -> Self {
        self.builtins.entry(category).or_default().push(middleware);
        self
    }

    /// Validates `ordering` (or uses [`DEFAULT_ORDER`]) and lays out the
    /// chain. Nothing is assembled if validation fails.
    pub fn build(&self, ordering: Option<&MiddlewareOrdering>) -> Result<Pipeline> {
        let default = MiddlewareOrdering::default();
        let ordering = ordering.unwrap_or(&default);
        ordering.validate()?;

        for category in MiddlewareCategory::ALL {
            let unused = ordering.custom(category).len();
            if unused > 0 && !ordering.order().contains(&category) {
                warn!(%category, unused, "custom middleware registered for a category outside the order");
            }
        }

        let mut layers = Vec::new();
        for category in ordering.order() {
            if let Some(builtins) = self.builtins.get(category) {
                layers.extend(builtins.iter().cloned());
            }
            layers.extend(ordering.custom(*category).iter().cloned());
        }
        Ok(Pipeline { layers: layers.into() })
    }
}

/// An ordered, immutable middleware chain.
#[derive(Clone)]
pub struct Pipeline {
    layers: Arc<[Middleware]>,
}

impl Pipeline {
    /// A pipeline with no middleware.
    pub fn empty() -> Self {
        Self { layers: Arc::from(Vec::new()) }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs `req` through every layer, ending at `endpoint`.
    pub fn run(&self, req: Request, endpoint: BoxedHandler) -> BoxFuture<'static, Response> {
        Next { layers: Arc::clone(&self.layers), index: 0, endpoint }.run(req)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::empty()
    }
}

/// The remainder of a middleware chain.
pub struct Next {
    layers: Arc<[Middleware]>,
    index: usize,
    endpoint: BoxedHandler,
}

impl Next {
    /// Passes `req` to the next layer, or to the endpoint after the last one.
    pub fn run(self, req: Request) -> BoxFuture<'static, Response> {
        match self.layers.get(self.index).cloned() {
            Some(layer) => {
                let next = Next { layers: self.layers, index: self.index + 1, endpoint: self.endpoint };
                layer(req, next)
            }
            None => self.endpoint.call(req),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use parking_lot::Mutex;
    use super::MiddlewareCategory::*;

    fn noop() -> Middleware {
        from_fn(|req, next| next.run(req))
    }

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Middleware {
        let log = Arc::clone(log);
        from_fn(move |req, next| {
            log.lock().push(name);
            next.run(req)
        })
    }

    fn permutations(items: &[MiddlewareCategory]) -> Vec<Vec<MiddlewareCategory>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn every_order_of_required_categories_is_valid() {
        for order in permutations(&[Core, Security, Observability]) {
            MiddlewareOrdering::new(order.clone()).validate().unwrap();
            for pos in 0..=order.len() {
                let mut with_app = order.clone();
                with_app.insert(pos, Application);
                MiddlewareOrdering::new(with_app).validate().unwrap();
            }
        }
    }

    #[test]
    fn removing_a_required_category_fails() {
        for required in MiddlewareCategory::REQUIRED {
            let order: Vec<_> = DEFAULT_ORDER.into_iter().filter(|c| *c != required).collect();
            let err = MiddlewareOrdering::new(order).validate().unwrap_err();
            assert!(matches!(err, Error::OrderingValidation(_)));
            assert!(err.to_string().contains(required.as_str()), "{err}");
        }
    }

    #[test]
    fn duplicating_any_category_fails() {
        for dup in DEFAULT_ORDER {
            let mut order = DEFAULT_ORDER.to_vec();
            order.push(dup);
            let err = MiddlewareOrdering::new(order).validate().unwrap_err();
            assert!(err.to_string().contains(&format!("duplicate middleware category: {dup}")));
        }
    }

    #[test]
    fn empty_order_fails() {
        let err = MiddlewareOrdering::new(Vec::new()).validate().unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn unknown_custom_category_name_is_rejected() {
        let mut ordering = MiddlewareOrdering::default();
        let err = ordering.register("routing", noop()).unwrap_err();
        assert!(err.to_string().contains("invalid middleware category for custom middleware: routing"));
        ordering.register("security", noop()).unwrap();
        assert_eq!(ordering.custom(Security).len(), 1);
    }

    #[test]
    fn application_middleware_is_allowed_without_application_in_order() {
        let ordering = MiddlewareOrdering::new([Core, Security, Observability]).with(Application, noop());
        ordering.validate().unwrap();
        let pipeline = PipelineBuilder::new().build(Some(&ordering)).unwrap();
        assert!(pipeline.is_empty());
    }

    #[test]
    fn build_rejects_invalid_ordering() {
        let ordering = MiddlewareOrdering::new([Core, Observability]);
        assert!(PipelineBuilder::new().build(Some(&ordering)).is_err());
    }

    #[tokio::test]
    async fn layers_run_in_category_then_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ordering = MiddlewareOrdering::new([Observability, Security, Core, Application])
            .with(Security, recording(&log, "security-1"))
            .with(Security, recording(&log, "security-2"))
            .with(Core, recording(&log, "core-custom"))
            .with(Application, recording(&log, "app"));
        let pipeline = PipelineBuilder::new()
            .builtin(Core, recording(&log, "core-builtin"))
            .builtin(Observability, recording(&log, "observability"))
            .build(Some(&ordering))
            .unwrap();

        let endpoint = (|_req: Request| async { "done" }).into_boxed_handler();
        let res = pipeline.run(Request::new(http::Method::GET, "/"), endpoint).await;

        assert_eq!(res.body(), b"done");
        assert_eq!(
            *log.lock(),
            ["observability", "security-1", "security-2", "core-builtin", "core-custom", "app"]
        );
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let deny = from_fn(|_req, _next| async { Response::status(http::StatusCode::FORBIDDEN) });
        let ordering = MiddlewareOrdering::default().with(Security, deny);
        let pipeline = PipelineBuilder::new().build(Some(&ordering)).unwrap();
        let endpoint = (|_req: Request| async { "unreachable" }).into_boxed_handler();
        let res = pipeline.run(Request::new(http::Method::GET, "/"), endpoint).await;
        assert_eq!(res.status_code(), http::StatusCode::FORBIDDEN);
    }
}
