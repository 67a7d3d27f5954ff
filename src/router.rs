//! Radix-tree request router.
//!
//! One tree per HTTP method. Every request, matched or not, runs through
//! the router's middleware [`Pipeline`] first; the route lookup is the
//! innermost step of the chain.

use std::collections::HashMap;
use std::sync::Arc;

use http::{HeaderValue, StatusCode};
use matchit::Router as MatchitRouter;

use crate::error::{Error, Result};
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::Pipeline;
use crate::request::Request;
use crate::response::Response;

/// Route pattern that served a request (e.g. `/users/{id}`), attached to
/// the response extensions so outer middleware can label by route instead
/// of by raw path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedPath(Arc<str>);

impl MatchedPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone)]
struct Route {
    pattern: Arc<str>,
    handler: BoxedHandler,
}

type Table = HashMap<Method, MatchitRouter<Route>>;

/// The application router.
///
/// Build it once at startup. Each [`Router::on`] call returns `self` so
/// registrations chain naturally; [`Router::route`] is the fallible form.
#[derive(Clone)]
pub struct Router {
    table: Arc<Table>,
    /// Innermost step of the chain, rebuilt whenever a route is added.
    endpoint: BoxedHandler,
    pipeline: Pipeline,
}

impl Default for Router {
    fn default() -> Self {
        let table = Arc::new(Table::new());
        Self { endpoint: endpoint(Arc::clone(&table)), table, pipeline: Pipeline::default() }
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the middleware pipeline wrapped around every route.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax and `req.param("name")` retrieves them:
    ///
    /// ```rust
    /// # use tsu_bootstrap::{Method, Request, Response, Router};
    /// # async fn get_user(_: Request) -> Response { Response::text("") }
    /// # async fn create_user(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::Get,  "/users/{id}", get_user)
    ///     .on(Method::Post, "/users",      create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the pattern is malformed or conflicts with an existing
    /// route. Use [`Router::route`] to get an error instead.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        if let Err(e) = self.route(method, path, handler) {
            panic!("{e}");
        }
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Get, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::Post, path, handler)
    }

    /// Registers `handler` for `method` and `path`.
    pub fn route(&mut self, method: Method, path: &str, handler: impl Handler) -> Result<&mut Self> {
        let route = Route { pattern: Arc::from(path), handler: handler.into_boxed_handler() };
        // Release the endpoint's table reference so `make_mut` edits in place.
        self.endpoint = endpoint(Arc::default());
        let inserted = Arc::make_mut(&mut self.table).entry(method).or_default().insert(path, route);
        self.endpoint = endpoint(Arc::clone(&self.table));
        inserted.map_err(|e| Error::Route { path: path.to_owned(), reason: e.to_string() })?;
        Ok(self)
    }

    /// Registers `handler` for every method at `path`. The handler decides
    /// which methods it answers.
    pub fn any(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self> {
        let handler = handler.into_boxed_handler();
        for method in Method::ALL {
            self.route(method, path, handler.clone())?;
        }
        Ok(self)
    }

    /// Runs `req` through the pipeline and the matching route.
    ///
    /// Unknown methods get `405`, as do known methods on a path that only
    /// other methods serve (with an `allow` header). Anything else that
    /// matches no route gets `404`.
    pub fn call(&self, req: Request) -> BoxFuture<'static, Response> {
        self.pipeline.run(req, self.endpoint.clone())
    }
}

fn endpoint(table: Arc<Table>) -> BoxedHandler {
    (move |req: Request| {
        let table = Arc::clone(&table);
        async move { dispatch(&table, req).await }
    })
    .into_boxed_handler()
}

async fn dispatch(table: &Table, mut req: Request) -> Response {
    let Ok(method) = Method::try_from(req.method()) else {
        return Response::status(StatusCode::METHOD_NOT_ALLOWED);
    };

    let found = table.get(&method).and_then(|tree| tree.at(req.path()).ok()).map(|m| {
        let params = m.params.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
        (m.value.clone(), params)
    });

    let Some((route, params)) = found else {
        return not_routed(table, req.path());
    };

    req.params = params;
    let mut res = route.handler.call(req).await;
    res.extensions_mut().insert(MatchedPath(route.pattern));
    res
}

fn not_routed(table: &Table, path: &str) -> Response {
    let allowed: Vec<&str> = Method::ALL
        .into_iter()
        .filter(|m| table.get(m).is_some_and(|tree| tree.at(path).is_ok()))
        .map(Method::as_str)
        .collect();
    if allowed.is_empty() {
        return Response::status(StatusCode::NOT_FOUND);
    }
    let mut res = Response::status(StatusCode::METHOD_NOT_ALLOWED);
    if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
        res.headers_mut().insert(http::header::ALLOW, value);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{self, MiddlewareCategory, PipelineBuilder};

    async fn user(req: Request) -> Response {
        Response::text(format!("user {}", req.param("id").unwrap_or("?")))
    }

    #[tokio::test]
    async fn routes_with_params_and_records_pattern() {
        let router = Router::new().get("/users/{id}", user);
        let res = router.call(Request::new(http::Method::GET, "/users/42")).await;
        assert_eq!(res.body(), b"user 42");
        assert_eq!(res.extensions().get::<MatchedPath>().map(MatchedPath::as_str), Some("/users/{id}"));
    }

    #[tokio::test]
    async fn not_found_and_method_not_allowed() {
        let router = Router::new().get("/users/{id}", user);

        let res = router.call(Request::new(http::Method::GET, "/orders")).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);

        let res = router.call(Request::new(http::Method::DELETE, "/users/1")).await;
        assert_eq!(res.status_code(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers()["allow"], "GET");

        let purge = http::Method::from_bytes(b"PURGE").unwrap();
        let res = router.call(Request::new(purge, "/users/1")).await;
        assert_eq!(res.status_code(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn conflicting_route_is_an_error() {
        let mut router = Router::new();
        router.route(Method::Get, "/users/{id}", user).unwrap();
        let err = router.route(Method::Get, "/users/{name}", user).err().unwrap();
        assert!(matches!(err, Error::Route { .. }));
    }

    #[tokio::test]
    async fn pipeline_wraps_unmatched_requests_too() {
        let tag = middleware::from_fn(|req, next| async move {
            let mut res = next.run(req).await;
            res.headers_mut().insert("x-seen", HeaderValue::from_static("1"));
            res
        });
        let pipeline = PipelineBuilder::new()
            .builtin(MiddlewareCategory::Core, tag)
            .build(None)
            .unwrap();
        let router = Router::new().with_pipeline(pipeline);

        let res = router.call(Request::new(http::Method::GET, "/nowhere")).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()["x-seen"], "1");
    }

    #[tokio::test]
    async fn any_registers_every_method() {
        let mut router = Router::new();
        router.any("/internal/logging", |req: Request| async move { req.method().to_string() }).unwrap();
        let res = router.call(Request::new(http::Method::PATCH, "/internal/logging")).await;
        assert_eq!(res.body(), b"PATCH");
    }

    #[tokio::test]
    async fn routes_added_later_are_dispatched_and_clones_stay_independent() {
        let mut router = Router::new().get("/users/{id}", user);
        let snapshot = router.clone();
        router.route(Method::Get, "/orders", |_req: Request| async { "orders" }).unwrap();

        let res = router.call(Request::new(http::Method::GET, "/orders")).await;
        assert_eq!(res.body(), b"orders");
        let res = snapshot.call(Request::new(http::Method::GET, "/orders")).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        let res = snapshot.call(Request::new(http::Method::GET, "/users/9")).await;
        assert_eq!(res.body(), b"user 9");
    }

    #[tokio::test]
    async fn failed_registration_keeps_existing_routes() {
        let mut router = Router::new().get("/users/{id}", user);
        assert!(router.route(Method::Get, "/users/{name}", user).is_err());
        let res = router.call(Request::new(http::Method::GET, "/users/1")).await;
        assert_eq!(res.body(), b"user 1");
    }
}
