//! Built-in middleware of the Core category.
//!
//! Installed in this order by the service router: request id, client IP,
//! panic recovery, base timeout.

use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use http::{HeaderValue, StatusCode};
use tracing::{error, warn};
use uuid::Uuid;

use super::{Middleware, from_fn};
use crate::response::Response;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id attached to the request extensions by [`request_id`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Client address resolved by [`real_ip`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RealIp(pub IpAddr);

/// Reuses an incoming `x-request-id` header or generates a UUID v4, stores
/// it as [`RequestId`] and echoes it on the response.
pub fn request_id() -> Middleware {
    from_fn(|mut req, next| async move {
        let id = req
            .header(REQUEST_ID_HEADER)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        req.extensions_mut().insert(RequestId(id.clone()));

        let mut res = next.run(req).await;
        if let Ok(value) = HeaderValue::from_str(&id) {
            res.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        res
    })
}

/// Resolves the client address from `x-forwarded-for` (first hop), then
/// `x-real-ip`, then the peer address, and stores it as [`RealIp`].
pub fn real_ip() -> Middleware {
    from_fn(|mut req, next| async move {
        let forwarded: Option<IpAddr> = req
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        let ip = forwarded
            .or_else(|| req.header("x-real-ip").and_then(|v| v.trim().parse().ok()))
            .or_else(|| req.remote_addr().map(|a| a.ip()));
        if let Some(ip) = ip {
            req.extensions_mut().insert(RealIp(ip));
        }
        next.run(req).await
    })
}

/// Turns a panic anywhere further down the chain into `500 Internal Server
/// Error` so one bad request never takes the connection task down.
pub fn recover() -> Middleware {
    from_fn(|req, next| async move {
        let method = req.method().clone();
        let path = req.path().to_owned();
        match AssertUnwindSafe(async move { next.run(req).await }).catch_unwind().await {
            Ok(res) => res,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                error!(%method, %path, %reason, "handler panicked");
                Response::status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    })
}

/// Answers `504 Gateway Timeout` when the rest of the chain takes longer
/// than `limit`.
pub fn timeout(limit: Duration) -> Middleware {
    from_fn(move |req, next| async move {
        let path = req.path().to_owned();
        match tokio::time::timeout(limit, next.run(req)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(%path, limit_ms = limit.as_millis() as u64, "request timed out");
                Response::status(StatusCode::GATEWAY_TIMEOUT)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::middleware::{MiddlewareCategory, PipelineBuilder};
    use crate::request::Request;

    fn pipeline(layer: Middleware) -> crate::middleware::Pipeline {
        PipelineBuilder::new()
            .builtin(MiddlewareCategory::Core, layer)
            .build(None)
            .unwrap()
    }

    #[tokio::test]
    async fn request_id_is_generated_and_echoed() {
        let endpoint = (|req: Request| async move {
            req.extensions().get::<RequestId>().map(|id| id.0.clone()).unwrap_or_default()
        })
        .into_boxed_handler();
        let res = pipeline(request_id()).run(Request::new(http::Method::GET, "/"), endpoint).await;

        let header = res.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_owned();
        assert!(Uuid::parse_str(&header).is_ok());
        assert_eq!(res.body(), header.as_bytes());
    }

    #[tokio::test]
    async fn incoming_request_id_is_kept() {
        let endpoint = (|_req: Request| async { "ok" }).into_boxed_handler();
        let req = Request::new(http::Method::GET, "/").with_header("x-request-id", "abc-123");
        let res = pipeline(request_id()).run(req, endpoint).await;
        assert_eq!(res.headers()[REQUEST_ID_HEADER], "abc-123");
    }

    #[tokio::test]
    async fn real_ip_prefers_forwarded_for() {
        let endpoint = (|req: Request| async move {
            req.extensions().get::<RealIp>().map(|ip| ip.0.to_string()).unwrap_or_default()
        })
        .into_boxed_handler();
        let req = Request::new(http::Method::GET, "/")
            .with_header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .with_header("x-real-ip", "198.51.100.1");
        let res = pipeline(real_ip()).run(req, endpoint).await;
        assert_eq!(res.body(), b"203.0.113.7");
    }

    #[tokio::test]
    async fn panics_become_500() {
        let endpoint = (|_req: Request| async {
            if true {
                panic!("boom");
            }
            "unreachable"
        })
        .into_boxed_handler();
        let res = pipeline(recover()).run(Request::new(http::Method::GET, "/"), endpoint).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_time_out() {
        let endpoint = (|_req: Request| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "late"
        })
        .into_boxed_handler();
        let res = pipeline(timeout(Duration::from_secs(1)))
            .run(Request::new(http::Method::GET, "/"), endpoint)
            .await;
        assert_eq!(res.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
