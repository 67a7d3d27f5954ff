//! Kubernetes probe handlers.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/internal/health` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/internal/ready` | Can the pod serve traffic? Failure → pulled from load-balancer. |
//! | **Startup** | `/internal/startup` | Has initialization finished? |
//!
//! Each probe is a plain function returning a [`ProbeResponse`]. A status
//! of `"ok"` answers `200`, anything else `503`:
//!
//! ```rust
//! use std::sync::Arc;
//! use tsu_bootstrap::probe::{ProbeHandlers, ProbeResponse};
//!
//! let probes = ProbeHandlers {
//!     readiness: Arc::new(|| {
//!         if dependencies_are_healthy() { ProbeResponse::ok() } else { ProbeResponse::new("degraded") }
//!     }),
//!     ..Default::default()
//! };
//! # fn dependencies_are_healthy() -> bool { true }
//! ```

use std::sync::Arc;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::handler::{BoxedHandler, Handler};
use crate::request::Request;
use crate::response::Response;

pub const STATUS_OK: &str = "ok";

/// Body of a probe response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ProbeResponse {
    pub fn ok() -> Self {
        Self::new(STATUS_OK)
    }

    pub fn new(status: impl Into<String>) -> Self {
        Self { status: status.into(), details: None }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.get_or_insert_with(Map::new).insert(key.into(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// A probe check. Runs on every probe request.
pub type ProbeCheck = Arc<dyn Fn() -> ProbeResponse + Send + Sync>;

/// The three probe checks mounted by the service.
#[derive(Clone)]
pub struct ProbeHandlers {
    pub liveness: ProbeCheck,
    pub readiness: ProbeCheck,
    pub startup: ProbeCheck,
}

impl Default for ProbeHandlers {
    fn default() -> Self {
        let ok: ProbeCheck = Arc::new(ProbeResponse::ok);
        Self { liveness: ok.clone(), readiness: ok.clone(), startup: ok }
    }
}

/// Wraps `check` into a handler answering `200` for `"ok"` and `503`
/// otherwise.
pub fn handler(check: ProbeCheck) -> BoxedHandler {
    (move |_req: Request| {
        let probe = check();
        async move { respond(&probe) }
    })
    .into_boxed_handler()
}

fn respond(probe: &ProbeResponse) -> Response {
    let status = if probe.is_ok() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    match serde_json::to_vec(probe) {
        Ok(body) => Response::builder().status(status).json(body),
        Err(e) => {
            error!(error = %e, "failed to encode probe response");
            Response::status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ok_status_answers_200() {
        let res = handler(Arc::new(ProbeResponse::ok))
            .call(Request::new(http::Method::GET, "/internal/health"))
            .await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body(), br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn other_status_answers_503_with_details() {
        let check: ProbeCheck = Arc::new(|| ProbeResponse::new("starting").with_detail("db", "connecting"));
        let res = handler(check).call(Request::new(http::Method::GET, "/internal/ready")).await;
        assert_eq!(res.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let body: ProbeResponse = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.status, "starting");
        assert_eq!(body.details.unwrap()["db"], "connecting");
    }
}
