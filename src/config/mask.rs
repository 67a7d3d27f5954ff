//! Redacted configuration view.

use std::sync::Arc;

use http::StatusCode;
use serde_json::{Map, Value};
use tracing::error;

use super::MaskedStore;
use crate::handler::{BoxedHandler, Handler};
use crate::request::Request;
use crate::response::Response;

pub const DEFAULT_MASK: &str = "******";

pub const DEFAULT_SENSITIVE_KEYS: [&str; 5] = ["password", "secret", "key", "token", "credential"];

/// Which keys are sensitive and what replaces their values.
///
/// A leaf is masked when its fully-qualified dotted key (for example
/// `database.password`) contains any of `sensitive_keys`, ignoring case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaskStrategy {
    pub sensitive_keys: Vec<String>,
    /// Empty falls back to [`DEFAULT_MASK`].
    pub mask_pattern: String,
}

impl Default for MaskStrategy {
    fn default() -> Self {
        Self {
            sensitive_keys: DEFAULT_SENSITIVE_KEYS.iter().map(|k| (*k).to_owned()).collect(),
            mask_pattern: DEFAULT_MASK.to_owned(),
        }
    }
}

impl MaskStrategy {
    pub fn new<I, S>(sensitive_keys: I, mask_pattern: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sensitive_keys: sensitive_keys.into_iter().map(Into::into).collect(),
            mask_pattern: mask_pattern.into(),
        }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.sensitive_keys.iter().any(|s| key.contains(&s.to_lowercase()))
    }

    /// The mask for sensitive keys, `value` unchanged otherwise.
    pub fn mask_value(&self, key: &str, value: &Value) -> Value {
        if !self.is_sensitive(key) {
            return value.clone();
        }
        let mask = if self.mask_pattern.is_empty() { DEFAULT_MASK } else { &self.mask_pattern };
        Value::String(mask.to_owned())
    }
}

/// Returns a masked copy of `snapshot`. Nested maps keep their shape;
/// arrays are leaves.
pub fn mask(snapshot: &Map<String, Value>, strategy: &MaskStrategy) -> Map<String, Value> {
    mask_map("", snapshot, strategy)
}

fn mask_map(prefix: &str, map: &Map<String, Value>, strategy: &MaskStrategy) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| {
            let full_key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
            let masked = match v {
                Value::Object(nested) => Value::Object(mask_map(&full_key, nested, strategy)),
                leaf => strategy.mask_value(&full_key, leaf),
            };
            (k.clone(), masked)
        })
        .collect()
}

/// Serves the masked snapshot of `store` as JSON on `GET`; the view is
/// recomputed on every request.
pub fn handler(store: Arc<dyn MaskedStore>, strategy: MaskStrategy) -> BoxedHandler {
    let strategy = Arc::new(strategy);
    (move |req: Request| {
        let store = Arc::clone(&store);
        let strategy = Arc::clone(&strategy);
        async move {
            if req.method() != http::Method::GET {
                return Response::builder()
                    .status(StatusCode::METHOD_NOT_ALLOWED)
                    .text("Method not allowed");
            }
            let encoded = store
                .masked_config(&strategy)
                .and_then(|config| Ok(serde_json::to_vec(&config)?));
            match encoded {
                Ok(body) => Response::json(body),
                Err(e) => {
                    error!(error = %e, "failed to render masked config");
                    Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).text(e.to_string())
                }
            }
        }
    })
    .into_boxed_handler()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{MemoryStore, Store, StoreOptions};

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn masks_nested_password() {
        let strategy = MaskStrategy::new(["password"], "******");
        let snapshot = object(json!({"database": {"host": "localhost", "password": "secret123"}}));
        let masked = mask(&snapshot, &strategy);
        assert_eq!(
            Value::Object(masked),
            json!({"database": {"host": "localhost", "password": "******"}}),
        );
        assert_eq!(snapshot["database"]["password"], "secret123");
    }

    #[test]
    fn matches_dotted_path_case_insensitively() {
        let strategy = MaskStrategy::default();
        let snapshot = object(json!({
            "api": {"Key": "abc", "timeout": 5},
            "oauth": {"client": {"SECRET_value": "s", "id": "c"}},
            "tokens": ["a", "b"],
        }));
        let masked = Value::Object(mask(&snapshot, &strategy));
        assert_eq!(masked["api"]["Key"], DEFAULT_MASK);
        assert_eq!(masked["api"]["timeout"], 5);
        assert_eq!(masked["oauth"]["client"]["SECRET_value"], DEFAULT_MASK);
        assert_eq!(masked["oauth"]["client"]["id"], "c");
        assert_eq!(masked["tokens"], DEFAULT_MASK);
    }

    #[test]
    fn masking_is_idempotent() {
        let strategy = MaskStrategy::default();
        let snapshot = object(json!({"db": {"password": "p", "port": 5432}, "name": "orders"}));
        let once = mask(&snapshot, &strategy);
        assert_eq!(mask(&once, &strategy), once);
    }

    #[test]
    fn empty_mask_pattern_falls_back() {
        let strategy = MaskStrategy::new(["token"], "");
        assert_eq!(strategy.mask_value("auth.token", &json!("t")), json!(DEFAULT_MASK));
    }

    #[tokio::test]
    async fn handler_serves_get_only() {
        let store = MemoryStore::new(&StoreOptions::default());
        store.set("database.password", json!("secret123"));
        store.set("database.host", json!("localhost"));
        let handler = handler(Arc::new(store), MaskStrategy::default());

        let res = handler.call(Request::new(http::Method::GET, "/internal/config")).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body, json!({"database": {"host": "localhost", "password": "******"}}));

        let res = handler.call(Request::new(http::Method::POST, "/internal/config")).await;
        assert_eq!(res.status_code(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.body(), b"Method not allowed");
    }
}
