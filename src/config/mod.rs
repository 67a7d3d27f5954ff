//! Configuration collaborator.
//!
//! The service reads settings through the object-safe [`Store`] trait.
//! Typed getters return `None` when a key is absent so callers can tell
//! "unset" apart from a zero value. A store that can also expose a
//! redacted snapshot advertises it through [`ConfigHandle::masked`].

mod mask;
mod memory;

pub use mask::{DEFAULT_MASK, DEFAULT_SENSITIVE_KEYS, MaskStrategy, handler, mask};
pub use memory::{MemoryStore, MemoryStoreFactory};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::BoxError;
use crate::handler::BoxedHandler;

/// Key/value configuration source. Keys are dotted paths
/// (`server.http.port`) and case-insensitive.
pub trait Store: Send + Sync {
    /// Raw value at `key`, nested sections included.
    fn get_value(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value);

    fn is_set(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    /// Loads (or reloads) the configured source.
    fn read_config(&self) -> Result<(), BoxError>;

    /// Every effective setting as one nested map.
    fn all_settings(&self) -> Map<String, Value>;

    fn get_string(&self, key: &str) -> Option<String> {
        match self.get_value(key)? {
            Value::String(s) => Some(s),
            Value::Null => Some(String::new()),
            other => Some(other.to_string()),
        }
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.get_value(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(i64::from(b)),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_value(key)? {
            Value::Bool(b) => Some(b),
            Value::String(s) => parse_bool(&s),
            Value::Number(n) => n.as_i64().map(|i| i != 0),
            _ => None,
        }
    }

    fn get_float(&self, key: &str) -> Option<f64> {
        match self.get_value(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integers are seconds; strings use the `1h2m3s` / `500ms` form.
    fn get_duration(&self, key: &str) -> Option<Duration> {
        match self.get_value(key)? {
            Value::Number(n) => n.as_f64().filter(|f| *f >= 0.0).map(Duration::from_secs_f64),
            Value::String(s) => parse_duration(&s),
            _ => None,
        }
    }

    /// Arrays element-wise; strings split on commas.
    fn get_string_slice(&self, key: &str) -> Option<Vec<String>> {
        match self.get_value(key)? {
            Value::Array(items) => Some(
                items
                    .into_iter()
                    .map(|v| match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            Value::String(s) => Some(
                s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect(),
            ),
            _ => None,
        }
    }
}

/// Serde decoding on top of any [`Store`].
pub trait StoreExt: Store {
    /// Decodes the section at `key`. `Ok(None)` when the key is unset.
    fn unmarshal_key<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BoxError> {
        match self.get_value(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Decodes every setting into `T`.
    fn unmarshal<T: DeserializeOwned>(&self) -> Result<T, BoxError> {
        Ok(serde_json::from_value(Value::Object(self.all_settings()))?)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// A store that can serve a redacted view of itself.
pub trait MaskedStore: Store {
    fn masked_config(&self, strategy: &MaskStrategy) -> Result<Map<String, Value>, BoxError> {
        Ok(mask(&self.all_settings(), strategy))
    }

    /// Handler mounted at `/internal/config`.
    fn config_handler(&self, strategy: MaskStrategy) -> BoxedHandler;
}

/// A constructed store and the optional capabilities it supports.
#[derive(Clone)]
pub struct ConfigHandle {
    pub store: Arc<dyn Store>,
    pub masked: Option<Arc<dyn MaskedStore>>,
}

/// Options handed to a [`ConfigFactory`].
#[derive(Clone, Debug, Default)]
pub struct StoreOptions {
    /// JSON or YAML file, chosen by extension. Read at construction.
    pub config_file: Option<String>,
    /// Environment overlay prefix: `server.http.port` is looked up as
    /// `<PREFIX>_SERVER_HTTP_PORT`.
    pub env_prefix: Option<String>,
    /// Lowest-priority values, keyed by dotted path.
    pub defaults: BTreeMap<String, Value>,
}

pub trait ConfigFactory: Send + Sync {
    fn new_store(&self, opts: &StoreOptions) -> Result<ConfigHandle, BoxError>;
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses `"90"` (seconds), `"1h30m"`, `"1.5s"`, `"250ms"`, `"10us"`,
/// `"100ns"`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "h" => 3_600_000_000_000.0,
            "m" => 60_000_000_000.0,
            "s" => 1_000_000_000.0,
            "ms" => 1_000_000.0,
            "us" | "µs" => 1_000.0,
            "ns" => 1.0,
            _ => return None,
        };
        rest = &rest[unit_end..];
        nanos += value * scale;
    }
    Some(Duration::from_nanos(nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("15"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("1h2m3s"), Some(Duration::from_secs(3723)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("10 parsecs"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn typed_getters_convert_strings() {
        let store = MemoryStore::new(&StoreOptions::default());
        store.set("server.http.port", Value::from("8081"));
        store.set("server.tls.enabled", Value::from("true"));
        store.set("server.http.read_timeout", Value::from(20));
        store.set("hosts", Value::from("a, b,c"));

        assert_eq!(store.get_int("server.http.port"), Some(8081));
        assert_eq!(store.get_bool("server.tls.enabled"), Some(true));
        assert_eq!(store.get_duration("server.http.read_timeout"), Some(Duration::from_secs(20)));
        assert_eq!(store.get_string_slice("hosts").unwrap(), ["a", "b", "c"]);
        assert_eq!(store.get_int("missing"), None);
    }

    #[test]
    fn unmarshal_key_decodes_sections() {
        #[derive(serde::Deserialize)]
        struct Http {
            port: u16,
        }

        let store = MemoryStore::new(&StoreOptions::default());
        store.set("server.http.port", Value::from(9000));
        let http: Http = store.unmarshal_key("server.http").unwrap().unwrap();
        assert_eq!(http.port, 9000);
        assert!(store.unmarshal_key::<Http>("server.grpc").unwrap().is_none());
    }
}
