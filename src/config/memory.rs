//! Layered in-process [`Store`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::{ConfigFactory, ConfigHandle, MaskStrategy, MaskedStore, Store, StoreOptions, mask};
use crate::error::BoxError;
use crate::handler::BoxedHandler;

type EnvLookup = fn(&str) -> Option<String>;

#[derive(Default)]
struct Layers {
    defaults: Map<String, Value>,
    file: Map<String, Value>,
    overrides: Map<String, Value>,
}

struct Inner {
    config_file: Option<PathBuf>,
    env_prefix: Option<String>,
    env: EnvLookup,
    layers: RwLock<Layers>,
}

/// Settings resolved from four layers, highest priority first: values
/// passed to [`Store::set`], environment variables, the config file, and
/// defaults. Keys are stored lower-cased.
///
/// Clones share the same settings.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Builds a store with `opts.defaults` applied. The config file is not
    /// read until [`Store::read_config`].
    pub fn new(opts: &StoreOptions) -> Self {
        Self::with_env(opts, |name| std::env::var(name).ok())
    }

    fn with_env(opts: &StoreOptions, env: EnvLookup) -> Self {
        let mut layers = Layers::default();
        for (key, value) in &opts.defaults {
            insert_path(&mut layers.defaults, key, value.clone());
        }
        Self {
            inner: Arc::new(Inner {
                config_file: opts.config_file.as_ref().map(PathBuf::from),
                env_prefix: opts
                    .env_prefix
                    .as_ref()
                    .filter(|p| !p.is_empty())
                    .map(|p| p.replace('-', "_").to_uppercase()),
                env,
                layers: RwLock::new(layers),
            }),
        }
    }

    fn env_value(&self, key: &str) -> Option<Value> {
        let prefix = self.inner.env_prefix.as_deref()?;
        let name = format!("{prefix}_{}", key.replace('.', "_").to_uppercase());
        (self.inner.env)(&name).map(Value::String)
    }

    /// Overlays environment values onto every leaf of `map`.
    fn overlay_env(&self, map: &mut Map<String, Value>, prefix: &str) {
        for (k, v) in map.iter_mut() {
            let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
            match v {
                Value::Object(nested) => self.overlay_env(nested, &key),
                leaf => {
                    if let Some(env) = self.env_value(&key) {
                        *leaf = env;
                    }
                }
            }
        }
    }
}

impl Store for MemoryStore {
    fn get_value(&self, key: &str) -> Option<Value> {
        let key = key.to_lowercase();
        {
            let layers = self.inner.layers.read();
            if let Some(v) = lookup(&layers.overrides, &key).filter(|v| !v.is_object()) {
                return Some(v.clone());
            }
        }
        if let Some(v) = self.env_value(&key) {
            return Some(v);
        }
        lookup(&self.all_settings(), &key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        insert_path(&mut self.inner.layers.write().overrides, &key.to_lowercase(), value);
    }

    fn read_config(&self) -> Result<(), BoxError> {
        let path = self.inner.config_file.as_deref().ok_or("no config file configured")?;
        let file = read_file(path).map_err(|e| format!("reading config {}: {e}", path.display()))?;
        self.inner.layers.write().file = file;
        Ok(())
    }

    fn all_settings(&self) -> Map<String, Value> {
        let layers = self.inner.layers.read();
        let mut merged = layers.defaults.clone();
        merge(&mut merged, &layers.file);
        self.overlay_env(&mut merged, "");
        merge(&mut merged, &layers.overrides);
        merged
    }
}

impl MaskedStore for MemoryStore {
    fn config_handler(&self, strategy: MaskStrategy) -> BoxedHandler {
        mask::handler(Arc::new(self.clone()), strategy)
    }
}

/// Builds [`MemoryStore`]s with the masked-view capability. Reads the
/// config file immediately when one is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryStoreFactory;

impl ConfigFactory for MemoryStoreFactory {
    fn new_store(&self, opts: &StoreOptions) -> Result<ConfigHandle, BoxError> {
        let store = MemoryStore::new(opts);
        if opts.config_file.is_some() {
            store.read_config()?;
        }
        let store = Arc::new(store);
        Ok(ConfigHandle { store: store.clone(), masked: Some(store) })
    }
}

fn read_file(path: &Path) -> Result<Map<String, Value>, BoxError> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)?,
        Some("yaml" | "yml") | None => serde_yaml::from_str(&text)?,
        Some(other) => return Err(format!("unsupported config type {other:?}").into()),
    };
    match lowercase_keys(value) {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err("config root must be a mapping".into()),
    }
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k.to_lowercase(), lowercase_keys(v))).collect())
        }
        other => other,
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn insert_path(map: &mut Map<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            map.insert(key.to_owned(), value);
        }
        Some((head, rest)) => {
            let entry = map.entry(head).or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(nested) = entry {
                insert_path(nested, rest, value);
            }
        }
    }
}

/// Deep-merges `top` over `base`: nested maps merge, anything else replaces.
fn merge(base: &mut Map<String, Value>, top: &Map<String, Value>) {
    for (k, v) in top {
        match (base.get_mut(k), v) {
            (Some(Value::Object(b)), Value::Object(t)) => merge(b, t),
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;

    use super::*;
    use crate::config::StoreExt;

    fn fake_env(name: &str) -> Option<String> {
        match name {
            "ORDERS_SVC_SERVER_HTTP_PORT" => Some("9090".into()),
            "ORDERS_SVC_DATABASE_HOST" => Some("db.internal".into()),
            _ => None,
        }
    }

    fn options(defaults: &[(&str, Value)]) -> StoreOptions {
        StoreOptions {
            env_prefix: Some("orders-svc".into()),
            defaults: defaults.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn layers_resolve_in_priority_order() {
        let store = MemoryStore::with_env(
            &options(&[("server.http.port", Value::from(8080)), ("server.http.read_timeout", Value::from("15s"))]),
            fake_env,
        );

        assert_eq!(store.get_int("server.http.port"), Some(9090));
        assert_eq!(store.get_string("server.http.read_timeout").as_deref(), Some("15s"));

        store.set("Server.HTTP.Port", Value::from(7070));
        assert_eq!(store.get_int("server.http.port"), Some(7070));
        assert!(store.is_set("server.http"));
        assert!(!store.is_set("server.grpc"));
    }

    #[test]
    fn all_settings_merges_nested_sections() {
        let store = MemoryStore::with_env(
            &options(&[("server.http.port", Value::from(8080)), ("database.host", Value::from("localhost"))]),
            fake_env,
        );
        store.set("database.password", Value::from("secret123"));

        let all = Value::Object(store.all_settings());
        assert_eq!(all["server"]["http"]["port"], "9090");
        assert_eq!(all["database"]["host"], "db.internal");
        assert_eq!(all["database"]["password"], "secret123");
    }

    #[test]
    fn reads_yaml_and_json_files() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(yaml, "Server:\n  http:\n    port: 8181\n    shutdown_timeout: 5s").unwrap();
        let handle = MemoryStoreFactory
            .new_store(&StoreOptions { config_file: Some(yaml.path().display().to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(handle.store.get_int("server.http.port"), Some(8181));
        assert_eq!(
            handle.store.get_duration("server.http.shutdown_timeout"),
            Some(std::time::Duration::from_secs(5)),
        );
        assert!(handle.masked.is_some());

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"{{"features": {{"beta": true}}}}"#).unwrap();
        let store = MemoryStore::new(&StoreOptions {
            config_file: Some(json.path().display().to_string()),
            ..Default::default()
        });
        store.read_config().unwrap();
        assert_eq!(store.get_bool("features.beta"), Some(true));
    }

    #[test]
    fn read_config_errors() {
        assert!(MemoryStore::new(&StoreOptions::default()).read_config().is_err());

        let missing = StoreOptions { config_file: Some("/nonexistent/app.yaml".into()), ..Default::default() };
        assert!(MemoryStoreFactory.new_store(&missing).is_err());

        let toml = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let store = MemoryStore::new(&StoreOptions {
            config_file: Some(toml.path().display().to_string()),
            ..Default::default()
        });
        assert!(store.read_config().is_err());
    }

    #[test]
    fn unmarshal_reads_whole_tree() {
        #[derive(serde::Deserialize)]
        struct Settings {
            database: Database,
        }
        #[derive(serde::Deserialize)]
        struct Database {
            host: String,
        }

        let store = MemoryStore::with_env(&options(&[]), fake_env);
        store.set("database.host", Value::from("primary"));
        let settings: Settings = store.unmarshal().unwrap();
        assert_eq!(settings.database.host, "primary");
    }
}
