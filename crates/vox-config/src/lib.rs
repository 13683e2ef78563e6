use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::time::Duration;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge. Used to snapshot the
/// operator-supplied `WorkerConfig` batch at `start` time for run attribution.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Runtime tunables recognized from the environment. Loaded once at startup;
/// a missing `database_url` is a configuration error (exit code 1).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker_interval_ms_default: u64,
    pub max_concurrent_calls: usize,
    pub max_concurrent_per_server: usize,
    pub lock_ttl_ms: u64,
    pub heartbeat_ms: u64,
    pub otp_timeout_ms: u64,
    pub database_url: String,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("ORCH_DATABASE_URL")
            .context("ORCH_DATABASE_URL is required")?;

        Ok(Self {
            worker_interval_ms_default: env_u64("ORCH_WORKER_INTERVAL_MS_DEFAULT", 800)?,
            max_concurrent_calls: env_u64("ORCH_MAX_CONCURRENT_CALLS", 50)? as usize,
            max_concurrent_per_server: env_u64("ORCH_MAX_CONCURRENT_PER_SERVER", 2)? as usize,
            lock_ttl_ms: env_u64("ORCH_LOCK_TTL_MS", 15_000)?,
            heartbeat_ms: env_u64("ORCH_HEARTBEAT_MS", 3_000)?,
            otp_timeout_ms: env_u64("ORCH_OTP_TIMEOUT_MS", 120_000)?,
            database_url,
        })
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn otp_timeout(&self) -> Duration {
        Duration::from_millis(self.otp_timeout_ms)
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{key} must be an integer, got {raw:?}")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).with_context(|| format!("reading {key}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overwrites_scalars_and_recurses_into_objects() {
        let mut base = serde_json::json!({"a": 1, "nested": {"x": 1, "y": 2}});
        let overlay = serde_json::json!({"a": 2, "nested": {"y": 9, "z": 3}});
        deep_merge(&mut base, overlay);
        assert_eq!(
            base,
            serde_json::json!({"a": 2, "nested": {"x": 1, "y": 9, "z": 3}})
        );
    }

    #[test]
    fn canonical_json_has_sorted_keys() {
        let v = serde_json::json!({"z": 1, "a": 2});
        assert_eq!(canonicalize_json(&v), r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn env_u64_falls_back_to_default_when_absent() {
        std::env::remove_var("VOX_TEST_UNSET_KEY");
        assert_eq!(env_u64("VOX_TEST_UNSET_KEY", 42).unwrap(), 42);
    }
}
