use std::sync::{Arc, RwLock};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GoogleConfig {
    pub gtag: Option<String>,
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpDataConfig {
    pub apikey: Option<String>,
}

/// Per-tracker event toggles. `raw` enables low-level per-transition events,
/// `summary` enables the single terminal aggregate event per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    pub raw: bool,
    pub summary: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            raw: false,
            summary: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub google: GoogleConfig,
    pub ipdata: IpDataConfig,
    pub user_info: Map<String, Value>,
    pub lifecycle: TrackerConfig,
    pub player: TrackerConfig,
}

/// Shared configuration handle. Readers take a short read lock;
/// `merge` is the only writer.
#[derive(Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().unwrap().clone()
    }

    pub fn debug_mode(&self) -> bool {
        self.inner.read().unwrap().google.debug
    }

    pub fn lifecycle(&self) -> TrackerConfig {
        self.inner.read().unwrap().lifecycle.clone()
    }

    pub fn player(&self) -> TrackerConfig {
        self.inner.read().unwrap().player.clone()
    }

    /// Merges a sparse configuration fragment into the current config.
    /// Unknown keys are tolerated and dropped on the round trip.
    pub fn merge(&self, sparse: Value) {
        let mut guard = self.inner.write().unwrap();
        let mut current = match serde_json::to_value(&*guard) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to serialize config for merge: {err}");
                return;
            }
        };
        merge_value(&mut current, &sparse);
        match serde_json::from_value(current) {
            Ok(merged) => *guard = merged,
            Err(err) => warn!("Ignoring unusable config fragment: {err}"),
        }
    }
}

/// Recursive key-wise override: objects merge per key, arrays replace
/// wholesale, scalars overwrite.
pub fn merge_value(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && source_value.is_object() => {
                        merge_value(existing, source_value);
                    }
                    _ => {
                        target_map.insert(key.clone(), source_value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}
