//! Generic key/value configuration and its translation into actor settings.
//!
//! The orchestrator only reads `num_slaves`. Everything else is forwarded
//! untouched: the coordinator and the workers each load their own settings
//! from the whole mapping and ignore keys they do not know.

use std::path::PathBuf;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::resources::Resources;

pub const NUM_WORKERS_KEY: &str = "num_slaves";
pub const QUIET_KEY: &str = "quiet";
pub const RESOURCES_KEY: &str = "resources";
pub const ADMISSION_KEY: &str = "slaves";
pub const WORK_DIR_KEY: &str = "work_dir";
pub const HOSTNAME_KEY: &str = "hostname";
pub const CLUSTER_KEY: &str = "cluster";
pub const LOG_DIR_KEY: &str = "log_dir";

const DEFAULT_NUM_WORKERS: i64 = 1;

/// Configuration translation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("key '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("{component} settings: {source}")]
    Settings {
        component: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Immutable-by-convention key/value configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    values: Map<String, Value>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shorthand launch form: worker count, per-worker resources, quiet.
    ///
    /// Admission is left open (`slaves = "*"`).
    pub fn for_workers(num_workers: usize, cpus: f64, mem: u64, disk: u64, quiet: bool) -> Self {
        Self::new()
            .with(ADMISSION_KEY, "*")
            .with(NUM_WORKERS_KEY, num_workers as u64)
            .with(QUIET_KEY, quiet)
            .with(
                RESOURCES_KEY,
                format!("cpus:{};mem:{};disk:{}", cpus, mem, disk),
            )
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reads an integer, accepting numbers and numeric strings.
    pub fn get_i64(&self, key: &str, default: i64) -> Result<i64, ConfigError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value_to_i64(value).ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected an integer, got {}", value),
            }),
        }
    }

    /// Reads a flag, accepting booleans and `true`/`false`/`1`/`0` strings.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value_to_bool(value).ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got {}", value),
            }),
        }
    }

    /// Reads a value as a string; non-string scalars are rendered.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Number of workers to launch (`num_slaves`, default 1).
    pub fn num_workers(&self) -> Result<usize, ConfigError> {
        let n = self.get_i64(NUM_WORKERS_KEY, DEFAULT_NUM_WORKERS)?;
        usize::try_from(n).map_err(|_| ConfigError::InvalidValue {
            key: NUM_WORKERS_KEY.to_string(),
            message: format!("worker count cannot be negative, got {}", n),
        })
    }

    pub fn coordinator_settings(&self) -> Result<CoordinatorSettings, ConfigError> {
        self.load("coordinator")
    }

    pub fn worker_settings(&self) -> Result<WorkerSettings, ConfigError> {
        self.load("worker")
    }

    fn load<T: for<'de> Deserialize<'de>>(&self, component: &'static str) -> Result<T, ConfigError> {
        serde_json::from_value(Value::Object(self.values.clone()))
            .map_err(|source| ConfigError::Settings { component, source })
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = Self::new();
        for (key, value) in iter {
            config.set(key, value);
        }
        config
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Settings the coordinator loads from the forwarded configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default, deserialize_with = "flexible_bool")]
    pub quiet: bool,

    /// Worker admission list: `*` or comma-separated hostnames.
    #[serde(rename = "slaves", default = "default_admission")]
    pub admission: String,

    /// Cluster name used in logs and snapshots.
    #[serde(rename = "cluster", default = "default_cluster_name")]
    pub cluster_name: String,

    /// Directory published through the file registry, if any.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl CoordinatorSettings {
    /// Whether a worker on `hostname` may register.
    pub fn admits(&self, hostname: &str) -> bool {
        self.admission
            .split(',')
            .map(str::trim)
            .any(|entry| entry == "*" || entry == hostname)
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            quiet: false,
            admission: default_admission(),
            cluster_name: default_cluster_name(),
            log_dir: None,
        }
    }
}

/// Settings every worker loads from the forwarded configuration.
///
/// `work_dir` is the base directory; the orchestrator gives each worker its
/// own subdirectory.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    #[serde(default, deserialize_with = "flexible_bool")]
    pub quiet: bool,

    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_worker_resources")]
    pub resources: Resources,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            quiet: false,
            work_dir: default_work_dir(),
            hostname: default_hostname(),
            resources: default_worker_resources(),
        }
    }
}

fn default_admission() -> String {
    "*".to_string()
}

fn default_cluster_name() -> String {
    "local".to_string()
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("minicluster")
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_worker_resources() -> Resources {
    Resources::from_parts(1.0, 1024, 10240)
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(false),
        other => value_to_bool(&other)
            .ok_or_else(|| de::Error::custom(format!("expected a boolean, got {}", other))),
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
