//! Server configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration loaded from `CASCADE_*` environment variables.
///
/// - `CASCADE_HOST` / `CASCADE_PORT`: bind address (default `0.0.0.0:3001`)
/// - `CASCADE_DATA_DIR`: failure records, stop markers and the workflow mirror
/// - `CASCADE_SCRIPTS_DIR`: directory of the default pipeline scripts
/// - `CASCADE_STAGE_REGISTRY`: JSON stage registry replacing the default pipeline
/// - `CASCADE_LOG_JSON`: emit JSON log lines
/// - `CASCADE_WORKFLOW_REGISTRY_URL` / `CASCADE_WORKFLOW_REGISTRY_API_KEY`:
///   external workflow registry; workflow sync is unavailable without them
/// - `CASCADE_SYNC_INTERVAL_SECS`: periodic workflow sync, disabled when 0
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    #[serde(default)]
    pub stage_registry: Option<PathBuf>,

    #[serde(default)]
    pub log_json: bool,

    /// Log lines kept per entity.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    #[serde(default)]
    pub workflow_registry_url: Option<String>,

    #[serde(default)]
    pub workflow_registry_api_key: Option<String>,

    #[serde(default = "default_registry_timeout_secs")]
    pub workflow_registry_timeout_secs: u64,

    #[serde(default)]
    pub sync_interval_secs: u64,

    /// Seconds a stage may ignore a stop request before it is killed.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_max_log_entries() -> usize {
    cascade::state::DEFAULT_MAX_LOG_ENTRIES
}

fn default_registry_timeout_secs() -> u64 {
    30
}

fn default_stop_grace_secs() -> u64 {
    300
}

impl ServerConfig {
    /// Load configuration from environment variables prefixed with `CASCADE_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed("CASCADE_").from_iter(vars)
    }

    /// Address suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn failures_dir(&self) -> PathBuf {
        self.data_dir.join("failures")
    }

    pub fn stop_dir(&self) -> PathBuf {
        self.data_dir.join("stop")
    }

    pub fn mirror_path(&self) -> PathBuf {
        self.data_dir.join("workflows.json")
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Periodic sync interval, if enabled.
    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            scripts_dir: default_scripts_dir(),
            stage_registry: None,
            log_json: false,
            max_log_entries: default_max_log_entries(),
            workflow_registry_url: None,
            workflow_registry_api_key: None,
            workflow_registry_timeout_secs: default_registry_timeout_secs(),
            sync_interval_secs: 0,
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}
