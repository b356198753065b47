//! OpenDesk configuration loader.

use od_queue::{BackoffPolicy, WorkerConfig};
use od_session::{HealthConfig, SupervisorConfig, SyncConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenDeskConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub events: EventsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8410".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the channel store and queue databases.
    /// Default: `~/.opendesk/data`
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl StorageConfig {
    pub fn data_dir_path(&self) -> anyhow::Result<PathBuf> {
        match self.data_dir.as_deref() {
            Some(raw) => expand_home(raw),
            None => Ok(default_data_dir()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_bulk_concurrency")]
    pub bulk_concurrency: usize,
}

fn default_connect_timeout_seconds() -> u64 {
    300
}

fn default_bulk_concurrency() -> usize {
    4
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout_seconds(),
            bulk_concurrency: default_bulk_concurrency(),
        }
    }
}

impl SupervisorSection {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            bulk_concurrency: self.bulk_concurrency,
            ..SupervisorConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    #[serde(default = "default_heartbeat_grace_seconds")]
    pub heartbeat_grace_seconds: u64,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_error_window_seconds")]
    pub error_window_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stale_grace_seconds")]
    pub stale_grace_seconds: u64,
}

fn default_probe_interval_seconds() -> u64 {
    30
}

fn default_heartbeat_grace_seconds() -> u64 {
    180
}

fn default_error_threshold() -> u32 {
    3
}

fn default_error_window_seconds() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    5
}

fn default_stale_grace_seconds() -> u64 {
    600
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval_seconds(),
            heartbeat_grace_seconds: default_heartbeat_grace_seconds(),
            error_threshold: default_error_threshold(),
            error_window_seconds: default_error_window_seconds(),
            max_retries: default_max_retries(),
            stale_grace_seconds: default_stale_grace_seconds(),
        }
    }
}

impl HealthSection {
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            probe_interval: Duration::from_secs(self.probe_interval_seconds),
            heartbeat_grace: Duration::from_secs(self.heartbeat_grace_seconds),
            error_threshold: self.error_threshold,
            error_window: Duration::from_secs(self.error_window_seconds),
            max_retries: self.max_retries,
            stale_grace: Duration::from_secs(self.stale_grace_seconds),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_sync_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_sync_interval_seconds() -> u64 {
    60
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_sync_interval_seconds(),
        }
    }
}

impl SyncSection {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: Duration::from_secs(self.interval_seconds),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_queue_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_queue_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,
}

fn default_queue_workers() -> usize {
    2
}

fn default_queue_poll_interval_ms() -> u64 {
    500
}

fn default_queue_lease_seconds() -> u64 {
    60
}

fn default_queue_batch_size() -> usize {
    8
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            workers: default_queue_workers(),
            poll_interval_ms: default_queue_poll_interval_ms(),
            lease_seconds: default_queue_lease_seconds(),
            batch_size: default_queue_batch_size(),
        }
    }
}

impl QueueSection {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_for: Duration::from_secs(self.lease_seconds),
            batch_size: self.batch_size,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsSection {
    /// POST target for published events; unset means events stay in-process.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl OpenDeskConfig {
    /// Load from an explicit path (must exist) or the default path
    /// (missing file falls back to defaults).
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (explicit, path) = match path {
            Some(path) => (true, path),
            None => (false, default_config_path()),
        };

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => toml::from_str::<OpenDeskConfig>(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                OpenDeskConfig::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!("read config {}: {e}", path.display()));
            }
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OPENDESK_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.server.bind_addr = v;
            }
        }
        if let Ok(v) = std::env::var("OPENDESK_DATA_DIR") {
            if !v.trim().is_empty() {
                self.storage.data_dir = Some(v);
            }
        }
        if let Ok(v) = std::env::var("OPENDESK_EVENT_WEBHOOK_URL") {
            if !v.trim().is_empty() {
                self.events.webhook_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("OPENDESK_EVENT_WEBHOOK_SECRET") {
            if !v.trim().is_empty() {
                self.events.webhook_secret = Some(v);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.supervisor.connect_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "supervisor.connect_timeout_seconds must be > 0"
            ));
        }
        if self.queue.workers == 0 {
            return Err(anyhow::anyhow!("queue.workers must be > 0"));
        }
        if self.queue.batch_size == 0 {
            return Err(anyhow::anyhow!("queue.batch_size must be > 0"));
        }
        if self.health.error_threshold == 0 {
            return Err(anyhow::anyhow!("health.error_threshold must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr))
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".opendesk").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".opendesk").join("data")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::OpenDeskConfig;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: OpenDeskConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:8410");
        assert_eq!(cfg.supervisor.connect_timeout_seconds, 300);
        assert_eq!(cfg.health.error_threshold, 3);
        assert_eq!(cfg.health.max_retries, 5);
        assert_eq!(cfg.sync.interval_seconds, 60);
        assert_eq!(cfg.queue.workers, 2);
        assert!(cfg.events.webhook_url.is_none());
    }

    #[test]
    fn partial_sections_keep_unset_defaults() {
        let cfg: OpenDeskConfig = toml::from_str(
            r#"
[server]
bind_addr = "0.0.0.0:9000"

[health]
max_retries = 2
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.server.http_timeout_seconds, 30);
        assert_eq!(cfg.health.max_retries, 2);
        assert_eq!(cfg.health.error_threshold, 3);
    }

    #[test]
    fn invalid_bind_addr_fails_validation() {
        let mut cfg = OpenDeskConfig::default();
        cfg.server.bind_addr = "not-an-addr".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_workers_fails_validation() {
        let mut cfg = OpenDeskConfig::default();
        cfg.queue.workers = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sections_convert_to_runtime_configs() {
        let cfg = OpenDeskConfig::default();
        let supervisor = cfg.supervisor.supervisor_config();
        assert_eq!(supervisor.connect_timeout.as_secs(), 300);
        let health = cfg.health.health_config();
        assert_eq!(health.probe_interval.as_secs(), 30);
        let worker = cfg.queue.worker_config();
        assert_eq!(worker.workers, 2);
    }
}
