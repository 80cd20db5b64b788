use serde::{Deserialize, Serialize};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root directory every `ItemRef::path` is resolved against.
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,
    /// Position-only updates are coalesced onto this tick.
    #[serde(default = "default_state_push_interval_ms")]
    pub state_push_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    /// Explicit mpv binary; discovered beside the exe or on PATH when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the hub; the control channel is derived from it.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Advance the local queue automatically when the player reaches eof.
    #[serde(default = "default_true")]
    pub auto_advance: bool,
    /// Only honour eof for the file the local queue believes is current.
    #[serde(default = "default_true")]
    pub reconcile_identity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            media_root: default_media_root(),
            state_push_interval_ms: default_state_push_interval_ms(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            binary: None,
            default_volume: default_volume(),
            extra_args: default_extra_args(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            probe_timeout_ms: default_probe_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            auto_advance: true,
            reconcile_identity: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_file: default_queue_file(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

impl ClientConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// `http(s)://host/` → `ws(s)://host/ws/mpv`.
    pub fn control_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/ws/mpv", ws_base)
    }
}

impl QueueConfig {
    /// Out-of-range values fall back to the default ttl.
    pub fn ttl(&self) -> chrono::TimeDelta {
        i64::try_from(self.ttl_hours)
            .ok()
            .and_then(chrono::TimeDelta::try_hours)
            .unwrap_or_else(|| chrono::TimeDelta::hours(DEFAULT_TTL_HOURS))
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DEFAULT_HUB_PORT
}

fn default_media_root() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_state_push_interval_ms() -> u64 {
    500
}

fn default_volume() -> u8 {
    100
}

fn default_extra_args() -> Vec<String> {
    vec!["--force-window=yes".to_string(), "--keep-open=yes".to_string()]
}

fn default_server_url() -> String {
    format!("http://127.0.0.1:{}", platform::DEFAULT_HUB_PORT)
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

fn default_queue_file() -> PathBuf {
    platform::data_dir().join("queue.json")
}

const DEFAULT_TTL_HOURS: i64 = 24;

fn default_ttl_hours() -> u64 {
    DEFAULT_TTL_HOURS as u64
}

impl Config {
    /// Load from the default location, writing defaults on first run.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hub.port, 8765);
        assert_eq!(config.hub.bind_address, "127.0.0.1");
        assert_eq!(config.client.backoff_base_ms, 500);
        assert_eq!(config.client.backoff_max_ms, 15_000);
        assert_eq!(config.client.probe_timeout(), Duration::from_secs(2));
        assert!(config.client.auto_advance);
        assert!(config.client.reconcile_identity);
        assert_eq!(config.queue.ttl(), chrono::Duration::hours(24));
        assert!(config.queue.state_file.ends_with("playsync/queue.json"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            server_url = "https://media.example:9000/"
            auto_advance = false
            "#,
        )
        .unwrap();
        assert!(!config.client.auto_advance);
        assert!(config.client.reconcile_identity);
        assert_eq!(config.client.probe_timeout_ms, 2000);
        assert_eq!(config.client.control_url(), "wss://media.example:9000/ws/mpv");
        assert_eq!(config.hub.state_push_interval_ms, 500);
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.client.control_url(), "ws://127.0.0.1:8765/ws/mpv");
        assert_eq!(back.mpv.extra_args, config.mpv.extra_args);
    }

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.hub.port, 8765);

        std::fs::write(&path, "[hub]\nport = 9000\n").unwrap();
        assert_eq!(Config::load_from(&path).unwrap().hub.port, 9000);

        std::fs::write(&path, "[hub\nport = ").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("parsing"));
    }

    #[test]
    fn test_oversized_ttl_falls_back_to_default() {
        let mut queue = QueueConfig::default();
        queue.ttl_hours = u64::MAX;
        assert_eq!(queue.ttl(), chrono::TimeDelta::hours(24));

        queue.ttl_hours = i64::MAX as u64;
        assert_eq!(queue.ttl(), chrono::TimeDelta::hours(24));

        queue.ttl_hours = 24 * 365;
        assert_eq!(queue.ttl(), chrono::TimeDelta::days(365));
    }
}
