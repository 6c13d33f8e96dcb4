use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_DETACH_OVER_BYTES: i64 = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hostnames served by the admin console surface (exact match).
    #[serde(default)]
    pub ui_hosts: Vec<String>,
    /// Base domains whose single-label subdomains select an upstream.
    #[serde(default = "default_proxy_domains")]
    pub proxy_domains: Vec<String>,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8788
}

fn default_proxy_domains() -> Vec<String> {
    vec!["localhost".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            ui_hosts: Vec::new(),
            proxy_domains: default_proxy_domains(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Absolute base URL; its path prefix is prepended to the inbound path.
    pub target: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Request-side capture cap in bytes. <= 0 counts bytes without buffering.
    #[serde(default = "default_max_request_body")]
    pub max_request_body: i64,
    /// Response-side capture cap in bytes.
    #[serde(default = "default_max_response_body")]
    pub max_response_body: i64,
    /// Header names whose captured values are masked (case-insensitive).
    #[serde(default = "default_sensitive_headers")]
    pub sensitive_headers: Vec<String>,
    /// Inline bodies larger than this move to the blob store.
    /// 0 selects the built-in default; negative disables detaching.
    #[serde(default)]
    pub detach_body_over_bytes: i64,
    /// Inline preview bound after detaching. 0 disables previews.
    #[serde(default = "default_body_preview_bytes")]
    pub body_preview_bytes: usize,
}

fn default_max_request_body() -> i64 {
    1024 * 1024
}

fn default_max_response_body() -> i64 {
    4 * 1024 * 1024
}

fn default_sensitive_headers() -> Vec<String> {
    [
        "authorization",
        "proxy-authorization",
        "cookie",
        "set-cookie",
        "x-api-key",
        "x-goog-api-key",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_body_preview_bytes() -> usize {
    4096
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_request_body: default_max_request_body(),
            max_response_body: default_max_response_body(),
            sensitive_headers: default_sensitive_headers(),
            detach_body_over_bytes: 0,
            body_preview_bytes: default_body_preview_bytes(),
        }
    }
}

impl LoggingConfig {
    /// Effective detach threshold: None when detaching is disabled.
    pub fn detach_threshold(&self) -> Option<usize> {
        match self.detach_body_over_bytes {
            0 => Some(DEFAULT_DETACH_OVER_BYTES as usize),
            n if n < 0 => None,
            n => Some(n as usize),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
    /// Records older than this many days are purged. 0 keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Capacity of the bounded queue feeding the storage worker.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_db_path() -> PathBuf {
    prismcat_home_dir().join("prismcat.db")
}

fn default_blob_dir() -> PathBuf {
    prismcat_home_dir().join("blobs")
}

fn default_retention_days() -> u32 {
    30
}

fn default_queue_size() -> usize {
    1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            blob_dir: default_blob_dir(),
            retention_days: default_retention_days(),
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Lower-cases upstream names and rejects case-insensitive duplicates.
    pub fn normalize(mut self) -> Result<Self> {
        let mut upstreams = HashMap::with_capacity(self.upstreams.len());
        for (name, upstream) in self.upstreams.drain() {
            let lower = name.to_ascii_lowercase();
            if upstreams.insert(lower.clone(), upstream).is_some() {
                bail!("duplicate upstream name (case-insensitive): {lower}");
            }
        }
        self.upstreams = upstreams;
        Ok(self)
    }
}

pub fn prismcat_home_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".prismcat")
}

pub fn default_config_path() -> PathBuf {
    prismcat_home_dir().join("config.toml")
}

pub async fn load_config(path: &Path) -> Result<Config> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Config::default().normalize();
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let cfg: Config = toml::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    cfg.normalize()
}

/// Shared configuration handle. Handlers take an `Arc` snapshot at entry so a
/// concurrent update never splits one request's behavior.
pub struct SharedConfig {
    current: RwLock<Arc<Config>>,
}

impl SharedConfig {
    pub fn new(initial: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub async fn snapshot(&self) -> Arc<Config> {
        self.current.read().await.clone()
    }

    pub async fn replace(&self, cfg: Config) {
        *self.current.write().await = Arc::new(cfg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [upstreams.openai]
            target = "https://api.openai.com"
            "#,
        )
        .unwrap();
        let cfg = cfg.normalize().unwrap();

        assert_eq!(cfg.server.port, 8788);
        assert_eq!(cfg.server.proxy_domains, vec!["localhost".to_string()]);
        assert_eq!(cfg.upstreams["openai"].timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(cfg.logging.max_request_body, 1024 * 1024);
        assert_eq!(cfg.storage.retention_days, 30);
    }

    #[test]
    fn normalize_lowercases_upstream_names() {
        let cfg: Config = toml::from_str(
            r#"
            [upstreams.OpenAI]
            target = "https://api.openai.com"
            "#,
        )
        .unwrap();
        let cfg = cfg.normalize().unwrap();
        assert!(cfg.upstreams.contains_key("openai"));
    }

    #[test]
    fn normalize_rejects_case_insensitive_duplicates() {
        let cfg: Config = toml::from_str(
            r#"
            [upstreams.openai]
            target = "https://one.example"
            [upstreams.OPENAI]
            target = "https://two.example"
            "#,
        )
        .unwrap();
        assert!(cfg.normalize().is_err());
    }

    #[test]
    fn detach_threshold_modes() {
        let mut logging = LoggingConfig::default();
        assert_eq!(
            logging.detach_threshold(),
            Some(DEFAULT_DETACH_OVER_BYTES as usize)
        );

        logging.detach_body_over_bytes = -1;
        assert_eq!(logging.detach_threshold(), None);

        logging.detach_body_over_bytes = 8;
        assert_eq!(logging.detach_threshold(), Some(8));
    }
}
