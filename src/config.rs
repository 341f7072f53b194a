//! TOML configuration.
//!
//! Endpoints, timeouts and pipeline tuning live in the config file. Secrets
//! do not: each client section names the environment variable holding its
//! token, and the value is read when the client is built.
//!
//! ```toml
//! [db]
//! path = "./data/curator.sqlite"
//!
//! [http]
//! timeout_secs = 30
//!
//! [analytics]
//! base_url = "http://public.infiviz.ai/api/v1"
//!
//! [ai_controller]
//! base_url = "https://aicontroller.infilect.com"
//!
//! [curation]
//! base_url = "https://curation.infilect.com/api/v1"
//! softtags = ["brand", "variant", "sku"]
//!
//! [pipeline]
//! cancel_check_interval = 10
//! group_by = "category"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sampler::GroupBy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub http: HttpConfig,
    pub analytics: AnalyticsConfig,
    pub ai_controller: AiControllerConfig,
    pub curation: CurationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    pub base_url: String,
    #[serde(default = "default_analytics_token_env")]
    pub token_env: String,
}

fn default_analytics_token_env() -> String {
    "ANALYTICS_API_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiControllerConfig {
    pub base_url: String,
    #[serde(default = "default_ai_controller_key_env")]
    pub api_key_env: String,
}

fn default_ai_controller_key_env() -> String {
    "AI_CONTROLLER_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CurationConfig {
    pub base_url: String,
    #[serde(default = "default_curation_token_env")]
    pub token_env: String,
    #[serde(default = "default_softtags")]
    pub softtags: Vec<String>,
    #[serde(default = "default_label_batch_size")]
    pub label_batch_size: usize,
}

fn default_curation_token_env() -> String {
    "CURATION_TOKEN".to_string()
}
fn default_softtags() -> Vec<String> {
    vec!["brand".to_string(), "variant".to_string(), "sku".to_string()]
}
fn default_label_batch_size() -> usize {
    490
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,
    #[serde(default)]
    pub group_by: GroupBy,
    /// Where launchers drop the per-task parameter files.
    #[serde(default = "default_params_dir")]
    pub params_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cancel_check_interval: default_cancel_check_interval(),
            group_by: GroupBy::default(),
            params_dir: default_params_dir(),
        }
    }
}

fn default_cancel_check_interval() -> usize {
    10
}
fn default_params_dir() -> PathBuf {
    std::env::temp_dir().join("curator-params")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// When set, log lines are also appended to `<dir>/<component>.log`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Read a secret from the environment variable named in config.
pub fn secret_from_env(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("{} environment variable not set", var))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }

    if config.pipeline.cancel_check_interval == 0 {
        anyhow::bail!("pipeline.cancel_check_interval must be > 0");
    }

    if config.curation.label_batch_size == 0 {
        anyhow::bail!("curation.label_batch_size must be > 0");
    }

    for (name, url) in [
        ("analytics.base_url", &config.analytics.base_url),
        ("ai_controller.base_url", &config.ai_controller.base_url),
        ("curation.base_url", &config.curation.base_url),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("{} must be an http(s) URL, got '{}'", name, url);
        }
    }

    Ok(config)
}
