//! 配置文件 `config.toml`，所有键都可以省略

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use crate::core::{DispatchError, DispatcherConfig, Result, StoreLocation};
use crate::uploaders::HttpUploaderConfig;
use crate::utils::{RetryPolicy, RetryStrategy};

pub const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_ADDR: &str = "127.0.0.1:5151";
pub const DEFAULT_STORE_URL: &str = "mem://collection/filename";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub addr: String,
    pub store: StoreConfig,
    pub uploader: UploaderConfig,
    pub dispatcher: DispatcherSection,
    pub retry: RetrySection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            store: StoreConfig::default(),
            uploader: UploaderConfig::default(),
            dispatcher: DispatcherSection::default(),
            retry: RetrySection::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    /// mem 后端的落盘文件
    pub localfile: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STORE_URL.to_string(),
            localfile: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UploaderConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        let defaults = HttpUploaderConfig::default();
        Self {
            endpoint: defaults.endpoint,
            token: defaults.token,
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DispatcherSection {
    /// 字节/秒，<= 0 不限速
    pub rate: f64,
    /// 突发字节数
    pub capacity: i64,
    pub poll_interval_ms: u64,
    pub chunk_size: usize,
    pub start_paused: bool,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        let defaults = DispatcherConfig::default();
        Self {
            rate: defaults.rate,
            capacity: defaults.capacity,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            chunk_size: defaults.chunk_size,
            start_paused: defaults.start_paused,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl Config {
    /// 读取 `<dir>/config.toml`，文件不存在时使用默认值
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)
            .map_err(|err| DispatchError::config(format!("{}: {err}", path.display())))?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| DispatchError::config(err.to_string()))
    }

    /// 支持 `:5151` 这种只写端口的地址
    pub fn listen_addr(&self) -> String {
        match self.addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.addr.clone(),
        }
    }

    pub fn store_location(&self) -> Result<StoreLocation> {
        StoreLocation::parse(&self.store.url, self.store.localfile.as_deref())
    }

    pub fn uploader_config(&self) -> HttpUploaderConfig {
        HttpUploaderConfig {
            endpoint: self.uploader.endpoint.clone(),
            token: self.uploader.token.clone().filter(|t| !t.is_empty()),
            timeout: Duration::from_secs(self.uploader.timeout_secs),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            rate: self.dispatcher.rate,
            capacity: self.dispatcher.capacity,
            poll_interval: Duration::from_millis(self.dispatcher.poll_interval_ms),
            chunk_size: self.dispatcher.chunk_size,
            start_paused: self.dispatcher.start_paused,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            strategy: RetryStrategy::Exponential {
                initial: Duration::from_millis(self.retry.initial_delay_ms),
                multiplier: self.retry.multiplier,
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
        }
    }
}

/// 默认配置目录 `~/.config/uplift`
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("uplift")
}
