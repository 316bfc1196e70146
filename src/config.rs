//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONDUCTOR__*` 覆盖（双下划线表示嵌套，如 `CONDUCTOR__REMOTE__BASE_URL=http://...`）。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::machine::ValidationRules;
use crate::core::state::{ArtifactStage, Operation, StepConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteSection,
    pub session: SessionSection,
    pub feed: FeedSection,
    /// 各操作默认的 provider / model
    pub defaults: BTreeMap<Operation, StepConfig>,
    /// [providers.<name>] 段
    pub providers: BTreeMap<String, ProviderSection>,
    pub artifacts: ArtifactsSection,
}

/// [remote] 段：服务地址、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 步骤提交的等待上限；超时只停止本地等待，不取消远端调用
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 线性退避：第 n 次重试前等待 n × backoff_ms
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_submit_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            submit_timeout_secs: default_submit_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RemoteSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    Memory,
    #[default]
    Sqlite,
}

/// [session] 段：快照存储后端与 TTL
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub backend: SessionBackend,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/sessions.db")
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_key_prefix() -> String {
    "conductor".to_string()
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backend: SessionBackend::default(),
            db_path: default_db_path(),
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// [feed] 段：事件流重连与诊断日志
#[derive(Debug, Clone, Deserialize)]
pub struct FeedSection {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// 打开后过期事件以 info 级别记录
    #[serde(default)]
    pub diagnostic: bool,
}

fn default_reconnect_delay_ms() -> u64 {
    800
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            diagnostic: false,
        }
    }
}

impl FeedSection {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderSection {
    pub default_model: Option<String>,
}

/// [artifacts] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ArtifactsSection {
    /// 各阶段必须出现的产物文件名
    #[serde(default)]
    pub required: BTreeMap<ArtifactStage, Vec<String>>,
}

impl AppConfig {
    pub fn validation_rules(&self) -> ValidationRules {
        ValidationRules {
            required: self.artifacts.required.clone(),
        }
    }

    /// provider → 默认模型（未配置模型的 provider 不出现）
    pub fn provider_models(&self) -> BTreeMap<String, String> {
        self.providers
            .iter()
            .filter_map(|(name, section)| {
                section
                    .default_model
                    .clone()
                    .map(|model| (name.clone(), model))
            })
            .collect()
    }
}

/// 从 config 目录加载配置，环境变量 CONDUCTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONDUCTOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONDUCTOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
