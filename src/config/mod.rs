//! Push Gateway 配置模块
//!
//! 该模块提供了应用程序配置管理功能，包括：
//! - 配置文件加载和解析（单文件或目录合并）
//! - 环境特定配置覆盖
//! - 会话、后端流、交换器、对账、公共频道、安全等配置定义
//!
//! 动态配置下发不在此处处理，进程内只持有启动时的静态视图。

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use toml::Value;
use tracing::warn;

mod manager;
pub use manager::ConfigManager;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<PushGatewayAppConfig> = OnceLock::new();

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
    #[serde(default)]
    pub with_file: bool,
    #[serde(default)]
    pub with_line_number: bool,
    /// 以 JSON 格式输出
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
            json: false,
        }
    }
}

/// 监听与节点配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerSection {
    /// 节点标识
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// 客户端 WebSocket 监听地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_addr: Option<String>,
    /// 后端业务流监听地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_addr: Option<String>,
    /// 停机时等待队列排空的宽限期（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_ms: Option<u64>,
}

/// 会话配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions_per_ip: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions_per_user: Option<usize>,
    /// 单连接下行队列长度
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    /// 单连接应答队列长度，满时阻塞读循环
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_queue_size: Option<usize>,
    /// 周期内允许的命令数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_limit: Option<u32>,
    /// 命令限流周期（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_idle_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_timeout_ms: Option<u64>,
    /// 未认证连接最长存活时间（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_timeout_ms: Option<u64>,
    /// 单次物理写超时（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout_ms: Option<u64>,
    /// 单连接最多订阅数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_topics: Option<usize>,
}

/// 后端流配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AcceptorSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_timeout_ms: Option<u64>,
    /// 断流后排空发送队列的宽限期（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_grace_ms: Option<u64>,
}

/// 交换器配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExchangeSection {
    /// 是否异步处理 SyncOneUser 事件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_queue_size: Option<usize>,
    /// 异步消费者单轮最多合并的事件数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// 单条同步消息最多携带的用户数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_batch_size: Option<usize>,
    /// 停机时的排空尝试次数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_attempts: Option<usize>,
    /// 同一用户强制同步的最小间隔（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_sync_interval_ms: Option<u64>,
}

/// 对账配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TickerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// 两次全量重同步之间的最小间隔（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_resync_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_robin: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_robin_interval_ms: Option<u64>,
    /// 会话心跳检查间隔（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_tick_ms: Option<u64>,
}

/// 公共频道配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublicSection {
    /// Delta 模式下快照堆积超过该值即压缩为 reset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_threshold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
}

/// API Key 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub secret: String,
    pub uid: i64,
}

/// 安全配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecuritySection {
    /// 灰度用户
    #[serde(default)]
    pub gray_uids: Vec<i64>,
    #[serde(default)]
    pub blocked_uids: Vec<i64>,
    /// 白名单用户不受单用户连接数限制
    #[serde(default)]
    pub allowed_uids: Vec<i64>,
    #[serde(default)]
    pub blocked_ips: Vec<String>,
    /// 白名单 IP 不受单 IP 连接数限制
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

/// 应用配置根
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PushGatewayAppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub acceptor: AcceptorSection,
    #[serde(default)]
    pub exchange: ExchangeSection,
    #[serde(default)]
    pub ticker: TickerSection,
    #[serde(default)]
    pub public: PublicSection,
    #[serde(default)]
    pub security: SecuritySection,
}

impl PushGatewayAppConfig {
    /// 确保配置有默认值
    fn ensure_defaults(&mut self) {
        if self.server.node_id.as_deref().map(str::is_empty).unwrap_or(true) {
            self.server.node_id = Some(
                env::var("HOSTNAME").unwrap_or_else(|_| "push-gateway-0".to_string()),
            );
        }
    }
}

/// 加载配置
pub fn load_config(path: Option<&str>) -> &'static PushGatewayAppConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
    };

    APP_CONFIG.get_or_init(|| {
        let mut cfg = load_with_fallback(&candidates);
        if let Err(e) = manager::ConfigManager::load_environment_config(&mut cfg) {
            warn!("failed to load environment config: {}", e);
        }
        cfg
    })
}

/// 获取已加载的应用配置
pub fn app_config() -> Option<&'static PushGatewayAppConfig> {
    APP_CONFIG.get()
}

/// 从字符串解析配置（测试与内嵌场景）
pub fn parse_config(content: &str) -> Result<PushGatewayAppConfig> {
    let mut cfg: PushGatewayAppConfig =
        toml::from_str(content).context("invalid config format")?;
    cfg.ensure_defaults();
    Ok(cfg)
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> PushGatewayAppConfig {
    for path in candidates {
        match load_config_from_source(path) {
            Ok(mut cfg) => {
                cfg.ensure_defaults();
                return cfg;
            }
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    let mut cfg = PushGatewayAppConfig::default();
    cfg.ensure_defaults();
    cfg
}

/// 从源加载配置
fn load_config_from_source(path: &Path) -> Result<PushGatewayAppConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    if metadata.is_dir() {
        load_config_from_directory(path)
    } else {
        load_config_from_file(path)
    }
}

/// 从文件加载配置
fn load_config_from_file(path: &Path) -> Result<PushGatewayAppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config file: {}", path.display()))?;
    let cfg: PushGatewayAppConfig = toml::from_str(&content)
        .with_context(|| format!("invalid config format: {}", path.display()))?;
    Ok(cfg)
}

/// 从目录加载配置：base.toml 为底，overrides/*.toml 按文件名顺序覆盖
fn load_config_from_directory(path: &Path) -> Result<PushGatewayAppConfig> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("overrides"))?;

    let cfg: PushGatewayAppConfig = merged
        .try_into()
        .with_context(|| format!("invalid configuration after merging {}", path.display()))?;

    Ok(cfg)
}

/// 合并目录中的配置
fn merge_directory(root: &mut Value, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let value = load_toml_value(&entry.path())?;
        merge_value(root, value);
    }

    Ok(())
}

/// 加载 TOML 值
fn load_toml_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 合并值：表递归合并，其余类型直接覆盖
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}
