//! Push Gateway Core 公共库
//!
//! 提供统一的配置加载、错误分类、指标与日志初始化

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing;
pub mod utils;

pub use config::{
    AcceptorSection, ApiKeyEntry, ConfigManager, ExchangeSection, LoggingConfig,
    PublicSection, PushGatewayAppConfig, SecuritySection, ServerSection, SessionSection,
    TickerSection, app_config, load_config, parse_config,
};
pub use error::{ErrorCode, GatewayError, Result};
pub use metrics::GatewayMetrics;
pub use utils::*;
