//! 配置管理器 - 负责处理不同环境下的配置覆盖
//!
//! 加载 `config/environments/{environment}.toml`，按表递归合并到基础配置上。

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;

use super::{PushGatewayAppConfig, merge_value};

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从环境变量 PUSH_GATEWAY_ENV 获取，未设置时默认为 "development"
    pub fn get_environment() -> String {
        env::var("PUSH_GATEWAY_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 是否生产环境
    pub fn is_production() -> bool {
        Self::get_environment().eq_ignore_ascii_case("production")
    }

    /// 根据环境加载特定配置并合并到基础配置中
    pub fn load_environment_config(base_config: &mut PushGatewayAppConfig) -> Result<()> {
        let env = Self::get_environment();
        let env_config_path = format!("config/environments/{}.toml", env);

        if !Path::new(&env_config_path).exists() {
            return Ok(());
        }

        let env_config_content = fs::read_to_string(&env_config_path)
            .with_context(|| format!("无法读取环境配置文件: {}", env_config_path))?;
        let env_config: Value = toml::from_str(&env_config_content)
            .with_context(|| format!("无效的环境配置格式: {}", env_config_path))?;

        *base_config = Self::overlay(base_config, env_config)?;
        Ok(())
    }

    /// 将覆盖表合并到已有配置，返回新配置
    pub fn overlay(base: &PushGatewayAppConfig, overlay: Value) -> Result<PushGatewayAppConfig> {
        let mut merged = Value::try_from(base).context("unable to represent config as TOML")?;
        merge_value(&mut merged, overlay);
        merged
            .try_into()
            .context("invalid configuration after environment overlay")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_overlay_keeps_untouched_sections() {
        let base = parse_config(
            r#"
            [session]
            max_sessions = 10
            queue_size = 4

            [security]
            blocked_uids = [1]
            "#,
        )
        .unwrap();

        let overlay: Value = toml::from_str("[session]\nqueue_size = 32").unwrap();
        let merged = ConfigManager::overlay(&base, overlay).unwrap();

        assert_eq!(merged.session.queue_size, Some(32));
        assert_eq!(merged.session.max_sessions, Some(10));
        assert_eq!(merged.security.blocked_uids, vec![1]);
        assert_eq!(merged.server.node_id, base.server.node_id);
    }
}
