//! 推送网关配置模块
//!
//! 取值顺序：环境变量 `PUSH_GATEWAY_*` > 配置文件 > 默认值

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use push_gateway_core::config::{ApiKeyEntry, PushGatewayAppConfig};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub node_id: String,
    pub ws_addr: String,
    pub backend_addr: String,
    pub shutdown_grace: Duration,
    // 会话准入
    pub max_sessions: usize,
    pub max_sessions_per_ip: usize,
    pub max_sessions_per_user: usize,
    // 会话运行参数
    pub session_queue_size: usize,
    pub reply_queue_size: usize,
    pub command_limit: u32,
    pub command_period: Duration,
    pub idle_timeout: Duration,
    pub min_idle_timeout: Duration,
    pub max_idle_timeout: Duration,
    pub auth_timeout: Duration,
    pub write_timeout: Duration,
    pub max_topics: usize,
    // 后端流
    pub acceptor_queue_size: usize,
    pub admin_timeout: Duration,
    pub acceptor_drain_grace: Duration,
    pub register_timeout: Duration,
    // 交换器
    pub exchange_async: bool,
    pub event_queue_size: usize,
    pub batch_size: usize,
    pub sync_batch_size: usize,
    pub drain_attempts: usize,
    pub force_sync_interval: Duration,
    // 对账
    pub ticker_interval: Duration,
    pub min_resync_interval: Duration,
    pub round_robin: bool,
    pub round_robin_interval: Duration,
    pub session_tick: Duration,
    // 公共频道
    pub snapshot_threshold: usize,
    pub public_queue_size: usize,
    // 安全
    pub gray_uids: HashSet<i64>,
    pub blocked_uids: HashSet<i64>,
    pub allowed_uids: HashSet<i64>,
    pub blocked_ips: HashSet<String>,
    pub allowed_ips: HashSet<String>,
    pub jwt_secret: Option<String>,
    pub api_keys: Vec<ApiKeyEntry>,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn resolve<T: FromStr>(key: &str, file: Option<T>, default: T) -> T {
    env_parse(key).or(file).unwrap_or(default)
}

fn resolve_ms(key: &str, file: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(resolve(key, file, default_ms))
}

fn env_list<T: FromStr>(key: &str) -> Option<Vec<T>> {
    env::var(key).ok().map(|v| {
        v.split(',')
            .filter_map(|item| item.trim().parse::<T>().ok())
            .collect()
    })
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: "push-gateway-0".to_string(),
            ws_addr: "0.0.0.0:8080".to_string(),
            backend_addr: "0.0.0.0:9090".to_string(),
            shutdown_grace: Duration::from_secs(5),
            max_sessions: 100_000,
            max_sessions_per_ip: 500,
            max_sessions_per_user: 50,
            session_queue_size: 256,
            reply_queue_size: 64,
            command_limit: 50,
            command_period: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            min_idle_timeout: Duration::from_secs(10),
            max_idle_timeout: Duration::from_secs(600),
            auth_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            max_topics: 256,
            acceptor_queue_size: 10_000,
            admin_timeout: Duration::from_secs(5),
            acceptor_drain_grace: Duration::from_secs(2),
            register_timeout: Duration::from_secs(10),
            exchange_async: true,
            event_queue_size: 10_000,
            batch_size: 64,
            sync_batch_size: 200,
            drain_attempts: 3,
            force_sync_interval: Duration::from_secs(1),
            ticker_interval: Duration::from_secs(1),
            min_resync_interval: Duration::from_secs(10),
            round_robin: false,
            round_robin_interval: Duration::from_secs(60),
            session_tick: Duration::from_secs(1),
            snapshot_threshold: 16,
            public_queue_size: 1_024,
            gray_uids: HashSet::new(),
            blocked_uids: HashSet::new(),
            allowed_uids: HashSet::new(),
            blocked_ips: HashSet::new(),
            allowed_ips: HashSet::new(),
            jwt_secret: None,
            api_keys: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_app_config(app: &PushGatewayAppConfig) -> Self {
        let d = Self::default();
        let server = &app.server;
        let session = &app.session;
        let acceptor = &app.acceptor;
        let exchange = &app.exchange;
        let ticker = &app.ticker;
        let public = &app.public;
        let security = &app.security;

        let node_id = env::var("PUSH_GATEWAY_NODE_ID")
            .ok()
            .or_else(|| server.node_id.clone())
            .unwrap_or(d.node_id);

        let ws_addr = env::var("PUSH_GATEWAY_WS_ADDR")
            .ok()
            .or_else(|| server.ws_addr.clone())
            .unwrap_or(d.ws_addr);

        let backend_addr = env::var("PUSH_GATEWAY_BACKEND_ADDR")
            .ok()
            .or_else(|| server.backend_addr.clone())
            .unwrap_or(d.backend_addr);

        let min_idle_timeout = resolve_ms(
            "PUSH_GATEWAY_MIN_IDLE_TIMEOUT_MS",
            session.min_idle_timeout_ms,
            d.min_idle_timeout.as_millis() as u64,
        );
        let max_idle_timeout = resolve_ms(
            "PUSH_GATEWAY_MAX_IDLE_TIMEOUT_MS",
            session.max_idle_timeout_ms,
            d.max_idle_timeout.as_millis() as u64,
        )
        .max(min_idle_timeout);
        let idle_timeout = resolve_ms(
            "PUSH_GATEWAY_IDLE_TIMEOUT_MS",
            session.idle_timeout_ms,
            d.idle_timeout.as_millis() as u64,
        )
        .clamp(min_idle_timeout, max_idle_timeout);

        let gray_uids = env_list("PUSH_GATEWAY_GRAY_UIDS")
            .unwrap_or_else(|| security.gray_uids.clone())
            .into_iter()
            .collect();
        let blocked_uids = env_list("PUSH_GATEWAY_BLOCKED_UIDS")
            .unwrap_or_else(|| security.blocked_uids.clone())
            .into_iter()
            .collect();

        let jwt_secret = env::var("PUSH_GATEWAY_JWT_SECRET")
            .ok()
            .or_else(|| security.jwt_secret.clone());

        Self {
            node_id,
            ws_addr,
            backend_addr,
            shutdown_grace: resolve_ms(
                "PUSH_GATEWAY_SHUTDOWN_GRACE_MS",
                server.shutdown_grace_ms,
                d.shutdown_grace.as_millis() as u64,
            ),
            max_sessions: resolve(
                "PUSH_GATEWAY_MAX_SESSIONS",
                session.max_sessions,
                d.max_sessions,
            ),
            max_sessions_per_ip: resolve(
                "PUSH_GATEWAY_MAX_SESSIONS_PER_IP",
                session.max_sessions_per_ip,
                d.max_sessions_per_ip,
            ),
            max_sessions_per_user: resolve(
                "PUSH_GATEWAY_MAX_SESSIONS_PER_USER",
                session.max_sessions_per_user,
                d.max_sessions_per_user,
            ),
            session_queue_size: resolve(
                "PUSH_GATEWAY_SESSION_QUEUE_SIZE",
                session.queue_size,
                d.session_queue_size,
            )
            .max(1),
            reply_queue_size: resolve(
                "PUSH_GATEWAY_REPLY_QUEUE_SIZE",
                session.reply_queue_size,
                d.reply_queue_size,
            )
            .max(1),
            command_limit: resolve(
                "PUSH_GATEWAY_COMMAND_LIMIT",
                session.command_limit,
                d.command_limit,
            ),
            command_period: resolve_ms(
                "PUSH_GATEWAY_COMMAND_PERIOD_MS",
                session.command_period_ms,
                d.command_period.as_millis() as u64,
            ),
            idle_timeout,
            min_idle_timeout,
            max_idle_timeout,
            auth_timeout: resolve_ms(
                "PUSH_GATEWAY_AUTH_TIMEOUT_MS",
                session.auth_timeout_ms,
                d.auth_timeout.as_millis() as u64,
            ),
            write_timeout: resolve_ms(
                "PUSH_GATEWAY_WRITE_TIMEOUT_MS",
                session.write_timeout_ms,
                d.write_timeout.as_millis() as u64,
            ),
            max_topics: resolve("PUSH_GATEWAY_MAX_TOPICS", session.max_topics, d.max_topics),
            acceptor_queue_size: resolve(
                "PUSH_GATEWAY_ACCEPTOR_QUEUE_SIZE",
                acceptor.queue_size,
                d.acceptor_queue_size,
            )
            .max(1),
            admin_timeout: resolve_ms(
                "PUSH_GATEWAY_ADMIN_TIMEOUT_MS",
                acceptor.admin_timeout_ms,
                d.admin_timeout.as_millis() as u64,
            ),
            acceptor_drain_grace: resolve_ms(
                "PUSH_GATEWAY_ACCEPTOR_DRAIN_GRACE_MS",
                acceptor.drain_grace_ms,
                d.acceptor_drain_grace.as_millis() as u64,
            ),
            register_timeout: d.register_timeout,
            exchange_async: resolve(
                "PUSH_GATEWAY_EXCHANGE_ASYNC",
                exchange.async_enabled,
                d.exchange_async,
            ),
            event_queue_size: resolve(
                "PUSH_GATEWAY_EVENT_QUEUE_SIZE",
                exchange.event_queue_size,
                d.event_queue_size,
            )
            .max(1),
            batch_size: resolve("PUSH_GATEWAY_BATCH_SIZE", exchange.batch_size, d.batch_size)
                .max(1),
            sync_batch_size: resolve(
                "PUSH_GATEWAY_SYNC_BATCH_SIZE",
                exchange.sync_batch_size,
                d.sync_batch_size,
            )
            .max(1),
            drain_attempts: resolve(
                "PUSH_GATEWAY_DRAIN_ATTEMPTS",
                exchange.drain_attempts,
                d.drain_attempts,
            ),
            force_sync_interval: resolve_ms(
                "PUSH_GATEWAY_FORCE_SYNC_INTERVAL_MS",
                exchange.force_sync_interval_ms,
                d.force_sync_interval.as_millis() as u64,
            ),
            ticker_interval: resolve_ms(
                "PUSH_GATEWAY_TICKER_INTERVAL_MS",
                ticker.interval_ms,
                d.ticker_interval.as_millis() as u64,
            ),
            min_resync_interval: resolve_ms(
                "PUSH_GATEWAY_MIN_RESYNC_INTERVAL_MS",
                ticker.min_resync_interval_ms,
                d.min_resync_interval.as_millis() as u64,
            ),
            round_robin: resolve(
                "PUSH_GATEWAY_ROUND_ROBIN",
                ticker.round_robin,
                d.round_robin,
            ),
            round_robin_interval: resolve_ms(
                "PUSH_GATEWAY_ROUND_ROBIN_INTERVAL_MS",
                ticker.round_robin_interval_ms,
                d.round_robin_interval.as_millis() as u64,
            ),
            session_tick: resolve_ms(
                "PUSH_GATEWAY_SESSION_TICK_MS",
                ticker.session_tick_ms,
                d.session_tick.as_millis() as u64,
            ),
            snapshot_threshold: resolve(
                "PUSH_GATEWAY_SNAPSHOT_THRESHOLD",
                public.snapshot_threshold,
                d.snapshot_threshold,
            ),
            public_queue_size: resolve(
                "PUSH_GATEWAY_PUBLIC_QUEUE_SIZE",
                public.queue_size,
                d.public_queue_size,
            )
            .max(1),
            gray_uids,
            blocked_uids,
            allowed_uids: security.allowed_uids.iter().copied().collect(),
            blocked_ips: security.blocked_ips.iter().cloned().collect(),
            allowed_ips: security.allowed_ips.iter().cloned().collect(),
            jwt_secret,
            api_keys: security.api_keys.clone(),
        }
    }

    /// 将单连接的空闲超时覆盖值限制在 [min, max] 内
    pub fn clamp_idle(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.idle_timeout)
            .clamp(self.min_idle_timeout, self.max_idle_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use push_gateway_core::config::parse_config;

    #[test]
    fn test_from_app_config_file_values() {
        let app = parse_config(
            r#"
            [session]
            queue_size = 4
            reply_queue_size = 0
            idle_timeout_ms = 1000000
            max_idle_timeout_ms = 120000
            min_idle_timeout_ms = 5000

            [exchange]
            sync_batch_size = 0

            [security]
            gray_uids = [5]
            "#,
        )
        .unwrap();

        let cfg = GatewayConfig::from_app_config(&app);
        assert_eq!(cfg.session_queue_size, 4);
        assert_eq!(cfg.reply_queue_size, 1);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(120));
        assert_eq!(cfg.sync_batch_size, 1);
        assert!(cfg.gray_uids.contains(&5));
    }

    #[test]
    fn test_clamp_idle() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.clamp_idle(Some(Duration::from_millis(1))), cfg.min_idle_timeout);
        assert_eq!(cfg.clamp_idle(Some(Duration::from_secs(3600))), cfg.max_idle_timeout);
        assert_eq!(cfg.clamp_idle(None), cfg.idle_timeout);
    }
}
