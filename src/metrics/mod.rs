//! # Prometheus 指标收集模块
//!
//! 推送网关的连接、后端流、交换器、公共频道指标。

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 推送网关指标
pub struct GatewayMetrics {
    /// 会话下行写入次数（按消息类别）
    pub session_write_total: IntCounterVec,
    /// 会话下行丢弃次数
    pub session_discard_total: IntCounter,
    /// 会话关闭次数（按原因）
    pub session_closed_total: IntCounterVec,
    /// 命令限流次数
    pub session_rate_limited_total: IntCounter,
    /// 当前会话数
    pub sessions: IntGauge,
    /// 当前用户数
    pub users: IntGauge,
    /// 当前后端流数
    pub acceptors: IntGauge,
    /// 后端流发送次数（按 acceptor）
    pub acceptor_send_total: IntCounterVec,
    /// 后端流丢弃次数（按 acceptor）
    pub acceptor_discard_total: IntCounterVec,
    /// Admin 请求超时次数
    pub admin_timeout_total: IntCounter,
    /// 交换器事件丢弃次数
    pub exchange_event_discard_total: IntCounter,
    /// 同步消息发送次数（按事件类型）
    pub sync_payload_total: IntCounterVec,
    /// 强制同步次数
    pub force_sync_total: IntCounter,
    /// 全量重同步次数（按触发原因）
    pub resync_total: IntCounterVec,
    /// 公共频道广播尝试次数（按 topic）
    pub public_broadcast_total: IntCounterVec,
    /// 公共频道广播成功次数（按 topic）
    pub public_broadcast_success_total: IntCounterVec,
    /// 公共频道丢弃次数（按 topic）
    pub public_discard_total: IntCounterVec,
    /// 协议违例踢出次数
    pub protocol_kick_total: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let session_write_total = IntCounterVec::new(
            Opts::new("session_write_total", "Total number of messages queued to sessions"),
            &["class"],
        )
        .expect("Failed to create session_write_total metric");

        let session_discard_total = IntCounter::new(
            "session_discard_total",
            "Total number of push messages discarded on full session queues",
        )
        .expect("Failed to create session_discard_total metric");

        let session_closed_total = IntCounterVec::new(
            Opts::new("session_closed_total", "Total number of closed sessions"),
            &["reason"],
        )
        .expect("Failed to create session_closed_total metric");

        let session_rate_limited_total = IntCounter::new(
            "session_rate_limited_total",
            "Total number of client commands rejected by the rate limiter",
        )
        .expect("Failed to create session_rate_limited_total metric");

        let sessions = IntGauge::new("sessions", "Number of live sessions")
            .expect("Failed to create sessions metric");
        let users = IntGauge::new("users", "Number of bound users")
            .expect("Failed to create users metric");
        let acceptors = IntGauge::new("acceptors", "Number of registered backend streams")
            .expect("Failed to create acceptors metric");

        let acceptor_send_total = IntCounterVec::new(
            Opts::new("acceptor_send_total", "Total number of frames queued to backend streams"),
            &["acceptor"],
        )
        .expect("Failed to create acceptor_send_total metric");

        let acceptor_discard_total = IntCounterVec::new(
            Opts::new(
                "acceptor_discard_total",
                "Total number of frames discarded on full backend stream queues",
            ),
            &["acceptor"],
        )
        .expect("Failed to create acceptor_discard_total metric");

        let admin_timeout_total = IntCounter::new(
            "admin_timeout_total",
            "Total number of admin requests that timed out",
        )
        .expect("Failed to create admin_timeout_total metric");

        let exchange_event_discard_total = IntCounter::new(
            "exchange_event_discard_total",
            "Total number of events dropped on a full exchange queue",
        )
        .expect("Failed to create exchange_event_discard_total metric");

        let sync_payload_total = IntCounterVec::new(
            Opts::new("sync_payload_total", "Total number of sync payloads sent to backends"),
            &["event"],
        )
        .expect("Failed to create sync_payload_total metric");

        let force_sync_total = IntCounter::new(
            "force_sync_total",
            "Total number of force-sync requests raised by unroutable pushes",
        )
        .expect("Failed to create force_sync_total metric");

        let resync_total = IntCounterVec::new(
            Opts::new("resync_total", "Total number of full user resyncs issued"),
            &["reason"],
        )
        .expect("Failed to create resync_total metric");

        let public_broadcast_total = IntCounterVec::new(
            Opts::new("public_broadcast_total", "Public broadcast attempts"),
            &["topic"],
        )
        .expect("Failed to create public_broadcast_total metric");

        let public_broadcast_success_total = IntCounterVec::new(
            Opts::new("public_broadcast_success_total", "Public broadcast successes"),
            &["topic"],
        )
        .expect("Failed to create public_broadcast_success_total metric");

        let public_discard_total = IntCounterVec::new(
            Opts::new("public_discard_total", "Public messages replaced or dropped"),
            &["topic"],
        )
        .expect("Failed to create public_discard_total metric");

        let protocol_kick_total = IntCounterVec::new(
            Opts::new("protocol_kick_total", "Connections closed for protocol violations"),
            &["reason"],
        )
        .expect("Failed to create protocol_kick_total metric");

        // 注册指标，忽略重复注册错误（测试中会重复创建）
        let _ = REGISTRY.register(Box::new(session_write_total.clone()));
        let _ = REGISTRY.register(Box::new(session_discard_total.clone()));
        let _ = REGISTRY.register(Box::new(session_closed_total.clone()));
        let _ = REGISTRY.register(Box::new(session_rate_limited_total.clone()));
        let _ = REGISTRY.register(Box::new(sessions.clone()));
        let _ = REGISTRY.register(Box::new(users.clone()));
        let _ = REGISTRY.register(Box::new(acceptors.clone()));
        let _ = REGISTRY.register(Box::new(acceptor_send_total.clone()));
        let _ = REGISTRY.register(Box::new(acceptor_discard_total.clone()));
        let _ = REGISTRY.register(Box::new(admin_timeout_total.clone()));
        let _ = REGISTRY.register(Box::new(exchange_event_discard_total.clone()));
        let _ = REGISTRY.register(Box::new(sync_payload_total.clone()));
        let _ = REGISTRY.register(Box::new(force_sync_total.clone()));
        let _ = REGISTRY.register(Box::new(resync_total.clone()));
        let _ = REGISTRY.register(Box::new(public_broadcast_total.clone()));
        let _ = REGISTRY.register(Box::new(public_broadcast_success_total.clone()));
        let _ = REGISTRY.register(Box::new(public_discard_total.clone()));
        let _ = REGISTRY.register(Box::new(protocol_kick_total.clone()));

        Self {
            session_write_total,
            session_discard_total,
            session_closed_total,
            session_rate_limited_total,
            sessions,
            users,
            acceptors,
            acceptor_send_total,
            acceptor_discard_total,
            admin_timeout_total,
            exchange_event_discard_total,
            sync_payload_total,
            force_sync_total,
            resync_total,
            public_broadcast_total,
            public_broadcast_success_total,
            public_discard_total,
            protocol_kick_total,
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 以文本格式导出全局注册表
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = GatewayMetrics::new();
        metrics.session_discard_total.inc();
        metrics
            .acceptor_discard_total
            .with_label_values(&["acc-1"])
            .inc();

        assert_eq!(metrics.session_discard_total.get(), 1);
        assert_eq!(
            metrics
                .acceptor_discard_total
                .with_label_values(&["acc-1"])
                .get(),
            1
        );

        // 重复创建不应 panic
        let _again = GatewayMetrics::new();
    }
}
