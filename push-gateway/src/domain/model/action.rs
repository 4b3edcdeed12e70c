//! 会话状态变更通知

use serde::Serialize;

use push_gateway_core::{current_millis, generate_id};

/// 动作类型，取值即 focus 位掩码中的位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum ActionKind {
    SessionOnline = 1,
    SessionOffline = 2,
    Subscribe = 4,
    Unsubscribe = 8,
}

impl ActionKind {
    pub fn bit(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::SessionOnline => "session_online",
            ActionKind::SessionOffline => "session_offline",
            ActionKind::Subscribe => "subscribe",
            ActionKind::Unsubscribe => "unsubscribe",
        }
    }

    /// 所有动作类型的掩码
    pub fn all_mask() -> u32 {
        ActionKind::SessionOnline.bit()
            | ActionKind::SessionOffline.bit()
            | ActionKind::Subscribe.bit()
            | ActionKind::Unsubscribe.bit()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub uid: i64,
    pub session_id: String,
    /// 受影响的 topic，已排序
    pub topics: Vec<String>,
    pub timestamp_ms: i64,
}

impl Action {
    pub fn new(kind: ActionKind, uid: i64, session_id: impl Into<String>, mut topics: Vec<String>) -> Self {
        topics.sort();
        topics.dedup();
        Self {
            id: generate_id(),
            kind,
            uid,
            session_id: session_id.into(),
            topics,
            timestamp_ms: current_millis(),
        }
    }
}
