//! 用户聚合状态快照

use std::collections::BTreeMap;

use serde::Serialize;

use super::TopicSet;

/// 单个连接的摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionBrief {
    pub session_id: String,
    pub short_id: u64,
    pub ip: String,
    pub protocol: String,
    pub topics: Vec<String>,
    pub started_at_ms: i64,
}

/// `User::build` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSnapshot {
    pub uid: i64,
    pub version: u64,
    pub created_at_nanos: i64,
    /// 当前合并后的订阅
    pub topics: TopicSet,
    /// 上一版本与当前版本的并集，刚退订的 topic 仍会出现一次
    pub merged_topics: TopicSet,
    pub sessions: Vec<SessionBrief>,
    /// 各连接参数的并集
    pub params: BTreeMap<String, String>,
}

impl UserSnapshot {
    /// 注册表中不存在该用户时的空状态
    pub fn absent(uid: i64) -> Self {
        Self {
            uid,
            version: 0,
            created_at_nanos: 0,
            topics: TopicSet::new(),
            merged_topics: TopicSet::new(),
            sessions: Vec::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn is_present(&self) -> bool {
        !self.sessions.is_empty()
    }
}
