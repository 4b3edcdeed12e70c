//! 公共频道消息与 topic 配置

use bytes::Bytes;
use serde::Serialize;

/// 公共消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKind {
    Unspecified,
    Snapshot,
    Delta,
    Reset,
}

/// 公共 topic 的推送模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PushMode {
    Full,
    Delta,
}

impl PushMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PushMode::Full => "full",
            PushMode::Delta => "delta",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TopicScope {
    Private,
    Public,
}

/// 后端注册时声明的 topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicConf {
    pub name: String,
    pub scope: TopicScope,
    pub push_mode: PushMode,
}

impl TopicConf {
    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: TopicScope::Private,
            push_mode: PushMode::Full,
        }
    }

    pub fn public(name: impl Into<String>, push_mode: PushMode) -> Self {
        Self {
            name: name.into(),
            scope: TopicScope::Public,
            push_mode,
        }
    }

    pub fn is_public(&self) -> bool {
        self.scope == TopicScope::Public
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublicMessage {
    pub topic: String,
    pub payload: Bytes,
    pub kind: MessageKind,
    /// 来源应用，用于指标
    pub source_app: String,
    /// 来源 acceptor
    pub address: String,
}

impl PublicMessage {
    pub fn new(topic: impl Into<String>, kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            kind,
            source_app: String::new(),
            address: String::new(),
        }
    }

    pub fn with_source(mut self, app: impl Into<String>, address: impl Into<String>) -> Self {
        self.source_app = app.into();
        self.address = address.into();
        self
    }
}
