//! 客户端命令服务
//!
//! 协议处理器解析出的操作在这里执行；每条命令先经过会话限流。

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use push_gateway_core::{GatewayError, Result};

use crate::config::GatewayConfig;
use crate::domain::repository::{Authenticator, Identity};
use crate::infrastructure::session::Session;

use super::exchange::Exchange;

/// topic 名称最大长度
pub const MAX_TOPIC_LEN: usize = 128;

/// 命令应答
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReply {
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}

impl CommandReply {
    fn ok(op: &'static str) -> Self {
        Self {
            op,
            uid: None,
            topics: Vec::new(),
        }
    }
}

pub struct ClientCommandService {
    exchange: Arc<Exchange>,
    authenticator: Arc<dyn Authenticator>,
    blocked_uids: HashSet<i64>,
    max_topics: usize,
}

impl ClientCommandService {
    pub fn new(
        config: &GatewayConfig,
        exchange: Arc<Exchange>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            exchange,
            authenticator,
            blocked_uids: config.blocked_uids.clone(),
            max_topics: config.max_topics,
        }
    }

    /// 令牌登录
    pub fn login(&self, session: &Arc<Session>, token: &str) -> Result<CommandReply> {
        session.allow()?;
        let identity = self.authenticator.login(token)?;
        self.admit(session, identity, "login")
    }

    /// API Key 签名认证
    pub fn auth(
        &self,
        session: &Arc<Session>,
        api_key: &str,
        expires: i64,
        signature: &str,
    ) -> Result<CommandReply> {
        session.allow()?;
        let identity = self.authenticator.auth(api_key, expires, signature)?;
        self.admit(session, identity, "auth")
    }

    fn admit(&self, session: &Arc<Session>, identity: Identity, op: &'static str) -> Result<CommandReply> {
        if self.blocked_uids.contains(&identity.uid) {
            warn!(uid = identity.uid, session_id = %session.id(), "blocked uid rejected");
            return Err(GatewayError::Blocked(format!("uid {}", identity.uid)));
        }
        self.exchange
            .on_login(session, identity.uid, identity.api_key)?;
        Ok(CommandReply {
            uid: Some(identity.uid),
            ..CommandReply::ok(op)
        })
    }

    pub fn subscribe(&self, session: &Arc<Session>, topics: &[String]) -> Result<CommandReply> {
        session.allow()?;
        let topics = normalize_topics(topics)?;

        let current = session.client().topics();
        let added = topics.iter().filter(|t| !current.contains(t)).count();
        if current.len() + added > self.max_topics {
            return Err(GatewayError::InvalidArgument(format!(
                "too many topics: limit {}",
                self.max_topics
            )));
        }

        let topics = self.exchange.on_subscribe(session, &topics)?;
        debug!(session_id = %session.id(), count = topics.len(), "subscribed");
        Ok(CommandReply {
            topics,
            ..CommandReply::ok("subscribe")
        })
    }

    pub fn unsubscribe(&self, session: &Arc<Session>, topics: &[String]) -> Result<CommandReply> {
        session.allow()?;
        let topics = normalize_topics(topics)?;
        let topics = self.exchange.on_unsubscribe(session, &topics)?;
        Ok(CommandReply {
            topics,
            ..CommandReply::ok("unsubscribe")
        })
    }

    /// 上行数据，需要登录
    pub fn input(&self, session: &Arc<Session>, topic: &str, data: Bytes) -> Result<CommandReply> {
        session.allow()?;
        if !session.client().is_authenticated() {
            return Err(GatewayError::NotAuthenticated);
        }
        validate_topic(topic)?;
        self.exchange.on_input(session, topic, data)?;
        Ok(CommandReply::ok("input"))
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(GatewayError::InvalidArgument("empty topic".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(GatewayError::InvalidArgument(format!(
            "topic longer than {} bytes",
            MAX_TOPIC_LEN
        )));
    }
    Ok(())
}

/// 去重并校验，保持原顺序
fn normalize_topics(topics: &[String]) -> Result<Vec<String>> {
    if topics.is_empty() {
        return Err(GatewayError::InvalidArgument("no topics".to_string()));
    }
    let mut seen = HashSet::with_capacity(topics.len());
    let mut out = Vec::with_capacity(topics.len());
    for topic in topics {
        let topic = topic.trim();
        validate_topic(topic)?;
        if seen.insert(topic) {
            out.push(topic.to_string());
        }
    }
    Ok(out)
}
