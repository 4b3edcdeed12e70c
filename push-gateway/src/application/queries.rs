//! 运维查询服务
//!
//! 只读视图直接读取在线注册表；除强制重同步与 Admin 请求外不修改任何状态。

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::info;

use push_gateway_core::{GatewayError, Result, metrics::gather_text};

use crate::domain::model::{ActionKind, SessionBrief, TopicScope};
use crate::infrastructure::acceptor::{Acceptor, AdminResponse};
use crate::infrastructure::public::PublicWorkerStats;

use super::event::Event;
use super::exchange::Exchange;

/// acceptor 概要
#[derive(Debug, Clone, Serialize)]
pub struct AcceptorSummary {
    pub id: String,
    pub app_id: String,
    pub shard_index: i32,
    pub shard_total: i32,
    pub connected_at_ms: i64,
}

/// acceptor 运行状态
#[derive(Debug, Clone, Serialize)]
pub struct AcceptorStatus {
    pub id: String,
    pub app_id: String,
    pub shard_index: i32,
    pub shard_total: i32,
    pub focus: Vec<&'static str>,
    pub private_topics: Vec<String>,
    pub public_topics: Vec<String>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub discard_count: u64,
    pub last_write_fail_ms: i64,
    pub last_resync_ms: i64,
    pub resync_pending: bool,
    pub pending_admin: usize,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptorMetrics {
    pub id: String,
    pub send_count: u64,
    pub discard_count: u64,
    pub ack_count: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicConfView {
    pub name: String,
    pub public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_mode: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptorConfig {
    pub id: String,
    pub focus_mask: u32,
    pub topics: Vec<TopicConfView>,
}

/// 强制重同步的范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncTarget {
    User(i64),
    Acceptor(String),
    All,
}

pub struct AdminQueryService {
    exchange: Arc<Exchange>,
}

impl AdminQueryService {
    pub fn new(exchange: Arc<Exchange>) -> Self {
        Self { exchange }
    }

    fn acceptor(&self, id: &str) -> Result<Arc<Acceptor>> {
        self.exchange
            .acceptors()
            .get(id)
            .ok_or_else(|| GatewayError::InvalidArgument(format!("unknown acceptor {}", id)))
    }

    pub fn list_acceptors(&self) -> Vec<AcceptorSummary> {
        let mut list: Vec<AcceptorSummary> = self
            .exchange
            .acceptors()
            .all()
            .iter()
            .map(|a| AcceptorSummary {
                id: a.id().to_string(),
                app_id: a.app_id().to_string(),
                shard_index: a.shard_index(),
                shard_total: a.shard_total(),
                connected_at_ms: a.connected_at_ms(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn acceptor_status(&self, id: &str) -> Result<AcceptorStatus> {
        let a = self.acceptor(id)?;
        let focus = [
            ActionKind::SessionOnline,
            ActionKind::SessionOffline,
            ActionKind::Subscribe,
            ActionKind::Unsubscribe,
        ]
        .into_iter()
        .filter(|k| a.focus(*k))
        .map(ActionKind::as_str)
        .collect();
        Ok(AcceptorStatus {
            id: a.id().to_string(),
            app_id: a.app_id().to_string(),
            shard_index: a.shard_index(),
            shard_total: a.shard_total(),
            focus,
            private_topics: a.private_topics().to_vec(),
            public_topics: a.public_topics().into_iter().map(|c| c.name).collect(),
            queue_depth: a.queue_depth(),
            queue_capacity: a.queue_capacity(),
            discard_count: a.discard_count(),
            last_write_fail_ms: a.last_write_fail_ms(),
            last_resync_ms: a.last_resync_ms(),
            resync_pending: a.needs_resync(),
            pending_admin: a.pending_admin(),
            closed: a.is_closed(),
        })
    }

    pub fn acceptor_metrics(&self, id: &str) -> Result<AcceptorMetrics> {
        let a = self.acceptor(id)?;
        Ok(AcceptorMetrics {
            id: a.id().to_string(),
            send_count: a.send_count(),
            discard_count: a.discard_count(),
            ack_count: a.ack_count(),
            queue_depth: a.queue_depth(),
            queue_capacity: a.queue_capacity(),
        })
    }

    pub fn acceptor_config(&self, id: &str) -> Result<AcceptorConfig> {
        let a = self.acceptor(id)?;
        let topics = a
            .topic_confs()
            .into_iter()
            .map(|c| TopicConfView {
                public: c.scope == TopicScope::Public,
                push_mode: c.is_public().then(|| c.push_mode.as_str()),
                name: c.name,
            })
            .collect();
        Ok(AcceptorConfig {
            id: a.id().to_string(),
            focus_mask: a.focus_mask(),
            topics,
        })
    }

    /// 用户的全部连接，用户不在线时为空
    pub fn user_sessions(&self, uid: i64) -> Vec<SessionBrief> {
        self.exchange
            .users()
            .get(uid)
            .map(|user| user.sessions().iter().map(|s| s.brief()).collect())
            .unwrap_or_default()
    }

    pub fn public_topics(&self) -> Vec<PublicWorkerStats> {
        self.exchange.publics().stats()
    }

    pub fn session_count(&self) -> usize {
        self.exchange.sessions().len()
    }

    pub fn user_count(&self) -> usize {
        self.exchange.users().len()
    }

    pub fn metrics_text(&self) -> String {
        gather_text()
    }

    /// 强制重同步，不受强制同步节流限制
    pub fn force_resync(&self, target: ResyncTarget) -> Result<()> {
        info!(scope = ?target, "admin forced resync");
        match target {
            ResyncTarget::User(uid) => self.exchange.dispatch_event(Event::ForceSyncUser {
                uid,
                acceptor_id: None,
            }),
            ResyncTarget::Acceptor(id) => {
                self.acceptor(&id)?;
                self.exchange
                    .dispatch_event(Event::resync_acceptor(id, "admin"));
            }
            ResyncTarget::All => self.exchange.dispatch_event(Event::resync_all("admin")),
        }
        Ok(())
    }

    /// 阻塞式 Admin 请求
    pub async fn send_admin(&self, acceptor_id: &str, method: &str, body: Bytes) -> Result<AdminResponse> {
        let a = self.acceptor(acceptor_id)?;
        a.send_admin(method, body).await
    }
}
