//! 交换器事件
//!
//! 事件只被交换器消费一次，产生的副作用全部由交换器负责。

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::domain::model::Action;
use crate::infrastructure::user::User;

/// 全量同步的用户范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUsers {
    All,
    List(Vec<i64>),
}

pub enum Event {
    /// 推送找不到目标连接，后端状态可能已过期
    ForceSyncUser {
        uid: i64,
        acceptor_id: Option<String>,
    },
    /// 单个用户状态变化
    SyncOneUser {
        user: Arc<User>,
        action: Option<Action>,
    },
    /// 全量重同步，`acceptor_id` 为空时发往全部 acceptor
    SyncAllUser {
        users: SyncUsers,
        acceptor_id: Option<String>,
        reason: &'static str,
    },
    SyncConfig {
        acceptor_id: Option<String>,
    },
    /// 客户端上行数据
    SyncInput {
        uid: i64,
        session_id: String,
        topic: String,
        data: Bytes,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ForceSyncUser { .. } => "force_sync_user",
            Event::SyncOneUser { .. } => "sync_one_user",
            Event::SyncAllUser { .. } => "sync_all_user",
            Event::SyncConfig { .. } => "sync_config",
            Event::SyncInput { .. } => "sync_input",
        }
    }

    pub fn sync_one(user: Arc<User>, action: Action) -> Self {
        Event::SyncOneUser {
            user,
            action: Some(action),
        }
    }

    pub fn resync_all(reason: &'static str) -> Self {
        Event::SyncAllUser {
            users: SyncUsers::All,
            acceptor_id: None,
            reason,
        }
    }

    pub fn resync_acceptor(acceptor_id: impl Into<String>, reason: &'static str) -> Self {
        Event::SyncAllUser {
            users: SyncUsers::All,
            acceptor_id: Some(acceptor_id.into()),
            reason,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ForceSyncUser { uid, acceptor_id } => f
                .debug_struct("ForceSyncUser")
                .field("uid", uid)
                .field("acceptor_id", acceptor_id)
                .finish(),
            Event::SyncOneUser { user, action } => f
                .debug_struct("SyncOneUser")
                .field("uid", &user.uid())
                .field("action", &action.as_ref().map(|a| a.kind))
                .finish(),
            Event::SyncAllUser {
                users,
                acceptor_id,
                reason,
            } => f
                .debug_struct("SyncAllUser")
                .field("users", users)
                .field("acceptor_id", acceptor_id)
                .field("reason", reason)
                .finish(),
            Event::SyncConfig { acceptor_id } => f
                .debug_struct("SyncConfig")
                .field("acceptor_id", acceptor_id)
                .finish(),
            Event::SyncInput {
                uid,
                session_id,
                topic,
                data,
            } => f
                .debug_struct("SyncInput")
                .field("uid", uid)
                .field("session_id", session_id)
                .field("topic", topic)
                .field("len", &data.len())
                .finish(),
        }
    }
}
