//! 后端业务流线协议
//!
//! 消息以 prost 编码，帧边界由 `LengthDelimitedCodec` 负责。

use std::collections::HashMap;

use crate::domain::model::{
    Action, MessageKind, PushMode, SessionBrief, TopicConf, TopicScope, UserSnapshot,
};
use crate::domain::service::SyncEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Command {
    Unspecified = 0,
    Register = 1,
    Push = 2,
    Admin = 3,
    Ack = 4,
    Sync = 5,
    SyncConfig = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireScope {
    Private = 0,
    Public = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WirePushMode {
    Full = 0,
    Delta = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireMessageKind {
    Unspecified = 0,
    Snapshot = 1,
    Delta = 2,
    Reset = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BackendFrame {
    #[prost(enumeration = "Command", tag = "1")]
    pub command: i32,
    #[prost(string, tag = "2")]
    pub request_id: String,
    #[prost(message, optional, tag = "3")]
    pub register: Option<Register>,
    #[prost(message, repeated, tag = "4")]
    pub push: Vec<PushMessage>,
    #[prost(message, optional, tag = "5")]
    pub admin: Option<AdminMessage>,
    #[prost(message, optional, tag = "6")]
    pub sync: Option<SyncPayload>,
    #[prost(message, optional, tag = "7")]
    pub config: Option<ConfigPayload>,
    #[prost(message, optional, tag = "8")]
    pub error: Option<ErrorStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Register {
    #[prost(string, tag = "1")]
    pub connector_id: String,
    #[prost(string, tag = "2")]
    pub app_id: String,
    #[prost(int32, tag = "3")]
    pub shard_index: i32,
    #[prost(int32, tag = "4")]
    pub shard_total: i32,
    /// ActionKind 位掩码
    #[prost(uint32, tag = "5")]
    pub focus_actions: u32,
    #[prost(message, repeated, tag = "6")]
    pub topics: Vec<WireTopicConf>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireTopicConf {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "WireScope", tag = "2")]
    pub scope: i32,
    #[prost(enumeration = "WirePushMode", tag = "3")]
    pub push_mode: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushMessage {
    #[prost(int64, tag = "1")]
    pub uid: i64,
    #[prost(string, tag = "2")]
    pub topic: String,
    /// 指定连接时只投递该连接
    #[prost(string, tag = "3")]
    pub session_id: String,
    /// 透传：忽略订阅关系，投递用户所有连接
    #[prost(bool, tag = "4")]
    pub pass_through: bool,
    #[prost(enumeration = "WireScope", tag = "5")]
    pub scope: i32,
    #[prost(enumeration = "WireMessageKind", tag = "6")]
    pub kind: i32,
    #[prost(bytes = "bytes", tag = "7")]
    pub payload: bytes::Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AdminMessage {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub body: bytes::Bytes,
    #[prost(int32, tag = "3")]
    pub code: i32,
    #[prost(bool, tag = "4")]
    pub is_response: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncPayload {
    #[prost(uint64, tag = "1")]
    pub sync_id: u64,
    /// 全量重同步
    #[prost(bool, tag = "2")]
    pub full: bool,
    /// 本次同步的最后一帧
    #[prost(bool, tag = "3")]
    pub last: bool,
    #[prost(message, repeated, tag = "4")]
    pub users: Vec<UserSync>,
    #[prost(message, repeated, tag = "5")]
    pub inputs: Vec<InputMessage>,
    #[prost(string, tag = "6")]
    pub event: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserSync {
    #[prost(int64, tag = "1")]
    pub uid: i64,
    /// 是否携带用户状态，false 时只有动作
    #[prost(bool, tag = "2")]
    pub has_state: bool,
    #[prost(uint64, tag = "3")]
    pub version: u64,
    #[prost(int64, tag = "4")]
    pub created_at: i64,
    #[prost(string, repeated, tag = "5")]
    pub topics: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    pub merged_topics: Vec<String>,
    #[prost(message, repeated, tag = "7")]
    pub sessions: Vec<SessionState>,
    #[prost(map = "string, string", tag = "8")]
    pub params: HashMap<String, String>,
    #[prost(message, repeated, tag = "9")]
    pub actions: Vec<ActionMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SessionState {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(string, tag = "2")]
    pub ip: String,
    #[prost(string, tag = "3")]
    pub protocol: String,
    #[prost(string, repeated, tag = "4")]
    pub topics: Vec<String>,
    #[prost(int64, tag = "5")]
    pub started_at: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ActionMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(int64, tag = "3")]
    pub uid: i64,
    #[prost(string, tag = "4")]
    pub session_id: String,
    #[prost(string, repeated, tag = "5")]
    pub topics: Vec<String>,
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InputMessage {
    #[prost(int64, tag = "1")]
    pub uid: i64,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(string, tag = "3")]
    pub topic: String,
    #[prost(bytes = "bytes", tag = "4")]
    pub data: bytes::Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConfigPayload {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(int64, repeated, tag = "2")]
    pub gray_uids: Vec<i64>,
    #[prost(uint32, tag = "3")]
    pub sync_batch_size: u32,
    #[prost(uint32, tag = "4")]
    pub max_sessions_per_user: u32,
    #[prost(message, repeated, tag = "5")]
    pub topics: Vec<WireTopicConf>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorStatus {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl BackendFrame {
    fn with_command(command: Command) -> Self {
        Self {
            command: command as i32,
            ..Default::default()
        }
    }

    pub fn register(register: Register) -> Self {
        Self {
            register: Some(register),
            ..Self::with_command(Command::Register)
        }
    }

    pub fn push(messages: Vec<PushMessage>) -> Self {
        Self {
            push: messages,
            ..Self::with_command(Command::Push)
        }
    }

    pub fn sync(payload: SyncPayload) -> Self {
        Self {
            sync: Some(payload),
            ..Self::with_command(Command::Sync)
        }
    }

    pub fn sync_config(payload: ConfigPayload) -> Self {
        Self {
            config: Some(payload),
            ..Self::with_command(Command::SyncConfig)
        }
    }

    pub fn admin_request(request_id: &str, method: &str, body: bytes::Bytes) -> Self {
        Self {
            request_id: request_id.to_string(),
            admin: Some(AdminMessage {
                method: method.to_string(),
                body,
                code: 0,
                is_response: false,
            }),
            ..Self::with_command(Command::Admin)
        }
    }

    pub fn ack(request_id: &str, error: Option<ErrorStatus>) -> Self {
        Self {
            request_id: request_id.to_string(),
            error,
            ..Self::with_command(Command::Ack)
        }
    }
}

impl From<&WireTopicConf> for TopicConf {
    fn from(conf: &WireTopicConf) -> Self {
        let scope = match conf.scope() {
            WireScope::Private => TopicScope::Private,
            WireScope::Public => TopicScope::Public,
        };
        let push_mode = match conf.push_mode() {
            WirePushMode::Full => PushMode::Full,
            WirePushMode::Delta => PushMode::Delta,
        };
        TopicConf {
            name: conf.name.clone(),
            scope,
            push_mode,
        }
    }
}

impl From<&TopicConf> for WireTopicConf {
    fn from(conf: &TopicConf) -> Self {
        let scope = match conf.scope {
            TopicScope::Private => WireScope::Private,
            TopicScope::Public => WireScope::Public,
        };
        let push_mode = match conf.push_mode {
            PushMode::Full => WirePushMode::Full,
            PushMode::Delta => WirePushMode::Delta,
        };
        WireTopicConf {
            name: conf.name.clone(),
            scope: scope as i32,
            push_mode: push_mode as i32,
        }
    }
}

impl PushMessage {
    pub fn is_public(&self) -> bool {
        self.scope() == WireScope::Public
    }

    pub fn message_kind(&self) -> MessageKind {
        match self.kind() {
            WireMessageKind::Unspecified => MessageKind::Unspecified,
            WireMessageKind::Snapshot => MessageKind::Snapshot,
            WireMessageKind::Delta => MessageKind::Delta,
            WireMessageKind::Reset => MessageKind::Reset,
        }
    }
}

impl From<&Action> for ActionMessage {
    fn from(action: &Action) -> Self {
        Self {
            id: action.id.clone(),
            kind: action.kind.bit(),
            uid: action.uid,
            session_id: action.session_id.clone(),
            topics: action.topics.clone(),
            timestamp: action.timestamp_ms,
        }
    }
}

impl From<&SessionBrief> for SessionState {
    fn from(brief: &SessionBrief) -> Self {
        Self {
            session_id: brief.session_id.clone(),
            ip: brief.ip.clone(),
            protocol: brief.protocol.clone(),
            topics: brief.topics.clone(),
            started_at: brief.started_at_ms,
        }
    }
}

impl From<SyncEntry> for UserSync {
    fn from(entry: SyncEntry) -> Self {
        let actions = entry.actions.iter().map(ActionMessage::from).collect();
        match entry.snapshot {
            Some(snapshot) => UserSync {
                actions,
                ..UserSync::from(&snapshot)
            },
            None => UserSync {
                uid: entry.uid,
                actions,
                ..Default::default()
            },
        }
    }
}

impl From<&UserSnapshot> for UserSync {
    fn from(snapshot: &UserSnapshot) -> Self {
        UserSync {
            uid: snapshot.uid,
            has_state: true,
            version: snapshot.version,
            created_at: snapshot.created_at_nanos,
            topics: snapshot.topics.to_vec(),
            merged_topics: snapshot.merged_topics.to_vec(),
            sessions: snapshot.sessions.iter().map(SessionState::from).collect(),
            params: snapshot
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            actions: Vec::new(),
        }
    }
}
