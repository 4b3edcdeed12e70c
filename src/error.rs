//! Push Gateway 错误模块
//!
//! 统一的错误分类：
//! - 容量类：全局 / 单 IP / 单用户连接数超限、黑名单拦截，同步拒绝，不致命
//! - 投递类：队列满被丢弃、连接已关闭，只计入指标并标记待重同步，不向触发方抛出
//! - 协议类：非法注册、未快照先增量等，关闭对应连接
//! - 竞态类：绑定到正在删除的用户，有限次重试，耗尽后才升级为硬错误
//! - 超时类：阻塞式 Admin 请求超时

use thiserror::Error;

/// 对客户端回包使用的稳定错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    TooManySessions = 10001,
    TooManySessionsPerIp = 10002,
    TooManySessionsPerUser = 10003,
    Blocked = 10004,
    Discarded = 10101,
    SessionClosed = 10102,
    AcceptorClosed = 10103,
    Protocol = 10201,
    InvalidRegister = 10202,
    NotAuthenticated = 10203,
    RateLimited = 10204,
    Unauthorized = 10205,
    InvalidArgument = 10206,
    UserDeleted = 10301,
    BindRetryExhausted = 10302,
    AdminTimeout = 10401,
    Config = 10501,
    Internal = 10999,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// 网关错误类型
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// 全局连接数超限
    #[error("too many sessions: limit {limit}")]
    TooManySessions { limit: usize },

    /// 单 IP 连接数超限
    #[error("too many sessions from ip {ip}: limit {limit}")]
    TooManySessionsPerIp { ip: String, limit: usize },

    /// 单用户连接数超限
    #[error("too many sessions for uid {uid}: limit {limit}")]
    TooManySessionsPerUser { uid: i64, limit: usize },

    /// 被黑名单拦截（ip 或 uid）
    #[error("blocked: {0}")]
    Blocked(String),

    /// 队列已满，消息被丢弃
    #[error("message discarded: {0}")]
    Discarded(String),

    /// 会话已关闭
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// 后端流已关闭
    #[error("acceptor closed: {0}")]
    AcceptorClosed(String),

    /// 协议违例
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// 后端注册信息非法
    #[error("invalid register: {0}")]
    InvalidRegister(String),

    /// 未登录
    #[error("not authenticated")]
    NotAuthenticated,

    /// 命令频率超限
    #[error("rate limited")]
    RateLimited,

    /// 认证失败
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// 参数非法
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 用户正在删除（绑定竞态哨兵）
    #[error("user {0} is being deleted")]
    UserDeleted(i64),

    /// 绑定重试耗尽
    #[error("bind retry exhausted for uid {uid} after {attempts} attempts")]
    BindRetryExhausted { uid: i64, attempts: usize },

    /// Admin 请求超时
    #[error("admin request {request_id} timed out after {timeout_ms}ms")]
    AdminTimeout { request_id: String, timeout_ms: u64 },

    /// 配置错误
    #[error("configuration error: {0}")]
    Config(String),

    /// 内部错误
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::TooManySessions { .. } => ErrorCode::TooManySessions,
            GatewayError::TooManySessionsPerIp { .. } => ErrorCode::TooManySessionsPerIp,
            GatewayError::TooManySessionsPerUser { .. } => ErrorCode::TooManySessionsPerUser,
            GatewayError::Blocked(_) => ErrorCode::Blocked,
            GatewayError::Discarded(_) => ErrorCode::Discarded,
            GatewayError::SessionClosed(_) => ErrorCode::SessionClosed,
            GatewayError::AcceptorClosed(_) => ErrorCode::AcceptorClosed,
            GatewayError::Protocol(_) => ErrorCode::Protocol,
            GatewayError::InvalidRegister(_) => ErrorCode::InvalidRegister,
            GatewayError::NotAuthenticated => ErrorCode::NotAuthenticated,
            GatewayError::RateLimited => ErrorCode::RateLimited,
            GatewayError::Unauthorized(_) => ErrorCode::Unauthorized,
            GatewayError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            GatewayError::UserDeleted(_) => ErrorCode::UserDeleted,
            GatewayError::BindRetryExhausted { .. } => ErrorCode::BindRetryExhausted,
            GatewayError::AdminTimeout { .. } => ErrorCode::AdminTimeout,
            GatewayError::Config(_) => ErrorCode::Config,
            GatewayError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// 容量类错误：准入时同步拒绝
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            GatewayError::TooManySessions { .. }
                | GatewayError::TooManySessionsPerIp { .. }
                | GatewayError::TooManySessionsPerUser { .. }
                | GatewayError::Blocked(_)
        )
    }

    /// 投递类错误：只计指标，不向上抛
    pub fn is_delivery(&self) -> bool {
        matches!(
            self,
            GatewayError::Discarded(_)
                | GatewayError::SessionClosed(_)
                | GatewayError::AcceptorClosed(_)
        )
    }

    /// 终态写错误：订阅者应被剔除
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GatewayError::SessionClosed(_) | GatewayError::AcceptorClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        assert!(GatewayError::TooManySessions { limit: 1 }.is_capacity());
        assert!(GatewayError::Discarded("q".into()).is_delivery());
        assert!(!GatewayError::Discarded("q".into()).is_terminal());
        assert!(GatewayError::SessionClosed("s".into()).is_terminal());
        assert!(!GatewayError::RateLimited.is_capacity());
    }

    #[test]
    fn test_error_code() {
        assert_eq!(GatewayError::RateLimited.code(), ErrorCode::RateLimited);
        assert_eq!(
            GatewayError::AdminTimeout {
                request_id: "r".into(),
                timeout_ms: 10
            }
            .code()
            .as_u32(),
            10401
        );
    }
}
