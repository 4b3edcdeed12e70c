//! 领域契约
//!
//! 物理连接与认证由外部适配器实现，核心只依赖这里的 trait。

use async_trait::async_trait;
use bytes::Bytes;

use push_gateway_core::Result;

/// 读取客户端数据帧
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// 返回 `Ok(None)` 表示对端正常关闭
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;
}

/// 写出客户端数据帧
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, data: Bytes) -> Result<()>;

    async fn close(&mut self);
}

/// 认证结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: i64,
    pub api_key: Option<String>,
}

/// 客户端认证
pub trait Authenticator: Send + Sync {
    /// 令牌登录
    fn login(&self, token: &str) -> Result<Identity>;

    /// API Key 签名认证
    fn auth(&self, api_key: &str, expires: i64, signature: &str) -> Result<Identity>;
}
