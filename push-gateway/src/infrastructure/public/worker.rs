//! 公共频道广播器契约

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

use push_gateway_core::Result;

use crate::domain::model::{PublicMessage, PushMode};
use crate::infrastructure::session::Session;

/// 广播器状态
#[derive(Debug, Clone, Serialize)]
pub struct PublicWorkerStats {
    pub topic: String,
    pub mode: PushMode,
    pub state: &'static str,
    pub subscribers: usize,
    pub discards: u64,
    pub broadcasts: u64,
    pub cache_len: usize,
}

/// 每个公共 topic 一个广播器
pub trait PublicWorker: Send + Sync {
    fn topic(&self) -> &str;

    fn mode(&self) -> PushMode;

    /// 非阻塞写入
    fn write(&self, msg: PublicMessage) -> Result<()>;

    fn subscribe(&self, session: Arc<Session>);

    fn unsubscribe(&self, session_id: &str);

    fn stats(&self) -> PublicWorkerStats;

    /// 启动后台消费任务
    fn start(self: Arc<Self>) -> JoinHandle<()>;

    fn stop(&self);
}
