//! # 后端业务流
//!
//! 一个 Acceptor 对应一条后端业务服务的长连接：
//! - `send`：非阻塞入队，满时丢弃并记录写失败时间，由对账任务补偿
//! - `send_admin`：阻塞式请求/应答，按 request_id 关联，带超时

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use push_gateway_core::{GatewayError, GatewayMetrics, Result, current_millis, generate_id};

use crate::config::GatewayConfig;
use crate::domain::model::{ActionKind, TopicConf, TopicSet};
use crate::domain::service::{AcceptorFilter, GrayList, check_user_shard, validate_registration};
use crate::proto::{BackendFrame, Register};

/// 注册信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptorRegistration {
    pub connector_id: String,
    pub app_id: String,
    pub shard_index: i32,
    pub shard_total: i32,
    pub focus: u32,
    pub topics: Vec<TopicConf>,
}

impl AcceptorRegistration {
    pub fn new(connector_id: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            connector_id: connector_id.into(),
            app_id: app_id.into(),
            shard_index: -1,
            shard_total: 0,
            focus: ActionKind::all_mask(),
            topics: Vec::new(),
        }
    }

    pub fn with_shard(mut self, index: i32, total: i32) -> Self {
        self.shard_index = index;
        self.shard_total = total;
        self
    }

    pub fn with_focus(mut self, focus: u32) -> Self {
        self.focus = focus;
        self
    }

    pub fn with_topics(mut self, topics: Vec<TopicConf>) -> Self {
        self.topics = topics;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_registration(&self.connector_id, self.shard_index, self.shard_total)
    }
}

impl From<&Register> for AcceptorRegistration {
    fn from(reg: &Register) -> Self {
        Self {
            connector_id: reg.connector_id.clone(),
            app_id: reg.app_id.clone(),
            shard_index: reg.shard_index,
            shard_total: reg.shard_total,
            focus: reg.focus_actions,
            topics: reg.topics.iter().map(TopicConf::from).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    pub queue_size: usize,
    pub admin_timeout: Duration,
}

impl AcceptorOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            queue_size: config.acceptor_queue_size,
            admin_timeout: config.admin_timeout,
        }
    }
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// Admin 应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    pub code: i32,
    pub body: Bytes,
}

/// 按名称排序的 topic 配置
struct TopicTable {
    private: Arc<TopicSet>,
    public: Vec<TopicConf>,
    all: Arc<TopicSet>,
}

impl TopicTable {
    fn build(confs: &[TopicConf]) -> Self {
        let private: TopicSet = confs
            .iter()
            .filter(|c| !c.is_public())
            .map(|c| c.name.clone())
            .collect();
        let mut public: Vec<TopicConf> = confs.iter().filter(|c| c.is_public()).cloned().collect();
        public.sort_by(|a, b| a.name.cmp(&b.name));
        public.dedup_by(|a, b| a.name == b.name);
        let all: TopicSet = confs.iter().map(|c| c.name.clone()).collect();
        Self {
            private: Arc::new(private),
            public,
            all: Arc::new(all),
        }
    }
}

pub struct Acceptor {
    id: String,
    app_id: String,
    shard_index: i32,
    shard_total: i32,
    focus: u32,
    topics: ArcSwap<TopicTable>,
    tx: mpsc::Sender<BackendFrame>,
    admin_timeout: Duration,
    pending_admin: DashMap<String, oneshot::Sender<AdminResponse>>,
    last_write_fail_ms: AtomicI64,
    last_resync_ms: AtomicI64,
    /// 上次重同步开始后是否又有丢弃
    resync_pending: AtomicBool,
    connected_at_ms: i64,
    send_count: AtomicU64,
    discard_count: AtomicU64,
    ack_count: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    metrics: Arc<GatewayMetrics>,
}

impl Acceptor {
    /// 创建 acceptor，返回发送队列的消费端，由流驱动写到线上
    pub fn new(
        registration: AcceptorRegistration,
        options: AcceptorOptions,
        metrics: Arc<GatewayMetrics>,
    ) -> (Arc<Self>, mpsc::Receiver<BackendFrame>) {
        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let (closed_tx, _) = watch::channel(false);
        let now = current_millis();
        let acceptor = Arc::new(Self {
            id: registration.connector_id,
            app_id: registration.app_id,
            shard_index: registration.shard_index,
            shard_total: registration.shard_total,
            focus: registration.focus,
            topics: ArcSwap::from_pointee(TopicTable::build(&registration.topics)),
            tx,
            admin_timeout: options.admin_timeout,
            pending_admin: DashMap::new(),
            last_write_fail_ms: AtomicI64::new(0),
            last_resync_ms: AtomicI64::new(now),
            resync_pending: AtomicBool::new(false),
            connected_at_ms: now,
            send_count: AtomicU64::new(0),
            discard_count: AtomicU64::new(0),
            ack_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_tx,
            metrics,
        });
        (acceptor, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn shard_index(&self) -> i32 {
        self.shard_index
    }

    pub fn shard_total(&self) -> i32 {
        self.shard_total
    }

    pub fn focus_mask(&self) -> u32 {
        self.focus
    }

    /// 是否关注该类动作
    pub fn focus(&self, kind: ActionKind) -> bool {
        self.focus & kind.bit() != 0
    }

    pub fn check_user_shard(&self, uid: i64, gray: &GrayList) -> bool {
        check_user_shard(self.shard_index, self.shard_total, uid, gray)
    }

    pub fn private_topics(&self) -> Arc<TopicSet> {
        Arc::clone(&self.topics.load().private)
    }

    pub fn public_topics(&self) -> Vec<TopicConf> {
        self.topics.load().public.clone()
    }

    /// 私有与公共 topic 名称
    pub fn all_topics(&self) -> Arc<TopicSet> {
        Arc::clone(&self.topics.load().all)
    }

    pub fn topic_confs(&self) -> Vec<TopicConf> {
        let table = self.topics.load();
        let mut confs: Vec<TopicConf> = table
            .private
            .iter()
            .map(|name| TopicConf::private(name.clone()))
            .collect();
        confs.extend(table.public.iter().cloned());
        confs
    }

    pub fn is_public_topic(&self, topic: &str) -> bool {
        self.topics
            .load()
            .public
            .binary_search_by(|c| c.name.as_str().cmp(topic))
            .is_ok()
    }

    /// 替换 topic 配置（SYNC_CONFIG）
    pub fn update_topics(&self, confs: &[TopicConf]) {
        self.topics.store(Arc::new(TopicTable::build(confs)));
        info!(acceptor_id = %self.id, topics = confs.len(), "acceptor topics updated");
    }

    pub fn filter(&self) -> AcceptorFilter {
        AcceptorFilter {
            shard_index: self.shard_index,
            shard_total: self.shard_total,
            focus: self.focus,
            topics: self.private_topics(),
        }
    }

    pub fn last_write_fail_ms(&self) -> i64 {
        self.last_write_fail_ms.load(Ordering::Acquire)
    }

    pub fn last_resync_ms(&self) -> i64 {
        self.last_resync_ms.load(Ordering::Acquire)
    }

    pub fn needs_resync(&self) -> bool {
        self.resync_pending.load(Ordering::Acquire)
    }

    /// 全量重同步开始前调用，此后的丢弃会重新置位
    pub fn mark_resync(&self, now_ms: i64) {
        self.resync_pending.store(false, Ordering::Release);
        self.last_resync_ms.store(now_ms, Ordering::Release);
    }

    pub fn connected_at_ms(&self) -> i64 {
        self.connected_at_ms
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::Relaxed)
    }

    pub fn discard_count(&self) -> u64 {
        self.discard_count.load(Ordering::Relaxed)
    }

    pub fn ack_count(&self) -> u64 {
        self.ack_count.load(Ordering::Relaxed)
    }

    pub fn record_ack(&self) {
        self.ack_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pending_admin(&self) -> usize {
        self.pending_admin.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn queue_capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// 非阻塞入队
    pub fn send(&self, frame: BackendFrame) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::AcceptorClosed(self.id.clone()));
        }
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.send_count.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .acceptor_send_total
                    .with_label_values(&[self.id.as_str()])
                    .inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.discard_count.fetch_add(1, Ordering::Relaxed);
                self.last_write_fail_ms
                    .store(current_millis(), Ordering::Release);
                self.resync_pending.store(true, Ordering::Release);
                self.metrics
                    .acceptor_discard_total
                    .with_label_values(&[self.id.as_str()])
                    .inc();
                debug!(acceptor_id = %self.id, "acceptor queue full, frame discarded");
                Err(GatewayError::Discarded(self.id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(GatewayError::AcceptorClosed(self.id.clone()))
            }
        }
    }

    /// 阻塞式 Admin 请求，超时或连接关闭时返回错误，不会无限等待
    pub async fn send_admin(&self, method: &str, body: Bytes) -> Result<AdminResponse> {
        let request_id = generate_id();
        let (tx, rx) = oneshot::channel();
        self.pending_admin.insert(request_id.clone(), tx);

        if let Err(e) = self.send(BackendFrame::admin_request(&request_id, method, body)) {
            self.pending_admin.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.admin_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GatewayError::AcceptorClosed(self.id.clone())),
            Err(_) => {
                self.pending_admin.remove(&request_id);
                self.metrics.admin_timeout_total.inc();
                warn!(acceptor_id = %self.id, request_id = %request_id, method, "admin request timed out");
                Err(GatewayError::AdminTimeout {
                    request_id,
                    timeout_ms: self.admin_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// 投递 Admin 应答，找不到等待方时返回 false
    pub fn complete_admin(&self, request_id: &str, response: AdminResponse) -> bool {
        match self.pending_admin.remove(request_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!(acceptor_id = %self.id, request_id, "admin response without waiter");
                false
            }
        }
    }

    /// 关闭，可重复调用；未完成的 Admin 请求立即失败
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending_admin.clear();
        self.closed_tx.send_replace(true);
        info!(acceptor_id = %self.id, app_id = %self.app_id, "acceptor closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::PushMode;

    fn acceptor(queue_size: usize, admin_timeout: Duration) -> (Arc<Acceptor>, mpsc::Receiver<BackendFrame>) {
        Acceptor::new(
            AcceptorRegistration::new("acc-1", "orders").with_topics(vec![
                TopicConf::private("orders"),
                TopicConf::public("ticker", PushMode::Full),
                TopicConf::private("positions"),
            ]),
            AcceptorOptions {
                queue_size,
                admin_timeout,
            },
            Arc::new(GatewayMetrics::new()),
        )
    }

    #[test]
    fn test_send_capacity() {
        let (acc, _rx) = acceptor(3, Duration::from_secs(1));
        for _ in 0..3 {
            acc.send(BackendFrame::ack("", None)).unwrap();
        }
        let err = acc.send(BackendFrame::ack("", None)).unwrap_err();
        assert!(matches!(err, GatewayError::Discarded(_)));
        assert_eq!(acc.discard_count(), 1);
        assert!(acc.last_write_fail_ms() > 0);
        assert_eq!(acc.queue_depth(), 3);
        assert!(acc.needs_resync());

        // 同一毫秒内开始重同步再丢弃，标记仍然保留
        acc.mark_resync(acc.last_write_fail_ms());
        assert!(!acc.needs_resync());
        assert!(acc.send(BackendFrame::ack("", None)).is_err());
        assert!(acc.needs_resync());
    }

    #[test]
    fn test_topic_tables() {
        let (acc, _rx) = acceptor(1, Duration::from_secs(1));
        assert!(acc.private_topics().contains("orders"));
        assert!(!acc.private_topics().contains("ticker"));
        assert!(acc.is_public_topic("ticker"));
        assert_eq!(acc.all_topics().len(), 3);

        acc.update_topics(&[TopicConf::private("wallet")]);
        assert!(acc.private_topics().contains("wallet"));
        assert!(!acc.is_public_topic("ticker"));
    }

    #[tokio::test]
    async fn test_admin_timeout() {
        let (acc, mut rx) = acceptor(4, Duration::from_millis(50));
        let err = acc.send_admin("status", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AdminTimeout { timeout_ms: 50, .. }));
        assert_eq!(acc.pending_admin(), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_admin_round_trip() {
        let (acc, mut rx) = acceptor(4, Duration::from_secs(5));
        let responder = {
            let acc = Arc::clone(&acc);
            tokio::spawn(async move {
                let frame = rx.recv().await.unwrap();
                acc.complete_admin(
                    &frame.request_id,
                    AdminResponse {
                        code: 0,
                        body: Bytes::from_static(b"ok"),
                    },
                )
            })
        };
        let resp = acc.send_admin("status", Bytes::new()).await.unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"ok"));
        assert!(responder.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_fails_pending_admin() {
        let (acc, _rx) = acceptor(4, Duration::from_secs(5));
        let waiter = {
            let acc = Arc::clone(&acc);
            tokio::spawn(async move { acc.send_admin("status", Bytes::new()).await })
        };
        while acc.pending_admin() == 0 {
            tokio::task::yield_now().await;
        }
        acc.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GatewayError::AcceptorClosed(_))));
        assert!(acc.send(BackendFrame::ack("", None)).is_err());
    }
}
