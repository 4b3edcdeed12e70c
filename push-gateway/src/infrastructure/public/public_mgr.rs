//! # 公共频道管理
//!
//! topic → 广播器。广播器在 acceptor 注册时按其声明的推送模式创建，
//! 之后不随 acceptor 下线而销毁，订阅关系得以保留。

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use push_gateway_core::{GatewayError, GatewayMetrics, Result};

use crate::config::GatewayConfig;
use crate::domain::model::{PublicMessage, PushMode, TopicConf};
use crate::infrastructure::session::Session;

use super::delta_worker::DeltaWorker;
use super::full_worker::FullWorker;
use super::worker::{PublicWorker, PublicWorkerStats};

pub struct PublicMgr {
    workers: DashMap<String, Arc<dyn PublicWorker>>,
    snapshot_threshold: usize,
    queue_size: usize,
    metrics: Arc<GatewayMetrics>,
}

impl PublicMgr {
    pub fn new(snapshot_threshold: usize, queue_size: usize, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            workers: DashMap::new(),
            snapshot_threshold,
            queue_size,
            metrics,
        }
    }

    pub fn from_config(config: &GatewayConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self::new(config.snapshot_threshold, config.public_queue_size, metrics)
    }

    /// 获取或创建 topic 的广播器，新建时启动后台任务
    pub fn ensure_topic(&self, conf: &TopicConf) -> Arc<dyn PublicWorker> {
        if let Some(existing) = self.workers.get(&conf.name) {
            if existing.mode() != conf.push_mode {
                warn!(
                    topic = %conf.name,
                    current = existing.mode().as_str(),
                    requested = conf.push_mode.as_str(),
                    "push mode conflict, keeping existing worker"
                );
            }
            return Arc::clone(existing.value());
        }

        let entry = self.workers.entry(conf.name.clone()).or_insert_with(|| {
            let worker: Arc<dyn PublicWorker> = match conf.push_mode {
                PushMode::Full => Arc::new(FullWorker::new(
                    conf.name.clone(),
                    Arc::clone(&self.metrics),
                )),
                PushMode::Delta => Arc::new(DeltaWorker::new(
                    conf.name.clone(),
                    self.snapshot_threshold,
                    self.queue_size,
                    Arc::clone(&self.metrics),
                )),
            };
            Arc::clone(&worker).start();
            info!(topic = %conf.name, mode = conf.push_mode.as_str(), "public worker created");
            worker
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn PublicWorker>> {
        self.workers.get(topic).map(|w| Arc::clone(w.value()))
    }

    pub fn is_public(&self, topic: &str) -> bool {
        self.workers.contains_key(topic)
    }

    pub fn write(&self, msg: PublicMessage) -> Result<()> {
        match self.get(&msg.topic) {
            Some(worker) => worker.write(msg),
            None => {
                debug!(topic = %msg.topic, source = %msg.source_app, "no worker for public topic");
                Err(GatewayError::Discarded(msg.topic))
            }
        }
    }

    /// 返回是否找到对应广播器
    pub fn subscribe(&self, topic: &str, session: Arc<Session>) -> bool {
        match self.get(topic) {
            Some(worker) => {
                worker.subscribe(session);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, topic: &str, session_id: &str) {
        if let Some(worker) = self.get(topic) {
            worker.unsubscribe(session_id);
        }
    }

    /// 会话关闭时清理其全部公共订阅
    pub fn unsubscribe_all<S: AsRef<str>>(&self, topics: &[S], session_id: &str) {
        for topic in topics {
            self.unsubscribe(topic.as_ref(), session_id);
        }
    }

    pub fn stats(&self) -> Vec<PublicWorkerStats> {
        let mut stats: Vec<PublicWorkerStats> =
            self.workers.iter().map(|w| w.value().stats()).collect();
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        stats
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn stop_all(&self) {
        for worker in self.workers.iter() {
            worker.value().stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::MessageKind;

    #[tokio::test]
    async fn test_ensure_topic_once() {
        let mgr = PublicMgr::new(4, 16, Arc::new(GatewayMetrics::new()));
        let a = mgr.ensure_topic(&TopicConf::public("ticker", PushMode::Full));
        let b = mgr.ensure_topic(&TopicConf::public("ticker", PushMode::Delta));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.mode(), PushMode::Full);
        assert!(mgr.is_public("ticker"));
        assert!(!mgr.is_public("orders"));
        mgr.stop_all();
    }

    #[tokio::test]
    async fn test_write_unknown_topic() {
        let mgr = PublicMgr::new(4, 16, Arc::new(GatewayMetrics::new()));
        let err = mgr
            .write(PublicMessage::new("nope", MessageKind::Delta, "x"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Discarded(_)));
    }

    #[tokio::test]
    async fn test_stats_sorted() {
        let mgr = PublicMgr::new(4, 16, Arc::new(GatewayMetrics::new()));
        mgr.ensure_topic(&TopicConf::public("b", PushMode::Delta));
        mgr.ensure_topic(&TopicConf::public("a", PushMode::Full));
        let stats = mgr.stats();
        assert_eq!(stats[0].topic, "a");
        assert_eq!(stats[1].state, "not_ready");
        mgr.stop_all();
    }
}
