//! # Full 模式广播器
//!
//! 只保留最新一条待发消息，未消费时再次写入直接覆盖（最新值优先）。
//! 新订阅者先收到上一次缓存的载荷，再加入广播集合。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use push_gateway_core::{GatewayError, GatewayMetrics, Result};

use crate::domain::model::{PublicMessage, PushMode};
use crate::infrastructure::session::Session;

use super::worker::{PublicWorker, PublicWorkerStats};

pub struct FullWorker {
    topic: String,
    pending: Mutex<Option<PublicMessage>>,
    cached: Mutex<Option<Bytes>>,
    joiners: Mutex<Vec<Arc<Session>>>,
    subscribers: DashMap<String, Arc<Session>>,
    notify: Notify,
    stopped: AtomicBool,
    discards: AtomicU64,
    broadcasts: AtomicU64,
    metrics: Arc<GatewayMetrics>,
}

impl FullWorker {
    pub fn new(topic: impl Into<String>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            topic: topic.into(),
            pending: Mutex::new(None),
            cached: Mutex::new(None),
            joiners: Mutex::new(Vec::new()),
            subscribers: DashMap::new(),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            discards: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// 处理一轮：接纳新订阅者，广播至多一条待发消息；返回成功投递数
    pub fn run_once(&self) -> usize {
        let joiners = std::mem::take(&mut *self.joiners.lock());
        let pending = self.pending.lock().take();
        let cached = self.cached.lock().clone();

        for session in joiners {
            if session.is_stopped() {
                continue;
            }
            if let Some(payload) = &cached {
                if let Err(e) = session.write_push(payload.clone()) {
                    if e.is_terminal() {
                        continue;
                    }
                }
            }
            self.subscribers.insert(session.id().to_string(), session);
        }

        let Some(msg) = pending else {
            return 0;
        };
        *self.cached.lock() = Some(msg.payload.clone());
        self.broadcast(msg.payload)
    }

    fn broadcast(&self, payload: Bytes) -> usize {
        let topic = self.topic.as_str();
        self.broadcasts.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            self.metrics
                .public_broadcast_total
                .with_label_values(&[topic])
                .inc();
            match entry.value().write_push(payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics
                        .public_broadcast_success_total
                        .with_label_values(&[topic])
                        .inc();
                }
                Err(e) if e.is_terminal() => dead.push(entry.key().clone()),
                Err(_) => {}
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
        delivered
    }

    async fn run(self: Arc<Self>) {
        info!(topic = %self.topic, "full worker started");
        loop {
            self.notify.notified().await;
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            self.run_once();
        }
        debug!(topic = %self.topic, "full worker stopped");
    }
}

impl PublicWorker for FullWorker {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn mode(&self) -> PushMode {
        PushMode::Full
    }

    fn write(&self, msg: PublicMessage) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(GatewayError::Discarded(self.topic.clone()));
        }
        if self.pending.lock().replace(msg).is_some() {
            self.discards.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .public_discard_total
                .with_label_values(&[self.topic.as_str()])
                .inc();
        }
        self.notify.notify_one();
        Ok(())
    }

    fn subscribe(&self, session: Arc<Session>) {
        self.joiners.lock().push(session);
        self.notify.notify_one();
    }

    fn unsubscribe(&self, session_id: &str) {
        self.subscribers.remove(session_id);
        self.joiners.lock().retain(|s| s.id() != session_id);
    }

    fn stats(&self) -> PublicWorkerStats {
        PublicWorkerStats {
            topic: self.topic.clone(),
            mode: PushMode::Full,
            state: if self.stopped.load(Ordering::Acquire) {
                "stopped"
            } else {
                "idle"
            },
            subscribers: self.subscribers.len(),
            discards: self.discards.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            cache_len: usize::from(self.cached.lock().is_some()),
        }
    }

    fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::MessageKind;
    use crate::infrastructure::session::{ConnMeta, SessionOptions};

    fn session() -> Arc<Session> {
        Session::new(
            ConnMeta::default(),
            SessionOptions::default(),
            Arc::new(GatewayMetrics::new()),
        )
    }

    fn msg(payload: &'static str) -> PublicMessage {
        PublicMessage::new("ticker", MessageKind::Unspecified, payload)
    }

    #[test]
    fn test_latest_value_wins() {
        let worker = FullWorker::new("ticker", Arc::new(GatewayMetrics::new()));
        let s = session();
        worker.subscribe(Arc::clone(&s));
        worker.run_once();

        worker.write(msg("1")).unwrap();
        worker.write(msg("2")).unwrap();
        assert_eq!(worker.run_once(), 1);
        assert_eq!(worker.run_once(), 0);

        assert_eq!(s.drain_queued(), vec![Bytes::from_static(b"2")]);
        let stats = worker.stats();
        assert_eq!(stats.discards, 1);
        assert_eq!(stats.broadcasts, 1);
    }

    #[test]
    fn test_joiner_receives_cached_payload_first() {
        let worker = FullWorker::new("ticker", Arc::new(GatewayMetrics::new()));
        worker.write(msg("old")).unwrap();
        worker.run_once();

        let s = session();
        worker.subscribe(Arc::clone(&s));
        worker.write(msg("new")).unwrap();
        worker.run_once();

        assert_eq!(
            s.drain_queued(),
            vec![Bytes::from_static(b"old"), Bytes::from_static(b"new")]
        );
    }

    #[test]
    fn test_prunes_closed_subscribers() {
        let worker = FullWorker::new("ticker", Arc::new(GatewayMetrics::new()));
        let s = session();
        worker.subscribe(Arc::clone(&s));
        worker.run_once();
        assert_eq!(worker.subscriber_count(), 1);

        s.stop("kicked");
        worker.write(msg("x")).unwrap();
        assert_eq!(worker.run_once(), 0);
        assert_eq!(worker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_background_consumer() {
        let worker = Arc::new(FullWorker::new("ticker", Arc::new(GatewayMetrics::new())));
        let handle = Arc::clone(&worker).start();
        let s = session();
        worker.subscribe(Arc::clone(&s));
        worker.write(msg("tick")).unwrap();

        for _ in 0..100 {
            if worker.stats().broadcasts > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(s.drain_queued(), vec![Bytes::from_static(b"tick")]);

        worker.stop();
        handle.await.unwrap();
    }
}
