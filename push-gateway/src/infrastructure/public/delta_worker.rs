//! # Delta 模式广播器
//!
//! 状态机 {stopped, not_ready, running}：
//! - not_ready：暂存收到的消息，第一条 snapshot/reset 被提升为 reset 广播给所有订阅者，进入 running
//! - running：reset 清空缓存并广播；delta 广播并追加到缓存；snapshot 只入队，
//!   超过阈值后压缩为一条 reset
//!
//! 新订阅者先收到完整缓存，再加入广播集合。未收到快照的订阅者若将收到 delta，
//! 视为协议违例直接断开。队列溢出会丢消息，此时退回 not_ready 等待下一次快照。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use push_gateway_core::{GatewayError, GatewayMetrics, Result};

use crate::domain::model::{MessageKind, PublicMessage, PushMode};
use crate::infrastructure::session::Session;

use super::worker::{PublicWorker, PublicWorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaState {
    Stopped,
    NotReady,
    Running,
}

impl DeltaState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaState::Stopped => "stopped",
            DeltaState::NotReady => "not_ready",
            DeltaState::Running => "running",
        }
    }
}

struct Subscriber {
    session: Arc<Session>,
    got_snapshot: bool,
}

struct DeltaInner {
    state: DeltaState,
    /// reset 及其后的全部 delta
    cache: Vec<Bytes>,
    /// not_ready 期间暂存的消息
    held: Vec<PublicMessage>,
    /// running 期间未广播的快照
    snapshots: Vec<PublicMessage>,
}

pub struct DeltaWorker {
    topic: String,
    snapshot_threshold: usize,
    tx: mpsc::Sender<PublicMessage>,
    rx: Mutex<Option<mpsc::Receiver<PublicMessage>>>,
    inner: Mutex<DeltaInner>,
    subscribers: DashMap<String, Subscriber>,
    joiners: Mutex<Vec<Arc<Session>>>,
    notify: Notify,
    overflowed: AtomicBool,
    discards: AtomicU64,
    broadcasts: AtomicU64,
    kicks: AtomicU64,
    metrics: Arc<GatewayMetrics>,
}

impl DeltaWorker {
    pub fn new(
        topic: impl Into<String>,
        snapshot_threshold: usize,
        queue_size: usize,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        Self {
            topic: topic.into(),
            snapshot_threshold: snapshot_threshold.max(1),
            tx,
            rx: Mutex::new(Some(rx)),
            inner: Mutex::new(DeltaInner {
                state: DeltaState::NotReady,
                cache: Vec::new(),
                held: Vec::new(),
                snapshots: Vec::new(),
            }),
            subscribers: DashMap::new(),
            joiners: Mutex::new(Vec::new()),
            notify: Notify::new(),
            overflowed: AtomicBool::new(false),
            discards: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            kicks: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn state(&self) -> DeltaState {
        self.inner.lock().state
    }

    pub fn cache(&self) -> Vec<Bytes> {
        self.inner.lock().cache.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn kicks(&self) -> u64 {
        self.kicks.load(Ordering::Relaxed)
    }

    fn discard(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.discards.fetch_add(n as u64, Ordering::Relaxed);
        self.metrics
            .public_discard_total
            .with_label_values(&[self.topic.as_str()])
            .inc_by(n as u64);
    }

    /// 后台任务未接管队列时，同步处理一轮：接纳新订阅者并消费已排队的消息
    pub fn run_once(&self) -> usize {
        self.admit_joiners();
        let mut processed = 0;
        let mut guard = self.rx.lock();
        if let Some(rx) = guard.as_mut() {
            while let Ok(msg) = rx.try_recv() {
                self.process(msg);
                processed += 1;
            }
        }
        processed
    }

    fn admit_joiners(&self) {
        let joiners = std::mem::take(&mut *self.joiners.lock());
        if joiners.is_empty() {
            return;
        }

        let inner = self.inner.lock();
        for session in joiners {
            if session.is_stopped() {
                continue;
            }
            let mut got_snapshot = inner.state == DeltaState::Running;
            if got_snapshot {
                for payload in &inner.cache {
                    match session.write_push(payload.clone()) {
                        Ok(()) => {}
                        Err(e) if e.is_terminal() => break,
                        Err(_) => {
                            got_snapshot = false;
                            break;
                        }
                    }
                }
            }
            if session.is_stopped() {
                continue;
            }
            self.subscribers.insert(
                session.id().to_string(),
                Subscriber {
                    session,
                    got_snapshot,
                },
            );
        }
    }

    /// 按状态机处理一条消息
    pub fn process(&self, msg: PublicMessage) {
        let mut inner = self.inner.lock();

        if self.overflowed.swap(false, Ordering::AcqRel) && inner.state == DeltaState::Running {
            info!(topic = %self.topic, "delta queue overflowed, waiting for next snapshot");
            inner.state = DeltaState::NotReady;
            inner.snapshots.clear();
        }

        let state = inner.state;
        match state {
            DeltaState::Stopped => {}
            DeltaState::NotReady => match msg.kind {
                MessageKind::Snapshot | MessageKind::Reset => {
                    let stale = inner.held.len();
                    inner.held.clear();
                    self.discard(stale);
                    inner.cache = vec![msg.payload.clone()];
                    inner.snapshots.clear();
                    inner.state = DeltaState::Running;
                    debug!(topic = %self.topic, dropped = stale, "first snapshot promoted to reset");
                    self.broadcast_reset(msg.payload);
                }
                MessageKind::Delta | MessageKind::Unspecified => {
                    inner.held.push(msg);
                    if inner.held.len() > self.snapshot_threshold {
                        inner.held.remove(0);
                        self.discard(1);
                    }
                }
            },
            DeltaState::Running => match msg.kind {
                MessageKind::Reset => {
                    inner.cache = vec![msg.payload.clone()];
                    inner.snapshots.clear();
                    self.broadcast_reset(msg.payload);
                }
                MessageKind::Delta | MessageKind::Unspecified => {
                    inner.cache.push(msg.payload.clone());
                    self.broadcast_delta(msg.payload);
                }
                MessageKind::Snapshot => {
                    inner.snapshots.push(msg);
                    if inner.snapshots.len() > self.snapshot_threshold {
                        let buffered = std::mem::take(&mut inner.snapshots);
                        self.discard(buffered.len() - 1);
                        if let Some(latest) = buffered.into_iter().last() {
                            inner.cache = vec![latest.payload.clone()];
                            debug!(topic = %self.topic, "snapshots compacted into reset");
                            self.broadcast_reset(latest.payload);
                        }
                    }
                }
            },
        }
    }

    fn broadcast_reset(&self, payload: Bytes) {
        let topic = self.topic.as_str();
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut dead = Vec::new();
        for mut entry in self.subscribers.iter_mut() {
            self.metrics
                .public_broadcast_total
                .with_label_values(&[topic])
                .inc();
            match entry.session.write_push(payload.clone()) {
                Ok(()) => {
                    entry.got_snapshot = true;
                    self.metrics
                        .public_broadcast_success_total
                        .with_label_values(&[topic])
                        .inc();
                }
                Err(e) if e.is_terminal() => dead.push(entry.key().clone()),
                Err(_) => entry.got_snapshot = false,
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    fn broadcast_delta(&self, payload: Bytes) {
        let topic = self.topic.as_str();
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.got_snapshot {
                warn!(
                    topic,
                    session_id = %entry.session.id(),
                    "delta before snapshot, closing session"
                );
                entry.session.stop("protocol");
                self.kicks.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .protocol_kick_total
                    .with_label_values(&["delta_before_snapshot"])
                    .inc();
                dead.push(entry.key().clone());
                continue;
            }
            self.metrics
                .public_broadcast_total
                .with_label_values(&[topic])
                .inc();
            match entry.session.write_push(payload.clone()) {
                Ok(()) => {
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
    }

    async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!(topic = %self.topic, "delta worker already running");
            return;
        };
        info!(topic = %self.topic, "delta worker started");

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        self.admit_joiners();
                        self.process(msg);
                    }
                    None => break,
                },
                _ = self.notify.notified() => {
                    if self.state() == DeltaState::Stopped {
                        break;
                    }
                    self.admit_joiners();
                }
            }
        }
        debug!(topic = %self.topic, "delta worker stopped");
    }
}

impl PublicWorker for DeltaWorker {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn mode(&self) -> PushMode {
        PushMode::Delta
    }

    fn write(&self, msg: PublicMessage) -> Result<()> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::Release);
                self.discard(1);
                Err(GatewayError::Discarded(self.topic.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(GatewayError::Discarded(self.topic.clone()))
            }
        }
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
        let inner = self.inner.lock();
        PublicWorkerStats {
            topic: self.topic.clone(),
            mode: PushMode::Delta,
            state: inner.state.as_str(),
            subscribers: self.subscribers.len(),
            discards: self.discards.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            cache_len: inner.cache.len(),
        }
    }

    fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn stop(&self) {
        self.inner.lock().state = DeltaState::Stopped;
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::session::{ConnMeta, SessionOptions};

    fn session(queue_size: usize) -> Arc<Session> {
        Session::new(
            ConnMeta::default(),
            SessionOptions {
                queue_size,
                ..SessionOptions::default()
            },
            Arc::new(GatewayMetrics::new()),
        )
    }

    fn worker(threshold: usize, queue_size: usize) -> DeltaWorker {
        DeltaWorker::new("depth", threshold, queue_size, Arc::new(GatewayMetrics::new()))
    }

    fn msg(kind: MessageKind, payload: &'static str) -> PublicMessage {
        PublicMessage::new("depth", kind, payload)
    }

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_first_snapshot_promoted_to_reset() {
        let w = worker(4, 16);
        let early = session(16);
        w.subscribe(Arc::clone(&early));
        w.run_once();

        w.process(msg(MessageKind::Delta, "d0"));
        assert_eq!(w.state(), DeltaState::NotReady);
        assert!(early.drain_queued().is_empty());

        w.process(msg(MessageKind::Snapshot, "s1"));
        assert_eq!(w.state(), DeltaState::Running);
        assert_eq!(w.cache(), vec![b("s1")]);
        assert_eq!(early.drain_queued(), vec![b("s1")]);
    }

    #[test]
    fn test_reset_then_deltas_cache() {
        let w = worker(4, 16);
        w.process(msg(MessageKind::Reset, "r"));
        for payload in ["d1", "d2", "d3"] {
            w.process(msg(MessageKind::Delta, payload));
        }
        assert_eq!(w.cache().len(), 4);

        let late = session(16);
        w.subscribe(Arc::clone(&late));
        w.run_once();
        assert_eq!(
            late.drain_queued(),
            vec![b("r"), b("d1"), b("d2"), b("d3")]
        );

        w.process(msg(MessageKind::Reset, "r2"));
        assert_eq!(w.cache(), vec![b("r2")]);
        assert_eq!(late.drain_queued(), vec![b("r2")]);
    }

    #[test]
    fn test_delta_before_snapshot_kicks() {
        let w = worker(4, 16);
        w.process(msg(MessageKind::Reset, "r"));
        w.process(msg(MessageKind::Delta, "d1"));

        // 队列只能容纳一条，缓存回放不完整
        let slow = session(1);
        w.subscribe(Arc::clone(&slow));
        w.run_once();
        assert_eq!(w.subscriber_count(), 1);

        w.process(msg(MessageKind::Delta, "d2"));
        assert!(slow.is_stopped());
        assert_eq!(slow.close_reason(), Some("protocol"));
        assert_eq!(w.subscriber_count(), 0);
        assert_eq!(w.kicks(), 1);
    }

    #[test]
    fn test_snapshot_compaction() {
        let w = worker(2, 16);
        let s = session(16);
        w.subscribe(Arc::clone(&s));
        w.run_once();
        w.process(msg(MessageKind::Reset, "r"));
        s.drain_queued();

        w.process(msg(MessageKind::Snapshot, "s1"));
        w.process(msg(MessageKind::Snapshot, "s2"));
        assert!(s.drain_queued().is_empty());
        assert_eq!(w.cache(), vec![b("r")]);

        w.process(msg(MessageKind::Snapshot, "s3"));
        assert_eq!(w.cache(), vec![b("s3")]);
        assert_eq!(s.drain_queued(), vec![b("s3")]);
    }

    #[test]
    fn test_overflow_falls_back_to_not_ready() {
        let w = worker(4, 1);
        w.process(msg(MessageKind::Reset, "r"));
        assert_eq!(w.state(), DeltaState::Running);

        w.write(msg(MessageKind::Delta, "d1")).unwrap();
        assert!(w.write(msg(MessageKind::Delta, "d2")).is_err());
        w.run_once();
        assert_eq!(w.state(), DeltaState::NotReady);

        w.write(msg(MessageKind::Snapshot, "s")).unwrap();
        w.run_once();
        assert_eq!(w.state(), DeltaState::Running);
        assert_eq!(w.cache(), vec![b("s")]);
    }

    #[test]
    fn test_no_delta_observed_before_snapshot() {
        let w = worker(4, 64);
        let subs: Vec<_> = (0..4).map(|_| session(64)).collect();
        for (i, s) in subs.iter().enumerate() {
            w.subscribe(Arc::clone(s));
            w.run_once();
            let kind = if i == 1 { MessageKind::Snapshot } else { MessageKind::Delta };
            w.process(msg(kind, "x"));
        }
        w.process(msg(MessageKind::Delta, "tail"));

        for s in &subs {
            let frames = s.drain_queued();
            // 第一帧必然是快照或缓存回放的起点
            if let Some(first) = frames.first() {
                assert_eq!(first, &b("x"));
            }
            assert!(!s.is_stopped());
        }
    }
}
