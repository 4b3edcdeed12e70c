//! # 对账任务
//!
//! 投递路径只丢不等，这里负责补偿：
//! - 交换器事件入队失败后，向全部 acceptor 全量重同步
//! - 单个 acceptor 写失败后，只对它全量重同步
//! - 可选的轮询重同步，每次一个 acceptor
//! - 会话心跳，踢出空闲或超时未登录的连接
//! - 清理过期的强制同步节流记录

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use push_gateway_core::current_millis;

use crate::config::GatewayConfig;
use crate::infrastructure::acceptor::AcceptorMgr;
use crate::infrastructure::session::SessionMgr;
use crate::infrastructure::session::session::wait_stopped;

use super::event::Event;
use super::exchange::Exchange;

/// 一次对账的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub exchange_resync: bool,
    pub acceptor_resyncs: Vec<String>,
    pub round_robin: Option<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        !self.exchange_resync && self.acceptor_resyncs.is_empty() && self.round_robin.is_none()
    }
}

pub struct TickerMgr {
    config: Arc<GatewayConfig>,
    exchange: Arc<Exchange>,
    acceptors: Arc<AcceptorMgr>,
    sessions: Arc<SessionMgr>,
    last_full_resync_ms: AtomicI64,
    last_round_robin_ms: AtomicI64,
    round_robin_cursor: AtomicUsize,
}

impl TickerMgr {
    pub fn new(config: Arc<GatewayConfig>, exchange: Arc<Exchange>) -> Self {
        let acceptors = Arc::clone(exchange.acceptors());
        let sessions = Arc::clone(exchange.sessions());
        let now = current_millis();
        Self {
            config,
            exchange,
            acceptors,
            sessions,
            last_full_resync_ms: AtomicI64::new(0),
            last_round_robin_ms: AtomicI64::new(now),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// 检查丢弃标记并发起必要的重同步
    pub fn reconcile(&self, now_ms: i64) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let min_interval = self.config.min_resync_interval.as_millis() as i64;

        let last_full = self.last_full_resync_ms.load(Ordering::Acquire);
        if now_ms - last_full >= min_interval && self.exchange.take_resync_pending() {
            self.last_full_resync_ms.store(now_ms, Ordering::Release);
            info!(
                last_fail_ms = self.exchange.last_fail_ms(),
                "exchange dropped events, resyncing all acceptors"
            );
            self.exchange.dispatch_event(Event::resync_all("exchange_drop"));
            report.exchange_resync = true;
        }

        if !report.exchange_resync {
            for acceptor in self.acceptors.all().iter() {
                let last = acceptor.last_resync_ms();
                if acceptor.needs_resync() && now_ms - last >= min_interval {
                    info!(
                        acceptor_id = %acceptor.id(),
                        last_fail_ms = acceptor.last_write_fail_ms(),
                        "acceptor dropped frames, resyncing"
                    );
                    self.exchange
                        .dispatch_event(Event::resync_acceptor(acceptor.id(), "acceptor_drop"));
                    report.acceptor_resyncs.push(acceptor.id().to_string());
                }
            }
        }

        if self.config.round_robin {
            let interval = self.config.round_robin_interval.as_millis() as i64;
            let last = self.last_round_robin_ms.load(Ordering::Acquire);
            if now_ms - last >= interval {
                self.last_round_robin_ms.store(now_ms, Ordering::Release);
                let all = self.acceptors.all();
                if !all.is_empty() {
                    let cursor = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
                    let acceptor = &all[cursor % all.len()];
                    if !report.exchange_resync && !report.acceptor_resyncs.iter().any(|id| id == acceptor.id()) {
                        debug!(acceptor_id = %acceptor.id(), "round robin resync");
                        self.exchange
                            .dispatch_event(Event::resync_acceptor(acceptor.id(), "round_robin"));
                        report.round_robin = Some(acceptor.id().to_string());
                    }
                }
            }
        }

        report
    }

    /// 会话心跳，返回被踢出的数量
    pub fn tick_sessions(&self, now_ms: i64) -> usize {
        let kicked = self.sessions.tick_all(now_ms);
        if kicked > 0 {
            debug!(kicked, "idle sessions evicted");
        }
        kicked
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut reconcile = tokio::time::interval(self.config.ticker_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut session_tick = tokio::time::interval(self.config.session_tick);
        session_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = self.config.ticker_interval.as_millis() as u64,
            round_robin = self.config.round_robin,
            "ticker started"
        );
        loop {
            tokio::select! {
                _ = wait_stopped(&mut shutdown) => break,
                _ = reconcile.tick() => {
                    let now = current_millis();
                    self.reconcile(now);
                    self.exchange.prune_force_sync(now);
                }
                _ = session_tick.tick() => {
                    self.tick_sessions(current_millis());
                }
            }
        }
        info!("ticker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::TopicConf;
    use crate::infrastructure::acceptor::{Acceptor, AcceptorOptions, AcceptorRegistration};
    use crate::infrastructure::public::PublicMgr;
    use crate::infrastructure::session::{AdmissionPolicy, ConnMeta, Session, SessionOptions};
    use crate::infrastructure::user::UserMgr;
    use crate::proto::BackendFrame;
    use push_gateway_core::GatewayMetrics;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn build(config: GatewayConfig) -> (TickerMgr, Arc<Exchange>, Arc<GatewayMetrics>) {
        let metrics = Arc::new(GatewayMetrics::new());
        let config = Arc::new(config);
        let exchange = Exchange::new(
            Arc::clone(&config),
            Arc::new(UserMgr::new(0, Default::default(), Arc::clone(&metrics))),
            Arc::new(AcceptorMgr::new(Arc::clone(&metrics))),
            Arc::new(PublicMgr::from_config(&config, Arc::clone(&metrics))),
            Arc::new(SessionMgr::new(
                AdmissionPolicy::from_config(&config),
                Arc::clone(&metrics),
            )),
            Arc::clone(&metrics),
        );
        (
            TickerMgr::new(config, Arc::clone(&exchange)),
            exchange,
            metrics,
        )
    }

    fn add_acceptor(
        exchange: &Exchange,
        id: &str,
        queue_size: usize,
        metrics: &Arc<GatewayMetrics>,
    ) -> (Arc<Acceptor>, mpsc::Receiver<BackendFrame>) {
        let (acc, rx) = Acceptor::new(
            AcceptorRegistration::new(id, "app").with_topics(vec![TopicConf::private("orders")]),
            AcceptorOptions {
                queue_size,
                admin_timeout: Duration::from_millis(50),
            },
            Arc::clone(metrics),
        );
        exchange.acceptors().add(Arc::clone(&acc));
        (acc, rx)
    }

    fn config() -> GatewayConfig {
        GatewayConfig {
            exchange_async: false,
            min_resync_interval: Duration::from_millis(100),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_acceptor_drop_triggers_targeted_resync() {
        let (ticker, exchange, metrics) = build(config());
        let (full, mut full_rx) = add_acceptor(&exchange, "full", 1, &metrics);
        let (_ok, mut ok_rx) = add_acceptor(&exchange, "ok", 16, &metrics);

        // 填满队列后再发一帧触发丢弃
        full.send(BackendFrame::default()).unwrap();
        assert!(full.send(BackendFrame::default()).is_err());
        while full_rx.try_recv().is_ok() {}

        let fail = full.last_write_fail_ms();
        let now = fail + 1_000;
        let report = ticker.reconcile(now);
        assert_eq!(report.acceptor_resyncs, vec!["full".to_string()]);
        assert!(!report.exchange_resync);
        assert!(full.last_resync_ms() >= fail);

        let frame = full_rx.try_recv().unwrap();
        assert!(frame.sync.unwrap().full);
        assert!(ok_rx.try_recv().is_err());

        // 已补偿，不再重复
        assert!(ticker.reconcile(now + 1_000).is_empty());
    }

    #[test]
    fn test_frames_dropped_during_resync_are_compensated() {
        let (ticker, exchange, metrics) = build(GatewayConfig {
            sync_batch_size: 1,
            ..config()
        });
        let (acc, mut rx) = add_acceptor(&exchange, "small", 2, &metrics);
        for uid in 1..=5 {
            let s = Session::new(
                ConnMeta::with_ip("127.0.0.1"),
                SessionOptions::default(),
                Arc::clone(&metrics),
            );
            s.client().subscribe(&["orders"]);
            assert!(exchange.users().bind(uid, s).is_ok());
        }

        exchange.process_event(Event::resync_acceptor("small", "register"));
        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 2);
        assert_eq!(acc.discard_count(), 1);
        assert!(acc.needs_resync());

        let report = ticker.reconcile(current_millis() + 10_000);
        assert_eq!(report.acceptor_resyncs, vec!["small".to_string()]);
    }

    #[test]
    fn test_exchange_drop_triggers_global_resync() {
        let (ticker, exchange, metrics) = build(GatewayConfig {
            exchange_async: true,
            event_queue_size: 1,
            ..config()
        });
        let (_a, mut rx_a) = add_acceptor(&exchange, "a", 16, &metrics);
        let (_b, mut rx_b) = add_acceptor(&exchange, "b", 16, &metrics);

        for uid in 1..=2 {
            let s = Session::new(
                ConnMeta::with_ip("127.0.0.1"),
                SessionOptions::default(),
                Arc::clone(&metrics),
            );
            exchange.on_login(&s, uid, None).unwrap();
        }
        let fail = exchange.last_fail_ms();
        assert!(fail > 0);

        let report = ticker.reconcile(fail + 1);
        assert!(report.exchange_resync);
        assert!(rx_a.try_recv().unwrap().sync.unwrap().full);
        assert!(rx_b.try_recv().unwrap().sync.unwrap().full);

        assert!(!ticker.reconcile(fail + 2).exchange_resync);
    }

    #[test]
    fn test_round_robin_rotates() {
        let (ticker, exchange, metrics) = build(GatewayConfig {
            round_robin: true,
            round_robin_interval: Duration::from_millis(10),
            ..config()
        });
        let (_a, _rx_a) = add_acceptor(&exchange, "a", 16, &metrics);
        let (_b, _rx_b) = add_acceptor(&exchange, "b", 16, &metrics);

        let base = current_millis() + 1_000;
        let first = ticker.reconcile(base).round_robin.unwrap();
        let second = ticker.reconcile(base + 20).round_robin.unwrap();
        assert_ne!(first, second);
        assert!(ticker.reconcile(base + 21).round_robin.is_none());
    }

    #[test]
    fn test_tick_sessions_evicts_unauthenticated() {
        let (ticker, exchange, metrics) = build(GatewayConfig {
            auth_timeout: Duration::from_millis(10),
            ..config()
        });
        let s = Session::new(
            ConnMeta::with_ip("127.0.0.1"),
            SessionOptions {
                auth_timeout: Duration::from_millis(10),
                ..SessionOptions::default()
            },
            Arc::clone(&metrics),
        );
        exchange.sessions().register(Arc::clone(&s)).unwrap();

        assert_eq!(ticker.tick_sessions(s.started_at_ms() + 1), 0);
        assert_eq!(ticker.tick_sessions(s.started_at_ms() + 1_000), 1);
        assert!(s.is_stopped());
        assert_eq!(s.close_reason(), Some("auth_timeout"));
    }
}
