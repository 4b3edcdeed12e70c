//! # 连接会话
//!
//! 一个物理连接对应一个 Session，内部有两条下行通道：
//! - reply：对客户端显式请求的应答，有界，满时等待写循环腾出空间，不丢弃
//! - push：业务推送，有界，满时丢弃并计数
//!
//! 读循环与写循环任一退出都会触发 `stop`，另一侧随之结束。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use push_gateway_core::{
    GatewayError, GatewayMetrics, Result, current_millis, generate_session_id, next_short_id,
};

use crate::config::GatewayConfig;
use crate::domain::model::SessionBrief;
use crate::domain::repository::{FrameReader, FrameWriter};

use super::client::{Client, ConnMeta};
use super::rate_limit::CommandLimiter;

/// 单连接空闲超时覆盖参数（毫秒）
pub const IDLE_TIMEOUT_PARAM: &str = "idle_timeout_ms";

/// 客户端协议版本，由握手路径决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/v2") {
            ProtocolVersion::V2
        } else {
            ProtocolVersion::V1
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "v1",
            ProtocolVersion::V2 => "v2",
        }
    }
}

/// 下行消息类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteClass {
    Reply,
    Push,
}

impl WriteClass {
    fn as_str(self) -> &'static str {
        match self {
            WriteClass::Reply => "reply",
            WriteClass::Push => "push",
        }
    }
}

/// 会话运行参数
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub queue_size: usize,
    pub reply_queue_size: usize,
    pub command_limit: u32,
    pub command_period: Duration,
    pub idle_timeout: Duration,
    pub auth_timeout: Duration,
    pub write_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &GatewayConfig, meta: &ConnMeta) -> Self {
        let requested = meta
            .params
            .get(IDLE_TIMEOUT_PARAM)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);
        Self {
            queue_size: config.session_queue_size,
            reply_queue_size: config.reply_queue_size,
            command_limit: config.command_limit,
            command_period: config.command_period,
            idle_timeout: config.clamp_idle(requested),
            auth_timeout: config.auth_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default(), &ConnMeta::default())
    }
}

/// 协议处理器：按版本解析客户端帧并执行命令
///
/// 返回错误表示连接不可继续，会话随即关闭。
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, session: &Arc<Session>, frame: Bytes) -> Result<()>;
}

/// 会话结束回调
pub trait SessionListener: Send + Sync {
    fn on_session_closed(&self, session: &Arc<Session>);
}

/// 等待 done 信号置位
pub(crate) async fn wait_stopped(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|stopped| *stopped).await;
}

struct Lanes {
    reply_rx: mpsc::Receiver<Bytes>,
    push_rx: mpsc::Receiver<Bytes>,
}

pub struct Session {
    id: String,
    short_id: u64,
    version: ProtocolVersion,
    client: Client,
    reply_tx: mpsc::Sender<Bytes>,
    push_tx: mpsc::Sender<Bytes>,
    lanes: Mutex<Option<Lanes>>,
    limiter: CommandLimiter,
    last_active_ms: AtomicI64,
    started_at_ms: i64,
    write_count: AtomicU64,
    drop_count: AtomicU64,
    idle_timeout: Duration,
    auth_timeout: Duration,
    write_timeout: Duration,
    done_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    close_reason: Mutex<Option<&'static str>>,
    metrics: Arc<GatewayMetrics>,
}

impl Session {
    pub fn new(
        meta: ConnMeta,
        options: SessionOptions,
        metrics: Arc<GatewayMetrics>,
    ) -> Arc<Self> {
        let version = ProtocolVersion::from_path(&meta.path);
        let (reply_tx, reply_rx) = mpsc::channel(options.reply_queue_size.max(1));
        let (push_tx, push_rx) = mpsc::channel(options.queue_size.max(1));
        let (done_tx, _) = watch::channel(false);
        let now = current_millis();

        Arc::new(Self {
            id: generate_session_id(),
            short_id: next_short_id(),
            version,
            client: Client::new(meta),
            reply_tx,
            push_tx,
            lanes: Mutex::new(Some(Lanes { reply_rx, push_rx })),
            limiter: CommandLimiter::new(options.command_limit, options.command_period),
            last_active_ms: AtomicI64::new(now),
            started_at_ms: now,
            write_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
            idle_timeout: options.idle_timeout,
            auth_timeout: options.auth_timeout,
            write_timeout: options.write_timeout,
            done_tx,
            stopped: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            metrics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn short_id(&self) -> u64 {
        self.short_id
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn member_id(&self) -> i64 {
        self.client.member_id()
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        *self.close_reason.lock()
    }

    /// 当前 push 通道排队数
    pub fn queued(&self) -> usize {
        self.push_tx.max_capacity() - self.push_tx.capacity()
    }

    pub fn touch(&self) {
        self.last_active_ms.store(current_millis(), Ordering::Relaxed);
    }

    /// 命令限流检查
    pub fn allow(&self) -> Result<()> {
        if self.limiter.allow() {
            Ok(())
        } else {
            self.metrics.session_rate_limited_total.inc();
            Err(GatewayError::RateLimited)
        }
    }

    fn record_write(&self, class: WriteClass) {
        self.metrics
            .session_write_total
            .with_label_values(&[class.as_str()])
            .inc();
    }

    /// 写入应答，队列满时等待，会话关闭时返回错误
    pub async fn write_reply(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.is_stopped() {
            return Err(GatewayError::SessionClosed(self.id.clone()));
        }
        let mut done = self.done_tx.subscribe();
        let sent = tokio::select! {
            biased;
            _ = wait_stopped(&mut done) => false,
            res = self.reply_tx.send(data.into()) => res.is_ok(),
        };
        if !sent {
            return Err(GatewayError::SessionClosed(self.id.clone()));
        }
        self.record_write(WriteClass::Reply);
        Ok(())
    }

    /// 写入推送，队列满时丢弃
    pub fn write_push(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.is_stopped() {
            return Err(GatewayError::SessionClosed(self.id.clone()));
        }
        match self.push_tx.try_send(data.into()) {
            Ok(()) => {
                self.record_write(WriteClass::Push);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                self.metrics.session_discard_total.inc();
                debug!(session_id = %self.id, "push queue full, message discarded");
                Err(GatewayError::Discarded(self.id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(GatewayError::SessionClosed(self.id.clone()))
            }
        }
    }

    /// 写循环未启动时取出已排队的消息，reply 在前
    pub fn drain_queued(&self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(lanes) = self.lanes.lock().as_mut() {
            while let Ok(data) = lanes.reply_rx.try_recv() {
                out.push(data);
            }
            while let Ok(data) = lanes.push_rx.try_recv() {
                out.push(data);
            }
        }
        out
    }

    /// 关闭会话，可重复调用
    pub fn stop(&self, reason: &'static str) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some(reason);
        self.done_tx.send_replace(true);
        self.metrics
            .session_closed_total
            .with_label_values(&[reason])
            .inc();
        debug!(session_id = %self.id, reason, "session stopped");
    }

    /// 心跳检查，返回是否因超时被踢出
    pub fn tick(&self, now_ms: i64) -> bool {
        if self.is_stopped() {
            return false;
        }

        if !self.client.is_authenticated() {
            if now_ms - self.started_at_ms >= self.auth_timeout.as_millis() as i64 {
                info!(session_id = %self.id, ip = %self.client.ip(), "auth timeout, closing session");
                self.stop("auth_timeout");
                return true;
            }
            return false;
        }

        if now_ms - self.last_active_ms() >= self.idle_timeout.as_millis() as i64 {
            info!(
                session_id = %self.id,
                uid = self.client.member_id(),
                "idle timeout, closing session"
            );
            self.stop("idle_timeout");
            return true;
        }
        false
    }

    pub fn brief(&self) -> SessionBrief {
        SessionBrief {
            session_id: self.id.clone(),
            short_id: self.short_id,
            ip: self.client.ip().to_string(),
            protocol: self.version.as_str().to_string(),
            topics: self.client.topics().to_vec(),
            started_at_ms: self.started_at_ms,
        }
    }

    /// 运行读写循环直到连接结束
    pub async fn run<R, W>(
        self: Arc<Self>,
        mut reader: R,
        writer: W,
        handler: Arc<dyn FrameHandler>,
        listener: Arc<dyn SessionListener>,
    ) where
        R: FrameReader,
        W: FrameWriter,
    {
        let Some(lanes) = self.lanes.lock().take() else {
            warn!(session_id = %self.id, "session already running");
            return;
        };

        let write_task = tokio::spawn(Arc::clone(&self).write_loop(writer, lanes));

        let mut done = self.done_tx.subscribe();
        loop {
            let frame = tokio::select! {
                _ = wait_stopped(&mut done) => break,
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(Some(data)) => {
                    self.touch();
                    if let Err(e) = handler.handle(&self, data).await {
                        warn!(session_id = %self.id, error = %e, "closing session on handler error");
                        self.metrics
                            .protocol_kick_total
                            .with_label_values(&["client"])
                            .inc();
                        self.stop("protocol");
                        break;
                    }
                }
                Ok(None) => {
                    self.stop("client_closed");
                    break;
                }
                Err(e) => {
                    debug!(session_id = %self.id, error = %e, "read failed");
                    self.stop("read_failed");
                    break;
                }
            }
        }

        self.stop("read_loop_exit");
        let _ = write_task.await;
        listener.on_session_closed(&self);
    }

    async fn write_loop<W: FrameWriter>(self: Arc<Self>, mut writer: W, lanes: Lanes) {
        let Lanes {
            mut reply_rx,
            mut push_rx,
        } = lanes;
        let mut done = self.done_tx.subscribe();

        loop {
            let data = tokio::select! {
                biased;
                _ = wait_stopped(&mut done) => break,
                Some(data) = reply_rx.recv() => data,
                Some(data) = push_rx.recv() => data,
                else => break,
            };

            match tokio::time::timeout(self.write_timeout, writer.write_frame(data)).await {
                Ok(Ok(())) => {
                    self.write_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    debug!(session_id = %self.id, error = %e, "write failed");
                    self.stop("write_failed");
                    break;
                }
                Err(_) => {
                    debug!(session_id = %self.id, "write deadline exceeded");
                    self.stop("write_timeout");
                    break;
                }
            }
        }

        writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::memory::memory_pair;
    use std::sync::atomic::AtomicUsize;

    fn options(queue_size: usize) -> SessionOptions {
        SessionOptions {
            queue_size,
            ..SessionOptions::default()
        }
    }

    fn session(queue_size: usize) -> Arc<Session> {
        Session::new(
            ConnMeta::with_ip("10.0.0.1"),
            options(queue_size),
            Arc::new(GatewayMetrics::new()),
        )
    }

    struct Echo;

    #[async_trait]
    impl FrameHandler for Echo {
        async fn handle(&self, session: &Arc<Session>, frame: Bytes) -> Result<()> {
            if frame.as_ref() == b"bad" {
                return Err(GatewayError::Protocol("bad frame".into()));
            }
            session.write_reply(frame).await
        }
    }

    #[derive(Default)]
    struct CountClosed(AtomicUsize);

    impl SessionListener for CountClosed {
        fn on_session_closed(&self, _session: &Arc<Session>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_push_drops_when_full_reply_never_drops() {
        let s = session(1);
        assert!(s.write_push("a").is_ok());
        let err = s.write_push("b").unwrap_err();
        assert!(matches!(err, GatewayError::Discarded(_)));
        assert_eq!(s.drop_count(), 1);

        for _ in 0..10 {
            s.write_reply("r").await.unwrap();
        }
        let queued = s.drain_queued();
        assert_eq!(queued.len(), 11);
        assert_eq!(queued[0], Bytes::from_static(b"r"));
    }

    #[tokio::test]
    async fn test_reply_waits_for_room_then_fails_on_stop() {
        let s = Session::new(
            ConnMeta::with_ip("10.0.0.1"),
            SessionOptions {
                reply_queue_size: 1,
                ..SessionOptions::default()
            },
            Arc::new(GatewayMetrics::new()),
        );
        s.write_reply("r1").await.unwrap();

        // 队列满时等待，不丢弃
        let blocked = tokio::time::timeout(Duration::from_millis(20), s.write_reply("r2")).await;
        assert!(blocked.is_err());
        assert_eq!(s.drain_queued(), vec![Bytes::from_static(b"r1")]);
        s.write_reply("r2").await.unwrap();

        let waiter = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.write_reply("r3").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.stop("kicked");
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(GatewayError::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_write_after_stop() {
        let s = session(4);
        s.stop("kicked");
        s.stop("again");
        assert_eq!(s.close_reason(), Some("kicked"));
        assert!(matches!(
            s.write_reply("x").await,
            Err(GatewayError::SessionClosed(_))
        ));
        assert!(matches!(s.write_push("x"), Err(GatewayError::SessionClosed(_))));
    }

    #[test]
    fn test_tick_auth_and_idle() {
        let s = Session::new(
            ConnMeta::default(),
            SessionOptions {
                auth_timeout: Duration::from_millis(100),
                idle_timeout: Duration::from_millis(200),
                ..SessionOptions::default()
            },
            Arc::new(GatewayMetrics::new()),
        );
        let start = s.started_at_ms();
        assert!(!s.tick(start + 50));
        assert!(s.tick(start + 100));
        assert_eq!(s.close_reason(), Some("auth_timeout"));

        let s = Session::new(
            ConnMeta::default(),
            SessionOptions {
                idle_timeout: Duration::from_millis(200),
                ..SessionOptions::default()
            },
            Arc::new(GatewayMetrics::new()),
        );
        s.client().set_member(7, None).unwrap();
        let active = s.last_active_ms();
        assert!(!s.tick(active + 199));
        assert!(s.tick(active + 200));
        assert_eq!(s.close_reason(), Some("idle_timeout"));
    }

    #[test]
    fn test_idle_override_clamped() {
        let config = GatewayConfig::default();
        let mut meta = ConnMeta::default();
        meta.params
            .insert(IDLE_TIMEOUT_PARAM.to_string(), "1".to_string());
        let opts = SessionOptions::from_config(&config, &meta);
        assert_eq!(opts.idle_timeout, config.min_idle_timeout);
    }

    #[test]
    fn test_rate_limit() {
        let s = Session::new(
            ConnMeta::default(),
            SessionOptions {
                command_limit: 1,
                command_period: Duration::from_secs(60),
                ..SessionOptions::default()
            },
            Arc::new(GatewayMetrics::new()),
        );
        assert!(s.allow().is_ok());
        assert_eq!(s.allow(), Err(GatewayError::RateLimited));
        assert!(!s.is_stopped());
    }

    #[tokio::test]
    async fn test_run_echo_and_close() {
        let s = session(8);
        let (reader, writer, mut peer) = memory_pair();
        let listener = Arc::new(CountClosed::default());
        let task = tokio::spawn(Arc::clone(&s).run(
            reader,
            writer,
            Arc::new(Echo),
            listener.clone() as Arc<dyn SessionListener>,
        ));

        peer.send("hello");
        assert_eq!(peer.recv().await.unwrap(), Bytes::from_static(b"hello"));

        s.write_push("tick").unwrap();
        assert_eq!(peer.recv().await.unwrap(), Bytes::from_static(b"tick"));

        peer.close();
        task.await.unwrap();
        assert!(s.is_stopped());
        assert_eq!(s.close_reason(), Some("client_closed"));
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_closes_session() {
        let s = session(8);
        let (reader, writer, peer) = memory_pair();
        let listener = Arc::new(CountClosed::default());
        let task = tokio::spawn(Arc::clone(&s).run(
            reader,
            writer,
            Arc::new(Echo),
            listener.clone() as Arc<dyn SessionListener>,
        ));

        peer.send("bad");
        task.await.unwrap();
        assert_eq!(s.close_reason(), Some("protocol"));
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_unblocks_loops() {
        let s = session(8);
        let (reader, writer, _peer) = memory_pair();
        let listener = Arc::new(CountClosed::default());
        let task = tokio::spawn(Arc::clone(&s).run(
            reader,
            writer,
            Arc::new(Echo),
            listener.clone() as Arc<dyn SessionListener>,
        ));

        tokio::task::yield_now().await;
        s.stop("kicked");
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }
}
