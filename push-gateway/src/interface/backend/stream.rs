//! # 后端业务流驱动
//!
//! 一条 TCP 连接对应一个 acceptor。首帧必须是 REGISTER，之后读写两个循环
//! 对称运行：读循环把推送交给交换器，写循环把 acceptor 队列写到线上。
//! 流结束时先从注册表摘除，再在宽限期内尽量写完队列。

use std::sync::Arc;

use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use push_gateway_core::{GatewayError, GatewayMetrics, Result};

use crate::application::{Event, Exchange};
use crate::config::GatewayConfig;
use crate::domain::model::TopicConf;
use crate::infrastructure::acceptor::{
    Acceptor, AcceptorOptions, AcceptorRegistration, AdminResponse,
};
use crate::infrastructure::session::session::wait_stopped;
use crate::proto::{BackendFrame, Command, ErrorStatus};

/// 单帧上限
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub fn backend_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode_frame(frame: &BackendFrame) -> Bytes {
    Bytes::from(frame.encode_to_vec())
}

pub fn decode_frame(data: &[u8]) -> Result<BackendFrame> {
    BackendFrame::decode(data).map_err(|e| GatewayError::Protocol(format!("decode backend frame: {}", e)))
}

pub struct BackendStreamDriver {
    config: Arc<GatewayConfig>,
    exchange: Arc<Exchange>,
    metrics: Arc<GatewayMetrics>,
}

impl BackendStreamDriver {
    pub fn new(config: Arc<GatewayConfig>, exchange: Arc<Exchange>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            config,
            exchange,
            metrics,
        }
    }

    /// 驱动一条后端流直到结束
    pub async fn serve<S>(&self, stream: S, peer: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(stream, backend_codec());
        let (mut sink, mut source) = framed.split();

        let first = match tokio::time::timeout(self.config.register_timeout, source.next()).await {
            Ok(Some(Ok(data))) => decode_frame(&data),
            Ok(Some(Err(e))) => Err(GatewayError::Protocol(format!("read register: {}", e))),
            Ok(None) => Err(GatewayError::Protocol("stream closed before register".to_string())),
            Err(_) => Err(GatewayError::InvalidRegister("register timeout".to_string())),
        };

        let registration = match first.and_then(|frame| parse_register(&frame)) {
            Ok(registration) => registration,
            Err(e) => {
                warn!(peer = %peer, error = %e, "backend registration rejected");
                self.metrics
                    .protocol_kick_total
                    .with_label_values(&["register"])
                    .inc();
                let status = ErrorStatus {
                    code: e.code().as_u32(),
                    message: e.to_string(),
                };
                let _ = sink.send(encode_frame(&BackendFrame::ack("", Some(status)))).await;
                let _ = sink.close().await;
                return Err(e);
            }
        };

        let (acceptor, rx) = Acceptor::new(
            registration,
            AcceptorOptions::from_config(&self.config),
            Arc::clone(&self.metrics),
        );
        let acceptors = Arc::clone(self.exchange.acceptors());
        if let Some(old) = acceptors.add(Arc::clone(&acceptor)) {
            info!(acceptor_id = %old.id(), "replacing existing acceptor");
            old.close();
        }
        for conf in acceptor.public_topics() {
            self.exchange.publics().ensure_topic(&conf);
        }
        info!(
            acceptor_id = %acceptor.id(),
            app_id = %acceptor.app_id(),
            shard_index = acceptor.shard_index(),
            shard_total = acceptor.shard_total(),
            peer = %peer,
            "acceptor registered"
        );

        if let Err(e) = sink.send(encode_frame(&BackendFrame::ack("", None))).await {
            warn!(acceptor_id = %acceptor.id(), error = %e, "failed to ack register");
            acceptors.remove(&acceptor);
            acceptor.close();
            return Ok(());
        }

        self.exchange
            .dispatch_event(Event::resync_acceptor(acceptor.id(), "register"));
        self.exchange.dispatch_event(Event::SyncConfig {
            acceptor_id: Some(acceptor.id().to_string()),
        });

        let send_task = tokio::spawn(send_loop(
            Arc::clone(&acceptor),
            sink,
            rx,
            self.config.acceptor_drain_grace,
        ));

        let mut closed = acceptor.closed_signal();
        loop {
            let item = tokio::select! {
                _ = wait_stopped(&mut closed) => break,
                item = source.next() => item,
            };
            let data = match item {
                Some(Ok(data)) => data,
                Some(Err(e)) => {
                    debug!(acceptor_id = %acceptor.id(), error = %e, "backend read failed");
                    break;
                }
                None => {
                    debug!(acceptor_id = %acceptor.id(), "backend stream ended");
                    break;
                }
            };
            let frame = match decode_frame(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(acceptor_id = %acceptor.id(), error = %e, "closing backend stream");
                    self.metrics
                        .protocol_kick_total
                        .with_label_values(&["backend_decode"])
                        .inc();
                    break;
                }
            };
            if let Err(e) = self.handle_frame(&acceptor, frame) {
                warn!(acceptor_id = %acceptor.id(), error = %e, "closing backend stream");
                self.metrics
                    .protocol_kick_total
                    .with_label_values(&["backend"])
                    .inc();
                break;
            }
        }

        acceptors.remove(&acceptor);
        acceptor.close();
        let _ = send_task.await;
        info!(acceptor_id = %acceptor.id(), peer = %peer, "acceptor stream finished");
        Ok(())
    }

    fn handle_frame(&self, acceptor: &Arc<Acceptor>, frame: BackendFrame) -> Result<()> {
        match Command::try_from(frame.command).unwrap_or(Command::Unspecified) {
            Command::Push => self.exchange.on_message(acceptor, frame.push),
            Command::Admin => match frame.admin {
                Some(admin) if admin.is_response => {
                    acceptor.complete_admin(
                        &frame.request_id,
                        AdminResponse {
                            code: admin.code,
                            body: admin.body,
                        },
                    );
                }
                _ => debug!(acceptor_id = %acceptor.id(), "admin request from backend ignored"),
            },
            Command::Ack => acceptor.record_ack(),
            Command::SyncConfig => {
                if let Some(config) = frame.config {
                    let confs: Vec<TopicConf> = config.topics.iter().map(TopicConf::from).collect();
                    acceptor.update_topics(&confs);
                    self.exchange.acceptors().reindex();
                    for conf in acceptor.public_topics() {
                        self.exchange.publics().ensure_topic(&conf);
                    }
                }
            }
            Command::Register => {
                return Err(GatewayError::Protocol("duplicate register".to_string()));
            }
            Command::Sync | Command::Unspecified => {
                debug!(acceptor_id = %acceptor.id(), command = frame.command, "unexpected backend command");
            }
        }
        Ok(())
    }
}

fn parse_register(frame: &BackendFrame) -> Result<AcceptorRegistration> {
    if frame.command != Command::Register as i32 {
        return Err(GatewayError::InvalidRegister(format!(
            "first frame must be REGISTER, got {}",
            frame.command
        )));
    }
    let register = frame
        .register
        .as_ref()
        .ok_or_else(|| GatewayError::InvalidRegister("missing register body".to_string()))?;
    let registration = AcceptorRegistration::from(register);
    registration.validate()?;
    Ok(registration)
}

async fn send_loop<W>(
    acceptor: Arc<Acceptor>,
    mut sink: W,
    mut rx: mpsc::Receiver<BackendFrame>,
    drain_grace: std::time::Duration,
) where
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let mut closed = acceptor.closed_signal();
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = wait_stopped(&mut closed) => break,
        };
        if let Err(e) = sink.send(encode_frame(&frame)).await {
            debug!(acceptor_id = %acceptor.id(), error = %e, "backend write failed");
            acceptor.close();
            return;
        }
    }

    // 关闭后在宽限期内写完已入队的帧
    rx.close();
    let drained = tokio::time::timeout(drain_grace, async {
        let mut count = 0usize;
        while let Some(frame) = rx.recv().await {
            if sink.send(encode_frame(&frame)).await.is_err() {
                break;
            }
            count += 1;
        }
        count
    })
    .await;
    match drained {
        Ok(count) => debug!(acceptor_id = %acceptor.id(), count, "acceptor queue drained"),
        Err(_) => warn!(acceptor_id = %acceptor.id(), "acceptor drain grace exceeded"),
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::acceptor::AcceptorMgr;
    use crate::infrastructure::public::PublicMgr;
    use crate::infrastructure::session::{AdmissionPolicy, SessionMgr};
    use crate::infrastructure::user::UserMgr;
    use crate::proto::{PushMessage, Register, WirePushMode, WireScope, WireTopicConf};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn driver() -> (Arc<BackendStreamDriver>, Arc<Exchange>) {
        let metrics = Arc::new(GatewayMetrics::new());
        let config = Arc::new(GatewayConfig {
            exchange_async: false,
            register_timeout: Duration::from_millis(200),
            ..GatewayConfig::default()
        });
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
            Arc::new(BackendStreamDriver::new(config, Arc::clone(&exchange), metrics)),
            exchange,
        )
    }

    fn register_frame(id: &str, index: i32, total: i32) -> BackendFrame {
        BackendFrame::register(Register {
            connector_id: id.to_string(),
            app_id: "orders".to_string(),
            shard_index: index,
            shard_total: total,
            focus_actions: 0xF,
            topics: vec![
                WireTopicConf {
                    name: "orders".to_string(),
                    scope: WireScope::Private as i32,
                    push_mode: WirePushMode::Full as i32,
                },
                WireTopicConf {
                    name: "ticker".to_string(),
                    scope: WireScope::Public as i32,
                    push_mode: WirePushMode::Full as i32,
                },
            ],
        })
    }

    async fn recv(client: &mut Framed<DuplexStream, LengthDelimitedCodec>) -> BackendFrame {
        let data = tokio::time::timeout(Duration::from_secs(1), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        decode_frame(&data).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_initial_sync() {
        let (driver, exchange) = driver();
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let serve = {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move { driver.serve(server_io, "test".to_string()).await })
        };

        let mut client = Framed::new(client_io, backend_codec());
        client
            .send(encode_frame(&register_frame("acc-1", 0, 2)))
            .await
            .unwrap();

        let ack = recv(&mut client).await;
        assert_eq!(ack.command, Command::Ack as i32);
        assert!(ack.error.is_none());

        let sync = recv(&mut client).await;
        assert_eq!(sync.command, Command::Sync as i32);
        assert!(sync.sync.unwrap().full);

        let config = recv(&mut client).await;
        assert_eq!(config.command, Command::SyncConfig as i32);
        assert_eq!(config.config.unwrap().topics.len(), 2);

        assert!(exchange.acceptors().get("acc-1").is_some());
        assert!(exchange.publics().is_public("ticker"));

        // 公共推送进入广播器
        let push = BackendFrame::push(vec![PushMessage {
            topic: "ticker".to_string(),
            scope: WireScope::Public as i32,
            payload: Bytes::from_static(b"tick"),
            ..Default::default()
        }]);
        client.send(encode_frame(&push)).await.unwrap();

        drop(client);
        serve.await.unwrap().unwrap();
        assert!(exchange.acceptors().get("acc-1").is_none());
        exchange.publics().stop_all();
    }

    #[tokio::test]
    async fn test_invalid_register_rejected() {
        let (driver, exchange) = driver();
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let serve = {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move { driver.serve(server_io, "test".to_string()).await })
        };

        let mut client = Framed::new(client_io, backend_codec());
        client
            .send(encode_frame(&register_frame("acc-1", 3, 2)))
            .await
            .unwrap();

        let ack = recv(&mut client).await;
        assert_eq!(ack.command, Command::Ack as i32);
        assert!(ack.error.is_some());
        assert!(matches!(
            serve.await.unwrap(),
            Err(GatewayError::InvalidRegister(_))
        ));
        assert!(exchange.acceptors().is_empty());
    }

    #[tokio::test]
    async fn test_reregister_replaces_old_stream() {
        let (driver, exchange) = driver();

        let (server_a, client_a) = tokio::io::duplex(64 * 1024);
        let serve_a = {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move { driver.serve(server_a, "a".to_string()).await })
        };
        let mut client_a = Framed::new(client_a, backend_codec());
        client_a
            .send(encode_frame(&register_frame("acc-1", -1, 0)))
            .await
            .unwrap();
        recv(&mut client_a).await;
        let first = exchange.acceptors().get("acc-1").unwrap();

        let (server_b, client_b) = tokio::io::duplex(64 * 1024);
        let serve_b = {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move { driver.serve(server_b, "b".to_string()).await })
        };
        let mut client_b = Framed::new(client_b, backend_codec());
        client_b
            .send(encode_frame(&register_frame("acc-1", -1, 0)))
            .await
            .unwrap();
        recv(&mut client_b).await;

        // 旧流被关闭
        tokio::time::timeout(Duration::from_secs(1), serve_a)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(first.is_closed());
        let current = exchange.acceptors().get("acc-1").unwrap();
        assert!(!Arc::ptr_eq(&first, &current));

        drop(client_a);
        drop(client_b);
        serve_b.await.unwrap().unwrap();
        exchange.publics().stop_all();
    }
}
