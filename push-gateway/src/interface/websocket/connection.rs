//! # WebSocket 接入
//!
//! 握手时采集 ip / path / host / referer / 查询参数，之后把读写两半
//! 分别适配为 `FrameReader` / `FrameWriter` 交给会话运行。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

use push_gateway_core::{GatewayError, GatewayMetrics, Result};

use crate::config::GatewayConfig;
use crate::domain::repository::{FrameReader, FrameWriter};
use crate::infrastructure::session::session::wait_stopped;
use crate::infrastructure::session::{
    ConnMeta, FrameHandler, Session, SessionListener, SessionMgr, SessionOptions,
};

/// 经代理转发时携带的券商标识
pub const BROKER_HEADER: &str = "x-broker-id";

type WsStream = WebSocketStream<TcpStream>;

pub struct WsReader {
    stream: SplitStream<WsStream>,
}

pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(GatewayError::SessionClosed(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, data: Bytes) -> Result<()> {
        let message = match std::str::from_utf8(&data) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(data.to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| GatewayError::SessionClosed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// 解析查询串，不做百分号解码
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn header(req: &Request, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// 从握手请求采集连接元数据
pub fn conn_meta(req: &Request, peer: &SocketAddr) -> ConnMeta {
    ConnMeta {
        ip: peer.ip().to_string(),
        path: req.uri().path().to_string(),
        host: header(req, "host"),
        referer: header(req, "referer"),
        broker_id: header(req, BROKER_HEADER),
        params: req.uri().query().map(parse_query).unwrap_or_default(),
    }
}

pub struct WebSocketServer {
    listener: TcpListener,
    config: Arc<GatewayConfig>,
    sessions: Arc<SessionMgr>,
    handler: Arc<dyn FrameHandler>,
    session_listener: Arc<dyn SessionListener>,
    metrics: Arc<GatewayMetrics>,
}

impl WebSocketServer {
    pub async fn bind(
        config: Arc<GatewayConfig>,
        sessions: Arc<SessionMgr>,
        handler: Arc<dyn FrameHandler>,
        session_listener: Arc<dyn SessionListener>,
        metrics: Arc<GatewayMetrics>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.ws_addr).await?;
        info!(addr = %config.ws_addr, "websocket listener bound");
        Ok(Self {
            listener,
            config,
            sessions,
            handler,
            session_listener,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let server = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                _ = wait_stopped(&mut shutdown) => break,
                accepted = server.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&server);
                    tokio::spawn(async move { server.handle(stream, peer).await });
                }
                Err(e) => warn!(error = %e, "websocket accept failed"),
            }
        }
        info!("websocket listener stopped");
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.sessions.admit(&peer.ip().to_string()) {
            debug!(peer = %peer, error = %e, "connection refused before handshake");
            return;
        }
        let _ = stream.set_nodelay(true);

        let captured = Arc::new(Mutex::new(ConnMeta::with_ip(peer.ip().to_string())));
        let callback = {
            let captured = Arc::clone(&captured);
            move |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
                *captured.lock() = conn_meta(req, &peer);
                Ok(response)
            }
        };
        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer = %peer, error = %e, "websocket handshake failed");
                return;
            }
        };

        let meta = captured.lock().clone();
        let options = SessionOptions::from_config(&self.config, &meta);
        let session = Session::new(meta, options, Arc::clone(&self.metrics));
        let (sink, stream) = ws.split();
        let mut writer = WsWriter { sink };
        if let Err(e) = self.sessions.register(Arc::clone(&session)) {
            let _ = writer.write_frame(Bytes::from(e.to_string())).await;
            writer.close().await;
            return;
        }

        debug!(
            session_id = %session.id(),
            peer = %peer,
            protocol = session.version().as_str(),
            "session accepted"
        );
        session
            .run(
                WsReader { stream },
                writer,
                Arc::clone(&self.handler),
                Arc::clone(&self.session_listener),
            )
            .await;
    }
}
