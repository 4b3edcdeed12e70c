//! 内存连接
//!
//! 以 channel 实现 `FrameReader` / `FrameWriter`，用于本地联调与测试。

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use push_gateway_core::{GatewayError, Result};

use crate::domain::repository::{FrameReader, FrameWriter};

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

/// 连接的对端
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

/// 创建一对内存连接：会话侧读写端与对端
pub fn memory_pair() -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        MemoryReader { rx: in_rx },
        MemoryWriter { tx: Some(out_tx) },
        MemoryPeer {
            inbound: Some(in_tx),
            outbound: out_rx,
        },
    )
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, data: Bytes) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(data)
                .map_err(|_| GatewayError::SessionClosed("peer gone".to_string())),
            None => Err(GatewayError::SessionClosed("writer closed".to_string())),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

impl MemoryPeer {
    /// 向会话发送一帧，连接已关闭时忽略
    pub fn send(&self, data: impl Into<Bytes>) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(data.into());
        }
    }

    /// 接收会话写出的下一帧，会话关闭后返回 None
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.outbound.try_recv().ok()
    }

    /// 关闭对端写方向，会话读到 EOF
    pub fn close(&mut self) {
        self.inbound = None;
    }
}
