//! 后端探针
//!
//! 接管 acceptor 的发送队列，经线协议编解码后取回帧，
//! 看到的内容与真实后端收到的一致。

use std::time::Duration;

use tokio::sync::mpsc;

use crate::proto::{BackendFrame, Command, SyncPayload};

use super::stream::{decode_frame, encode_frame};

pub struct BackendProbe {
    rx: mpsc::Receiver<BackendFrame>,
}

impl BackendProbe {
    pub fn new(rx: mpsc::Receiver<BackendFrame>) -> Self {
        Self { rx }
    }

    fn wire(frame: BackendFrame) -> Option<BackendFrame> {
        decode_frame(&encode_frame(&frame)).ok()
    }

    /// 取出当前已入队的全部帧
    pub fn frames(&mut self) -> Vec<BackendFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.extend(Self::wire(frame));
        }
        out
    }

    /// 当前已入队的同步消息
    pub fn syncs(&mut self) -> Vec<SyncPayload> {
        self.frames()
            .into_iter()
            .filter(|f| f.command == Command::Sync as i32)
            .filter_map(|f| f.sync)
            .collect()
    }

    /// 等待下一帧
    pub async fn next(&mut self, timeout: Duration) -> Option<BackendFrame> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Self::wire(frame),
            _ => None,
        }
    }

    /// 同步消息中出现过的 uid
    pub fn synced_uids(&mut self) -> Vec<i64> {
        let mut uids: Vec<i64> = self
            .syncs()
            .iter()
            .flat_map(|s| s.users.iter().map(|u| u.uid))
            .collect();
        uids.sort_unstable();
        uids.dedup();
        uids
    }
}
