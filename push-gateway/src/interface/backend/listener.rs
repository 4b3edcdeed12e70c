//! 后端流监听
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::infrastructure::session::session::wait_stopped;

use super::stream::BackendStreamDriver;

pub struct BackendListener {
    listener: TcpListener,
    driver: Arc<BackendStreamDriver>,
}

impl BackendListener {
    pub async fn bind(addr: &str, driver: Arc<BackendStreamDriver>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "backend listener bound");
        Ok(Self { listener, driver })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受连接直到收到关闭信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = wait_stopped(&mut shutdown) => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let driver = Arc::clone(&self.driver);
                    tokio::spawn(async move {
                        if let Err(e) = driver.serve(stream, peer.to_string()).await {
                            debug!(peer = %peer, error = %e, "backend stream ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "backend accept failed"),
            }
        }
        info!("backend listener stopped");
    }
}
