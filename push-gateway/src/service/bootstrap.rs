//! 应用启动器 - 负责启动各任务与有序关闭

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use push_gateway_core::tracing::spawn_deadlock_detector;

use crate::config::GatewayConfig;
use crate::interface::backend::BackendListener;
use crate::interface::websocket::WebSocketServer;

use super::wire::{self, ApplicationContext};

const DEADLOCK_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用直到收到 ctrl-c
    pub async fn run(config: GatewayConfig) -> Result<()> {
        spawn_deadlock_detector(DEADLOCK_CHECK_INTERVAL);
        let context = wire::initialize(config);
        info!(node_id = %context.config.node_id, "application context created");
        Self::run_with_context(context, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    /// 运行服务，`shutdown` 完成后按顺序关闭
    pub async fn run_with_context<F>(context: ApplicationContext, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (accept_tx, accept_rx) = watch::channel(false);
        let (core_tx, core_rx) = watch::channel(false);

        let ws_server = WebSocketServer::bind(
            Arc::clone(&context.config),
            Arc::clone(&context.sessions),
            context.frame_handler(),
            context.session_listener(),
            Arc::clone(&context.metrics),
        )
        .await?;
        let backend_listener =
            BackendListener::bind(&context.config.backend_addr, Arc::clone(&context.backend))
                .await?;

        let exchange_task = tokio::spawn(Arc::clone(&context.exchange).run(core_rx.clone()));
        let ticker_task = tokio::spawn(Arc::clone(&context.ticker).run(core_rx));
        let ws_task = tokio::spawn(ws_server.run(accept_rx.clone()));
        let backend_task = tokio::spawn(backend_listener.run(accept_rx));

        info!(
            ws_addr = %context.config.ws_addr,
            backend_addr = %context.config.backend_addr,
            "push gateway started"
        );
        shutdown.await;
        info!("shutdown requested");

        Self::shutdown(
            &context,
            accept_tx,
            core_tx,
            [ws_task, backend_task],
            [exchange_task, ticker_task],
        )
        .await;
        info!("push gateway stopped");
        Ok(())
    }

    async fn shutdown(
        context: &ApplicationContext,
        accept_tx: watch::Sender<bool>,
        core_tx: watch::Sender<bool>,
        listeners: [JoinHandle<()>; 2],
        core: [JoinHandle<()>; 2],
    ) {
        let grace = context.config.shutdown_grace;

        // 1. 停止接受新连接
        let _ = accept_tx.send(true);
        for task in listeners {
            let _ = task.await;
        }

        // 2. 关闭客户端会话
        context.sessions.stop_all("shutdown");

        // 3. 关闭后端流，等待会话与流退出
        context.acceptors.close_all();
        let drained = tokio::time::timeout(grace, async {
            while !context.sessions.is_empty() {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = context.sessions.len(),
                "sessions still open after shutdown grace"
            );
        }

        // 4. 交换器排空剩余事件
        let _ = core_tx.send(true);
        for task in core {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("background task did not stop within shutdown grace");
            }
        }

        // 5. 停止公共频道
        context.publics.stop_all();
    }
}
