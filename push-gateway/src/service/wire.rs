//! 依赖装配
//!
//! 按依赖顺序构建注册表、交换器与对外服务，不启动任何任务。

use std::sync::Arc;

use push_gateway_core::GatewayMetrics;

use crate::application::{AdminQueryService, ClientCommandService, Exchange, TickerMgr};
use crate::config::GatewayConfig;
use crate::infrastructure::acceptor::AcceptorMgr;
use crate::infrastructure::auth::GatewayAuthenticator;
use crate::infrastructure::public::PublicMgr;
use crate::infrastructure::session::{AdmissionPolicy, FrameHandler, SessionListener, SessionMgr};
use crate::infrastructure::user::UserMgr;
use crate::interface::backend::BackendStreamDriver;
use crate::interface::websocket::JsonFrameHandler;

/// 应用上下文，持有所有已构建的组件
pub struct ApplicationContext {
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<GatewayMetrics>,
    pub sessions: Arc<SessionMgr>,
    pub users: Arc<UserMgr>,
    pub acceptors: Arc<AcceptorMgr>,
    pub publics: Arc<PublicMgr>,
    pub exchange: Arc<Exchange>,
    pub ticker: Arc<TickerMgr>,
    pub commands: Arc<ClientCommandService>,
    pub queries: Arc<AdminQueryService>,
    pub backend: Arc<BackendStreamDriver>,
}

impl ApplicationContext {
    /// 客户端协议处理器
    pub fn frame_handler(&self) -> Arc<dyn FrameHandler> {
        Arc::new(JsonFrameHandler::new(Arc::clone(&self.commands)))
    }

    /// 会话关闭回调，由交换器负责清理用户与订阅
    pub fn session_listener(&self) -> Arc<dyn SessionListener> {
        Arc::clone(&self.exchange) as Arc<dyn SessionListener>
    }
}

pub fn initialize(config: GatewayConfig) -> ApplicationContext {
    let config = Arc::new(config);
    let metrics = Arc::new(GatewayMetrics::new());

    // 1. 在线注册表
    let sessions = Arc::new(SessionMgr::new(
        AdmissionPolicy::from_config(&config),
        Arc::clone(&metrics),
    ));
    let users = Arc::new(UserMgr::new(
        config.max_sessions_per_user,
        config.allowed_uids.clone(),
        Arc::clone(&metrics),
    ));
    let acceptors = Arc::new(AcceptorMgr::new(Arc::clone(&metrics)));
    let publics = Arc::new(PublicMgr::from_config(&config, Arc::clone(&metrics)));

    // 2. 交换器与对账
    let exchange = Exchange::new(
        Arc::clone(&config),
        Arc::clone(&users),
        Arc::clone(&acceptors),
        Arc::clone(&publics),
        Arc::clone(&sessions),
        Arc::clone(&metrics),
    );
    let ticker = Arc::new(TickerMgr::new(Arc::clone(&config), Arc::clone(&exchange)));

    // 3. 对外服务
    let authenticator = Arc::new(GatewayAuthenticator::from_config(&config));
    let commands = Arc::new(ClientCommandService::new(
        &config,
        Arc::clone(&exchange),
        authenticator,
    ));
    let queries = Arc::new(AdminQueryService::new(Arc::clone(&exchange)));
    let backend = Arc::new(BackendStreamDriver::new(
        Arc::clone(&config),
        Arc::clone(&exchange),
        Arc::clone(&metrics),
    ));

    ApplicationContext {
        config,
        metrics,
        sessions,
        users,
        acceptors,
        publics,
        exchange,
        ticker,
        commands,
        queries,
        backend,
    }
}
