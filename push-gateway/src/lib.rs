//! 推送网关
//!
//! 客户端经 WebSocket 接入，业务后端以 acceptor 身份通过长连接流注册；
//! 网关负责在两者之间同步在线状态并路由推送。

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;
pub mod proto;
pub mod service;

pub use config::GatewayConfig;
pub use service::{ApplicationBootstrap, ApplicationContext};
