//! # 会话注册表
//!
//! 准入限制（全局 / 单 IP / 黑白名单）是跨键不变量，整个注册表由一把
//! 读写锁保护。开启 `deadlock-detection` feature 时该锁纳入死锁检测。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use push_gateway_core::{GatewayError, GatewayMetrics, Result};

use crate::config::GatewayConfig;

use super::session::Session;

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    per_ip: HashMap<String, usize>,
}

/// 准入策略
#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    /// 0 表示不限制
    pub max_sessions: usize,
    pub max_sessions_per_ip: usize,
    pub blocked_ips: HashSet<String>,
    /// 白名单 IP 不受单 IP 限制
    pub allowed_ips: HashSet<String>,
}

impl AdmissionPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            max_sessions_per_ip: config.max_sessions_per_ip,
            blocked_ips: config.blocked_ips.clone(),
            allowed_ips: config.allowed_ips.clone(),
        }
    }
}

pub struct SessionMgr {
    registry: RwLock<Registry>,
    policy: AdmissionPolicy,
    metrics: Arc<GatewayMetrics>,
}

impl SessionMgr {
    pub fn new(policy: AdmissionPolicy, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            policy,
            metrics,
        }
    }

    fn check(&self, registry: &Registry, ip: &str) -> Result<()> {
        if self.policy.blocked_ips.contains(ip) {
            return Err(GatewayError::Blocked(format!("ip {}", ip)));
        }
        if self.policy.max_sessions > 0 && registry.sessions.len() >= self.policy.max_sessions {
            return Err(GatewayError::TooManySessions {
                limit: self.policy.max_sessions,
            });
        }
        if self.policy.max_sessions_per_ip > 0 && !self.policy.allowed_ips.contains(ip) {
            let count = registry.per_ip.get(ip).copied().unwrap_or(0);
            if count >= self.policy.max_sessions_per_ip {
                return Err(GatewayError::TooManySessionsPerIp {
                    ip: ip.to_string(),
                    limit: self.policy.max_sessions_per_ip,
                });
            }
        }
        Ok(())
    }

    /// 握手前的预检，不占用名额
    pub fn admit(&self, ip: &str) -> Result<()> {
        let registry = self.registry.read();
        self.check(&registry, ip)
    }

    /// 检查准入并登记会话
    pub fn register(&self, session: Arc<Session>) -> Result<()> {
        let ip = session.client().ip().to_string();
        let mut registry = self.registry.write();
        if let Err(e) = self.check(&registry, &ip) {
            warn!(session_id = %session.id(), ip = %ip, error = %e, "session rejected");
            return Err(e);
        }
        if registry
            .sessions
            .insert(session.id().to_string(), session)
            .is_none()
        {
            *registry.per_ip.entry(ip).or_insert(0) += 1;
        }
        self.metrics.sessions.set(registry.sessions.len() as i64);
        Ok(())
    }

    pub fn unregister(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut registry = self.registry.write();
        let session = registry.sessions.remove(session_id)?;
        let ip = session.client().ip();
        if let Some(count) = registry.per_ip.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                registry.per_ip.remove(ip);
            }
        }
        self.metrics.sessions.set(registry.sessions.len() as i64);
        Some(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry.read().sessions.get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_by_ip(&self, ip: &str) -> usize {
        self.registry.read().per_ip.get(ip).copied().unwrap_or(0)
    }

    /// 当前会话快照，遍历时不持锁
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.registry.read().sessions.values().cloned().collect()
    }

    /// 对所有会话做超时检查，返回踢出数量
    pub fn tick_all(&self, now_ms: i64) -> usize {
        self.snapshot()
            .iter()
            .filter(|session| session.tick(now_ms))
            .count()
    }

    pub fn stop_all(&self, reason: &'static str) {
        let sessions = self.snapshot();
        info!(count = sessions.len(), reason, "stopping all sessions");
        for session in sessions {
            session.stop(reason);
        }
    }
}
