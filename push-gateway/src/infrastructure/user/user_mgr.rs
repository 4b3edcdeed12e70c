//! # 用户注册表
//!
//! 按 uid 分片的并发映射，绑定/解绑互不阻塞。

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use push_gateway_core::{GatewayError, GatewayMetrics, Result};

use crate::infrastructure::session::Session;

use super::user::User;

/// 绑定遇到删除竞态时的最大尝试次数
pub const BIND_MAX_ATTEMPTS: usize = 3;

pub struct UserMgr {
    users: DashMap<i64, Arc<User>>,
    /// 0 表示不限制
    max_sessions_per_user: usize,
    allowed_uids: HashSet<i64>,
    metrics: Arc<GatewayMetrics>,
}

impl UserMgr {
    pub fn new(
        max_sessions_per_user: usize,
        allowed_uids: HashSet<i64>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            users: DashMap::new(),
            max_sessions_per_user,
            allowed_uids,
            metrics,
        }
    }

    /// 将连接绑定到用户，必要时创建用户
    pub fn bind(&self, uid: i64, session: Arc<Session>) -> Result<Arc<User>> {
        let exempt = self.allowed_uids.contains(&uid);
        for attempt in 1..=BIND_MAX_ATTEMPTS {
            let user = Arc::clone(
                &self
                    .users
                    .entry(uid)
                    .or_insert_with(|| Arc::new(User::new(uid))),
            );

            match user.add(Arc::clone(&session), self.max_sessions_per_user, exempt) {
                Ok(()) => {
                    self.metrics.users.set(self.users.len() as i64);
                    return Ok(user);
                }
                Err(GatewayError::UserDeleted(_)) => {
                    debug!(uid, attempt, "bind raced with user deletion, retrying");
                    self.users.remove_if(&uid, |_, current| Arc::ptr_eq(current, &user));
                }
                Err(e) => return Err(e),
            }
        }

        error!(uid, session_id = %session.id(), "bind retry exhausted");
        Err(GatewayError::BindRetryExhausted {
            uid,
            attempts: BIND_MAX_ATTEMPTS,
        })
    }

    /// 解绑连接，用户变空时从注册表删除；可重复调用
    ///
    /// 返回被操作的用户实例（可能已删除），供后续同步使用。
    pub fn unbind(&self, uid: i64, session_id: &str) -> Option<Arc<User>> {
        let user = self.users.get(&uid).map(|entry| Arc::clone(entry.value()))?;
        let (removed, empty) = user.remove(session_id);
        if empty {
            self.users.remove_if(&uid, |_, current| Arc::ptr_eq(current, &user));
            self.metrics.users.set(self.users.len() as i64);
        }
        if removed { Some(user) } else { None }
    }

    pub fn get(&self, uid: i64) -> Option<Arc<User>> {
        self.users.get(&uid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<User>> {
        self.users
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::session::{ConnMeta, SessionOptions};

    fn session() -> Arc<Session> {
        Session::new(
            ConnMeta::with_ip("127.0.0.1"),
            SessionOptions::default(),
            Arc::new(GatewayMetrics::new()),
        )
    }

    fn mgr(limit: usize) -> UserMgr {
        UserMgr::new(limit, HashSet::new(), Arc::new(GatewayMetrics::new()))
    }

    #[test]
    fn test_bind_unbind_no_leak() {
        let mgr = mgr(0);
        let s1 = session();
        let s2 = session();
        let u1 = mgr.bind(42, Arc::clone(&s1)).unwrap();
        let u2 = mgr.bind(42, Arc::clone(&s2)).unwrap();
        assert!(Arc::ptr_eq(&u1, &u2));
        assert_eq!(u1.session_count(), 2);

        assert!(mgr.unbind(42, s1.id()).is_some());
        assert_eq!(mgr.len(), 1);
        assert!(mgr.unbind(42, s2.id()).is_some());
        assert!(mgr.get(42).is_none());
        assert!(mgr.is_empty());

        // 重复解绑无副作用
        assert!(mgr.unbind(42, s2.id()).is_none());
    }

    #[test]
    fn test_bind_replaces_deleted_user() {
        let mgr = mgr(0);
        let s1 = session();
        let stale = mgr.bind(7, Arc::clone(&s1)).unwrap();
        // 模拟删除标记已置位但条目尚未移除
        stale.remove(s1.id());
        assert!(stale.is_deleted());
        assert!(mgr.get(7).is_some());

        let s2 = session();
        let fresh = mgr.bind(7, Arc::clone(&s2)).unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.session_count(), 1);
        assert!(Arc::ptr_eq(&mgr.get(7).unwrap(), &fresh));
    }

    #[test]
    fn test_per_user_limit() {
        let mgr = mgr(1);
        mgr.bind(9, session()).unwrap();
        let err = mgr.bind(9, session()).unwrap_err();
        assert!(err.is_capacity());
        let user = format!("{:?}", mgr.get(9).unwrap());
        assert!(user.contains("uid: 9") && user.contains("sessions: 1"));
    }

    #[test]
    fn test_concurrent_bind_unbind_leaves_no_duplicates() {
        let mgr = Arc::new(mgr(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let s = session();
                        match mgr.bind(1, Arc::clone(&s)) {
                            Ok(user) => assert!(!user.sessions().is_empty()),
                            Err(e) => assert!(matches!(e, GatewayError::BindRetryExhausted { .. })),
                        }
                        mgr.unbind(1, s.id());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(mgr.get(1).is_none());
    }
}
