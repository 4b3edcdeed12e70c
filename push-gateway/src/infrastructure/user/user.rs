//! # 用户聚合
//!
//! 一个 uid 下的全部连接。连接列表写时复制，读方无锁；
//! `deleted` 只会从 false 变为 true 一次，用于识别"删除后立即重新绑定"的竞态。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use push_gateway_core::{GatewayError, Result, current_nanos};

use crate::domain::model::{TopicSet, UserSnapshot};
use crate::infrastructure::session::Session;

pub struct User {
    uid: i64,
    created_at_nanos: i64,
    sessions: ArcSwap<Vec<Arc<Session>>>,
    lock: Mutex<()>,
    version: AtomicU64,
    topics: ArcSwap<TopicSet>,
    deleted: AtomicBool,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("uid", &self.uid)
            .field("sessions", &self.session_count())
            .field("version", &self.version())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

impl User {
    pub fn new(uid: i64) -> Self {
        Self {
            uid,
            created_at_nanos: current_nanos(),
            sessions: ArcSwap::from_pointee(Vec::new()),
            lock: Mutex::new(()),
            version: AtomicU64::new(0),
            topics: ArcSwap::from_pointee(TopicSet::new()),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn created_at_nanos(&self) -> i64 {
        self.created_at_nanos
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn sessions(&self) -> Arc<Vec<Arc<Session>>> {
        self.sessions.load_full()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load().len()
    }

    /// 最近一次 `build` 得到的合并订阅
    pub fn topics(&self) -> Arc<TopicSet> {
        self.topics.load_full()
    }

    /// 加入连接
    ///
    /// 用户已删除时返回 `UserDeleted`，调用方应丢弃该实例后重试；
    /// `limit` 为 0 或 `exempt` 时不检查单用户连接数。
    pub fn add(&self, session: Arc<Session>, limit: usize, exempt: bool) -> Result<()> {
        let _guard = self.lock.lock();
        if self.is_deleted() {
            return Err(GatewayError::UserDeleted(self.uid));
        }

        let current = self.sessions.load();
        if current.iter().any(|s| s.id() == session.id()) {
            return Ok(());
        }
        if limit > 0 && !exempt && current.len() >= limit {
            return Err(GatewayError::TooManySessionsPerUser {
                uid: self.uid,
                limit,
            });
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(session);
        self.sessions.store(Arc::new(next));
        Ok(())
    }

    /// 移除连接，返回 (是否移除, 是否已空)
    ///
    /// 列表变空时标记删除。
    pub fn remove(&self, session_id: &str) -> (bool, bool) {
        let _guard = self.lock.lock();
        let current = self.sessions.load();
        let next: Vec<Arc<Session>> = current
            .iter()
            .filter(|s| s.id() != session_id)
            .cloned()
            .collect();
        let removed = next.len() != current.len();
        let empty = next.is_empty();
        if removed {
            self.sessions.store(Arc::new(next));
        }
        if empty {
            self.deleted.store(true, Ordering::Release);
        }
        (removed, empty)
    }

    /// 重新计算合并订阅并递增版本
    pub fn build(&self) -> UserSnapshot {
        let _guard = self.lock.lock();
        let sessions = self.sessions.load_full();

        let mut topics = TopicSet::new();
        let mut params = BTreeMap::new();
        let mut briefs = Vec::with_capacity(sessions.len());
        for session in sessions.iter() {
            topics = topics.merge(&session.client().topics());
            for (k, v) in &session.client().meta().params {
                params.insert(k.clone(), v.clone());
            }
            briefs.push(session.brief());
        }

        let old = self.topics.swap(Arc::new(topics.clone()));
        let merged_topics = old.merge(&topics);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

        UserSnapshot {
            uid: self.uid,
            version,
            created_at_nanos: self.created_at_nanos,
            topics,
            merged_topics,
            sessions: briefs,
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::session::{ConnMeta, SessionOptions};
    use push_gateway_core::GatewayMetrics;

    fn session() -> Arc<Session> {
        Session::new(
            ConnMeta::with_ip("127.0.0.1"),
            SessionOptions::default(),
            Arc::new(GatewayMetrics::new()),
        )
    }

    #[test]
    fn test_add_is_idempotent_and_limited() {
        let user = User::new(1);
        let s1 = session();
        user.add(Arc::clone(&s1), 1, false).unwrap();
        user.add(Arc::clone(&s1), 1, false).unwrap();
        assert_eq!(user.session_count(), 1);

        let err = user.add(session(), 1, false).unwrap_err();
        assert!(matches!(err, GatewayError::TooManySessionsPerUser { uid: 1, limit: 1 }));
        user.add(session(), 1, true).unwrap();
        assert_eq!(user.session_count(), 2);
    }

    #[test]
    fn test_remove_last_marks_deleted() {
        let user = User::new(2);
        let s1 = session();
        user.add(Arc::clone(&s1), 0, false).unwrap();
        assert_eq!(user.remove("missing"), (false, false));
        assert_eq!(user.remove(s1.id()), (true, true));
        assert!(user.is_deleted());
        assert!(matches!(
            user.add(session(), 0, false),
            Err(GatewayError::UserDeleted(2))
        ));
    }

    #[test]
    fn test_build_versions_and_params() {
        let user = User::new(3);
        let mut meta = ConnMeta::with_ip("1.2.3.4");
        meta.params.insert("lang".into(), "en".into());
        let s1 = Session::new(meta, SessionOptions::default(), Arc::new(GatewayMetrics::new()));
        s1.client().subscribe(&["orders"]);
        user.add(s1, 0, false).unwrap();

        let first = user.build();
        assert_eq!(first.version, 1);
        assert_eq!(first.params.get("lang").map(String::as_str), Some("en"));
        assert!(first.topics.contains("orders"));

        let second = user.build();
        assert_eq!(second.version, 2);
        assert_eq!(second.sessions.len(), 1);
    }
}
