//! 单连接身份与订阅状态

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use push_gateway_core::{GatewayError, Result};

use crate::domain::model::TopicSet;

/// 握手时采集的连接元数据
#[derive(Debug, Clone, Default)]
pub struct ConnMeta {
    pub ip: String,
    pub path: String,
    pub host: String,
    pub referer: String,
    pub broker_id: String,
    pub params: HashMap<String, String>,
}

impl ConnMeta {
    pub fn with_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Self::default()
        }
    }
}

/// 连接内的客户端状态
///
/// 订阅集合写时复制：修改在 `topics_lock` 下构建新集合后整体替换，
/// 读方无锁且不会看到半更新的集合。
pub struct Client {
    /// 0 表示未认证
    member_id: AtomicI64,
    api_key: RwLock<Option<String>>,
    topics: ArcSwap<TopicSet>,
    topics_lock: Mutex<()>,
    meta: ConnMeta,
}

impl Client {
    pub fn new(meta: ConnMeta) -> Self {
        Self {
            member_id: AtomicI64::new(0),
            api_key: RwLock::new(None),
            topics: ArcSwap::from_pointee(TopicSet::new()),
            topics_lock: Mutex::new(()),
            meta,
        }
    }

    pub fn member_id(&self) -> i64 {
        self.member_id.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.member_id() != 0
    }

    /// 设置登录身份，已登录为其他用户时拒绝
    pub fn set_member(&self, uid: i64, api_key: Option<String>) -> Result<()> {
        if uid == 0 {
            return Err(GatewayError::InvalidArgument("uid must not be 0".to_string()));
        }
        match self
            .member_id
            .compare_exchange(0, uid, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(current) if current == uid => {}
            Err(current) => {
                return Err(GatewayError::Unauthorized(format!(
                    "already authenticated as {}",
                    current
                )));
            }
        }
        if api_key.is_some() {
            *self.api_key.write() = api_key;
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key.read().clone()
    }

    pub fn topics(&self) -> Arc<TopicSet> {
        self.topics.load_full()
    }

    /// 返回实际新增的 topic
    pub fn subscribe<S: AsRef<str>>(&self, topics: &[S]) -> Vec<String> {
        let _guard = self.topics_lock.lock();
        let (next, added) = self.topics.load().add(topics);
        if !added.is_empty() {
            self.topics.store(Arc::new(next));
        }
        added
    }

    /// 返回实际移除的 topic
    pub fn unsubscribe<S: AsRef<str>>(&self, topics: &[S]) -> Vec<String> {
        let _guard = self.topics_lock.lock();
        let (next, removed) = self.topics.load().remove(topics);
        if !removed.is_empty() {
            self.topics.store(Arc::new(next));
        }
        removed
    }

    pub fn meta(&self) -> &ConnMeta {
        &self.meta
    }

    pub fn ip(&self) -> &str {
        &self.meta.ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_cannot_switch() {
        let client = Client::new(ConnMeta::with_ip("127.0.0.1"));
        assert!(!client.is_authenticated());
        client.set_member(42, Some("key".into())).unwrap();
        client.set_member(42, None).unwrap();
        assert!(client.set_member(43, None).is_err());
        assert_eq!(client.member_id(), 42);
        assert_eq!(client.api_key().as_deref(), Some("key"));
    }

    #[test]
    fn test_subscribe_copy_on_write() {
        let client = Client::new(ConnMeta::default());
        let before = client.topics();
        assert_eq!(client.subscribe(&["a", "b"]).len(), 2);
        assert!(before.is_empty());
        assert_eq!(client.unsubscribe(&["a", "zz"]), vec!["a".to_string()]);
        assert_eq!(client.topics().to_vec(), vec!["b".to_string()]);
    }
}
