//! # Acceptor 注册表
//!
//! 三组索引（id / 应用 / topic）整体写时复制。推送热路径只读取当前发布的
//! 快照，不会与后端 I/O 争用锁。

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;

use push_gateway_core::GatewayMetrics;

use super::acceptor::Acceptor;

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<Acceptor>>,
    by_app: HashMap<String, Vec<Arc<Acceptor>>>,
    by_topic: HashMap<String, Vec<Arc<Acceptor>>>,
    all: Arc<Vec<Arc<Acceptor>>>,
}

impl Indices {
    fn build(acceptors: Vec<Arc<Acceptor>>) -> Self {
        let mut by_id = HashMap::with_capacity(acceptors.len());
        let mut by_app: HashMap<String, Vec<Arc<Acceptor>>> = HashMap::new();
        let mut by_topic: HashMap<String, Vec<Arc<Acceptor>>> = HashMap::new();

        for acceptor in &acceptors {
            by_id.insert(acceptor.id().to_string(), Arc::clone(acceptor));
            by_app
                .entry(acceptor.app_id().to_string())
                .or_default()
                .push(Arc::clone(acceptor));
            for topic in acceptor.all_topics().iter() {
                by_topic
                    .entry(topic.clone())
                    .or_default()
                    .push(Arc::clone(acceptor));
            }
        }

        Self {
            by_id,
            by_app,
            by_topic,
            all: Arc::new(acceptors),
        }
    }
}

pub struct AcceptorMgr {
    indices: ArcSwap<Indices>,
    lock: Mutex<()>,
    metrics: Arc<GatewayMetrics>,
}

impl AcceptorMgr {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            indices: ArcSwap::from_pointee(Indices::default()),
            lock: Mutex::new(()),
            metrics,
        }
    }

    fn publish(&self, acceptors: Vec<Arc<Acceptor>>) {
        self.metrics.acceptors.set(acceptors.len() as i64);
        self.indices.store(Arc::new(Indices::build(acceptors)));
    }

    /// 登记 acceptor，同 id 的旧实例被替换并返回，由调用方关闭
    pub fn add(&self, acceptor: Arc<Acceptor>) -> Option<Arc<Acceptor>> {
        let _guard = self.lock.lock();
        let current = self.indices.load();
        let old = current.by_id.get(acceptor.id()).cloned();

        let mut next: Vec<Arc<Acceptor>> = current
            .all
            .iter()
            .filter(|a| a.id() != acceptor.id())
            .cloned()
            .collect();
        next.push(acceptor);
        self.publish(next);
        old
    }

    /// 仅当注册表中仍是同一实例时移除
    pub fn remove(&self, acceptor: &Arc<Acceptor>) -> bool {
        let _guard = self.lock.lock();
        let current = self.indices.load();
        match current.by_id.get(acceptor.id()) {
            Some(existing) if Arc::ptr_eq(existing, acceptor) => {}
            _ => return false,
        }

        let next: Vec<Arc<Acceptor>> = current
            .all
            .iter()
            .filter(|a| !Arc::ptr_eq(a, acceptor))
            .cloned()
            .collect();
        self.publish(next);
        info!(acceptor_id = %acceptor.id(), "acceptor unregistered");
        true
    }

    /// topic 配置变化后重建索引
    pub fn reindex(&self) {
        let _guard = self.lock.lock();
        let current = self.indices.load();
        self.publish(current.all.iter().cloned().collect());
    }

    pub fn get(&self, id: &str) -> Option<Arc<Acceptor>> {
        self.indices.load().by_id.get(id).cloned()
    }

    pub fn by_app(&self, app_id: &str) -> Vec<Arc<Acceptor>> {
        self.indices
            .load()
            .by_app
            .get(app_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn by_topic(&self, topic: &str) -> Vec<Arc<Acceptor>> {
        self.indices
            .load()
            .by_topic
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all(&self) -> Arc<Vec<Arc<Acceptor>>> {
        Arc::clone(&self.indices.load().all)
    }

    /// 指定 id 时只返回该 acceptor，否则返回全部
    pub fn targets(&self, id: Option<&str>) -> Vec<Arc<Acceptor>> {
        match id {
            Some(id) => self.get(id).into_iter().collect(),
            None => self.all().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.indices.load().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 关闭并移除所有 acceptor
    pub fn close_all(&self) {
        let _guard = self.lock.lock();
        let current = self.indices.load();
        for acceptor in current.all.iter() {
            acceptor.close();
        }
        self.publish(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::TopicConf;
    use crate::infrastructure::acceptor::{AcceptorOptions, AcceptorRegistration};

    fn acceptor(id: &str, app: &str, topics: &[&str]) -> Arc<Acceptor> {
        let (acc, _rx) = Acceptor::new(
            AcceptorRegistration::new(id, app)
                .with_topics(topics.iter().map(|t| TopicConf::private(*t)).collect()),
            AcceptorOptions::default(),
            Arc::new(GatewayMetrics::new()),
        );
        acc
    }

    #[test]
    fn test_indices() {
        let mgr = AcceptorMgr::new(Arc::new(GatewayMetrics::new()));
        mgr.add(acceptor("a1", "orders", &["orders", "fills"]));
        mgr.add(acceptor("a2", "orders", &["orders"]));
        mgr.add(acceptor("b1", "wallet", &["wallet"]));

        assert_eq!(mgr.len(), 3);
        assert_eq!(mgr.by_app("orders").len(), 2);
        assert_eq!(mgr.by_topic("orders").len(), 2);
        assert_eq!(mgr.by_topic("fills").len(), 1);
        assert!(mgr.by_topic("none").is_empty());
        assert_eq!(mgr.targets(Some("b1")).len(), 1);
        assert_eq!(mgr.targets(None).len(), 3);
    }

    #[test]
    fn test_replace_same_id() {
        let mgr = AcceptorMgr::new(Arc::new(GatewayMetrics::new()));
        let first = acceptor("a1", "orders", &["orders"]);
        assert!(mgr.add(Arc::clone(&first)).is_none());

        let second = acceptor("a1", "orders", &["orders"]);
        let old = mgr.add(Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&old, &first));
        assert_eq!(mgr.len(), 1);

        // 旧实例的迟到移除不影响新实例
        assert!(!mgr.remove(&first));
        assert!(Arc::ptr_eq(&mgr.get("a1").unwrap(), &second));
        assert!(mgr.remove(&second));
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_snapshot_survives_mutation() {
        let mgr = AcceptorMgr::new(Arc::new(GatewayMetrics::new()));
        mgr.add(acceptor("a1", "orders", &["orders"]));
        let snapshot = mgr.all();
        mgr.add(acceptor("a2", "orders", &["orders"]));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(mgr.all().len(), 2);
    }
}
