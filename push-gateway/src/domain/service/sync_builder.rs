//! 按 acceptor 构造同步条目
//!
//! 每个 acceptor 有自己的分片与 topic 过滤条件，同一事件对不同 acceptor
//! 产出的内容不同。

use std::sync::Arc;

use crate::domain::model::{Action, TopicSet, UserSnapshot, sorted_intersects};

use super::shard::{GrayList, check_user_shard};

/// acceptor 的过滤视图
#[derive(Debug, Clone)]
pub struct AcceptorFilter {
    pub shard_index: i32,
    pub shard_total: i32,
    pub focus: u32,
    pub topics: Arc<TopicSet>,
}

/// 发往单个 acceptor 的用户条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub uid: i64,
    pub snapshot: Option<UserSnapshot>,
    pub actions: Vec<Action>,
}

/// 一个用户待同步的原始材料
#[derive(Debug, Clone)]
pub struct SyncSource {
    pub snapshot: UserSnapshot,
    pub actions: Vec<Action>,
    /// 忽略 topic 交集，无条件附带快照
    pub force: bool,
}

impl SyncSource {
    pub fn new(snapshot: UserSnapshot) -> Self {
        Self {
            snapshot,
            actions: Vec::new(),
            force: false,
        }
    }

    pub fn forced(snapshot: UserSnapshot) -> Self {
        Self {
            snapshot,
            actions: Vec::new(),
            force: true,
        }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }
}

/// 动作是否为该 acceptor 关注
pub fn action_selected(filter: &AcceptorFilter, action: &Action) -> bool {
    if filter.focus & action.kind.bit() == 0 {
        return false;
    }
    action.topics.is_empty() || sorted_intersects(filter.topics.as_slice(), &action.topics)
}

/// 过滤出发往该 acceptor 的条目，无内容时返回 None
pub fn filter_entry(filter: &AcceptorFilter, gray: &GrayList, source: &SyncSource) -> Option<SyncEntry> {
    let uid = source.snapshot.uid;
    if !check_user_shard(filter.shard_index, filter.shard_total, uid, gray) {
        return None;
    }

    let actions: Vec<Action> = source
        .actions
        .iter()
        .filter(|a| action_selected(filter, a))
        .cloned()
        .collect();

    let snapshot = if source.force || filter.topics.intersects(&source.snapshot.merged_topics) {
        Some(source.snapshot.clone())
    } else {
        None
    };

    if snapshot.is_none() && actions.is_empty() {
        return None;
    }

    Some(SyncEntry {
        uid,
        snapshot,
        actions,
    })
}

/// 按条数切分，空输入返回空
pub fn split_batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ActionKind;

    fn snapshot(uid: i64, topics: &[&str]) -> UserSnapshot {
        let set: TopicSet = topics.iter().copied().collect();
        UserSnapshot {
            topics: set.clone(),
            merged_topics: set,
            ..UserSnapshot::absent(uid)
        }
    }

    fn filter(index: i32, total: i32, focus: u32, topics: &[&str]) -> AcceptorFilter {
        AcceptorFilter {
            shard_index: index,
            shard_total: total,
            focus,
            topics: Arc::new(topics.iter().copied().collect()),
        }
    }

    #[test]
    fn test_shard_mismatch_yields_nothing() {
        let f = filter(1, 2, ActionKind::all_mask(), &["t1"]);
        let src = SyncSource::forced(snapshot(2, &["t1"]));
        assert!(filter_entry(&f, &GrayList::default(), &src).is_none());

        let src = SyncSource::forced(snapshot(3, &["t1"]));
        assert!(filter_entry(&f, &GrayList::default(), &src).is_some());
    }

    #[test]
    fn test_snapshot_requires_topic_intersection() {
        let f = filter(-1, 0, 0, &["orders"]);
        let src = SyncSource::new(snapshot(1, &["positions"]));
        assert!(filter_entry(&f, &GrayList::default(), &src).is_none());

        let src = SyncSource::new(snapshot(1, &["orders", "positions"]));
        let entry = filter_entry(&f, &GrayList::default(), &src).unwrap();
        assert!(entry.snapshot.is_some());
        assert!(entry.actions.is_empty());
    }

    #[test]
    fn test_action_focus_and_topics() {
        let f = filter(-1, 0, ActionKind::Subscribe.bit(), &["orders"]);
        let sub = Action::new(ActionKind::Subscribe, 1, "s1", vec!["orders".into()]);
        let other = Action::new(ActionKind::Subscribe, 1, "s1", vec!["wallet".into()]);
        let online = Action::new(ActionKind::SessionOnline, 1, "s1", vec![]);

        assert!(action_selected(&f, &sub));
        assert!(!action_selected(&f, &other));
        assert!(!action_selected(&f, &online));

        let f = filter(-1, 0, ActionKind::SessionOnline.bit(), &[]);
        assert!(action_selected(&f, &online));
    }

    #[test]
    fn test_split_batches() {
        let batches = split_batches((0..5).collect(), 2);
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert!(split_batches(Vec::<i32>::new(), 3).is_empty());
    }
}
