//! 有序去重的 topic 集合
//!
//! 客户端订阅与 acceptor 过滤条件共用。集合本身不可变，
//! 修改操作返回新集合，由持有方以原子替换的方式发布。

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSet {
    topics: Vec<String>,
}

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics
            .binary_search_by(|t| t.as_str().cmp(topic))
            .is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.topics.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.topics
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.topics.clone()
    }

    /// 加入若干 topic，返回新集合和实际新增的部分
    pub fn add<S: AsRef<str>>(&self, topics: &[S]) -> (TopicSet, Vec<String>) {
        let mut added: Vec<String> = topics
            .iter()
            .map(|t| t.as_ref())
            .filter(|t| !self.contains(t))
            .map(str::to_string)
            .collect();
        added.sort();
        added.dedup();

        if added.is_empty() {
            return (self.clone(), added);
        }

        let mut next = Vec::with_capacity(self.topics.len() + added.len());
        next.extend(self.topics.iter().cloned());
        next.extend(added.iter().cloned());
        next.sort();
        (TopicSet { topics: next }, added)
    }

    /// 移除若干 topic，返回新集合和实际移除的部分
    pub fn remove<S: AsRef<str>>(&self, topics: &[S]) -> (TopicSet, Vec<String>) {
        let drop = TopicSet::from_iter(topics.iter().map(|t| t.as_ref().to_string()));
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            if drop.contains(topic) {
                removed.push(topic.clone());
            } else {
                kept.push(topic.clone());
            }
        }
        (TopicSet { topics: kept }, removed)
    }

    /// 并集
    pub fn merge(&self, other: &TopicSet) -> TopicSet {
        let (a, b) = (&self.topics, &other.topics);
        let mut out = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => {
                    out.push(a[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(b[j].clone());
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(a[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend(a[i..].iter().cloned());
        out.extend(b[j..].iter().cloned());
        TopicSet { topics: out }
    }

    /// 两个有序集合是否有交集（归并扫描）
    pub fn intersects(&self, other: &TopicSet) -> bool {
        sorted_intersects(&self.topics, &other.topics)
    }

    /// 交集
    pub fn intersection(&self, other: &TopicSet) -> Vec<String> {
        let (a, b) = (&self.topics, &other.topics);
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(a[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        out
    }
}

/// 有序切片交集判断，两侧都必须已排序
pub fn sorted_intersects(a: &[String], b: &[String]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => return true,
        }
    }
    false
}

impl FromIterator<String> for TopicSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut topics: Vec<String> = iter.into_iter().collect();
        topics.sort();
        topics.dedup();
        TopicSet { topics }
    }
}

impl<'a> FromIterator<&'a str> for TopicSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        iter.into_iter().map(str::to_string).collect()
    }
}

impl fmt::Display for TopicSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.topics.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dedups_and_sorts() {
        let set = TopicSet::new();
        let (set, added) = set.add(&["b", "a", "b"]);
        assert_eq!(set.as_slice(), &["a".to_string(), "b".to_string()]);
        assert_eq!(added, vec!["a".to_string(), "b".to_string()]);

        let (set2, added) = set.add(&["a", "c"]);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(set2.len(), 3);
        // 原集合不变
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove_reports_removed() {
        let set: TopicSet = ["x", "y", "z"].into_iter().collect();
        let (next, removed) = set.remove(&["y", "missing"]);
        assert_eq!(removed, vec!["y".to_string()]);
        assert!(!next.contains("y"));
        assert!(next.contains("x"));
    }

    #[test]
    fn test_merge_and_intersect() {
        let a: TopicSet = ["a", "c", "e"].into_iter().collect();
        let b: TopicSet = ["b", "c", "f"].into_iter().collect();
        let merged = a.merge(&b);
        assert_eq!(merged.len(), 5);
        assert!(a.intersects(&b));
        assert_eq!(a.intersection(&b), vec!["c".to_string()]);

        let c: TopicSet = ["d"].into_iter().collect();
        assert!(!a.intersects(&c));
        assert!(!a.intersects(&TopicSet::new()));
    }
}
