//! 用户分片与后端注册校验

use std::collections::HashSet;
use std::sync::Arc;

use push_gateway_core::{GatewayError, Result};

/// 灰度用户名单，只读共享
#[derive(Debug, Clone, Default)]
pub struct GrayList(Arc<HashSet<i64>>);

impl GrayList {
    pub fn new(uids: impl IntoIterator<Item = i64>) -> Self {
        Self(Arc::new(uids.into_iter().collect()))
    }

    pub fn contains(&self, uid: i64) -> bool {
        self.0.contains(&uid)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<i64> {
        let mut uids: Vec<i64> = self.0.iter().copied().collect();
        uids.sort_unstable();
        uids
    }
}

/// 判断用户是否落在 acceptor 的分片内
///
/// - `shard_index < 0` 或 `shard_total <= 0`：不分片，匹配所有用户
/// - `shard_index == shard_total`：灰度分片，只匹配灰度名单
/// - 其他：`uid mod shard_total == shard_index`
///
/// 灰度用户在普通取模分片上同样匹配。
pub fn check_user_shard(shard_index: i32, shard_total: i32, uid: i64, gray: &GrayList) -> bool {
    if shard_index < 0 || shard_total <= 0 {
        return true;
    }
    if shard_index == shard_total {
        return gray.contains(uid);
    }
    uid.rem_euclid(shard_total as i64) == shard_index as i64
}

/// 校验后端注册头
pub fn validate_registration(connector_id: &str, shard_index: i32, shard_total: i32) -> Result<()> {
    if connector_id.trim().is_empty() {
        return Err(GatewayError::InvalidRegister(
            "missing connector id".to_string(),
        ));
    }
    if shard_total > 0 && shard_index != -1 && !(0..=shard_total).contains(&shard_index) {
        return Err(GatewayError::InvalidRegister(format!(
            "shard index {} outside [0, {}]",
            shard_index, shard_total
        )));
    }
    if shard_index < -1 {
        return Err(GatewayError::InvalidRegister(format!(
            "invalid shard index {}",
            shard_index
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_property() {
        let gray = GrayList::default();
        for total in 1..=7 {
            for uid in -20i64..200 {
                let hits = (0..total)
                    .filter(|idx| check_user_shard(*idx, total, uid, &gray))
                    .count();
                assert_eq!(hits, 1, "uid {} total {}", uid, total);
            }
        }
    }

    #[test]
    fn test_no_sharding_and_gray() {
        let gray = GrayList::new([7]);
        assert!(check_user_shard(-1, 4, 123, &gray));
        assert!(check_user_shard(2, 0, 123, &gray));
        assert!(check_user_shard(4, 4, 7, &gray));
        assert!(!check_user_shard(4, 4, 8, &gray));
        // 灰度用户仍落在自己的取模分片
        assert!(check_user_shard(3, 4, 7, &gray));
    }

    #[test]
    fn test_validate_registration() {
        assert!(validate_registration("acc", 1, 2).is_ok());
        assert!(validate_registration("acc", 2, 2).is_ok());
        assert!(validate_registration("acc", -1, 2).is_ok());
        assert!(validate_registration("acc", 0, 0).is_ok());
        assert!(validate_registration("", 0, 2).is_err());
        assert!(validate_registration("acc", 3, 2).is_err());
        assert!(validate_registration("acc", -5, 0).is_err());
    }
}
