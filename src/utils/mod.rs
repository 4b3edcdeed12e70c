//! 工具函数模块
//!
//! 时间戳与 ID 生成

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 获取当前时间戳（毫秒）
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 获取当前时间戳（纳秒）
pub fn current_nanos() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| current_millis().saturating_mul(1_000_000))
}

/// 生成全局唯一 ID（ULID，按时间有序）
pub fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

/// 生成连接 ID
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

static SHORT_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内递增的短 ID，用于日志与订阅集合的键
pub fn next_short_id() -> u64 {
    SHORT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_monotonic() {
        let a = next_short_id();
        let b = next_short_id();
        assert!(b > a);
    }

    #[test]
    fn test_ids_unique() {
        assert_ne!(generate_id(), generate_id());
        assert_ne!(generate_session_id(), generate_session_id());
        assert!(current_nanos() > current_millis());
    }
}
