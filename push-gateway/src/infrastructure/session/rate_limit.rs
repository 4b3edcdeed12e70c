//! # 命令限流
//!
//! 固定窗口计数桶：每个周期开始时令牌补满，周期内最多放行 `limit` 条命令。

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 令牌桶状态
struct Bucket {
    /// 当前窗口剩余令牌
    tokens: u32,
    /// 当前窗口开始时间
    window_start: Instant,
}

/// 单连接命令限流器
pub struct CommandLimiter {
    /// 每周期令牌数，0 表示不限流
    limit: u32,
    period: Duration,
    bucket: Mutex<Bucket>,
}

impl CommandLimiter {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period: period.max(Duration::from_millis(1)),
            bucket: Mutex::new(Bucket {
                tokens: limit,
                window_start: Instant::now(),
            }),
        }
    }

    /// 尝试消费一个令牌
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }

        let mut bucket = self.bucket.lock();
        if now.saturating_duration_since(bucket.window_start) >= self.period {
            bucket.tokens = self.limit;
            bucket.window_start = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_reset() {
        let limiter = CommandLimiter::new(2, Duration::from_millis(100));
        let start = Instant::now();
        assert!(limiter.allow_at(start));
        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(start + Duration::from_millis(50)));
        assert!(limiter.allow_at(start + Duration::from_millis(150)));
    }

    #[test]
    fn test_unlimited() {
        let limiter = CommandLimiter::new(0, Duration::from_secs(1));
        for _ in 0..1000 {
            assert!(limiter.allow());
        }
    }
}
