//! # 日志初始化模块
//!
//! 基于 `tracing-subscriber` 的 fmt 输出，`RUST_LOG` 优先于配置文件中的级别。
//! 开启 `deadlock-detection` feature 时额外启动 parking_lot 死锁检测线程。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// 从配置初始化日志系统
///
/// # 示例
/// ```rust,ignore
/// use push_gateway_core::config::LoggingConfig;
///
/// init_tracing_from_config(None);
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     ..LoggingConfig::default()
/// };
/// init_tracing_from_config(Some(&config));
/// ```
pub fn init_tracing_from_config(logging_config: Option<&LoggingConfig>) {
    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(config.level.as_str()),
    };

    let builder = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter);

    // 重复初始化（测试中常见）直接忽略
    if config.json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

/// 启动死锁检测线程（仅在 `deadlock-detection` feature 下生效）
///
/// 注册表的粗粒度读写锁使用 parking_lot，检测到环路时输出各线程的回溯。
#[cfg(feature = "deadlock-detection")]
pub fn spawn_deadlock_detector(interval: std::time::Duration) {
    use tracing::error;

    std::thread::Builder::new()
        .name("deadlock-detector".to_string())
        .spawn(move || {
            loop {
                std::thread::sleep(interval);
                let deadlocks = parking_lot::deadlock::check_deadlock();
                if deadlocks.is_empty() {
                    continue;
                }
                error!(cycles = deadlocks.len(), "deadlock detected");
                for (i, threads) in deadlocks.iter().enumerate() {
                    for t in threads {
                        error!(
                            cycle = i,
                            thread_id = ?t.thread_id(),
                            backtrace = ?t.backtrace(),
                            "deadlocked thread"
                        );
                    }
                }
            }
        })
        .map(|_| ())
        .unwrap_or_else(|e| error!(error = %e, "failed to spawn deadlock detector"));
}

/// 未开启 feature 时为空操作
#[cfg(not(feature = "deadlock-detection"))]
pub fn spawn_deadlock_detector(_interval: std::time::Duration) {}
