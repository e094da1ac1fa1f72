//! 配置常量模块
//!
//! 运行时与指标相关的可调常量都在这里定义，便于后期修改

use std::time::Duration;

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 协程栈默认大小：256KB
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// 协程栈最小大小：16KB
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// 工作线程名前缀
pub const WORKER_NAME_PREFIX: &str = "qtask-worker";

/// 定时器线程名
pub const TIMER_THREAD_NAME: &str = "qtask-timer";

/// 全局队列批量获取大小
pub const GLOBAL_BATCH_SIZE: usize = 32;

/// 指标滑动窗口默认长度（秒）
pub const DEFAULT_WINDOW_SECS: u64 = 10;

/// 命名服务默认轮询间隔
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);

/// 命名服务默认重试间隔
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// 延迟直方图的桶数量
pub const HISTOGRAM_BUCKETS: usize = 10;
