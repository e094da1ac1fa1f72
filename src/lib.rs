//! qtask: M:N 协程调度器与调度器感知的同步原语
//!
//! - [`runtime`]: 工作线程池、协程的创建/挂起/唤醒、睡眠与协作式停止
//! - [`sync`]: 互斥锁、条件变量、可重入锁、读写锁，协程与原生线程通用
//! - [`metrics`]: 延迟直方图与记录器
//! - [`naming`]: 命名服务轮询循环
//!
//! ```no_run
//! use std::sync::Arc;
//! use qtask::sync::Mutex;
//!
//! let counter = Arc::new(Mutex::new(0));
//! let handles: Vec<_> = (0..8)
//!     .map(|_| {
//!         let counter = Arc::clone(&counter);
//!         qtask::spawn(move || *counter.lock() += 1).unwrap()
//!     })
//!     .collect();
//! for h in handles {
//!     h.join().unwrap();
//! }
//! assert_eq!(*counter.lock(), 8);
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod runtime;
pub mod sync;

pub use error::{Error, JoinError, Result, Stopped};
pub use metrics::{Histogram, LatencyHistogramRecorder};
pub use runtime::{
    default_scheduler, sleep, spawn, yield_now, ExecutionContext, JoinHandle, Scheduler, SchedulerConfig,
    TaskGroup, TaskId,
};
pub use sync::{
    ConditionVariable, Mutex, RecursiveMutex, RecursiveTimedMutex, SharedMutex, SharedTimedMutex, TimedMutex,
};
