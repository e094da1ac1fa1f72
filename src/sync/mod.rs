//! 调度器感知的同步原语
//!
//! 每个原语在阻塞前查询当前执行上下文：协程挂起自己并让出载体线程，
//! 原生线程阻塞操作系统线程。两条路径对外的返回约定完全相同。
//!
//! 所有原语内部状态都由各自私有的短临界区锁保护，原语之间不存在锁顺序依赖。

pub mod condvar;
pub mod mutex;
pub mod recursive_mutex;
pub mod shared_mutex;

pub use condvar::{ConditionVariable, WaitTimeoutResult};
pub use mutex::{Mutex, MutexGuard, RawMutex, TimedMutex};
pub use recursive_mutex::{RecursiveMutex, RecursiveMutexGuard, RecursiveTimedMutex};
pub use shared_mutex::{
    RawSharedMutex, SharedMutex, SharedMutexReadGuard, SharedMutexWriteGuard, SharedTimedMutex,
};
