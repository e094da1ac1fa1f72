//! 协程运行时模块
//!
//! 实现 M:N 协程调度系统
//!
//! 核心组件：
//! - G (Task): 协程，包含自己的栈和执行上下文
//! - P (Processor): 逻辑处理器，持有本地运行队列的窃取句柄
//! - M (Machine): 操作系统线程，执行协程
//!
//! 阻塞原语通过 [`context`] 判断调用者类型，通过 [`park`] 挂起或阻塞。

pub mod context;
pub mod group;
pub mod machine;
pub mod park;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod stack;
pub mod task;
pub mod time;
pub mod timer;

pub use context::{current, current_task_id, in_task, ExecutionContext};
pub use group::TaskGroup;
pub use park::{WaitNode, WaitStatus};
pub use scheduler::{default_scheduler, spawn, Scheduler, SchedulerConfig, SchedulerStats};
pub use stack::StackSize;
pub use task::{JoinHandle, TaskStatus};
pub use time::{deadline_after, is_stopped, sleep, yield_now};

/// 协程 ID 类型
pub type TaskId = u64;

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
