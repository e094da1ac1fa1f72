//! 执行上下文
//!
//! 每个阻塞原语在阻塞前都要知道调用者是协程还是原生线程：
//! 协程挂起自己、让出载体线程；原生线程直接阻塞操作系统线程。
//! 这里维护线程本地的“当前协程”指针，由工作线程在切入/切出协程时设置。
//!
//! 协程可能在一个工作线程上挂起、在另一个上恢复，所以访问线程本地变量的
//! 函数都标记为 `#[inline(never)]`，避免编译器跨挂起点缓存 TLS 地址。

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::queue::LocalQueue;
use super::task::Task;
use super::TaskId;

/// 原生线程 ID 计数器（与协程 ID 属于不同空间）
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// 执行上下文标识
///
/// 先比较种类再比较 ID：协程 7 与线程 7 永远不是同一个上下文。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    /// 轻量级协程
    Task(TaskId),
    /// 原生操作系统线程
    NativeThread(u64),
}

impl ExecutionContext {
    /// 是否为协程
    #[inline]
    pub fn is_task(&self) -> bool {
        matches!(self, ExecutionContext::Task(_))
    }
}

/// 工作线程私有状态
pub(crate) struct WorkerContext {
    /// 所属调度器 ID
    pub scheduler_id: u64,
    /// 本地运行队列（仅本线程可 push/pop）
    pub queue: LocalQueue,
}

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
    static WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// 当前执行上下文
#[inline(never)]
pub fn current() -> ExecutionContext {
    match current_task_id() {
        Some(id) => ExecutionContext::Task(id),
        None => ExecutionContext::NativeThread(THREAD_ID.with(|id| *id)),
    }
}

/// 是否运行在协程中
#[inline(never)]
pub fn in_task() -> bool {
    CURRENT_TASK.with(|t| t.borrow().is_some())
}

/// 当前协程 ID
#[inline(never)]
pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.with(|t| t.borrow().as_ref().map(|t| t.id))
}

/// 当前协程
#[inline(never)]
pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|t| t.borrow().clone())
}

/// 设置当前协程（由工作线程在 resume 前后调用）
#[inline(never)]
pub(crate) fn set_current_task(task: Option<Arc<Task>>) {
    CURRENT_TASK.with(|t| *t.borrow_mut() = task);
}

/// 若当前线程是 `scheduler_id` 的工作线程，则把协程推入本地队列
///
/// 返回 `Err(task)` 表示调用方需要改用全局队列。
#[inline(never)]
pub(crate) fn push_local(scheduler_id: u64, task: Arc<Task>) -> Result<(), Arc<Task>> {
    WORKER.with(|w| match w.borrow().as_ref() {
        Some(ctx) if ctx.scheduler_id == scheduler_id => {
            ctx.queue.push(task);
            Ok(())
        }
        _ => Err(task),
    })
}

/// 在当前工作线程的私有状态上执行闭包
#[inline(never)]
pub(crate) fn with_worker<R>(f: impl FnOnce(&WorkerContext) -> R) -> Option<R> {
    WORKER.with(|w| w.borrow().as_ref().map(f))
}

/// 工作线程上下文守卫
///
/// 安装于工作线程启动时，线程退出循环时清理线程本地状态。
pub(crate) struct WorkerGuard {
    _private: (),
}

impl WorkerGuard {
    /// 安装工作线程上下文
    pub fn install(ctx: WorkerContext) -> Self {
        WORKER.with(|w| *w.borrow_mut() = Some(ctx));
        Self { _private: () }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        set_current_task(None);
        // 残留在本地队列中的协程随队列一起释放
        let ctx = WORKER.with(|w| w.borrow_mut().take());
        drop(ctx);
    }
}
