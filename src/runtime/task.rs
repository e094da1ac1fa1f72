//! 协程 (Task) 结构
//!
//! Task 是调度的基本单位：一个运行在独立栈上的闭包，
//! 可以在任意阻塞点挂起并在任意工作线程上恢复。

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;

use super::context;
use super::park::{WaitNode, WaitStatus};
use super::scheduler::Shared;
use super::stack::StackSize;
use super::TaskId;
use crate::error::{Error, JoinError};
use crate::sync::{ConditionVariable, Mutex as TaskMutex};

/// 协程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// 可运行，等待被调度
    Runnable = 0,
    /// 正在某个工作线程上运行
    Running = 1,
    /// 已挂起，等待唤醒
    Suspended = 2,
    /// 运行中收到唤醒，切出后立即重新入队
    Notified = 3,
    /// 已结束
    Dead = 4,
}

impl From<u8> for TaskStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => TaskStatus::Runnable,
            1 => TaskStatus::Running,
            2 => TaskStatus::Suspended,
            3 => TaskStatus::Notified,
            _ => TaskStatus::Dead,
        }
    }
}

/// 协程切出时交给工作线程的请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    /// 主动让出，重新入队
    Yield,
    /// 等待唤醒
    Park,
}

type TaskYielder = Yielder<(), Suspend>;
type TaskCoroutine = Coroutine<(), Suspend, (), DefaultStack>;

/// 协程体
pub(crate) type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// 协程栈槽
///
/// 同一时刻只有一个工作线程持有槽锁并 resume 协程。
struct CoroutineSlot(Option<TaskCoroutine>);

// 协程体要求 Send；切换线程时协程内部不持有线程亲和的状态
unsafe impl Send for CoroutineSlot {}

impl Drop for CoroutineSlot {
    fn drop(&mut self) {
        if let Some(co) = self.0.take() {
            if co.started() && !co.done() {
                // 挂起中的栈无法安全展开，直接泄漏
                log::warn!("leaking the stack of a task suspended at shutdown");
                std::mem::forget(co);
            }
        }
    }
}

/// 协程
pub struct Task {
    /// 协程唯一 ID
    pub id: TaskId,
    /// 协程状态（原子操作）
    status: AtomicU8,
    /// 协程栈与执行体
    coroutine: Mutex<CoroutineSlot>,
    /// 当前协程栈上的 Yielder，首次运行时写入
    yielder: AtomicPtr<TaskYielder>,
    /// 停止标记
    stopped: AtomicBool,
    /// 可被停止请求打断的等待
    waiting_on: Mutex<Option<Arc<WaitNode>>>,
    /// 所属调度器
    scheduler: Option<Arc<Shared>>,
    /// 调度计数
    schedule_count: AtomicU64,
}

impl Task {
    /// 创建新的协程
    pub(crate) fn new(
        id: TaskId,
        body: TaskBody,
        stack_size: StackSize,
        scheduler: Arc<Shared>,
    ) -> Result<Self, Error> {
        let stack = stack_size.allocate()?;
        let coroutine = TaskCoroutine::with_stack(stack, move |yielder: &TaskYielder, ()| {
            if let Some(task) = context::current_task() {
                task.yielder
                    .store(yielder as *const TaskYielder as *mut TaskYielder, Ordering::Release);
            }
            body();
        });

        Ok(Self {
            id,
            status: AtomicU8::new(TaskStatus::Runnable as u8),
            coroutine: Mutex::new(CoroutineSlot(Some(coroutine))),
            yielder: AtomicPtr::new(ptr::null_mut()),
            stopped: AtomicBool::new(false),
            waiting_on: Mutex::new(None),
            scheduler: Some(scheduler),
            schedule_count: AtomicU64::new(0),
        })
    }

    /// 创建不可运行的空协程（仅测试队列使用）
    #[cfg(test)]
    pub(crate) fn detached_for_test(id: TaskId) -> Self {
        Self {
            id,
            status: AtomicU8::new(TaskStatus::Runnable as u8),
            coroutine: Mutex::new(CoroutineSlot(None)),
            yielder: AtomicPtr::new(ptr::null_mut()),
            stopped: AtomicBool::new(false),
            waiting_on: Mutex::new(None),
            scheduler: None,
            schedule_count: AtomicU64::new(0),
        }
    }

    /// 获取协程状态
    #[inline]
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置协程状态
    #[inline]
    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 尝试将状态从 expected 改为 new
    #[inline]
    pub(crate) fn cas_status(&self, expected: TaskStatus, new: TaskStatus) -> bool {
        self.status
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 检查是否已结束
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.status() == TaskStatus::Dead
    }

    /// 是否收到停止请求
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// 请求停止
    ///
    /// 正在可取消等待中的协程会被立即唤醒。
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let node = self.waiting_on.lock().clone();
        if let Some(node) = node {
            node.fire(WaitStatus::Stopped);
        }
    }

    /// 登记/清除可取消的等待
    pub(crate) fn set_waiting_on(&self, node: Option<Arc<WaitNode>>) {
        *self.waiting_on.lock() = node;
    }

    /// 增加调度计数
    #[inline]
    pub(crate) fn inc_schedule_count(&self) {
        self.schedule_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取调度计数
    #[inline]
    pub fn schedule_count(&self) -> u64 {
        self.schedule_count.load(Ordering::Relaxed)
    }

    /// 所属调度器
    pub(crate) fn scheduler(&self) -> Option<&Arc<Shared>> {
        self.scheduler.as_ref()
    }

    /// 在当前线程上运行协程直到它切出或结束
    ///
    /// 返回 `None` 表示协程已执行完毕，栈随之释放。
    pub(crate) fn resume(&self) -> Option<Suspend> {
        let mut slot = self.coroutine.lock();
        let co = slot.0.as_mut()?;
        match co.resume(()) {
            CoroutineResult::Yield(request) => Some(request),
            CoroutineResult::Return(()) => {
                slot.0 = None;
                None
            }
        }
    }

    /// 从协程内部切出到工作线程
    ///
    /// 只能由正在运行该协程的代码调用。
    pub(crate) fn suspend(&self, request: Suspend) {
        let yielder = self.yielder.load(Ordering::Acquire);
        assert!(!yielder.is_null(), "task {} suspended outside its own stack", self.id);
        // yielder 位于本协程栈上，协程存活期间有效
        unsafe { (*yielder).suspend(request) }
    }

    /// 唤醒协程（进入可运行状态）
    ///
    /// 若协程仍在运行（刚登记等待、尚未切出），标记为 Notified，
    /// 由工作线程在它切出后立即重新入队。
    pub(crate) fn unpark(self: &Arc<Self>) {
        loop {
            match self.status() {
                TaskStatus::Suspended => {
                    if self.cas_status(TaskStatus::Suspended, TaskStatus::Runnable) {
                        if let Some(scheduler) = &self.scheduler {
                            scheduler.schedule(Arc::clone(self));
                        }
                        return;
                    }
                }
                TaskStatus::Running => {
                    if self.cas_status(TaskStatus::Running, TaskStatus::Notified) {
                        return;
                    }
                }
                TaskStatus::Runnable | TaskStatus::Notified | TaskStatus::Dead => return,
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// 协程结果槽
pub(crate) struct JoinState<T> {
    result: TaskMutex<Option<Result<T, JoinError>>>,
    cond: ConditionVariable,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Self {
        Self {
            result: TaskMutex::new(None),
            cond: ConditionVariable::new(),
        }
    }

    fn complete(&self, result: Result<T, JoinError>) {
        *self.result.lock() = Some(result);
        self.cond.notify_all();
    }

    fn is_complete(&self) -> bool {
        self.result.lock().is_some()
    }
}

/// 包装用户闭包：捕获 panic 并写入结果槽
pub(crate) fn wrap_body<F, T>(id: TaskId, f: F, state: Arc<JoinState<T>>) -> TaskBody
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Box::new(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            let err = JoinError::Panicked(panic_message(payload.as_ref()));
            log::error!("task {} {}", id, err);
            err
        });
        state.complete(result);
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// 协程句柄
///
/// 丢弃句柄不会取消协程。
pub struct JoinHandle<T> {
    task: Arc<Task>,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: Arc<Task>, state: Arc<JoinState<T>>) -> Self {
        Self { task, state }
    }

    /// 获取协程 ID
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// 获取协程状态
    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    /// 协程体是否已执行完毕
    pub fn is_finished(&self) -> bool {
        self.state.is_complete()
    }

    /// 请求协程停止
    pub fn stop(&self) {
        self.task.request_stop();
    }

    /// 等待协程结束并取回结果
    ///
    /// 在协程中调用时只挂起调用方协程。
    pub fn join(self) -> Result<T, JoinError> {
        let mut guard = self.state.result.lock();
        self.state.cond.wait_until(&mut guard, |r| r.is_some());
        match guard.take() {
            Some(result) => result,
            None => unreachable!("join woke without a result"),
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}
