//! 挂起与唤醒
//!
//! [`WaitNode`] 是所有阻塞原语共用的等待节点：原语把节点放进自己的等待队列，
//! 然后在节点上等待；唤醒方调用 [`WaitNode::fire`]。
//!
//! - 协程：切出到工作线程，载体线程继续运行其他协程，唤醒时重新入队
//! - 原生线程：在节点自带的条件变量上阻塞
//!
//! 节点状态只能从 `PENDING` 迁移一次，通知、超时、停止三者之间只有一个生效，
//! 因此超时放弃的等待者不会“吞掉”一次移交。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::context;
use super::task::{Suspend, Task};

const PENDING: u8 = 0;
const NOTIFIED: u8 = 1;
const TIMED_OUT: u8 = 2;
const STOPPED: u8 = 3;

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// 被唤醒方通知
    Notified,
    /// 截止时间已到
    TimedOut,
    /// 所在协程收到停止请求
    Stopped,
}

impl WaitStatus {
    fn from_state(state: u8) -> Option<Self> {
        match state {
            NOTIFIED => Some(WaitStatus::Notified),
            TIMED_OUT => Some(WaitStatus::TimedOut),
            STOPPED => Some(WaitStatus::Stopped),
            _ => None,
        }
    }

    fn as_state(self) -> u8 {
        match self {
            WaitStatus::Notified => NOTIFIED,
            WaitStatus::TimedOut => TIMED_OUT,
            WaitStatus::Stopped => STOPPED,
        }
    }
}

/// 原生线程的阻塞点
struct ThreadParker {
    lock: Mutex<()>,
    cond: Condvar,
}

/// 被唤醒的对象
enum WakeTarget {
    Task(Arc<Task>),
    Thread(ThreadParker),
}

/// 等待节点
pub struct WaitNode {
    state: AtomicU8,
    target: WakeTarget,
}

impl WaitNode {
    /// 为当前执行上下文创建等待节点
    pub fn for_current() -> Arc<Self> {
        let target = match context::current_task() {
            Some(task) => WakeTarget::Task(task),
            None => WakeTarget::Thread(ThreadParker {
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        };
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            target,
        })
    }

    /// 等待结果，尚未完成时为 `None`
    #[inline]
    pub fn status(&self) -> Option<WaitStatus> {
        WaitStatus::from_state(self.state.load(Ordering::Acquire))
    }

    /// 是否仍在等待
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// 仅迁移状态，不唤醒
    fn complete(&self, status: WaitStatus) -> bool {
        self.state
            .compare_exchange(PENDING, status.as_state(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 完成等待并唤醒等待者
    ///
    /// 返回 `false` 表示节点已被其他原因完成，本次调用无效。
    pub fn fire(&self, status: WaitStatus) -> bool {
        if !self.complete(status) {
            return false;
        }
        match &self.target {
            WakeTarget::Task(task) => task.unpark(),
            WakeTarget::Thread(parker) => {
                let _guard = parker.lock.lock();
                parker.cond.notify_one();
            }
        }
        true
    }

    /// 在节点上等待，直到被通知、超时，或（可取消时）收到停止请求
    ///
    /// `deadline` 为 `None` 表示不限时。
    pub fn wait(self: &Arc<Self>, deadline: Option<Instant>, interruptible: bool) -> WaitStatus {
        match &self.target {
            WakeTarget::Task(task) => self.wait_task(task, deadline, interruptible),
            WakeTarget::Thread(parker) => self.wait_thread(parker, deadline),
        }
    }

    fn wait_task(self: &Arc<Self>, task: &Arc<Task>, deadline: Option<Instant>, interruptible: bool) -> WaitStatus {
        if interruptible {
            task.set_waiting_on(Some(Arc::clone(self)));
            if task.is_stopped() {
                self.fire(WaitStatus::Stopped);
            }
        }

        let timer = match deadline {
            Some(d) if self.is_pending() => {
                if Instant::now() >= d {
                    self.complete(WaitStatus::TimedOut);
                    None
                } else {
                    task.scheduler()
                        .map(|s| (Arc::clone(s), s.timer().add(d, Arc::clone(self))))
                }
            }
            _ => None,
        };

        while self.is_pending() {
            task.suspend(Suspend::Park);
        }

        if let Some((scheduler, id)) = timer {
            scheduler.timer().cancel(id);
        }
        if interruptible {
            task.set_waiting_on(None);
        }

        self.status().unwrap_or(WaitStatus::Notified)
    }

    fn wait_thread(&self, parker: &ThreadParker, deadline: Option<Instant>) -> WaitStatus {
        let mut guard = parker.lock.lock();
        while self.is_pending() {
            match deadline {
                None => parker.cond.wait(&mut guard),
                Some(deadline) => {
                    if parker.cond.wait_until(&mut guard, deadline).timed_out() {
                        self.complete(WaitStatus::TimedOut);
                    }
                }
            }
        }
        drop(guard);
        self.status().unwrap_or(WaitStatus::Notified)
    }
}

impl std::fmt::Debug for WaitNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitNode")
            .field("status", &self.status())
            .field("task", &matches!(self.target, WakeTarget::Task(_)))
            .finish()
    }
}
