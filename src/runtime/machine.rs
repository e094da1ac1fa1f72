//! 工作线程 (Machine)
//!
//! M - 操作系统线程，循环取出协程并在自己的栈上 resume 它们

use std::sync::atomic::{self, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::context::{self, WorkerContext, WorkerGuard};
use super::processor::ProcessorStatus;
use super::queue::LocalQueue;
use super::scheduler::Shared;
use super::task::{Suspend, Task, TaskStatus};
use crate::error::Error;

/// 工作线程
pub struct Machine {
    /// 线程 ID（同时是所绑定处理器的下标）
    pub id: usize,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 是否正在休眠
    parking: AtomicBool,
    /// 是否应该停止
    should_stop: AtomicBool,
    /// 休眠/唤醒同步
    park_mutex: Mutex<bool>,
    park_cond: Condvar,
    /// 执行过的协程切片数量
    run_count: AtomicU64,
}

impl Machine {
    /// 创建新的工作线程
    pub fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            thread: Mutex::new(None),
            parking: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            park_mutex: Mutex::new(false),
            park_cond: Condvar::new(),
            run_count: AtomicU64::new(0),
        })
    }

    /// 启动工作线程
    pub(crate) fn start(self: &Arc<Self>, shared: Arc<Shared>, queue: LocalQueue) -> Result<(), Error> {
        let machine = Arc::clone(self);
        let name = format!("{}-{}", shared.config().thread_name_prefix, self.id);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || machine.run_loop(&shared, queue))
            .map_err(Error::SpawnThread)?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// 主执行循环
    fn run_loop(&self, shared: &Arc<Shared>, queue: LocalQueue) {
        let _guard = WorkerGuard::install(WorkerContext {
            scheduler_id: shared.id(),
            queue,
        });
        let processor = shared.processor(self.id);
        if let Some(p) = processor {
            p.set_status(ProcessorStatus::Running);
        }
        log::debug!("worker {} started", self.id);

        loop {
            if self.should_stop.load(Ordering::Acquire) {
                break;
            }

            match self.find_work(shared) {
                Some(task) => self.execute(shared, task),
                None => self.park(shared),
            }
        }

        if let Some(p) = processor {
            p.set_status(ProcessorStatus::Stopped);
        }
        log::debug!("worker {} stopped after {} runs", self.id, self.run_count());
    }

    /// 查找可执行的协程
    fn find_work(&self, shared: &Shared) -> Option<Arc<Task>> {
        context::with_worker(|ctx| {
            // 1. 本地队列
            if let Some(task) = ctx.queue.pop() {
                return Some(task);
            }

            // 2. 全局队列（批量搬运）
            if let Some(task) = ctx.queue.refill_from(shared.global_queue(), shared.config().global_batch_size) {
                return Some(task);
            }

            // 3. 从其他处理器窃取
            shared.steal_work(self.id, &ctx.queue)
        })
        .flatten()
    }

    /// 执行协程
    fn execute(&self, shared: &Shared, task: Arc<Task>) {
        task.set_status(TaskStatus::Running);
        task.inc_schedule_count();

        let processor = shared.processor(self.id);
        if let Some(p) = processor {
            p.set_current(Some(task.id));
            p.inc_schedule_count();
        }
        self.run_count.fetch_add(1, Ordering::Relaxed);

        context::set_current_task(Some(Arc::clone(&task)));
        let request = task.resume();
        context::set_current_task(None);

        if let Some(p) = processor {
            p.set_current(None);
        }

        // 根据协程切出原因处理
        match request {
            None => {
                task.set_status(TaskStatus::Dead);
                shared.finish_task(&task);
            }
            Some(Suspend::Yield) => {
                task.set_status(TaskStatus::Runnable);
                shared.schedule_yielded(task);
            }
            Some(Suspend::Park) => {
                // 切出前已被唤醒：状态为 Notified，直接重新入队
                if !task.cas_status(TaskStatus::Running, TaskStatus::Suspended) {
                    task.set_status(TaskStatus::Runnable);
                    shared.schedule(task);
                }
            }
        }
    }

    /// 休眠等待
    ///
    /// 先公开休眠意图再复查队列，与 `Shared::wake_machine` 的
    /// “先入队再看休眠标记”配对，保证不会漏掉唤醒。
    fn park(&self, shared: &Shared) {
        self.parking.store(true, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);

        if shared.has_work() || self.should_stop.load(Ordering::SeqCst) {
            self.parking.store(false, Ordering::SeqCst);
            return;
        }

        let mut guard = self.park_mutex.lock();
        while !*guard && !self.should_stop.load(Ordering::Acquire) {
            self.park_cond.wait(&mut guard);
        }
        *guard = false;
        drop(guard);

        self.parking.store(false, Ordering::SeqCst);
    }

    /// 唤醒线程
    pub fn unpark(&self) {
        let mut guard = self.park_mutex.lock();
        *guard = true;
        self.park_cond.notify_one();
    }

    /// 检查是否正在休眠
    #[inline]
    pub fn is_parking(&self) -> bool {
        self.parking.load(Ordering::SeqCst)
    }

    /// 停止工作线程
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Release);
        self.unpark();
    }

    /// 等待线程结束
    ///
    /// 在该工作线程自身上调用时不等待，线程在当前协程切出后自行退出。
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                log::debug!("worker {} stopping itself", self.id);
                return;
            }
            if handle.join().is_err() {
                log::error!("worker {} panicked", self.id);
            }
        }
    }

    /// 获取执行过的协程切片数量
    #[inline]
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("parking", &self.is_parking())
            .field("run_count", &self.run_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpark_before_park_is_remembered() {
        let m = Machine::new(0);
        m.unpark();
        assert!(*m.park_mutex.lock());
        assert!(!m.is_parking());
    }

    #[test]
    fn test_stop_sets_flag() {
        let m = Machine::new(3);
        m.stop();
        assert!(m.should_stop.load(Ordering::Acquire));
        // 未启动的线程 join 直接返回
        m.join();
    }
}
