//! 调度器
//!
//! 实现 M:N 调度模型的核心调度逻辑：每个工作线程 (M) 绑定一个处理器 (P)，
//! 协程 (Task) 在本地队列、全局队列之间流转，空闲线程从其他处理器窃取。

use std::sync::atomic::{self, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::context;
use super::machine::Machine;
use super::processor::Processor;
use super::queue::{GlobalQueue, LocalQueue};
use super::stack::StackSize;
use super::task::{self, JoinHandle, JoinState, Task, TaskBody};
use super::timer::TimerThread;
use super::TaskId;
use crate::config::{DEFAULT_STACK_SIZE, GLOBAL_BATCH_SIZE, WORKER_NAME_PREFIX};
use crate::error::Error;

/// 调度器 ID 计数器
static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// 进程级默认调度器
static DEFAULT_SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// 获取（必要时创建）默认调度器
///
/// 创建工作线程失败属于不可恢复的环境错误，直接 panic。
pub fn default_scheduler() -> &'static Scheduler {
    DEFAULT_SCHEDULER.get_or_init(|| match Scheduler::new(SchedulerConfig::default()) {
        Ok(scheduler) => scheduler,
        Err(e) => panic!("failed to start the default scheduler: {}", e),
    })
}

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 工作线程数（默认为 CPU 核心数）
    pub num_workers: usize,
    /// 协程栈大小
    pub stack_size: usize,
    /// 工作线程名前缀
    pub thread_name_prefix: String,
    /// 全局队列批量获取大小
    pub global_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            stack_size: DEFAULT_STACK_SIZE,
            thread_name_prefix: WORKER_NAME_PREFIX.to_string(),
            global_batch_size: GLOBAL_BATCH_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// 设置工作线程数
    pub fn with_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// 设置协程栈大小
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// 设置工作线程名前缀
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// 设置全局队列批量获取大小
    pub fn with_global_batch_size(mut self, n: usize) -> Self {
        self.global_batch_size = n;
        self
    }
}

/// 调度器共享状态
pub(crate) struct Shared {
    /// 调度器 ID
    id: u64,
    /// 配置
    config: SchedulerConfig,
    /// 规范化后的栈大小
    stack_size: StackSize,
    /// 所有处理器
    processors: Vec<Processor>,
    /// 所有工作线程
    machines: RwLock<Vec<Arc<Machine>>>,
    /// 全局运行队列
    global_queue: GlobalQueue,
    /// 定时器线程
    timer: TimerThread,
    /// 协程 ID 计数器
    next_task_id: AtomicU64,
    /// 存活协程数量
    task_count: AtomicU64,
    /// 是否正在运行
    running: AtomicBool,
    /// 启动时间
    start_time: Instant,
    /// 外部句柄的共同所有者，全部句柄释放后失效
    owner: OnceLock<Weak<Owner>>,
}

impl Shared {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn timer(&self) -> &TimerThread {
        &self.timer
    }

    #[inline]
    pub(crate) fn global_queue(&self) -> &GlobalQueue {
        &self.global_queue
    }

    pub(crate) fn processor(&self, idx: usize) -> Option<&Processor> {
        self.processors.get(idx)
    }

    /// 调度协程
    ///
    /// 在本调度器的工作线程上调用时放入本地队列，否则放入全局队列。
    pub(crate) fn schedule(&self, task: Arc<Task>) {
        if let Err(task) = context::push_local(self.id, task) {
            self.global_queue.push(task);
        }
        atomic::fence(Ordering::SeqCst);
        self.wake_machine();
    }

    /// 重新调度主动让出的协程
    ///
    /// 放入全局队列队尾：本地队列是 LIFO，放回本地会让它立刻再次被弹出。
    pub(crate) fn schedule_yielded(&self, task: Arc<Task>) {
        self.global_queue.push(task);
        atomic::fence(Ordering::SeqCst);
        self.wake_machine();
    }

    /// 是否还有待运行的协程
    pub(crate) fn has_work(&self) -> bool {
        !self.global_queue.is_empty() || self.processors.iter().any(|p| !p.stealer().is_empty())
    }

    /// 工作窃取
    ///
    /// 以调度计数作为伪随机起点，避免所有空闲线程总是窃取同一个处理器。
    pub(crate) fn steal_work(&self, thief: usize, local: &LocalQueue) -> Option<Arc<Task>> {
        let num_p = self.processors.len();
        if num_p <= 1 {
            return None;
        }
        let offset = self
            .processors
            .get(thief)
            .map_or(0, |p| p.schedule_count() as usize);

        for i in 0..num_p {
            let idx = (thief + offset + i + 1) % num_p;
            if idx == thief {
                continue;
            }
            if let Some(task) = local.steal_from(self.processors[idx].stealer()) {
                return Some(task);
            }
        }
        None
    }

    /// 唤醒一个休眠中的工作线程
    fn wake_machine(&self) {
        let machines = self.machines.read();
        for m in machines.iter() {
            if m.is_parking() {
                m.unpark();
                break;
            }
        }
    }

    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let machines: Vec<_> = self.machines.read().clone();
        for m in &machines {
            m.stop();
        }
        for m in &machines {
            m.join();
        }
        self.timer.stop();

        // 断开全局队列中协程对调度器的引用
        let mut dropped = 0usize;
        while self.global_queue.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!("scheduler {} shut down with {} runnable tasks", self.id, dropped);
        }
        log::debug!("scheduler {} stopped", self.id);
    }

    /// 协程完成
    pub(crate) fn finish_task(&self, task: &Task) {
        self.task_count.fetch_sub(1, Ordering::Relaxed);
        log::trace!("task {} finished", task.id);
    }
}

/// 所有外部句柄共享，最后一个句柄释放时停止调度器
///
/// 协程和工作线程只引用 [`Shared`]，不会让调度器在句柄全部释放后继续存活。
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::Acquire) {
            log::debug!("last handle of scheduler {} dropped, shutting down", self.shared.id);
            self.shared.shutdown();
        }
    }
}

/// 调度器句柄
///
/// 克隆句柄共享同一组工作线程。显式调用 [`Scheduler::shutdown`]，
/// 或最后一个句柄被释放时，调度器停止。
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    owner: Arc<Owner>,
}

impl Scheduler {
    /// 使用指定配置创建并启动调度器
    pub fn new(config: SchedulerConfig) -> Result<Self, Error> {
        let num_workers = config.num_workers.max(1);
        let queues: Vec<LocalQueue> = (0..num_workers).map(|_| LocalQueue::new()).collect();
        let processors = queues
            .iter()
            .enumerate()
            .map(|(id, q)| Processor::new(id, q.stealer()))
            .collect();

        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size: StackSize::new(config.stack_size),
            config,
            processors,
            machines: RwLock::new(Vec::with_capacity(num_workers)),
            global_queue: GlobalQueue::new(),
            timer: TimerThread::start()?,
            next_task_id: AtomicU64::new(1),
            task_count: AtomicU64::new(0),
            running: AtomicBool::new(true),
            start_time: Instant::now(),
            owner: OnceLock::new(),
        });
        let owner = Arc::new(Owner {
            shared: Arc::clone(&shared),
        });
        let _ = shared.owner.set(Arc::downgrade(&owner));

        let scheduler = Self { shared, owner };
        for (i, queue) in queues.into_iter().enumerate() {
            let m = Machine::new(i);
            // 先登记再启动，保证 wake_machine 能看到它
            scheduler.shared.machines.write().push(Arc::clone(&m));
            if let Err(e) = m.start(Arc::clone(&scheduler.shared), queue) {
                scheduler.shutdown();
                return Err(e);
            }
        }

        log::debug!(
            "scheduler {} started with {} workers",
            scheduler.shared.id,
            num_workers
        );
        Ok(scheduler)
    }

    /// 当前协程所属的调度器
    ///
    /// 调度器的句柄已全部释放时返回 `None`。
    pub fn current() -> Option<Self> {
        let task = context::current_task()?;
        let shared = task.scheduler()?;
        let owner = shared.owner.get()?.upgrade()?;
        Some(Self {
            shared: Arc::clone(shared),
            owner,
        })
    }

    /// 创建并调度新协程
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, handle) = self.build_task(f)?;
        self.shared.schedule(task);
        Ok(handle)
    }

    /// 创建协程但不入队（供 TaskGroup 在入队前登记）
    pub(crate) fn build_task<F, T>(&self, f: F) -> Result<(Arc<Task>, JoinHandle<T>), Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_running() {
            return Err(Error::Shutdown);
        }

        let id = self.next_task_id();
        let state = Arc::new(JoinState::new());
        let body: TaskBody = task::wrap_body(id, f, Arc::clone(&state));
        let task = Arc::new(Task::new(id, body, self.shared.stack_size, Arc::clone(&self.shared))?);

        self.shared.task_count.fetch_add(1, Ordering::Relaxed);
        Ok((Arc::clone(&task), JoinHandle::new(task, state)))
    }

    /// 把已创建的协程放入运行队列
    pub(crate) fn submit(&self, task: Arc<Task>) {
        self.shared.schedule(task);
    }

    /// 停止调度器
    ///
    /// 停止并等待所有工作线程退出，仍在挂起中的协程不会再被运行。
    /// 在本调度器的协程中调用时不等待自己所在的工作线程，它在当前协程切出后退出。
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// 检查是否正在运行
    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// 生成新的协程 ID
    #[inline]
    pub fn next_task_id(&self) -> TaskId {
        self.shared.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 存活协程数量
    #[inline]
    pub fn task_count(&self) -> u64 {
        self.shared.task_count.load(Ordering::Relaxed)
    }

    /// 工作线程数量
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.processors.len()
    }

    /// 获取运行时间
    pub fn elapsed(&self) -> Duration {
        self.shared.start_time.elapsed()
    }

    /// 获取调度统计信息
    pub fn stats(&self) -> SchedulerStats {
        let mut total_local = 0;
        let mut schedule_counts = Vec::with_capacity(self.shared.processors.len());
        for p in &self.shared.processors {
            total_local += p.queue_len();
            schedule_counts.push(p.schedule_count());
        }
        let parked_workers = self
            .shared
            .machines
            .read()
            .iter()
            .filter(|m| m.is_parking())
            .count();

        SchedulerStats {
            task_count: self.task_count(),
            global_queue_len: self.shared.global_queue.len(),
            total_local_queue_len: total_local,
            processor_schedule_counts: schedule_counts,
            parked_workers,
            pending_timers: self.shared.timer.len(),
            timer_heap_len: self.shared.timer.heap_len(),
            elapsed: self.elapsed(),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.shared.id)
            .field("workers", &self.num_workers())
            .field("running", &self.is_running())
            .finish()
    }
}

/// 调度统计信息
#[derive(Debug)]
pub struct SchedulerStats {
    pub task_count: u64,
    pub global_queue_len: usize,
    pub total_local_queue_len: usize,
    pub processor_schedule_counts: Vec<u64>,
    pub parked_workers: usize,
    pub pending_timers: usize,
    /// 定时器堆条目数（含尚未清理的已取消条目）
    pub timer_heap_len: usize,
    pub elapsed: Duration,
}

/// 在当前调度器（协程内）或默认调度器上创建协程
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>, Error>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match Scheduler::current() {
        Some(scheduler) => scheduler.spawn(f),
        None => default_scheduler().spawn(f),
    }
}
