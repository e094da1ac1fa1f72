//! 逻辑处理器 (Processor)
//!
//! P - 每个工作线程对应一个处理器，保存其本地队列的窃取句柄和调度统计，
//! 供其他线程读取。本地队列本身只归工作线程所有。

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_deque::Stealer;
use crossbeam_utils::CachePadded;

use super::task::Task;
use super::TaskId;

/// 无协程运行时的占位 ID
const NO_TASK: TaskId = 0;

/// 处理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorStatus {
    /// 空闲
    Idle = 0,
    /// 运行中
    Running = 1,
    /// 停止
    Stopped = 2,
}

impl From<u8> for ProcessorStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ProcessorStatus::Idle,
            1 => ProcessorStatus::Running,
            _ => ProcessorStatus::Stopped,
        }
    }
}

/// 逻辑处理器
pub struct Processor {
    /// 处理器 ID
    pub id: usize,
    /// 处理器状态
    status: AtomicU8,
    /// 本地队列的窃取句柄
    stealer: Stealer<Arc<Task>>,
    /// 当前正在运行的协程 ID
    current: AtomicU64,
    /// 调度计数
    schedule_count: CachePadded<AtomicU64>,
}

impl Processor {
    /// 创建新的处理器
    pub fn new(id: usize, stealer: Stealer<Arc<Task>>) -> Self {
        Self {
            id,
            status: AtomicU8::new(ProcessorStatus::Idle as u8),
            stealer,
            current: AtomicU64::new(NO_TASK),
            schedule_count: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// 获取处理器状态
    #[inline]
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置处理器状态
    #[inline]
    pub fn set_status(&self, status: ProcessorStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 窃取句柄
    #[inline]
    pub fn stealer(&self) -> &Stealer<Arc<Task>> {
        &self.stealer
    }

    /// 本地队列长度（近似值）
    #[inline]
    pub fn queue_len(&self) -> usize {
        self.stealer.len()
    }

    /// 当前协程 ID
    #[inline]
    pub fn current(&self) -> Option<TaskId> {
        match self.current.load(Ordering::Acquire) {
            NO_TASK => None,
            id => Some(id),
        }
    }

    /// 设置当前协程
    pub fn set_current(&self, id: Option<TaskId>) {
        self.current.store(id.unwrap_or(NO_TASK), Ordering::Release);
    }

    /// 增加调度计数
    pub fn inc_schedule_count(&self) {
        self.schedule_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取调度计数
    #[inline]
    pub fn schedule_count(&self) -> u64 {
        self.schedule_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("queue_len", &self.queue_len())
            .field("current", &self.current())
            .finish()
    }
}
