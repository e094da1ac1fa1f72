//! 定时器线程
//!
//! 协程的限时等待不能占用载体线程去计时，所以由独立的定时器线程
//! 在截止时间到达时以 `TimedOut` 完成等待节点。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::park::{WaitNode, WaitStatus};
use crate::config::TIMER_THREAD_NAME;
use crate::error::Error;

/// 定时器 ID
pub type TimerId = u64;

/// 允许堆中残留的失效条目数量下限
const PRUNE_SLACK: usize = 64;

/// 定时器队列中的条目，按截止时间组成最小堆
struct TimerEntry {
    deadline: Instant,
    id: TimerId,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Ord for TimerEntry {
    /// 反向比较，使 `BinaryHeap` 先弹出最早的截止时间
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    /// 仍然有效的定时器；取消时先从这里删除，堆中的失效条目到期或整理时丢弃
    pending: HashMap<TimerId, Arc<WaitNode>>,
    next_id: TimerId,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// 定时器线程
pub struct TimerThread {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// 启动定时器线程
    pub fn start() -> Result<Self, Error> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                pending: HashMap::new(),
                next_id: 1,
                stopped: false,
            }),
            cond: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(TIMER_THREAD_NAME.to_string())
            .spawn(move || run_loop(&worker))
            .map_err(Error::SpawnThread)?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// 注册定时器，到期时以 `TimedOut` 完成节点
    pub fn add(&self, deadline: Instant, node: Arc<WaitNode>) -> TimerId {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let earliest = state.heap.peek().map_or(true, |e| deadline < e.deadline);
        state.heap.push(TimerEntry { deadline, id });
        state.pending.insert(id, node);
        drop(state);

        if earliest {
            self.shared.cond.notify_one();
        }
        id
    }

    /// 取消定时器，返回它是否尚未触发
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.shared.state.lock();
        let removed = state.pending.remove(&id).is_some();
        if removed {
            prune(&mut state);
        }
        removed
    }

    /// 堆中条目数量（含已取消但尚未清理的条目）
    pub fn heap_len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// 有效定时器数量
    pub fn len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// 是否没有有效定时器
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 停止定时器线程并等待其退出
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.cond.notify_one();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for TimerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerThread").field("pending", &self.len()).finish()
    }
}

fn run_loop(shared: &TimerShared) {
    log::debug!("timer thread started");
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            break;
        }

        let due = take_due(&mut state, Instant::now());
        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for node in due {
                    node.fire(WaitStatus::TimedOut);
                }
            });
            continue;
        }

        match state.heap.peek().map(|e| e.deadline) {
            Some(deadline) => {
                shared.cond.wait_until(&mut state, deadline);
            }
            None => shared.cond.wait(&mut state),
        }
    }
    log::debug!("timer thread stopped");
}

/// 失效条目明显多于有效条目时重建堆
///
/// 长超时的等待大多被提前取消，不整理的话堆会一直增长到截止时间。
fn prune(state: &mut TimerState) {
    if state.heap.len() <= PRUNE_SLACK + 2 * state.pending.len() {
        return;
    }
    let before = state.heap.len();
    let pending = &state.pending;
    state.heap.retain(|e| pending.contains_key(&e.id));
    log::trace!("timer heap pruned from {} to {} entries", before, state.heap.len());
}

fn take_due(state: &mut TimerState, now: Instant) -> Vec<Arc<WaitNode>> {
    let mut due = Vec::new();
    while let Some(entry) = state.heap.peek() {
        if entry.deadline > now {
            break;
        }
        let id = entry.id;
        state.heap.pop();
        if let Some(node) = state.pending.remove(&id) {
            due.push(node);
        }
    }
    due
}
