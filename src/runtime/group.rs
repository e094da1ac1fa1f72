//! 协程组
//!
//! 跟踪一组协程，统一下发停止请求。停止是协作式的：
//! 正在可取消睡眠中的成员立即返回 `Err(Stopped)`，其余成员通过
//! [`is_stopped`](super::is_stopped) 自行检查。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::context;
use super::scheduler::Scheduler;
use super::task::{JoinHandle, Task};
use super::TaskId;
use crate::error::Error;
use crate::sync::{ConditionVariable, Mutex};

struct GroupShared {
    tasks: DashMap<TaskId, Arc<Task>>,
    stopped: AtomicBool,
    /// 尚未结束的成员数量，`join_all` 在上面等待
    live: Mutex<usize>,
    drained: ConditionVariable,
}

/// 成员结束（含 panic）时把自己移出组
struct Membership {
    group: Arc<GroupShared>,
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(id) = context::current_task_id() {
            self.group.tasks.remove(&id);
        }
        let mut live = self.group.live.lock();
        *live -= 1;
        if *live == 0 {
            self.group.drained.notify_all();
        }
    }
}

/// 协程组
pub struct TaskGroup {
    scheduler: Scheduler,
    shared: Arc<GroupShared>,
}

impl TaskGroup {
    /// 在指定调度器上创建协程组
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            shared: Arc::new(GroupShared {
                tasks: DashMap::new(),
                stopped: AtomicBool::new(false),
                live: Mutex::new(0),
                drained: ConditionVariable::new(),
            }),
        }
    }

    /// 在组内创建协程
    ///
    /// 组已停止时协程仍会运行，但一开始就处于停止状态。
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let group = Arc::clone(&self.shared);
        let (task, handle) = self.scheduler.build_task(move || {
            let _member = Membership { group };
            f()
        })?;

        *self.shared.live.lock() += 1;
        self.shared.tasks.insert(task.id, Arc::clone(&task));
        if self.shared.stopped.load(Ordering::SeqCst) {
            task.request_stop();
        }
        self.scheduler.submit(task);
        Ok(handle)
    }

    /// 向所有当前及以后的成员下发停止请求
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        for entry in self.shared.tasks.iter() {
            entry.value().request_stop();
        }
        log::debug!("task group stopped with {} live members", self.len());
    }

    /// 是否已停止
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// 尚未结束的成员数量
    pub fn len(&self) -> usize {
        self.shared.tasks.len()
    }

    /// 是否没有存活成员
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 等待所有成员结束
    pub fn join_all(&self) {
        let mut live = self.shared.live.lock();
        self.shared.drained.wait_until(&mut live, |n| *n == 0);
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("len", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stopped;
    use crate::runtime::{self, SchedulerConfig};
    use std::time::{Duration, Instant};

    fn small(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig::default().with_workers(workers).with_stack_size(128 * 1024)).unwrap()
    }

    #[test]
    fn test_group_tracks_members() {
        let scheduler = small(2);
        let group = TaskGroup::new(&scheduler);
        let handles: Vec<_> = (0..8u32).map(|i| group.spawn(move || i * 2).unwrap()).collect();
        let sum: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(sum, 56);
        group.join_all();
        assert!(group.is_empty());
        scheduler.shutdown();
    }

    #[test]
    fn test_group_stop_wakes_sleepers() {
        let scheduler = small(2);
        let group = TaskGroup::new(&scheduler);
        let handles: Vec<_> = (0..4)
            .map(|_| group.spawn(|| runtime::sleep(Duration::from_secs(30))).unwrap())
            .collect();
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        group.stop();
        assert!(group.is_stopped());
        for h in handles {
            assert_eq!(h.join(), Ok(Err(Stopped)));
        }
        group.join_all();
        assert!(start.elapsed() < Duration::from_secs(5));
        scheduler.shutdown();
    }

    #[test]
    fn test_spawn_into_stopped_group() {
        let scheduler = small(1);
        let group = TaskGroup::new(&scheduler);
        group.stop();
        let handle = group.spawn(runtime::is_stopped).unwrap();
        assert_eq!(handle.join(), Ok(true));
        scheduler.shutdown();
    }

    #[test]
    fn test_panicking_member_leaves_group() {
        let scheduler = small(1);
        let group = TaskGroup::new(&scheduler);
        let handle = group.spawn(|| panic!("member failed")).unwrap();
        assert!(handle.join().is_err());
        group.join_all();
        assert_eq!(group.len(), 0);
        scheduler.shutdown();
    }
}
