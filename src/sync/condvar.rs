//! 条件变量
//!
//! 与 [`Mutex`](super::Mutex) 配合使用。等待者先登记节点再释放互斥锁，
//! 因此释放锁与挂起之间到达的通知不会丢失。
//!
//! `wait*` 不响应协程的停止请求，供锁的实现内部使用；
//! `wait*_interruptible` 在协程收到停止请求时立即返回 `Err(Stopped)`，
//! 返回前同样重新持有互斥锁。原生线程没有停止请求，两组接口行为相同。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::mutex::MutexGuard;
use crate::error::Stopped;
use crate::runtime::park::{WaitNode, WaitStatus};
use crate::runtime::time::deadline_after;

/// 限时等待的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    /// 是否因超时返回
    #[inline]
    pub fn timed_out(self) -> bool {
        self.0
    }
}

/// 调度器感知的条件变量
pub struct ConditionVariable {
    waiters: parking_lot::Mutex<VecDeque<Arc<WaitNode>>>,
}

impl ConditionVariable {
    /// 创建条件变量
    pub const fn new() -> Self {
        Self {
            waiters: parking_lot::const_mutex(VecDeque::new()),
        }
    }

    fn wait_inner<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
        interruptible: bool,
    ) -> WaitStatus {
        let node = WaitNode::for_current();
        self.waiters.lock().push_back(Arc::clone(&node));

        let status = lock_api::MutexGuard::unlocked(guard, || node.wait(deadline, interruptible));
        if status != WaitStatus::Notified {
            self.waiters.lock().retain(|n| !Arc::ptr_eq(n, &node));
        }
        status
    }

    /// 释放锁并等待通知，返回前重新持有锁
    ///
    /// 可能虚假唤醒，调用方应在循环中检查条件，或使用 [`wait_until`](Self::wait_until)。
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        self.wait_inner(guard, None, false);
    }

    /// 等待直到 `condition` 成立
    pub fn wait_until<T: ?Sized, F>(&self, guard: &mut MutexGuard<'_, T>, mut condition: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        while !condition(&mut **guard) {
            self.wait(guard);
        }
    }

    /// 等待通知，最迟到 `deadline` 返回
    pub fn wait_deadline<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, deadline: Instant) -> WaitTimeoutResult {
        WaitTimeoutResult(self.wait_inner(guard, Some(deadline), false) == WaitStatus::TimedOut)
    }

    /// 等待通知，最多等待 `timeout`
    ///
    /// 截止时间超出可表示范围时按不限时等待。
    pub fn wait_for<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> WaitTimeoutResult {
        let status = self.wait_inner(guard, deadline_after(timeout), false);
        WaitTimeoutResult(status == WaitStatus::TimedOut)
    }

    /// 同 [`wait`](Self::wait)，协程收到停止请求时返回 `Err(Stopped)`
    pub fn wait_interruptible<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) -> Result<(), Stopped> {
        match self.wait_inner(guard, None, true) {
            WaitStatus::Stopped => Err(Stopped),
            _ => Ok(()),
        }
    }

    /// 同 [`wait_until`](Self::wait_until)，停止时不再等待条件
    pub fn wait_until_interruptible<T: ?Sized, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        mut condition: F,
    ) -> Result<(), Stopped>
    where
        F: FnMut(&mut T) -> bool,
    {
        while !condition(&mut **guard) {
            self.wait_interruptible(guard)?;
        }
        Ok(())
    }

    /// 同 [`wait_deadline`](Self::wait_deadline)，协程收到停止请求时返回 `Err(Stopped)`
    pub fn wait_deadline_interruptible<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Instant,
    ) -> Result<WaitTimeoutResult, Stopped> {
        Self::interrupted(self.wait_inner(guard, Some(deadline), true))
    }

    /// 同 [`wait_for`](Self::wait_for)，协程收到停止请求时返回 `Err(Stopped)`
    pub fn wait_for_interruptible<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<WaitTimeoutResult, Stopped> {
        Self::interrupted(self.wait_inner(guard, deadline_after(timeout), true))
    }

    fn interrupted(status: WaitStatus) -> Result<WaitTimeoutResult, Stopped> {
        match status {
            WaitStatus::Stopped => Err(Stopped),
            status => Ok(WaitTimeoutResult(status == WaitStatus::TimedOut)),
        }
    }

    /// 唤醒一个等待者，返回是否有人被唤醒
    pub fn notify_one(&self) -> bool {
        let mut waiters = self.waiters.lock();
        while let Some(node) = waiters.pop_front() {
            // 已超时的等待者不占用这次通知
            if node.fire(WaitStatus::Notified) {
                return true;
            }
        }
        false
    }

    /// 唤醒所有等待者，返回被唤醒的数量
    pub fn notify_all(&self) -> usize {
        let drained: Vec<_> = self.waiters.lock().drain(..).collect();
        drained
            .into_iter()
            .filter(|node| node.fire(WaitStatus::Notified))
            .count()
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Scheduler, SchedulerConfig, TaskGroup};
    use crate::sync::Mutex;
    use std::thread;

    fn small(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig::default().with_workers(workers).with_stack_size(128 * 1024)).unwrap()
    }

    #[test]
    fn test_notify_without_waiters() {
        let cv = ConditionVariable::new();
        assert!(!cv.notify_one());
        assert_eq!(cv.notify_all(), 0);
    }

    #[test]
    fn test_wait_for_times_out() {
        let m = Mutex::new(());
        let cv = ConditionVariable::new();
        let mut g = m.lock();
        let start = Instant::now();
        assert!(cv.wait_for(&mut g, Duration::from_millis(20)).timed_out());
        assert!(start.elapsed() >= Duration::from_millis(20));
        // 超时的等待者已从队列移除
        assert!(!cv.notify_one());
    }

    #[test]
    fn test_stop_cuts_timed_wait_short() {
        let scheduler = small(2);
        let pair = Arc::new((Mutex::new(0u32), ConditionVariable::new()));

        let p = Arc::clone(&pair);
        let waiter = scheduler
            .spawn(move || {
                let (m, cv) = &*p;
                let mut g = m.lock();
                let result = cv.wait_for_interruptible(&mut g, Duration::from_secs(30));
                // 返回时仍持有锁
                *g += 1;
                result
            })
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        waiter.stop();
        assert_eq!(waiter.join(), Ok(Err(Stopped)));
        assert!(start.elapsed() < Duration::from_secs(5));

        let (m, cv) = &*pair;
        assert_eq!(*m.lock(), 1);
        // 被停止的等待者已离开队列
        assert!(!cv.notify_one());
        scheduler.shutdown();
    }

    #[test]
    fn test_group_stop_wakes_condition_waiters() {
        let scheduler = small(2);
        let group = TaskGroup::new(&scheduler);
        let pair = Arc::new((Mutex::new(false), ConditionVariable::new()));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let p = Arc::clone(&pair);
                group
                    .spawn(move || {
                        let (m, cv) = &*p;
                        let mut ready = m.lock();
                        cv.wait_until_interruptible(&mut ready, |r| *r)
                    })
                    .unwrap()
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        group.stop();
        for h in handles {
            assert_eq!(h.join(), Ok(Err(Stopped)));
        }
        group.join_all();
        scheduler.shutdown();
    }

    #[test]
    fn test_interruptible_wait_after_stop_returns_at_once() {
        let scheduler = small(1);
        let group = TaskGroup::new(&scheduler);
        group.stop();
        let handle = group
            .spawn(|| {
                let m = Mutex::new(());
                let cv = ConditionVariable::new();
                let mut g = m.lock();
                let start = Instant::now();
                let result = cv.wait_for_interruptible(&mut g, Duration::from_secs(30));
                (result, start.elapsed() < Duration::from_secs(5))
            })
            .unwrap();
        assert_eq!(handle.join(), Ok((Err(Stopped), true)));
        scheduler.shutdown();
    }

    #[test]
    fn test_interruptible_wait_on_native_thread() {
        let m = Mutex::new(());
        let cv = ConditionVariable::new();
        let mut g = m.lock();
        let result = cv.wait_for_interruptible(&mut g, Duration::from_millis(10));
        assert_eq!(result.map(WaitTimeoutResult::timed_out), Ok(true));
    }

    #[test]
    fn test_uninterruptible_wait_ignores_stop() {
        let scheduler = small(1);
        let pair = Arc::new((Mutex::new(()), ConditionVariable::new()));
        let p = Arc::clone(&pair);
        let waiter = scheduler
            .spawn(move || {
                let (m, cv) = &*p;
                let mut g = m.lock();
                cv.wait_for(&mut g, Duration::from_millis(100)).timed_out()
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        waiter.stop();
        assert_eq!(waiter.join(), Ok(true));
        scheduler.shutdown();
    }

    #[test]
    fn test_thread_signals_task() {
        let scheduler = small(2);
        let pair = Arc::new((Mutex::new(false), ConditionVariable::new()));

        let p = Arc::clone(&pair);
        let waiter = scheduler
            .spawn(move || {
                let (m, cv) = &*p;
                let mut ready = m.lock();
                cv.wait_until(&mut ready, |r| *r);
                *ready
            })
            .unwrap();

        thread::sleep(Duration::from_millis(10));
        {
            let (m, cv) = &*pair;
            *m.lock() = true;
            cv.notify_all();
        }
        assert_eq!(waiter.join(), Ok(true));
        scheduler.shutdown();
    }

    #[test]
    fn test_task_signals_thread() {
        let scheduler = small(1);
        let pair = Arc::new((Mutex::new(0u32), ConditionVariable::new()));

        let p = Arc::clone(&pair);
        scheduler
            .spawn(move || {
                let (m, cv) = &*p;
                *m.lock() = 42;
                cv.notify_one();
            })
            .unwrap();

        let (m, cv) = &*pair;
        let mut value = m.lock();
        cv.wait_until(&mut value, |v| *v != 0);
        assert_eq!(*value, 42);
        drop(value);
        scheduler.shutdown();
    }

    #[test]
    fn test_notify_all_wakes_every_task() {
        let scheduler = small(2);
        let state = Arc::new((Mutex::new((false, 0usize)), ConditionVariable::new()));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = Arc::clone(&state);
                scheduler
                    .spawn(move || {
                        let (m, cv) = &*s;
                        let mut g = m.lock();
                        g.1 += 1;
                        cv.wait_until(&mut g, |(go, _)| *go);
                    })
                    .unwrap()
            })
            .collect();

        let (m, cv) = &*state;
        // 等所有协程都进入等待
        loop {
            if m.lock().1 == 10 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        m.lock().0 = true;
        cv.notify_all();
        for h in handles {
            h.join().unwrap();
        }
        scheduler.shutdown();
    }
}
