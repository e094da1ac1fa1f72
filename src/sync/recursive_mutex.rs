//! 可重入互斥锁
//!
//! 所有者以 [`ExecutionContext`] 记录：先比较种类（协程/原生线程）再比较 ID，
//! 协程 ID 与线程 ID 来自不同空间，数值相同也不是同一个所有者。

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use super::condvar::ConditionVariable;
use super::mutex::Mutex;
use crate::runtime::context::{self, ExecutionContext};
use crate::runtime::time::deadline_after;

#[derive(Debug, Default)]
struct Ownership {
    depth: usize,
    owner: Option<ExecutionContext>,
}

impl Ownership {
    /// 未被持有，或持有者就是调用者
    fn available(&self, me: ExecutionContext) -> bool {
        self.depth == 0 || self.owner == Some(me)
    }

    fn acquire(&mut self, me: ExecutionContext) {
        if self.depth == 0 {
            self.owner = Some(me);
        }
        self.depth += 1;
    }
}

/// 可重入互斥锁
///
/// 同一执行上下文可以多次加锁，必须解锁同样次数才会释放。
pub struct RecursiveMutex {
    state: Mutex<Ownership>,
    cv: ConditionVariable,
}

impl RecursiveMutex {
    /// 创建未加锁的可重入锁
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Ownership::default()),
            cv: ConditionVariable::new(),
        }
    }

    /// 加锁
    ///
    /// 持有者重入立即成功；其他上下文等待直到深度回到 0。
    pub fn lock(&self) {
        let me = context::current();
        let mut state = self.state.lock();
        self.cv.wait_until(&mut state, |s| s.available(me));
        state.acquire(me);
    }

    /// 尝试加锁，从不阻塞
    pub fn try_lock(&self) -> bool {
        let me = context::current();
        let Some(mut state) = self.state.try_lock() else {
            return false;
        };
        if !state.available(me) {
            return false;
        }
        state.acquire(me);
        true
    }

    /// 解锁一层
    ///
    /// # Panics
    ///
    /// 调用者不是当前持有者时 panic。
    pub fn unlock(&self) {
        let me = context::current();
        let mut state = self.state.lock();
        assert!(
            state.depth > 0 && state.owner == Some(me),
            "RecursiveMutex unlocked by {:?} which does not own it",
            me
        );
        state.depth -= 1;
        if state.depth > 0 {
            return;
        }
        state.owner = None;
        drop(state);
        self.cv.notify_one();
    }

    /// 加锁并返回 RAII 守卫
    pub fn guard(&self) -> RecursiveMutexGuard<'_> {
        self.lock();
        RecursiveMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// 当前重入深度，0 表示未加锁
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    /// 当前持有者
    pub fn owner(&self) -> Option<ExecutionContext> {
        self.state.lock().owner
    }

    fn lock_until(&self, deadline: Instant) -> bool {
        let me = context::current();
        let Some(mut state) = self.state.try_lock_until(deadline) else {
            return false;
        };
        while !state.available(me) {
            if Instant::now() >= deadline {
                break;
            }
            self.cv.wait_deadline(&mut state, deadline);
        }
        if !state.available(me) {
            return false;
        }
        state.acquire(me);
        true
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecursiveMutex {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        assert_eq!(
            state.depth, 0,
            "RecursiveMutex dropped while held by {:?}",
            state.owner
        );
    }
}

impl std::fmt::Debug for RecursiveMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RecursiveMutex")
            .field("depth", &state.depth)
            .field("owner", &state.owner)
            .finish()
    }
}

/// [`RecursiveMutex::guard`] 返回的守卫，离开作用域时解锁一层
///
/// 解锁必须发生在加锁的执行上下文中，所以守卫不能跨线程移动。
#[must_use = "if unused the RecursiveMutex will immediately unlock"]
pub struct RecursiveMutexGuard<'a> {
    mutex: &'a RecursiveMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RecursiveMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// 支持限时加锁的可重入互斥锁
#[derive(Debug, Default)]
pub struct RecursiveTimedMutex {
    inner: RecursiveMutex,
}

impl RecursiveTimedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> bool {
        self.inner.try_lock()
    }

    pub fn unlock(&self) {
        self.inner.unlock()
    }

    pub fn guard(&self) -> RecursiveMutexGuard<'_> {
        self.inner.guard()
    }

    pub fn depth(&self) -> usize {
        self.inner.depth()
    }

    /// 最多等待 `timeout`，超时返回 `false` 且不持有锁
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        match deadline_after(timeout) {
            Some(deadline) => self.inner.lock_until(deadline),
            None => {
                self.inner.lock();
                true
            }
        }
    }

    /// 最迟等到 `deadline`，超时返回 `false` 且不持有锁
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        self.inner.lock_until(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Scheduler, SchedulerConfig};
    use std::sync::Arc;
    use std::thread;

    fn small(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig::default().with_workers(workers).with_stack_size(128 * 1024)).unwrap()
    }

    #[test]
    fn test_reentrant_lock() {
        let m = RecursiveMutex::new();
        for k in 1..=3 {
            m.lock();
            assert_eq!(m.depth(), k);
        }
        assert_eq!(m.owner(), Some(context::current()));
        m.unlock();
        m.unlock();
        // 少解锁一次，锁仍被持有
        assert_eq!(m.depth(), 1);
        m.unlock();
        assert_eq!(m.depth(), 0);
        assert!(m.owner().is_none());
    }

    #[test]
    fn test_other_thread_blocks_until_released() {
        let m = Arc::new(RecursiveMutex::new());
        m.lock();
        m.lock();

        let m2 = Arc::clone(&m);
        let other = thread::spawn(move || {
            assert!(!m2.try_lock());
            let start = Instant::now();
            m2.lock();
            let waited = start.elapsed();
            m2.unlock();
            waited
        });

        thread::sleep(Duration::from_millis(30));
        m.unlock();
        thread::sleep(Duration::from_millis(10));
        // 深度 1 时仍然持有
        assert_eq!(m.depth(), 1);
        m.unlock();
        assert!(other.join().unwrap() >= Duration::from_millis(30));
    }

    #[test]
    fn test_task_and_thread_do_not_share_ownership() {
        let scheduler = small(1);
        let m = Arc::new(RecursiveMutex::new());
        let _g = m.guard();

        let m2 = Arc::clone(&m);
        let handle = scheduler.spawn(move || m2.try_lock()).unwrap();
        assert_eq!(handle.join(), Ok(false));
        scheduler.shutdown();
    }

    #[test]
    fn test_task_reentry() {
        let scheduler = small(2);
        let m = Arc::new(RecursiveMutex::new());
        let m2 = Arc::clone(&m);
        let handle = scheduler
            .spawn(move || {
                let _a = m2.guard();
                let _b = m2.guard();
                assert!(m2.try_lock());
                let depth = m2.depth();
                m2.unlock();
                depth
            })
            .unwrap();
        assert_eq!(handle.join(), Ok(3));
        assert_eq!(m.depth(), 0);
        scheduler.shutdown();
    }

    #[test]
    #[should_panic(expected = "does not own it")]
    fn test_unlock_by_non_owner_panics() {
        let m = RecursiveMutex::new();
        m.unlock();
    }

    #[test]
    fn test_timed_lock_times_out() {
        let m = Arc::new(RecursiveTimedMutex::new());
        m.lock();
        let m2 = Arc::clone(&m);
        let other = thread::spawn(move || {
            let start = Instant::now();
            let ok = m2.try_lock_for(Duration::from_millis(20));
            (ok, start.elapsed())
        });
        let (ok, waited) = other.join().unwrap();
        assert!(!ok);
        assert!(waited >= Duration::from_millis(20));
        // 持有者重入不受超时影响
        assert!(m.try_lock_for(Duration::ZERO));
        m.unlock();
        m.unlock();
    }

    #[test]
    fn test_task_timed_lock() {
        let scheduler = small(2);
        let m = Arc::new(RecursiveTimedMutex::new());
        m.lock();

        let m2 = Arc::clone(&m);
        let short = scheduler
            .spawn(move || {
                let start = Instant::now();
                let ok = m2.try_lock_for(Duration::from_millis(20));
                (ok, start.elapsed())
            })
            .unwrap();
        let (ok, waited) = short.join().unwrap();
        assert!(!ok);
        assert!(waited >= Duration::from_millis(20));
        assert_eq!(m.depth(), 1);

        let m3 = Arc::clone(&m);
        let long = scheduler
            .spawn(move || {
                if !m3.try_lock_for(Duration::from_secs(10)) {
                    return None;
                }
                // 协程持有后同样可以重入
                let reentered = m3.try_lock_for(Duration::ZERO);
                let depth = m3.depth();
                m3.unlock();
                m3.unlock();
                Some((reentered, depth))
            })
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        m.unlock();
        assert_eq!(long.join(), Ok(Some((true, 2))));
        assert_eq!(m.depth(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_timed_lock_acquires_after_release() {
        let m = Arc::new(RecursiveTimedMutex::new());
        m.lock();
        let m2 = Arc::clone(&m);
        let other = thread::spawn(move || {
            let ok = m2.try_lock_for(Duration::from_secs(10));
            if ok {
                m2.unlock();
            }
            ok
        });
        thread::sleep(Duration::from_millis(20));
        m.unlock();
        assert!(other.join().unwrap());
    }
}
