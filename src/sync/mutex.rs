//! 互斥锁
//!
//! 解锁时把所有权直接移交给队首等待者（`locked` 保持为 `true`），
//! 被唤醒的等待者醒来即持有锁，不会与新来的加锁者竞争。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lock_api::{GuardSend, RawMutexTimed};

use crate::runtime::park::{WaitNode, WaitStatus};
use crate::runtime::time::deadline_after;

struct MutexState {
    locked: bool,
    waiters: VecDeque<Arc<WaitNode>>,
}

/// 调度器感知的原始互斥锁
///
/// 通常通过 [`Mutex<T>`] 使用。
pub struct RawMutex {
    state: parking_lot::Mutex<MutexState>,
}

impl RawMutex {
    /// 加锁，`deadline` 为 `None` 时不限时
    fn lock_until(&self, deadline: Option<Instant>) -> bool {
        let node = {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return true;
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return false;
            }
            let node = WaitNode::for_current();
            state.waiters.push_back(Arc::clone(&node));
            node
        };

        match node.wait(deadline, false) {
            WaitStatus::Notified => true,
            WaitStatus::TimedOut | WaitStatus::Stopped => {
                // 节点已超时，unlock 不会再把锁交给它
                self.state.lock().waiters.retain(|n| !Arc::ptr_eq(n, &node));
                false
            }
        }
    }

    /// 当前等待者数量
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

unsafe impl lock_api::RawMutex for RawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawMutex = RawMutex {
        state: parking_lot::const_mutex(MutexState {
            locked: false,
            waiters: VecDeque::new(),
        }),
    };

    // 协程会在线程间迁移，守卫必须能随之移动
    type GuardMarker = GuardSend;

    fn lock(&self) {
        self.lock_until(None);
    }

    fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    unsafe fn unlock(&self) {
        let mut state = self.state.lock();
        while let Some(node) = state.waiters.pop_front() {
            if node.fire(WaitStatus::Notified) {
                return;
            }
        }
        state.locked = false;
    }

    fn is_locked(&self) -> bool {
        self.state.lock().locked
    }
}

unsafe impl RawMutexTimed for RawMutex {
    type Duration = Duration;
    type Instant = Instant;

    fn try_lock_for(&self, timeout: Duration) -> bool {
        self.lock_until(deadline_after(timeout))
    }

    fn try_lock_until(&self, deadline: Instant) -> bool {
        self.lock_until(Some(deadline))
    }
}

/// 调度器感知的互斥锁
pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;

/// [`Mutex`] 的 RAII 守卫
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;

/// 支持限时加锁的互斥锁
///
/// 与 [`Mutex`] 是同一把锁：`try_lock_for` / `try_lock_until` 对协程和原生线程
/// 都返回同样的布尔约定。
pub type TimedMutex<T = ()> = lock_api::Mutex<RawMutex, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{self, Scheduler, SchedulerConfig};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn small(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig::default().with_workers(workers).with_stack_size(128 * 1024)).unwrap()
    }

    #[test]
    fn test_lock_unlock_native() {
        let m = Mutex::new(5);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.is_locked());
            assert!(m.try_lock().is_none());
        }
        assert!(!m.is_locked());
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn test_mutual_exclusion_tasks_and_threads() {
        let scheduler = small(4);
        let m = Arc::new(Mutex::new(0u64));
        let inside = Arc::new(AtomicBool::new(false));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let m = Arc::clone(&m);
                let inside = Arc::clone(&inside);
                scheduler
                    .spawn(move || {
                        for _ in 0..100 {
                            let mut g = m.lock();
                            assert!(!inside.swap(true, Ordering::SeqCst));
                            runtime::yield_now();
                            *g += 1;
                            inside.store(false, Ordering::SeqCst);
                        }
                    })
                    .unwrap()
            })
            .collect();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut g = m.lock();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        thread::yield_now();
                        *g += 1;
                        inside.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for t in tasks {
            t.join().unwrap();
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*m.lock(), 2000);
        scheduler.shutdown();
    }

    #[test]
    fn test_try_lock_for_zero_on_held_lock() {
        let m = TimedMutex::new(());
        let _g = m.lock();
        let start = Instant::now();
        assert!(m.try_lock_for(Duration::ZERO).is_none());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_try_lock_for_succeeds_when_released() {
        let m = Arc::new(TimedMutex::new(()));
        let g = m.lock();
        let m2 = Arc::clone(&m);
        let waiter = thread::spawn(move || m2.try_lock_for(Duration::from_secs(10)).is_some());
        thread::sleep(Duration::from_millis(20));
        drop(g);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_task_timed_lock() {
        let scheduler = small(2);
        let m = Arc::new(TimedMutex::new(()));
        let g = m.lock();

        let m2 = Arc::clone(&m);
        let short = scheduler
            .spawn(move || m2.try_lock_for(Duration::from_millis(20)).is_some())
            .unwrap();
        assert_eq!(short.join(), Ok(false));
        assert_eq!(m.raw_waiters(), 0);

        let m3 = Arc::clone(&m);
        let long = scheduler
            .spawn(move || m3.try_lock_for(Duration::from_secs(10)).is_some())
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(g);
        assert_eq!(long.join(), Ok(true));
        scheduler.shutdown();
    }

    #[test]
    fn test_timed_out_waiter_does_not_swallow_handoff() {
        let m = Arc::new(TimedMutex::new(()));
        let g = m.lock();

        let m1 = Arc::clone(&m);
        let impatient = thread::spawn(move || m1.try_lock_for(Duration::from_millis(10)).is_some());
        let m2 = Arc::clone(&m);
        let patient = thread::spawn(move || {
            let _g = m2.lock();
        });

        assert!(!impatient.join().unwrap());
        thread::sleep(Duration::from_millis(10));
        drop(g);
        patient.join().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn test_long_timed_locks_leave_no_timers_behind() {
        let scheduler = small(4);
        let m = Arc::new(TimedMutex::new(0u64));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                scheduler
                    .spawn(move || {
                        for _ in 0..500 {
                            if let Some(mut g) = m.try_lock_for(Duration::from_secs(3600)) {
                                runtime::yield_now();
                                *g += 1;
                            }
                        }
                    })
                    .unwrap()
            })
            .collect();
        for t in tasks {
            t.join().unwrap();
        }

        assert_eq!(*m.lock(), 2000);
        let stats = scheduler.stats();
        assert_eq!(stats.pending_timers, 0);
        assert!(stats.timer_heap_len <= 64, "heap kept {} entries", stats.timer_heap_len);
        scheduler.shutdown();
    }

    trait RawWaiters {
        fn raw_waiters(&self) -> usize;
    }

    impl<T> RawWaiters for Mutex<T> {
        fn raw_waiters(&self) -> usize {
            unsafe { self.raw() }.waiter_count()
        }
    }
}
