//! 读写锁（写者优先）
//!
//! 状态压缩在一个 `u32` 中：最高位是“写者已进入”标记，其余位是读者计数。
//! 写者先置位标记挡住新读者，再等待已有读者退出，所以源源不断的读者
//! 不会饿死写者。
//!
//! 写者解锁时唤醒所有在 `read_cv` 上等待的上下文（读者和下一个写者），
//! 它们在内部互斥锁下重新检查状态。被唤醒的读者可能先于被唤醒的写者
//! 进入；写者随后置位标记，并在 `write_cv` 上等这些读者退出。

use std::time::{Duration, Instant};

use lock_api::{GuardSend, RawRwLock, RawRwLockTimed};

use super::condvar::ConditionVariable;
use super::mutex::Mutex;
use crate::runtime::time::deadline_after;

const WRITE_ENTERED: u32 = 1 << (u32::BITS - 1);
const N_READERS: u32 = !WRITE_ENTERED;

/// 写者优先的原始读写锁
pub struct RawSharedMutex {
    state: Mutex<u32>,
    read_cv: ConditionVariable,
    write_cv: ConditionVariable,
    /// 读者计数饱和值，达到后新读者等待
    max_readers: u32,
}

impl RawSharedMutex {
    /// 创建未加锁的读写锁
    pub const fn new() -> Self {
        Self {
            state: Mutex::const_new(<super::mutex::RawMutex as lock_api::RawMutex>::INIT, 0),
            read_cv: ConditionVariable::new(),
            write_cv: ConditionVariable::new(),
            max_readers: N_READERS,
        }
    }

    #[cfg(test)]
    fn with_max_readers(max_readers: u32) -> Self {
        let mut raw = Self::new();
        raw.max_readers = max_readers;
        raw
    }

    // ---- 独占 ----

    /// 独占加锁
    pub fn lock(&self) {
        let mut state = self.state.lock();
        while *state & WRITE_ENTERED != 0 {
            self.read_cv.wait(&mut state);
        }
        *state |= WRITE_ENTERED;
        while *state & N_READERS != 0 {
            self.write_cv.wait(&mut state);
        }
    }

    /// 仅在完全空闲时成功
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if *state == 0 {
            *state = WRITE_ENTERED;
            true
        } else {
            false
        }
    }

    /// 释放独占锁
    ///
    /// # Safety
    ///
    /// 调用方必须持有独占锁。
    pub unsafe fn unlock(&self) {
        let mut state = self.state.lock();
        *state = 0;
        drop(state);
        self.read_cv.notify_all();
    }

    /// 限时独占加锁，超时时撤销已置位的写者标记
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if *state & WRITE_ENTERED != 0 {
            loop {
                let result = self.read_cv.wait_deadline(&mut state, deadline);
                if *state & WRITE_ENTERED == 0 {
                    break;
                }
                if result.timed_out() {
                    return false;
                }
            }
        }
        *state |= WRITE_ENTERED;
        if *state & N_READERS != 0 {
            loop {
                let result = self.write_cv.wait_deadline(&mut state, deadline);
                if *state & N_READERS == 0 {
                    break;
                }
                if result.timed_out() {
                    *state &= !WRITE_ENTERED;
                    drop(state);
                    self.read_cv.notify_all();
                    return false;
                }
            }
        }
        true
    }

    /// 限时独占加锁
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        match deadline_after(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => {
                self.lock();
                true
            }
        }
    }

    // ---- 共享 ----

    /// 共享加锁
    pub fn lock_shared(&self) {
        let mut state = self.state.lock();
        while *state & WRITE_ENTERED != 0 || *state & N_READERS >= self.max_readers {
            self.read_cv.wait(&mut state);
        }
        let readers = (*state & N_READERS) + 1;
        *state = (*state & !N_READERS) | readers;
    }

    /// 没有写者且读者未饱和时成功
    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.lock();
        let readers = *state & N_READERS;
        if *state & WRITE_ENTERED == 0 && readers < self.max_readers {
            *state = (*state & !N_READERS) | (readers + 1);
            true
        } else {
            false
        }
    }

    /// 释放共享锁
    ///
    /// # Safety
    ///
    /// 调用方必须持有共享锁。
    pub unsafe fn unlock_shared(&self) {
        let mut state = self.state.lock();
        let readers = (*state & N_READERS) - 1;
        *state = (*state & !N_READERS) | readers;
        if *state & WRITE_ENTERED != 0 {
            if readers == 0 {
                drop(state);
                self.write_cv.notify_one();
            }
        } else if readers == self.max_readers - 1 {
            drop(state);
            self.read_cv.notify_one();
        }
    }

    /// 限时共享加锁
    pub fn try_lock_shared_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if *state & WRITE_ENTERED != 0 || *state & N_READERS >= self.max_readers {
            loop {
                let result = self.read_cv.wait_deadline(&mut state, deadline);
                if *state & WRITE_ENTERED == 0 && *state & N_READERS < self.max_readers {
                    break;
                }
                if result.timed_out() {
                    return false;
                }
            }
        }
        let readers = (*state & N_READERS) + 1;
        *state = (*state & !N_READERS) | readers;
        true
    }

    /// 限时共享加锁
    pub fn try_lock_shared_for(&self, timeout: Duration) -> bool {
        match deadline_after(timeout) {
            Some(deadline) => self.try_lock_shared_until(deadline),
            None => {
                self.lock_shared();
                true
            }
        }
    }

    /// 当前读者数量
    pub fn reader_count(&self) -> u32 {
        *self.state.lock() & N_READERS
    }

    /// 是否有写者已进入（持有或正在等待读者退出）
    pub fn is_write_entered(&self) -> bool {
        *self.state.lock() & WRITE_ENTERED != 0
    }
}

impl Default for RawSharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RawSharedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("RawSharedMutex")
            .field("write_entered", &(state & WRITE_ENTERED != 0))
            .field("readers", &(state & N_READERS))
            .finish()
    }
}

unsafe impl RawRwLock for RawSharedMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: RawSharedMutex = RawSharedMutex::new();

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        RawSharedMutex::lock_shared(self)
    }

    fn try_lock_shared(&self) -> bool {
        RawSharedMutex::try_lock_shared(self)
    }

    unsafe fn unlock_shared(&self) {
        RawSharedMutex::unlock_shared(self)
    }

    fn lock_exclusive(&self) {
        self.lock()
    }

    fn try_lock_exclusive(&self) -> bool {
        self.try_lock()
    }

    unsafe fn unlock_exclusive(&self) {
        self.unlock()
    }

    fn is_locked(&self) -> bool {
        *self.state.lock() != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.is_write_entered()
    }
}

unsafe impl RawRwLockTimed for RawSharedMutex {
    type Duration = Duration;
    type Instant = Instant;

    fn try_lock_shared_for(&self, timeout: Duration) -> bool {
        RawSharedMutex::try_lock_shared_for(self, timeout)
    }

    fn try_lock_shared_until(&self, deadline: Instant) -> bool {
        RawSharedMutex::try_lock_shared_until(self, deadline)
    }

    fn try_lock_exclusive_for(&self, timeout: Duration) -> bool {
        self.try_lock_for(timeout)
    }

    fn try_lock_exclusive_until(&self, deadline: Instant) -> bool {
        self.try_lock_until(deadline)
    }
}

/// 写者优先的读写锁
pub type SharedMutex<T = ()> = lock_api::RwLock<RawSharedMutex, T>;

/// 支持限时加锁的读写锁（与 [`SharedMutex`] 是同一把锁）
pub type SharedTimedMutex<T = ()> = lock_api::RwLock<RawSharedMutex, T>;

/// 共享守卫
pub type SharedMutexReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawSharedMutex, T>;

/// 独占守卫
pub type SharedMutexWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawSharedMutex, T>;
