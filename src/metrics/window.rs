//! 按秒分槽的滑动窗口
//!
//! 每个槽记录某一秒内样本的和、个数与最大值。窗口长度为 `n` 秒时保留
//! `n + 1` 个槽：最近 `n` 个完整秒加上当前这一秒。

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::{Backoff, CachePadded};

/// 槽尚未使用
const EMPTY: u64 = 0;
/// 槽正在切换到新的一秒
const RESETTING: u64 = u64::MAX;

/// 一秒的统计，全部字段为原子量
///
/// `tag` 是秒序号加一（相对窗口创建时间），`EMPTY` 表示从未写入。
struct Slot {
    tag: AtomicU64,
    sum: AtomicI64,
    num: AtomicU64,
    max: AtomicI64,
}

impl Slot {
    fn new() -> Self {
        Self {
            tag: AtomicU64::new(EMPTY),
            sum: AtomicI64::new(0),
            num: AtomicU64::new(0),
            max: AtomicI64::new(i64::MIN),
        }
    }

    /// 确保槽属于 `tag` 对应的一秒，必要时由一个线程负责清零
    fn claim(&self, tag: u64) {
        let backoff = Backoff::new();
        loop {
            let current = self.tag.load(Ordering::Acquire);
            if current == tag {
                return;
            }
            if current == RESETTING {
                backoff.snooze();
                continue;
            }
            if self
                .tag
                .compare_exchange(current, RESETTING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.sum.store(0, Ordering::Relaxed);
                self.num.store(0, Ordering::Relaxed);
                self.max.store(i64::MIN, Ordering::Relaxed);
                self.tag.store(tag, Ordering::Release);
                return;
            }
        }
    }
}

/// 窗口内的统计结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSample {
    pub sum: i64,
    pub num: u64,
    pub max: i64,
    /// 样本覆盖的时间跨度
    pub span: Duration,
}

impl WindowSample {
    /// 平均值，无样本时为 0
    pub fn average(&self) -> i64 {
        if self.num == 0 {
            0
        } else {
            self.sum / self.num as i64
        }
    }

    /// 每秒样本数（四舍五入）
    pub fn per_second(&self) -> i64 {
        let secs = self.span.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        // 浮点运算避免溢出
        (self.num as f64 / secs).round() as i64
    }
}

/// 滑动窗口
///
/// 记录路径只有原子操作，不会阻塞调用线程；跨秒切换时新一秒的第一个
/// 写入者负责清零槽，其他写入者短暂自旋等它完成。
pub struct Window {
    slots: Box<[CachePadded<Slot>]>,
    window_secs: u64,
    start: Instant,
}

impl Window {
    /// 创建长度为 `window_secs` 秒的窗口（至少 1 秒）
    pub fn new(window_secs: u64) -> Self {
        let window_secs = window_secs.max(1);
        let slots = (0..=window_secs).map(|_| CachePadded::new(Slot::new())).collect();
        Self {
            slots,
            window_secs,
            start: Instant::now(),
        }
    }

    /// 窗口长度（秒）
    pub fn window_size(&self) -> u64 {
        self.window_secs
    }

    fn slot_for(&self, second: u64) -> &Slot {
        &self.slots[(second % self.slots.len() as u64) as usize]
    }

    /// 记录一个样本
    pub fn record(&self, value: i64) {
        let second = self.start.elapsed().as_secs();
        let slot = self.slot_for(second);
        slot.claim(second + 1);
        slot.sum.fetch_add(value, Ordering::Relaxed);
        slot.max.fetch_max(value, Ordering::Relaxed);
        slot.num.fetch_add(1, Ordering::Release);
    }

    /// 最近 `secs` 秒（超过窗口长度时按窗口长度）的统计
    pub fn sample(&self, secs: u64) -> WindowSample {
        let secs = secs.clamp(1, self.window_secs);
        let now = self.start.elapsed();
        let current = now.as_secs();
        let lowest = current.saturating_sub(secs);

        let mut sample = WindowSample {
            sum: 0,
            num: 0,
            max: 0,
            span: now - Duration::from_secs(lowest),
        };
        for slot in self.slots.iter() {
            let tag = slot.tag.load(Ordering::Acquire);
            if tag == EMPTY || tag == RESETTING {
                continue;
            }
            let second = tag - 1;
            if second < lowest || second > current {
                continue;
            }
            let num = slot.num.load(Ordering::Acquire);
            if num == 0 {
                continue;
            }
            let max = slot.max.load(Ordering::Relaxed);
            sample.max = if sample.num == 0 { max } else { sample.max.max(max) };
            sample.sum = sample.sum.saturating_add(slot.sum.load(Ordering::Relaxed));
            sample.num += num;
        }
        sample
    }

    /// 整个窗口的统计
    pub fn sample_all(&self) -> WindowSample {
        self.sample(self.window_secs)
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("window_secs", &self.window_secs)
            .field("sample", &self.sample_all())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_window() {
        let w = Window::new(10);
        let s = w.sample_all();
        assert_eq!(s.num, 0);
        assert_eq!(s.average(), 0);
        assert_eq!(s.max, 0);
    }

    #[test]
    fn test_sum_num_max() {
        let w = Window::new(5);
        for v in [10, 30, 20] {
            w.record(v);
        }
        let s = w.sample_all();
        assert_eq!(s.num, 3);
        assert_eq!(s.sum, 60);
        assert_eq!(s.max, 30);
        assert_eq!(s.average(), 20);
        assert!(s.per_second() >= 3);
    }

    #[test]
    fn test_zero_window_is_clamped() {
        let w = Window::new(0);
        assert_eq!(w.window_size(), 1);
        w.record(1);
        assert_eq!(w.sample(0).num, 1);
    }

    #[test]
    fn test_slot_claim_resets_stale_second() {
        let slot = Slot::new();
        slot.claim(1);
        slot.sum.fetch_add(40, Ordering::Relaxed);
        slot.max.fetch_max(40, Ordering::Relaxed);
        slot.num.fetch_add(1, Ordering::Relaxed);

        // 同一秒再次认领不清零
        slot.claim(1);
        assert_eq!(slot.num.load(Ordering::Relaxed), 1);

        // 槽被复用到后面的某一秒时清零
        slot.claim(12);
        assert_eq!(slot.tag.load(Ordering::Relaxed), 12);
        assert_eq!(slot.num.load(Ordering::Relaxed), 0);
        assert_eq!(slot.sum.load(Ordering::Relaxed), 0);
        assert_eq!(slot.max.load(Ordering::Relaxed), i64::MIN);
    }

    #[test]
    fn test_concurrent_record() {
        let w = Arc::new(Window::new(60));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let w = Arc::clone(&w);
                thread::spawn(move || {
                    for i in 0..1000 {
                        w.record(t * 1000 + i);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let s = w.sample_all();
        assert_eq!(s.num, 8000);
        assert_eq!(s.max, 7999);
        assert_eq!(s.sum, (0..8000i64).sum::<i64>());
    }

    #[test]
    fn test_per_second_rounding() {
        let s = WindowSample {
            sum: 0,
            num: 3,
            max: 0,
            span: Duration::from_millis(2000),
        };
        assert_eq!(s.per_second(), 2);
        let empty = WindowSample { span: Duration::ZERO, ..s };
        assert_eq!(empty.per_second(), 0);
    }
}
