//! 固定桶延迟直方图
//!
//! 桶计数器在构造时一次性分配，记录只做一次原子加法。

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::HISTOGRAM_BUCKETS;
use crate::error::Error;

/// 桶数量
pub const NUM_BUCKETS: usize = HISTOGRAM_BUCKETS;

/// 默认桶上界（含），单位与记录的延迟一致
pub const DEFAULT_CEILINGS: [i64; NUM_BUCKETS] =
    [1000, 2000, 3000, 4000, 5000, 6000, 7000, 8000, 9000, i64::MAX];

/// 延迟直方图
pub struct Histogram {
    ceilings: [i64; NUM_BUCKETS],
    buckets: [AtomicU64; NUM_BUCKETS],
    /// 用于告警日志
    debug_name: RwLock<String>,
}

impl Histogram {
    /// 使用默认桶上界创建
    pub fn new() -> Self {
        Self {
            ceilings: DEFAULT_CEILINGS,
            buckets: Default::default(),
            debug_name: RwLock::new(String::new()),
        }
    }

    /// 使用自定义桶上界创建，上界必须严格递增
    pub fn with_ceilings(ceilings: [i64; NUM_BUCKETS]) -> Result<Self, Error> {
        if ceilings.windows(2).any(|w| w[0] >= w[1]) || ceilings[0] < 0 {
            return Err(Error::InvalidCeilings);
        }
        Ok(Self {
            ceilings,
            ..Self::new()
        })
    }

    /// 记录一个样本
    ///
    /// 负数或大于最后一个上界的样本打印告警后丢弃，返回 `false`。
    pub fn record(&self, value: i64) -> bool {
        if value < 0 {
            log::warn!("input={} to {} is negative, drop", value, self.describe());
            return false;
        }
        match self.ceilings.iter().position(|&c| value <= c) {
            Some(i) => {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                log::warn!("input={} to {} is out of range, drop", value, self.describe());
                false
            }
        }
    }

    /// 第 `i` 个桶的计数，越界返回 0
    pub fn get_value(&self, i: usize) -> u64 {
        self.buckets.get(i).map_or(0, |b| b.load(Ordering::Relaxed))
    }

    /// 所有桶的计数
    pub fn values(&self) -> [u64; NUM_BUCKETS] {
        std::array::from_fn(|i| self.get_value(i))
    }

    /// 已记录的样本总数
    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// 桶上界
    pub fn ceilings(&self) -> &[i64; NUM_BUCKETS] {
        &self.ceilings
    }

    /// 清空所有桶
    pub fn reset(&self) {
        for b in &self.buckets {
            b.store(0, Ordering::Relaxed);
        }
    }

    pub fn set_debug_name(&self, name: &str) {
        *self.debug_name.write() = name.to_string();
    }

    fn describe(&self) -> String {
        let name = self.debug_name.read();
        if name.is_empty() {
            format!("Histogram({:p})", self)
        } else {
            format!("`{}'", name)
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Histogram")
            .field("name", &*self.debug_name.read())
            .field("values", &self.values())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buckets() {
        let h = Histogram::new();
        for v in [500, 1500, 9500, -5] {
            h.record(v);
        }
        assert_eq!(h.values(), [1, 1, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(h.count(), 3);
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        let h = Histogram::new();
        assert!(h.record(1000));
        assert!(h.record(0));
        assert!(h.record(1001));
        assert_eq!(h.get_value(0), 2);
        assert_eq!(h.get_value(1), 1);
        assert_eq!(h.get_value(NUM_BUCKETS), 0);
    }

    #[test]
    fn test_negative_sample_does_not_disturb_buckets() {
        let h = Histogram::new();
        h.set_debug_name("rpc_latency");
        h.record(2500);
        assert!(!h.record(-1));
        assert_eq!(h.values()[2], 1);
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn test_custom_ceilings() {
        let h = Histogram::with_ceilings([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
        assert!(h.record(10));
        assert!(!h.record(11));
        assert_eq!(h.count(), 1);

        assert!(matches!(
            Histogram::with_ceilings([1, 1, 3, 4, 5, 6, 7, 8, 9, 10]),
            Err(Error::InvalidCeilings)
        ));
    }

    #[test]
    fn test_reset() {
        let h = Histogram::new();
        h.record(1);
        h.record(100_000);
        h.reset();
        assert_eq!(h.count(), 0);
    }

    #[test]
    fn test_concurrent_record() {
        let h = std::sync::Arc::new(Histogram::new());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let h = std::sync::Arc::clone(&h);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        h.record(t * 1000 + i % 1000);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(h.count(), 4000);
    }
}
