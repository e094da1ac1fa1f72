//! 延迟直方图记录器
//!
//! 一次记录同时写入：累计和/个数、按秒滑动窗口（平均延迟、QPS、最大延迟）、
//! 固定桶直方图。`expose` 后在全局注册表中以扁平名字导出：
//!
//! ```text
//! <prefix>_latency            窗口内平均延迟
//! <prefix>_max_latency        窗口内最大延迟
//! <prefix>_count              累计样本数
//! <prefix>_qps                最近一秒的 QPS
//! <prefix>_latency_bucket_N   第 N 个桶的计数 (N = 0..9)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::histogram::{Histogram, NUM_BUCKETS};
use super::registry::{global_registry, Getter};
use super::window::Window;
use crate::config::DEFAULT_WINDOW_SECS;
use crate::error::Error;

struct RecorderInner {
    sum: AtomicI64,
    num: AtomicU64,
    window: Window,
    histogram: Histogram,
}

impl RecorderInner {
    fn qps(&self, secs: u64) -> i64 {
        self.window.sample(secs).per_second()
    }
}

/// 延迟记录器
///
/// 丢弃时自动从注册表中注销。
pub struct LatencyHistogramRecorder {
    inner: Arc<RecorderInner>,
    exposed: Mutex<Vec<String>>,
}

impl LatencyHistogramRecorder {
    /// 使用默认窗口长度创建
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW_SECS)
    }

    /// 指定窗口长度（秒），0 表示默认值
    pub fn with_window(window_secs: u64) -> Self {
        let window_secs = if window_secs == 0 { DEFAULT_WINDOW_SECS } else { window_secs };
        Self {
            inner: Arc::new(RecorderInner {
                sum: AtomicI64::new(0),
                num: AtomicU64::new(0),
                window: Window::new(window_secs),
                histogram: Histogram::new(),
            }),
            exposed: Mutex::new(Vec::new()),
        }
    }

    /// 记录一次延迟
    ///
    /// 负数样本打印告警后整体丢弃，不影响已有统计。
    pub fn record(&self, latency: i64) {
        if !self.inner.histogram.record(latency) {
            return;
        }
        self.inner.sum.fetch_add(latency, Ordering::Relaxed);
        self.inner.num.fetch_add(1, Ordering::Relaxed);
        self.inner.window.record(latency);
    }

    /// 窗口长度（秒）
    pub fn window_size(&self) -> u64 {
        self.inner.window.window_size()
    }

    /// 窗口内的平均延迟
    pub fn latency(&self) -> i64 {
        self.inner.window.sample_all().average()
    }

    /// 最近 `secs` 秒的平均延迟
    pub fn latency_in(&self, secs: u64) -> i64 {
        self.inner.window.sample(secs).average()
    }

    /// 窗口内的最大延迟
    pub fn max_latency(&self) -> i64 {
        self.inner.window.sample_all().max
    }

    /// 累计样本数
    pub fn count(&self) -> u64 {
        self.inner.num.load(Ordering::Relaxed)
    }

    /// 累计平均延迟
    pub fn total_average(&self) -> i64 {
        match self.count() {
            0 => 0,
            n => self.inner.sum.load(Ordering::Relaxed) / n as i64,
        }
    }

    /// 最近一秒的 QPS
    pub fn qps(&self) -> i64 {
        self.inner.qps(1)
    }

    /// 最近 `secs` 秒的 QPS
    pub fn qps_in(&self, secs: u64) -> i64 {
        self.inner.qps(secs)
    }

    /// 第 `i` 个桶的计数
    pub fn latency_bucket(&self, i: usize) -> u64 {
        self.inner.histogram.get_value(i)
    }

    /// 所有桶的计数
    pub fn latency_buckets(&self) -> [u64; NUM_BUCKETS] {
        self.inner.histogram.values()
    }

    /// 以 `prefix` 为前缀导出
    pub fn expose(&self, prefix: &str) -> Result<(), Error> {
        self.expose_as("", prefix)
    }

    /// 以 `prefix1_prefix2` 为前缀导出
    ///
    /// `prefix2` 末尾的 `latency`/`Latency` 会被去掉。重复导出时先注销旧名字；
    /// 任何一个名字注册失败都会撤销本次已注册的名字。
    pub fn expose_as(&self, prefix1: &str, prefix2: &str) -> Result<(), Error> {
        let prefix = build_prefix(prefix1, prefix2).map_err(|e| {
            log::error!("{}", e);
            e
        })?;

        self.hide();
        let registry = global_registry();
        let mut exposed = self.exposed.lock();
        for (suffix, getter) in self.getters() {
            let name = join_name(&prefix, &suffix);
            if let Err(e) = registry.expose(&name, getter) {
                log::warn!("failed to expose `{}': {}", name, e);
                for old in exposed.drain(..) {
                    registry.hide(&old);
                }
                return Err(e);
            }
            exposed.push(name);
        }
        drop(exposed);

        self.inner.histogram.set_debug_name(&prefix);
        Ok(())
    }

    /// 注销所有已导出的名字
    pub fn hide(&self) {
        let registry = global_registry();
        for name in self.exposed.lock().drain(..) {
            registry.hide(&name);
        }
    }

    /// 已导出的名字
    pub fn exposed_names(&self) -> Vec<String> {
        self.exposed.lock().clone()
    }

    fn getters(&self) -> Vec<(String, Getter)> {
        let mut getters: Vec<(String, Getter)> = Vec::with_capacity(4 + NUM_BUCKETS);

        let inner = Arc::clone(&self.inner);
        getters.push(("latency".into(), Box::new(move || inner.window.sample_all().average())));
        let inner = Arc::clone(&self.inner);
        getters.push(("max_latency".into(), Box::new(move || inner.window.sample_all().max)));
        let inner = Arc::clone(&self.inner);
        getters.push((
            "count".into(),
            Box::new(move || inner.num.load(Ordering::Relaxed) as i64),
        ));
        let inner = Arc::clone(&self.inner);
        getters.push(("qps".into(), Box::new(move || inner.qps(1))));

        for i in 0..NUM_BUCKETS {
            let inner = Arc::clone(&self.inner);
            getters.push((
                format!("latency_bucket_{}", i),
                Box::new(move || inner.histogram.get_value(i) as i64),
            ));
        }
        getters
    }
}

impl Default for LatencyHistogramRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LatencyHistogramRecorder {
    fn drop(&mut self) {
        self.hide();
    }
}

impl fmt::Display for LatencyHistogramRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{latency={} max{}={} qps={} count={}}}",
            self.latency(),
            self.window_size(),
            self.max_latency(),
            self.qps(),
            self.count()
        )
    }
}

impl fmt::Debug for LatencyHistogramRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 拼接导出前缀
fn build_prefix(prefix1: &str, prefix2: &str) -> Result<String, Error> {
    if prefix2.is_empty() {
        return Err(Error::InvalidPrefix(prefix2.to_string()));
    }
    let stripped = prefix2
        .strip_suffix("latency")
        .or_else(|| prefix2.strip_suffix("Latency"))
        .unwrap_or(prefix2);
    if stripped.is_empty() {
        return Err(Error::InvalidPrefix(prefix2.to_string()));
    }
    if prefix1.is_empty() {
        Ok(stripped.to_string())
    } else {
        Ok(join_name(prefix1, stripped))
    }
}

/// 以 `_` 连接，前半段已以 `_` 结尾时不重复
fn join_name(prefix: &str, name: &str) -> String {
    if prefix.ends_with('_') {
        format!("{}{}", prefix, name)
    } else {
        format!("{}_{}", prefix, name)
    }
}
