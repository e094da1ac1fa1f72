//! 延迟指标
//!
//! 记录路径只有原子操作，可以在协程和原生线程中直接调用，不会阻塞载体线程。

pub mod histogram;
pub mod recorder;
pub mod registry;
pub mod window;

pub use histogram::{Histogram, DEFAULT_CEILINGS, NUM_BUCKETS};
pub use recorder::LatencyHistogramRecorder;
pub use registry::{global_registry, Getter, Registry};
pub use window::{Window, WindowSample};
