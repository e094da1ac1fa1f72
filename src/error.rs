//! 错误类型
//!
//! 竞争与超时都不是错误：等待是正常控制流，超时以 `false` 返回。
//! 这里只收录真正需要调用方处理的情况。

use std::fmt;
use std::io;

/// 运行时与指标模块的错误
#[derive(Debug)]
pub enum Error {
    /// 创建工作线程或定时器线程失败
    SpawnThread(io::Error),
    /// 分配协程栈失败
    StackAlloc(io::Error),
    /// 调度器已经关闭
    Shutdown,
    /// 直方图桶上界不是严格递增
    InvalidCeilings,
    /// 指标前缀非法
    InvalidPrefix(String),
    /// 指标名已被占用
    DuplicateName(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SpawnThread(e) => write!(f, "failed to spawn thread: {}", e),
            Error::StackAlloc(e) => write!(f, "failed to allocate task stack: {}", e),
            Error::Shutdown => write!(f, "scheduler has been shut down"),
            Error::InvalidCeilings => write!(f, "histogram ceilings must be strictly increasing"),
            Error::InvalidPrefix(p) => write!(f, "invalid metric prefix `{}`", p),
            Error::DuplicateName(n) => write!(f, "metric `{}` is already exposed", n),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SpawnThread(e) | Error::StackAlloc(e) => Some(e),
            _ => None,
        }
    }
}

/// 协程收到停止请求
///
/// 由可取消的睡眠返回，调用方应当把它当作干净的退出信号向上传播，不再重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

impl fmt::Display for Stopped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task was asked to stop")
    }
}

impl std::error::Error for Stopped {}

/// 等待协程结束时的错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// 协程体发生 panic，附带 panic 信息
    Panicked(String),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(msg) => write!(f, "task panicked: {}", msg),
        }
    }
}

impl std::error::Error for JoinError {}

pub type Result<T> = std::result::Result<T, Error>;
