//! 命名服务轮询
//!
//! 周期性地从命名服务拉取服务器列表并交给回调。轮询运行在协程里，
//! 所在协程收到停止请求时在下一次睡眠处干净地退出。

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::{DEFAULT_POLLING_INTERVAL, DEFAULT_RETRY_INTERVAL};
use crate::runtime;

/// 服务器节点
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerNode {
    pub addr: SocketAddr,
    pub tag: String,
}

impl ServerNode {
    pub fn new(addr: SocketAddr, tag: impl Into<String>) -> Self {
        Self {
            addr,
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ServerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag.is_empty() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}({})", self.addr, self.tag)
        }
    }
}

/// 拉取服务器列表失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    /// 命名服务不可达
    Unavailable(String),
    /// 返回内容无法解析
    InvalidResponse(String),
}

impl fmt::Display for NamingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamingError::Unavailable(msg) => write!(f, "naming service unavailable: {}", msg),
            NamingError::InvalidResponse(msg) => write!(f, "invalid naming service response: {}", msg),
        }
    }
}

impl std::error::Error for NamingError {}

/// 命名服务后端
pub trait NamingService {
    /// 拉取 `service_name` 当前的服务器列表
    fn get_servers(&mut self, service_name: &str) -> Result<Vec<ServerNode>, NamingError>;
}

/// 接收服务器列表的一方
pub trait NamingServiceActions {
    /// 用新列表整体替换旧列表
    fn reset_servers(&self, servers: &[ServerNode]);
}

/// 轮询参数
#[derive(Debug, Clone)]
pub struct PollingOptions {
    /// 两次拉取之间的间隔
    pub polling_interval: Duration,
    /// 拉取失败后的额外等待
    pub retry_interval: Duration,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// 运行轮询循环，直到所在协程收到停止请求
///
/// 第一次拉取即使失败也会以空列表调用一次 `reset_servers`，
/// 让等待首批结果的调用方不会永远阻塞。在原生线程上调用时永不返回。
pub fn run_naming_service<S, A>(service: &mut S, service_name: &str, actions: &A, options: &PollingOptions)
where
    S: NamingService + ?Sized,
    A: NamingServiceActions + ?Sized,
{
    let mut ever_reset = false;
    loop {
        let result = service.get_servers(service_name);
        if runtime::is_stopped() {
            log::debug!("quit naming service loop of `{}'", service_name);
            return;
        }
        match result {
            Ok(servers) => {
                ever_reset = true;
                actions.reset_servers(&servers);
            }
            Err(e) => {
                log::warn!("failed to get servers of `{}': {}", service_name, e);
                if !ever_reset {
                    ever_reset = true;
                    actions.reset_servers(&[]);
                }
                let retry = options.retry_interval.max(Duration::from_millis(1));
                if runtime::sleep(retry).is_err() {
                    log::debug!("quit naming service loop of `{}'", service_name);
                    return;
                }
            }
        }
        if runtime::sleep(options.polling_interval).is_err() {
            log::debug!("quit naming service loop of `{}'", service_name);
            return;
        }
    }
}
