//! 睡眠、让出与截止时间

use std::thread;
use std::time::{Duration, Instant};

use super::context;
use super::park::{WaitNode, WaitStatus};
use super::task::Suspend;
use crate::error::Stopped;

/// 计算 `now + timeout`
///
/// 结果无法表示时返回 `None`，调用方按不限时处理。
#[inline]
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// 睡眠指定时长
///
/// 协程睡眠时只挂起自己；收到停止请求（睡眠前或睡眠中）立即返回 `Err(Stopped)`。
/// 原生线程直接阻塞，不会被停止。
pub fn sleep(duration: Duration) -> Result<(), Stopped> {
    if !context::in_task() {
        thread::sleep(duration);
        return Ok(());
    }

    let node = WaitNode::for_current();
    match node.wait(deadline_after(duration), true) {
        WaitStatus::Stopped => Err(Stopped),
        WaitStatus::TimedOut | WaitStatus::Notified => Ok(()),
    }
}

/// 让出执行权
///
/// 协程重新入队，载体线程先运行其他协程；原生线程调用 `std::thread::yield_now`。
pub fn yield_now() {
    match context::current_task() {
        Some(task) => task.suspend(Suspend::Yield),
        None => thread::yield_now(),
    }
}

/// 当前协程是否收到停止请求（原生线程总是 `false`）
pub fn is_stopped() -> bool {
    context::current_task().map_or(false, |t| t.is_stopped())
}
