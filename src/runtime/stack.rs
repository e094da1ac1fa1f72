//! 协程栈管理
//!
//! 每个协程拥有独立的栈，挂起时整条调用链原样保留在自己的栈上，
//! 因此深处的同步 `lock()` 调用也能让出载体线程。

use corosensei::stack::DefaultStack;

use crate::config::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::error::Error;

/// 页大小
const PAGE_SIZE: usize = 4096;

/// 协程栈大小
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSize(usize);

impl StackSize {
    /// 规范化栈大小：不小于最小值，并向上对齐到页
    pub fn new(bytes: usize) -> Self {
        let bytes = bytes.max(MIN_STACK_SIZE);
        let rounded = bytes
            .checked_add(PAGE_SIZE - 1)
            .map(|b| b & !(PAGE_SIZE - 1))
            .unwrap_or(usize::MAX & !(PAGE_SIZE - 1));
        Self(rounded)
    }

    /// 字节数
    #[inline]
    pub fn bytes(&self) -> usize {
        self.0
    }

    /// 分配一块协程栈
    pub(crate) fn allocate(&self) -> Result<DefaultStack, Error> {
        DefaultStack::new(self.0).map_err(Error::StackAlloc)
    }
}

impl Default for StackSize {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}
