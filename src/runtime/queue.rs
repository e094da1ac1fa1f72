//! 运行队列
//!
//! 本地队列由工作线程独占 push/pop，其他线程通过 [`Stealer`] 从尾部窃取；
//! 全局队列接收来自非工作线程（或其他调度器线程）的唤醒。

use std::sync::Arc;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

use super::task::Task;

/// 本地运行队列
///
/// - 拥有者 push/pop（LIFO，刚唤醒的协程缓存更热）
/// - 其他线程通过 `stealer()` 取得的句柄从另一端窃取
pub struct LocalQueue {
    inner: Worker<Arc<Task>>,
}

impl LocalQueue {
    /// 创建新的本地队列
    pub fn new() -> Self {
        Self { inner: Worker::new_lifo() }
    }

    /// 获取窃取句柄
    pub fn stealer(&self) -> Stealer<Arc<Task>> {
        self.inner.stealer()
    }

    /// 队列长度
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 推入协程（仅拥有者调用）
    pub fn push(&self, task: Arc<Task>) {
        self.inner.push(task);
    }

    /// 弹出协程（仅拥有者调用）
    pub fn pop(&self) -> Option<Arc<Task>> {
        self.inner.pop()
    }

    /// 从全局队列批量搬运一部分到本地并弹出一个
    pub fn refill_from(&self, global: &GlobalQueue, batch: usize) -> Option<Arc<Task>> {
        loop {
            match global.inner.steal_batch_with_limit_and_pop(&self.inner, batch) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// 从别的处理器窃取一半并弹出一个
    pub fn steal_from(&self, victim: &Stealer<Arc<Task>>) -> Option<Arc<Task>> {
        loop {
            match victim.steal_batch_and_pop(&self.inner) {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// 全局队列
pub struct GlobalQueue {
    inner: Injector<Arc<Task>>,
}

impl GlobalQueue {
    /// 创建新的全局队列
    pub fn new() -> Self {
        Self { inner: Injector::new() }
    }

    /// 队列长度
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// 是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 推入协程
    pub fn push(&self, task: Arc<Task>) {
        self.inner.push(task);
    }

    /// 弹出协程
    pub fn pop(&self) -> Option<Arc<Task>> {
        loop {
            match self.inner.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }
}

impl Default for GlobalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_task(id: u64) -> Arc<Task> {
        Arc::new(Task::detached_for_test(id))
    }

    #[test]
    fn test_local_queue_push_pop() {
        let queue = LocalQueue::new();

        queue.push(make_test_task(1));
        queue.push(make_test_task(2));
        assert_eq!(queue.len(), 2);

        let popped = queue.pop().unwrap();
        assert_eq!(popped.id, 2); // LIFO

        let popped = queue.pop().unwrap();
        assert_eq!(popped.id, 1);

        assert!(queue.is_empty());
    }

    #[test]
    fn test_local_queue_steal() {
        let victim = LocalQueue::new();
        for i in 0..10 {
            victim.push(make_test_task(i));
        }

        let thief = LocalQueue::new();
        let stolen = thief.steal_from(&victim.stealer()).unwrap();
        assert!(stolen.id < 10);
        assert!(victim.len() < 10);
        assert_eq!(victim.len() + thief.len() + 1, 10);
    }

    #[test]
    fn test_global_queue() {
        let queue = GlobalQueue::new();

        queue.push(make_test_task(1));
        queue.push(make_test_task(2));
        assert_eq!(queue.len(), 2);

        let task = queue.pop().unwrap();
        assert_eq!(task.id, 1); // FIFO
    }

    #[test]
    fn test_refill_from_global() {
        let global = GlobalQueue::new();
        for i in 0..8 {
            global.push(make_test_task(i));
        }

        let local = LocalQueue::new();
        assert!(local.refill_from(&global, 4).is_some());
        assert_eq!(local.len() + global.len(), 7);
        assert!(local.len() <= 4);
    }
}
