//! 指标变量注册表
//!
//! 变量以名字注册一个取值函数，导出方按名字读取。

use std::sync::OnceLock;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Error;

/// 取值函数
pub type Getter = Box<dyn Fn() -> i64 + Send + Sync>;

/// 进程级注册表
static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// 获取进程级注册表
pub fn global_registry() -> &'static Registry {
    GLOBAL_REGISTRY.get_or_init(Registry::new)
}

/// 指标变量注册表
#[derive(Default)]
pub struct Registry {
    vars: DashMap<String, Getter>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册变量，名字已被占用时失败
    pub fn expose(&self, name: &str, getter: Getter) -> Result<(), Error> {
        match self.vars.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateName(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(getter);
                Ok(())
            }
        }
    }

    /// 注销变量，返回它是否存在
    pub fn hide(&self, name: &str) -> bool {
        self.vars.remove(name).is_some()
    }

    /// 读取变量当前值
    pub fn get(&self, name: &str) -> Option<i64> {
        self.vars.get(name).map(|getter| (getter.value())())
    }

    /// 是否已注册
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// 按名字排序的所有变量当前值
    pub fn dump(&self) -> Vec<(String, i64)> {
        let mut out: Vec<_> = self
            .vars
            .iter()
            .map(|entry| (entry.key().clone(), (entry.value())()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_expose_get_hide() {
        let registry = Registry::new();
        let value = Arc::new(AtomicI64::new(3));
        let v = Arc::clone(&value);
        registry
            .expose("requests", Box::new(move || v.load(Ordering::Relaxed)))
            .unwrap();

        assert_eq!(registry.get("requests"), Some(3));
        value.store(9, Ordering::Relaxed);
        assert_eq!(registry.get("requests"), Some(9));

        assert!(registry.hide("requests"));
        assert!(!registry.hide("requests"));
        assert_eq!(registry.get("requests"), None);
    }

    #[test]
    fn test_duplicate_name() {
        let registry = Registry::new();
        registry.expose("a", Box::new(|| 1)).unwrap();
        assert!(matches!(
            registry.expose("a", Box::new(|| 2)),
            Err(Error::DuplicateName(name)) if name == "a"
        ));
        assert_eq!(registry.get("a"), Some(1));
    }

    #[test]
    fn test_dump_sorted() {
        let registry = Registry::new();
        registry.expose("b", Box::new(|| 2)).unwrap();
        registry.expose("a", Box::new(|| 1)).unwrap();
        assert_eq!(registry.dump(), vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    }
}
