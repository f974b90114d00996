//! 符号链接表
//!
//! 生成代码引用的运行时辅助函数按名称解析为宿主地址。
//! 解析结果在首次成功后永久缓存；每个名称的查询与填充在该名称的槽位锁内完成，
//! 因此同一名称并发解析时底层提供者最多被调用一次。

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use vm_core::{JitError, JitResult};

/// 宿主符号提供者
pub trait SymbolProvider: Send + Sync {
    /// 查找符号地址
    fn lookup(&self, name: &str) -> Option<usize>;
}

/// 通过动态链接器查找当前进程中的符号
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSymbolProvider;

impl SymbolProvider for HostSymbolProvider {
    #[cfg(unix)]
    fn lookup(&self, name: &str) -> Option<usize> {
        let cname = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
        (!addr.is_null()).then_some(addr as usize)
    }

    #[cfg(not(unix))]
    fn lookup(&self, name: &str) -> Option<usize> {
        let _ = CString::new(name).ok()?;
        None
    }
}

/// 解析失败时的缓存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissPolicy {
    /// 只缓存成功结果，失败的名称下次重新查询
    #[default]
    Retry,
    /// 失败结果同样永久缓存
    Memoize,
}

/// 单个名称的解析状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Entry {
    /// 尚未解析，或失败后等待重试
    #[default]
    Pending,
    Resolved(usize),
    /// 失败结果（仅 [`MissPolicy::Memoize`]）
    Missing,
}

type Slot = Arc<Mutex<Entry>>;

/// 符号链接表
///
/// 名称表的锁只用于取出该名称的槽位；查询提供者时持有的是槽位锁，
/// 所以不同名称可以并发解析，提供者也可以在查询中解析其他名称。
/// 提供者不能在查询中再次解析同一个名称。
pub struct LinkTable {
    provider: Box<dyn SymbolProvider>,
    policy: MissPolicy,
    entries: Mutex<HashMap<String, Slot>>,
}

impl fmt::Debug for LinkTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkTable")
            .field("policy", &self.policy)
            .field("entries", &self.len())
            .finish()
    }
}

impl LinkTable {
    pub fn new(provider: Box<dyn SymbolProvider>, policy: MissPolicy) -> Self {
        Self {
            provider,
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 使用 [`HostSymbolProvider`] 作为后备
    pub fn with_host_provider(policy: MissPolicy) -> Self {
        Self::new(Box::new(HostSymbolProvider), policy)
    }

    pub fn policy(&self) -> MissPolicy {
        self.policy
    }

    fn slot(&self, name: &str) -> Slot {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get(name) {
            return Arc::clone(slot);
        }
        let slot = Slot::default();
        entries.insert(name.to_string(), Arc::clone(&slot));
        slot
    }

    /// 预先登记运行时函数；覆盖之前的结果（包括缓存的失败）
    pub fn define(&self, name: &str, addr: usize) {
        log::trace!("link table: define `{name}` = {addr:#x}");
        *self.slot(name).lock() = Entry::Resolved(addr);
    }

    /// 解析符号
    pub fn resolve(&self, name: &str) -> JitResult<usize> {
        let slot = self.slot(name);
        let mut entry = slot.lock();

        match *entry {
            Entry::Resolved(addr) => return Ok(addr),
            Entry::Missing => {
                log::error!("symbol `{name}` not found (cached miss), linkage failed");
                return Err(JitError::linkage(name, "symbol not found (cached)"));
            }
            Entry::Pending => {}
        }

        match self.provider.lookup(name) {
            Some(addr) => {
                *entry = Entry::Resolved(addr);
                log::trace!("link table: resolved `{name}` = {addr:#x}");
                Ok(addr)
            }
            None => {
                if self.policy == MissPolicy::Memoize {
                    *entry = Entry::Missing;
                }
                log::error!("symbol `{name}` not found, linkage failed");
                Err(JitError::linkage(name, "symbol not found"))
            }
        }
    }

    /// 名称是否已有缓存（成功或失败）
    pub fn is_cached(&self, name: &str) -> bool {
        let Some(slot) = self.entries.lock().get(name).cloned() else {
            return false;
        };
        let entry = *slot.lock();
        entry != Entry::Pending
    }

    /// 缓存项数
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = self.entries.lock().values().cloned().collect();
        slots
            .iter()
            .filter(|slot| *slot.lock() != Entry::Pending)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
