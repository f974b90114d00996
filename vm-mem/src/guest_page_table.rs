//! 客户机页表
//!
//! 单级稀疏表：页索引（地址 >> 12）-> 该页在宿主内存中的基址。
//! 空项表示该页尚未提交。表由客户机内存子系统维护，
//! 编译后的代码只读取 [`GuestPageTable::as_ptr`] 指向的数组。

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use vm_core::{
    GUEST_PAGE_COUNT, GUEST_PAGE_MASK, GUEST_PAGE_SIZE, GuestAddr, JitError, JitResult, page_index,
    page_offset,
};

/// 客户机页表
pub struct GuestPageTable {
    entries: Box<[AtomicPtr<u8>]>,
}

impl GuestPageTable {
    /// 创建覆盖整个 32 位地址空间的空页表
    pub fn new() -> Self {
        let entries = (0..GUEST_PAGE_COUNT)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self { entries }
    }

    /// 生成代码使用的表基址（`*mut u8` 数组）
    pub fn as_ptr(&self) -> *const *mut u8 {
        // AtomicPtr<u8> 与 *mut u8 内存布局相同
        self.entries.as_ptr() as *const *mut u8
    }

    /// 表项数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 映射一页
    pub fn map(&self, index: usize, host: NonNull<u8>) -> JitResult<()> {
        let entry = self.entries.get(index).ok_or_else(|| {
            JitError::InvalidAddress(format!("page index {index:#x} outside the guest address space"))
        })?;
        entry.store(host.as_ptr(), Ordering::Release);
        Ok(())
    }

    /// 把一段宿主内存映射到从 `addr` 开始的连续客户机页
    ///
    /// `addr` 与 `len` 都必须按客户机页对齐。
    pub fn map_range(&self, addr: GuestAddr, host: NonNull<u8>, len: usize) -> JitResult<()> {
        if addr & GUEST_PAGE_MASK != 0 || len % GUEST_PAGE_SIZE != 0 {
            log::error!("unaligned guest mapping: {addr:#010x} + {len:#x}");
            return Err(JitError::InvalidAddress(format!(
                "guest mapping {addr:#010x} + {len:#x} is not page aligned"
            )));
        }

        let first = page_index(addr);
        let pages = len / GUEST_PAGE_SIZE;
        if first + pages > self.entries.len() {
            return Err(JitError::InvalidAddress(format!(
                "guest mapping {addr:#010x} + {len:#x} wraps the address space"
            )));
        }

        for i in 0..pages {
            let base = host.as_ptr().wrapping_add(i * GUEST_PAGE_SIZE);
            self.entries[first + i].store(base, Ordering::Release);
        }
        log::trace!("mapped guest {addr:#010x}..+{len:#x} -> {host:p}");
        Ok(())
    }

    /// 撤销一页映射
    pub fn unmap(&self, index: usize) {
        if let Some(entry) = self.entries.get(index) {
            entry.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// 读取页表项
    pub fn entry(&self, index: usize) -> Option<NonNull<u8>> {
        self.entries
            .get(index)
            .and_then(|entry| NonNull::new(entry.load(Ordering::Acquire)))
    }

    /// 宿主侧地址转换，与生成代码的计算方式一致
    pub fn translate(&self, addr: GuestAddr) -> Option<*mut u8> {
        self.entry(page_index(addr))
            .map(|base| base.as_ptr().wrapping_add(page_offset(addr)))
    }

    /// 已映射的页数
    pub fn mapped_pages(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.load(Ordering::Relaxed).is_null())
            .count()
    }
}

impl Default for GuestPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GuestPageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestPageTable")
            .field("base", &self.as_ptr())
            .field("mapped_pages", &self.mapped_pages())
            .finish()
    }
}
