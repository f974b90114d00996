//! JIT 代码/数据区
//!
//! 启动时保留一段连续的宿主地址范围 `[org, org + capacity)`，之后按页递增分配：
//! 游标只前进不后退，区段不会单独释放，只能通过 [`CodeArena::reset`] 整体作废。
//!
//! 代码区段提交为 读+写+执行；数据区段提交为 读+写，只读数据在链接完成后由
//! [`CodeArena::finalize_section`] 降为只读。

use std::fmt;
use std::ptr::NonNull;

use parking_lot::Mutex;
use vm_core::{JitError, JitResult, SectionKind};

use crate::sys::{self, Protection};

/// 已分配的区段
#[derive(Debug, Clone)]
pub struct Section {
    ptr: NonNull<u8>,
    len: usize,
    committed: usize,
    kind: SectionKind,
    id: u32,
}

impl Section {
    /// 区段起始地址
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// 区段起始地址（整数形式）
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// 请求的大小
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 实际提交的大小（整页）
    pub fn committed_len(&self) -> usize {
        self.committed
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// 区段内容
    ///
    /// # Safety
    /// 区段必须仍然可写（未被 finalize 为只读，arena 未 reset），
    /// 且没有正在执行的代码依赖这段内存。
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[derive(Debug, Default)]
struct ArenaState {
    /// 下一个空闲位置相对 `org` 的偏移，始终按页对齐
    cursor: usize,
    sections: usize,
}

/// 代码/数据区管理器
pub struct CodeArena {
    org: NonNull<u8>,
    capacity: usize,
    page_size: usize,
    state: Mutex<ArenaState>,
}

// 内部状态由互斥锁保护；org/capacity 构造后不变。
unsafe impl Send for CodeArena {}
unsafe impl Sync for CodeArena {}

impl fmt::Debug for CodeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CodeArena")
            .field("org", &self.org)
            .field("capacity", &self.capacity)
            .field("cursor", &state.cursor)
            .field("sections", &state.sections)
            .finish()
    }
}

impl CodeArena {
    /// 保留 `capacity` 字节（向上取整到宿主页）
    pub fn reserve(capacity: usize) -> JitResult<Self> {
        let page_size = sys::host_page_size();
        let capacity = capacity
            .max(1)
            .checked_next_multiple_of(page_size)
            .ok_or_else(|| JitError::Host {
                op: "reserve",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "arena capacity overflows the address space",
                ),
            })?;

        let org = sys::reserve(capacity).map_err(|source| {
            log::error!("failed to reserve {capacity} bytes for the code arena: {source}");
            JitError::Host { op: "reserve", source }
        })?;

        log::debug!(
            "code arena reserved at {:p}, {} bytes ({} byte pages)",
            org,
            capacity,
            page_size
        );

        Ok(Self {
            org,
            capacity,
            page_size,
            state: Mutex::new(ArenaState::default()),
        })
    }

    /// 区域起始地址
    pub fn origin(&self) -> *const u8 {
        self.org.as_ptr()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 区段对齐粒度
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// 下一个空闲地址
    pub fn cursor(&self) -> *const u8 {
        self.org.as_ptr().wrapping_add(self.state.lock().cursor)
    }

    /// 已使用字节数
    pub fn used(&self) -> usize {
        self.state.lock().cursor
    }

    /// 剩余字节数
    pub fn remaining(&self) -> usize {
        self.capacity - self.state.lock().cursor
    }

    /// 已分配区段数
    pub fn section_count(&self) -> usize {
        self.state.lock().sections
    }

    /// 地址是否位于本区域内
    pub fn contains(&self, addr: *const u8) -> bool {
        let start = self.org.as_ptr() as usize;
        let addr = addr as usize;
        addr >= start && addr < start + self.capacity
    }

    /// 分配可执行代码区段
    pub fn allocate_code_section(
        &self,
        size: usize,
        align: u32,
        id: u32,
        name: &str,
    ) -> JitResult<Section> {
        self.allocate(SectionKind::Code, size, align, id, name)
    }

    /// 分配数据区段
    pub fn allocate_data_section(
        &self,
        size: usize,
        align: u32,
        id: u32,
        name: &str,
        read_only: bool,
    ) -> JitResult<Section> {
        let kind = if read_only {
            SectionKind::ReadOnlyData
        } else {
            SectionKind::Data
        };
        self.allocate(kind, size, align, id, name)
    }

    fn allocate(
        &self,
        kind: SectionKind,
        size: usize,
        align: u32,
        id: u32,
        name: &str,
    ) -> JitResult<Section> {
        let size = size.max(1);
        let align = (align as usize).max(1).next_power_of_two().max(self.page_size);

        let mut state = self.state.lock();
        let remaining = self.capacity - state.cursor;

        let bounds = state
            .cursor
            .checked_next_multiple_of(align)
            .and_then(|start| Some((start, start.checked_add(size)?)))
            .and_then(|(start, end)| Some((start, end.checked_next_multiple_of(self.page_size)?)))
            .filter(|&(_, end)| end <= self.capacity);

        let Some((start, end)) = bounds else {
            log::error!(
                "out of {kind} section memory: `{name}` (id {id}) requested {size} bytes, {remaining} of {} bytes left",
                self.capacity
            );
            return Err(JitError::AllocationExhausted {
                kind,
                name: name.to_string(),
                requested: size,
                remaining,
            });
        };

        let prot = match kind {
            SectionKind::Code => Protection::ReadWriteExecute,
            SectionKind::Data | SectionKind::ReadOnlyData => Protection::ReadWrite,
        };
        let ptr = self.org.as_ptr().wrapping_add(start);
        unsafe { sys::protect(ptr, end - start, prot) }.map_err(|source| {
            log::error!("failed to commit {kind} section `{name}` ({} bytes at {ptr:p}): {source}", end - start);
            JitError::Host { op: "commit", source }
        })?;

        state.cursor = end;
        state.sections += 1;

        log::trace!(
            "{kind} section `{name}` (id {id}): {size} bytes at {ptr:p}, cursor +{:#x}",
            end
        );

        Ok(Section {
            // org 非空且 start < capacity
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len: size,
            committed: end - start,
            kind,
            id,
        })
    }

    /// 区段内容写完后调用：代码刷新指令缓存，只读数据去掉写权限
    pub fn finalize_section(&self, section: &Section) -> JitResult<()> {
        debug_assert!(self.contains(section.as_ptr()));
        match section.kind {
            SectionKind::Code => sys::flush_icache(section.as_ptr(), section.len),
            SectionKind::ReadOnlyData => {
                unsafe { sys::protect(section.as_ptr(), section.committed, Protection::ReadOnly) }
                    .map_err(|source| {
                        log::error!(
                            "failed to seal rodata section {} at {:p}: {source}",
                            section.id,
                            section.as_ptr()
                        );
                        JitError::Host { op: "protect", source }
                    })?;
            }
            SectionKind::Data => {}
        }
        Ok(())
    }

    /// 作废所有区段并把游标回到起点
    ///
    /// # Safety
    /// 调用方保证本区域中的代码不会再被执行、数据不会再被访问。
    pub unsafe fn reset(&self) -> JitResult<()> {
        let mut state = self.state.lock();
        if state.cursor > 0 {
            unsafe { sys::decommit(self.org.as_ptr(), state.cursor) }.map_err(|source| {
                log::error!("failed to decommit code arena: {source}");
                JitError::Host { op: "decommit", source }
            })?;
        }
        log::debug!(
            "code arena at {:p} reset, {} sections ({} bytes) dropped",
            self.org,
            state.sections,
            state.cursor
        );
        *state = ArenaState::default();
        Ok(())
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        unsafe { sys::release(self.org.as_ptr(), self.capacity) };
    }
}
