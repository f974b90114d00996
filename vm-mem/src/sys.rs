//! 宿主虚拟内存原语：保留、提交/改保护、回收、指令缓存刷新

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// 页面保护属性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// 不可访问（仅保留）
    None,
    ReadOnly,
    ReadWrite,
    ReadWriteExecute,
}

/// 宿主页大小
pub fn host_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(imp::page_size)
}

/// 保留 `len` 字节地址空间，不提交物理内存
pub(crate) fn reserve(len: usize) -> io::Result<NonNull<u8>> {
    imp::reserve(len)
}

/// 提交并设置保护属性
///
/// # Safety
/// `ptr..ptr+len` 必须位于 [`reserve`] 返回的范围内且按页对齐。
pub(crate) unsafe fn protect(ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
    unsafe { imp::protect(ptr, len, prot) }
}

/// 撤销提交，保留地址空间
///
/// # Safety
/// 同 [`protect`]；调用后该范围内的内容不再有效。
pub(crate) unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
    unsafe { imp::decommit(ptr, len) }
}

/// 释放整段保留
///
/// # Safety
/// `ptr`/`len` 必须与 [`reserve`] 的结果一致，且之后不再访问。
pub(crate) unsafe fn release(ptr: *mut u8, len: usize) {
    unsafe { imp::release(ptr, len) }
}

/// 写入代码后使指令缓存失效
pub(crate) fn flush_icache(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        use std::arch::asm;

        let ctr: u64;
        asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nomem, nostack));
        let dline = 4usize << ((ctr >> 16) & 0xf);
        let iline = 4usize << (ctr & 0xf);

        let start = ptr as usize;
        let end = start + len;

        let mut addr = start & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {0}", in(reg) addr, options(nostack));
            addr += dline;
        }
        asm!("dsb ish", options(nostack));

        let mut addr = start & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {0}", in(reg) addr, options(nostack));
            addr += iline;
        }
        asm!("dsb ish", options(nostack));
        asm!("isb", options(nostack));
    }

    #[cfg(target_arch = "riscv64")]
    unsafe {
        std::arch::asm!("fence.i", options(nostack));
    }

    // x86_64 的指令缓存与数据缓存保持一致
    #[cfg(not(any(target_arch = "aarch64", target_arch = "riscv64")))]
    let _ = ptr;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp {
            use super::Protection;
            use std::io;
            use std::ptr::{self, NonNull};

            #[cfg(target_os = "linux")]
            const RESERVE_FLAGS: libc::c_int =
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            #[cfg(not(target_os = "linux"))]
            const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            fn native(prot: Protection) -> libc::c_int {
                match prot {
                    Protection::None => libc::PROT_NONE,
                    Protection::ReadOnly => libc::PROT_READ,
                    Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
                    Protection::ReadWriteExecute => {
                        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
                    }
                }
            }

            pub(super) fn page_size() -> usize {
                let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                if size <= 0 { 4096 } else { size as usize }
            }

            pub(super) fn reserve(len: usize) -> io::Result<NonNull<u8>> {
                let ptr = unsafe {
                    libc::mmap(ptr::null_mut(), len, libc::PROT_NONE, RESERVE_FLAGS, -1, 0)
                };
                if ptr == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
            }

            pub(super) unsafe fn protect(ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
                let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, len, native(prot)) };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }

            pub(super) unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
                unsafe {
                    protect(ptr, len, Protection::None)?;
                    if libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTNEED) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            }

            pub(super) unsafe fn release(ptr: *mut u8, len: usize) {
                unsafe {
                    libc::munmap(ptr as *mut libc::c_void, len);
                }
            }
        }
    } else if #[cfg(windows)] {
        mod imp {
            use super::Protection;
            use std::io;
            use std::mem::MaybeUninit;
            use std::ptr::{self, NonNull};
            use windows_sys::Win32::System::Memory::{
                MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
                PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, VirtualAlloc,
                VirtualFree, VirtualProtect,
            };
            use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

            fn native(prot: Protection) -> PAGE_PROTECTION_FLAGS {
                match prot {
                    Protection::None => PAGE_NOACCESS,
                    Protection::ReadOnly => PAGE_READONLY,
                    Protection::ReadWrite => PAGE_READWRITE,
                    Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
                }
            }

            pub(super) fn page_size() -> usize {
                let mut info = MaybeUninit::<SYSTEM_INFO>::zeroed();
                unsafe {
                    GetSystemInfo(info.as_mut_ptr());
                    info.assume_init().dwPageSize as usize
                }
            }

            pub(super) fn reserve(len: usize) -> io::Result<NonNull<u8>> {
                let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
                NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)
            }

            pub(super) unsafe fn protect(ptr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
                if prot == Protection::None {
                    return unsafe { decommit(ptr, len) };
                }
                unsafe {
                    if VirtualAlloc(ptr as *const _, len, MEM_COMMIT, native(prot)).is_null() {
                        return Err(io::Error::last_os_error());
                    }
                    let mut old = 0;
                    if VirtualProtect(ptr as *const _, len, native(prot), &mut old) == 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            }

            pub(super) unsafe fn decommit(ptr: *mut u8, len: usize) -> io::Result<()> {
                if unsafe { VirtualFree(ptr as *mut _, len, MEM_DECOMMIT) } == 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }

            pub(super) unsafe fn release(ptr: *mut u8, _len: usize) {
                unsafe {
                    VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
                }
            }
        }
    } else {
        compile_error!("Unsupported platform for the JIT code arena");
    }
}
