//! # vm-core - 虚拟机核心类型
//!
//! ARM 动态二进制翻译器与执行调度器共享的基础定义。
//!
//! ## 主要组件
//!
//! - **地址类型**: [`GuestAddr`] 以及客户机页常量
//! - **CPU 上下文**: [`CpuContext`] 固定布局记录，[`CpuContextLayout`] 给出生成代码使用的字段偏移
//! - **块出口**: [`BlockExit`] 编译块返回值的编码
//! - **错误**: [`JitError`] 统一错误类型

pub mod error;
pub mod exit;
pub mod regs;

pub use error::{JitError, JitResult, SectionKind};
pub use exit::BlockExit;
pub use regs::{
    CPSR_C, CPSR_N, CPSR_T, CPSR_V, CPSR_Z, Condition, CpuContext, CpuContextLayout, REG_LR, REG_PC,
    REG_SP,
};

/// 客户机（32 位 ARM）虚拟地址
pub type GuestAddr = u32;

/// 客户机页偏移位数
pub const GUEST_PAGE_SHIFT: u32 = 12;
/// 客户机页大小：4KB
pub const GUEST_PAGE_SIZE: usize = 1 << GUEST_PAGE_SHIFT;
/// 页内偏移掩码
pub const GUEST_PAGE_MASK: u32 = (1 << GUEST_PAGE_SHIFT) - 1;
/// 覆盖 32 位地址空间所需的页表项数
pub const GUEST_PAGE_COUNT: usize = 1 << (32 - GUEST_PAGE_SHIFT);

/// 客户机地址所在的页索引
#[inline]
pub const fn page_index(addr: GuestAddr) -> usize {
    (addr >> GUEST_PAGE_SHIFT) as usize
}

/// 客户机地址的页内偏移
#[inline]
pub const fn page_offset(addr: GuestAddr) -> usize {
    (addr & GUEST_PAGE_MASK) as usize
}
