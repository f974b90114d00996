//! 客户机 CPU 上下文
//!
//! 每个客户机线程一个实例，由执行调度器分配并独占。
//! 编译后的代码按 [`CpuContextLayout`] 中的偏移直接读写字段，
//! 因此字段顺序在进程生命周期内固定，任何已编译的块都依赖它。

use std::fmt;
use std::mem::{offset_of, size_of};
use std::ptr;

/// CPSR 负数标志
pub const CPSR_N: u32 = 1 << 31;
/// CPSR 零标志
pub const CPSR_Z: u32 = 1 << 30;
/// CPSR 进位标志
pub const CPSR_C: u32 = 1 << 29;
/// CPSR 溢出标志
pub const CPSR_V: u32 = 1 << 28;
/// CPSR Thumb 状态位
pub const CPSR_T: u32 = 1 << 5;

/// 程序计数器寄存器号
pub const REG_PC: usize = 15;
/// 链接寄存器号
pub const REG_LR: usize = 14;
/// 栈指针寄存器号
pub const REG_SP: usize = 13;

/// ARM CPU 上下文（固定布局）
///
/// 字段顺序：页表指针、剩余周期、R0-R15、CPSR、D0-D31、FPSCR。
#[repr(C)]
pub struct CpuContext {
    /// 客户机页表（页索引 -> 宿主页基址）
    pub page_table: *const *mut u8,
    /// 剩余周期数，编译块每退出一次减去已执行的指令数
    pub cycles_remaining: i32,
    /// R0 - R15
    pub regs: [u32; 16],
    /// 当前程序状态寄存器
    pub cpsr: u32,
    /// D0 - D31
    pub vfp: [u64; 32],
    /// 浮点状态寄存器
    pub fpscr: u32,
}

// 上下文只在所属执行槽的线程上使用；页表由客户机内存子系统自行同步。
unsafe impl Send for CpuContext {}

impl CpuContext {
    /// 创建绑定到给定页表的上下文
    pub fn new(page_table: *const *mut u8) -> Self {
        Self {
            page_table,
            cycles_remaining: 0,
            regs: [0; 16],
            cpsr: 0,
            vfp: [0; 32],
            fpscr: 0,
        }
    }

    /// 读取通用寄存器
    #[inline]
    pub fn reg(&self, index: usize) -> u32 {
        self.regs[index]
    }

    /// 写入通用寄存器
    #[inline]
    pub fn set_reg(&mut self, index: usize, value: u32) {
        self.regs[index] = value;
    }

    /// 当前 PC
    #[inline]
    pub fn pc(&self) -> u32 {
        self.regs[REG_PC]
    }

    /// 设置 PC
    #[inline]
    pub fn set_pc(&mut self, pc: u32) {
        self.regs[REG_PC] = pc;
    }

    pub fn flag_n(&self) -> bool {
        self.cpsr & CPSR_N != 0
    }

    pub fn flag_z(&self) -> bool {
        self.cpsr & CPSR_Z != 0
    }

    pub fn flag_c(&self) -> bool {
        self.cpsr & CPSR_C != 0
    }

    pub fn flag_v(&self) -> bool {
        self.cpsr & CPSR_V != 0
    }

    /// 一次性设置 NZCV
    pub fn set_nzcv(&mut self, n: bool, z: bool, c: bool, v: bool) {
        let mut cpsr = self.cpsr & !(CPSR_N | CPSR_Z | CPSR_C | CPSR_V);
        if n {
            cpsr |= CPSR_N;
        }
        if z {
            cpsr |= CPSR_Z;
        }
        if c {
            cpsr |= CPSR_C;
        }
        if v {
            cpsr |= CPSR_V;
        }
        self.cpsr = cpsr;
    }

    /// 是否处于 Thumb 状态
    pub fn is_thumb(&self) -> bool {
        self.cpsr & CPSR_T != 0
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new(ptr::null())
    }
}

impl fmt::Debug for CpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuContext")
            .field("page_table", &self.page_table)
            .field("cycles_remaining", &self.cycles_remaining)
            .field("regs", &format_args!("{:08x?}", self.regs))
            .field("cpsr", &format_args!("{:#010x}", self.cpsr))
            .field("fpscr", &format_args!("{:#010x}", self.fpscr))
            .finish_non_exhaustive()
    }
}

/// 生成代码使用的 [`CpuContext`] 字段偏移
pub struct CpuContextLayout;

impl CpuContextLayout {
    pub const PAGE_TABLE: usize = offset_of!(CpuContext, page_table);
    pub const CYCLES_REMAINING: usize = offset_of!(CpuContext, cycles_remaining);
    pub const REGS: usize = offset_of!(CpuContext, regs);
    pub const CPSR: usize = offset_of!(CpuContext, cpsr);
    pub const VFP: usize = offset_of!(CpuContext, vfp);
    pub const FPSCR: usize = offset_of!(CpuContext, fpscr);
    /// 整个上下文的大小
    pub const SIZE: usize = size_of::<CpuContext>();

    /// 字段按声明顺序排列（名称、偏移），调度器据此校验自己的分配
    pub const FIELDS: [(&'static str, usize); 6] = [
        ("page_table", Self::PAGE_TABLE),
        ("cycles_remaining", Self::CYCLES_REMAINING),
        ("regs", Self::REGS),
        ("cpsr", Self::CPSR),
        ("vfp", Self::VFP),
        ("fpscr", Self::FPSCR),
    ];

    /// 通用寄存器 `index` 的偏移
    #[inline]
    pub const fn reg(index: usize) -> usize {
        Self::REGS + index * size_of::<u32>()
    }

    /// 浮点寄存器 D`index` 的偏移
    #[inline]
    pub const fn vfp(index: usize) -> usize {
        Self::VFP + index * size_of::<u64>()
    }
}

/// ARM 条件码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

impl Condition {
    /// 从指令高 4 位解码；0b1111 不是条件码
    pub fn from_bits(bits: u32) -> Option<Self> {
        let cond = match bits & 0xf {
            0x0 => Condition::Eq,
            0x1 => Condition::Ne,
            0x2 => Condition::Cs,
            0x3 => Condition::Cc,
            0x4 => Condition::Mi,
            0x5 => Condition::Pl,
            0x6 => Condition::Vs,
            0x7 => Condition::Vc,
            0x8 => Condition::Hi,
            0x9 => Condition::Ls,
            0xa => Condition::Ge,
            0xb => Condition::Lt,
            0xc => Condition::Gt,
            0xd => Condition::Le,
            0xe => Condition::Al,
            _ => return None,
        };
        Some(cond)
    }

    /// 针对给定 CPSR 求值（宿主侧参考实现）
    pub fn holds(self, cpsr: u32) -> bool {
        let n = cpsr & CPSR_N != 0;
        let z = cpsr & CPSR_Z != 0;
        let c = cpsr & CPSR_C != 0;
        let v = cpsr & CPSR_V != 0;
        match self {
            Condition::Eq => z,
            Condition::Ne => !z,
            Condition::Cs => c,
            Condition::Cc => !c,
            Condition::Mi => n,
            Condition::Pl => !n,
            Condition::Vs => v,
            Condition::Vc => !v,
            Condition::Hi => c && !z,
            Condition::Ls => !c || z,
            Condition::Ge => n == v,
            Condition::Lt => n != v,
            Condition::Gt => !z && n == v,
            Condition::Le => z || n != v,
            Condition::Al => true,
        }
    }

    /// 汇编后缀（AL 为空）
    pub fn suffix(self) -> &'static str {
        match self {
            Condition::Eq => "eq",
            Condition::Ne => "ne",
            Condition::Cs => "cs",
            Condition::Cc => "cc",
            Condition::Mi => "mi",
            Condition::Pl => "pl",
            Condition::Vs => "vs",
            Condition::Vc => "vc",
            Condition::Hi => "hi",
            Condition::Ls => "ls",
            Condition::Ge => "ge",
            Condition::Lt => "lt",
            Condition::Gt => "gt",
            Condition::Le => "le",
            Condition::Al => "",
        }
    }
}
