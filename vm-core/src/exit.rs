//! 编译块出口编码
//!
//! 编译块签名为 `extern "C" fn(*mut CpuContext) -> u64`。
//! 返回值高 32 位为出口标签，低 32 位为附带数据。

use crate::GuestAddr;

/// 出口标签
pub mod tags {
    pub const END_OF_BLOCK: u32 = 0;
    pub const BRANCH: u32 = 1;
    pub const SUPERVISOR: u32 = 2;
    pub const PAGE_FAULT: u32 = 3;
}

/// 编译块退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// 顺序执行到块尾，PC 指向下一条指令
    EndOfBlock,
    /// 执行了改变 PC 的指令
    Branch,
    /// SVC 调用，附带立即数；PC 指向 SVC 之后
    Supervisor(u32),
    /// 访问了未提交的客户机页（仅在启用页保护时产生），PC 指向出错指令
    PageFault(GuestAddr),
    /// 无法识别的返回值
    Unknown(u64),
}

impl BlockExit {
    /// 编码为原生返回值
    pub const fn encode(self) -> u64 {
        match self {
            BlockExit::EndOfBlock => pack(tags::END_OF_BLOCK, 0),
            BlockExit::Branch => pack(tags::BRANCH, 0),
            BlockExit::Supervisor(imm) => pack(tags::SUPERVISOR, imm),
            BlockExit::PageFault(addr) => pack(tags::PAGE_FAULT, addr),
            BlockExit::Unknown(raw) => raw,
        }
    }

    /// 从原生返回值解码
    pub const fn decode(raw: u64) -> Self {
        let data = raw as u32;
        match (raw >> 32) as u32 {
            tags::END_OF_BLOCK if data == 0 => BlockExit::EndOfBlock,
            tags::BRANCH if data == 0 => BlockExit::Branch,
            tags::SUPERVISOR => BlockExit::Supervisor(data),
            tags::PAGE_FAULT => BlockExit::PageFault(data),
            _ => BlockExit::Unknown(raw),
        }
    }
}

/// 打包标签与数据
#[inline]
pub const fn pack(tag: u32, data: u32) -> u64 {
    ((tag as u64) << 32) | data as u64
}
