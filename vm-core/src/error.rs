//! JIT 统一错误类型
//!
//! 所有失败都以 [`JitError`] 返回，调用方据此决定是否可以在本地恢复：
//! 分配耗尽与链接失败不会破坏翻译上下文，未实现的操作码需要转交解释器执行。

use std::fmt;
use std::io;

use thiserror::Error;

use crate::GuestAddr;

/// 代码/数据区段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// 可执行代码（读+写+执行）
    Code,
    /// 读写数据
    Data,
    /// 只读数据（链接完成后降为只读）
    ReadOnlyData,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionKind::Code => write!(f, "code"),
            SectionKind::Data => write!(f, "data"),
            SectionKind::ReadOnlyData => write!(f, "rodata"),
        }
    }
}

/// JIT 错误
#[derive(Debug, Error)]
pub enum JitError {
    /// 代码区容量耗尽
    #[error(
        "arena exhausted: {kind} section `{name}` needs {requested} bytes, {remaining} bytes left"
    )]
    AllocationExhausted {
        /// 区段类型
        kind: SectionKind,
        /// 区段名称
        name: String,
        /// 请求大小（字节）
        requested: usize,
        /// 剩余容量（字节）
        remaining: usize,
    },

    /// 符号无法解析，或模块安装失败
    #[error("linkage failed for `{symbol}`: {reason}")]
    LinkageFailure {
        /// 符号或模块名称
        symbol: String,
        /// 失败原因
        reason: String,
    },

    /// 解码后的指令没有对应的翻译处理器
    #[error("no translation handler for `{opcode}` at {addr:#010x}")]
    UnimplementedOpcode {
        /// 指令地址
        addr: GuestAddr,
        /// 操作码描述
        opcode: String,
    },

    /// 内存操作数构造非法
    #[error("invalid memory operand: {0}")]
    InvalidAddress(String),

    /// 宿主系统调用失败（保留、提交、保护内存）
    #[error("host {op} failed: {source}")]
    Host {
        /// 失败的操作
        op: &'static str,
        /// 底层 IO 错误
        #[source]
        source: io::Error,
    },

    /// 宿主 ISA 不受代码生成后端支持
    #[error("code generation backend unavailable: {0}")]
    Backend(String),

    /// 配置无效
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl JitError {
    /// 构造链接失败
    pub fn linkage(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        JitError::LinkageFailure {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    /// 调用方是否可以继续使用同一个翻译上下文
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            JitError::AllocationExhausted { .. }
                | JitError::LinkageFailure { .. }
                | JitError::UnimplementedOpcode { .. }
                | JitError::InvalidAddress(_)
        )
    }

    /// 是否应当把指令转交解释器执行
    pub fn needs_interpreter(&self) -> bool {
        matches!(self, JitError::UnimplementedOpcode { .. })
    }
}

/// JIT 结果类型
pub type JitResult<T> = Result<T, JitError>;
