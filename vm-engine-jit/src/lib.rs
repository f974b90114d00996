//! # vm-engine-jit - ARM 动态重编译器
//!
//! 基于 Cranelift，把解码后的 ARM 指令翻译成宿主本地代码。
//!
//! ## 架构
//!
//! ```text
//! ArmInsn[] -> Translator -> TranslationUnit -> add_module -> EntryPoint
//!              (handlers)    (Cranelift IR)    (compile, place, link)
//! ```
//!
//! ## 主要组件
//!
//! - [`LinkTable`]: 运行时辅助函数名 -> 宿主地址，线程安全并缓存结果
//! - [`TranslationContext`]: 拥有一个代码生成后端，绑定 [`vm_mem::CodeArena`] 与 [`LinkTable`]
//! - [`Translator`]: 按操作码族分派的指令翻译器，访存统一经过 [`UnitBuilder::memory_operand`]
//! - [`BlockCompiler`]: 翻译驱动，缓存编译块，无法翻译的指令交给外部解释器
//!
//! ## 编译块约定
//!
//! 编译块签名为 `extern "C" fn(*mut CpuContext) -> u64`，返回 [`vm_core::BlockExit`] 编码。
//! 调度器在调用前按 [`vm_core::CpuContextLayout`] 填好上下文，并保证块可能访问的客户机页已提交
//! （除非启用了 [`JitConfig::guard_unmapped_pages`]）。
//!
//! ## 示例
//!
//! ```rust,ignore
//! use vm_engine_jit::{BlockCompiler, JitConfig, TranslationContext};
//!
//! let ctx = TranslationContext::with_config(JitConfig::default())?;
//! let mut compiler = BlockCompiler::new(ctx);
//! if let Some(entry) = compiler.compile(&insns)?.entry() {
//!     let exit = unsafe { entry.invoke(&mut cpu) };
//! }
//! ```

pub mod config;
pub mod context;
pub mod driver;
pub mod insn;
pub mod link_table;
mod pipeline;
pub mod runtime;
pub mod translator;

pub use config::{ConfigError, DEFAULT_ARENA_CAPACITY, JitConfig, OptLevel};
pub use context::{
    BlockFn, CodegenContext, ContextStats, DataLayout, EntryPoint, Linkage, Mangler, ModuleHandle,
    SymbolTable, TranslationContext, TranslationUnit, UnitData, UnitFunction,
};
pub use driver::{BlockCompiler, CompileOutcome};
pub use insn::{
    AccessSize, Addressing, ArmInsn, ArmOp, BlockMode, DpOpcode, MsrOperand, Offset, OpcodeFamily,
    Operand2, ShiftKind,
};
pub use link_table::{HostSymbolProvider, LinkTable, MissPolicy, SymbolProvider};
pub use translator::{Flow, Handler, HandlerTable, MemOperand, Translator, UnitBuilder};

pub use vm_core::{BlockExit, CpuContext, CpuContextLayout, JitError, JitResult};
