//! 翻译驱动
//!
//! 把解码后的指令批次翻译、安装为编译块，并按起始地址缓存。
//! 遇到没有处理器的指令时：若它是批次第一条，结果为 [`CompileOutcome::Interpret`]，
//! 由调度器交给外部解释器；否则只编译它之前的前缀，块在该指令处结束。

use std::collections::HashMap;

use vm_core::{GuestAddr, JitError, JitResult};

use crate::context::{EntryPoint, ModuleHandle, TranslationContext};
use crate::insn::ArmInsn;
use crate::translator::Translator;

/// 编译结果
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    /// 已安装（或命中缓存）的块
    Installed {
        entry: EntryPoint,
        module: ModuleHandle,
    },
    /// 第一条指令需要解释执行
    Interpret { addr: GuestAddr, opcode: String },
}

impl CompileOutcome {
    pub fn entry(&self) -> Option<EntryPoint> {
        match self {
            CompileOutcome::Installed { entry, .. } => Some(*entry),
            CompileOutcome::Interpret { .. } => None,
        }
    }
}

/// 块编译器
#[derive(Debug)]
pub struct BlockCompiler {
    ctx: TranslationContext,
    translator: Translator,
    blocks: HashMap<GuestAddr, ModuleHandle>,
}

impl BlockCompiler {
    pub fn new(ctx: TranslationContext) -> Self {
        Self::with_translator(ctx, Translator::new())
    }

    pub fn with_translator(ctx: TranslationContext, translator: Translator) -> Self {
        Self {
            ctx,
            translator,
            blocks: HashMap::new(),
        }
    }

    pub fn context(&self) -> &TranslationContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut TranslationContext {
        &mut self.ctx
    }

    pub fn translator_mut(&mut self) -> &mut Translator {
        &mut self.translator
    }

    /// 已缓存的块
    pub fn lookup(&self, addr: GuestAddr) -> Option<EntryPoint> {
        let module = self.blocks.get(&addr)?;
        module.entry(&self.ctx.mangler().block_name(addr))
    }

    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// 编译从 `insns[0].addr` 开始的块
    pub fn compile(&mut self, insns: &[ArmInsn]) -> JitResult<CompileOutcome> {
        let Some(first) = insns.first() else {
            return Err(JitError::InvalidAddress(
                "empty instruction batch has no start address".to_string(),
            ));
        };
        let start = first.addr;

        if let Some(module) = self.blocks.get(&start) {
            if let Some(entry) = module.entry(&self.ctx.mangler().block_name(start)) {
                return Ok(CompileOutcome::Installed {
                    entry,
                    module: module.clone(),
                });
            }
        }

        let unit = match self.translator.translate(&mut self.ctx, insns) {
            Ok(unit) => unit,
            Err(JitError::UnimplementedOpcode { addr, opcode }) => {
                let Some(split) = insns.iter().position(|insn| insn.addr == addr) else {
                    return Err(JitError::UnimplementedOpcode { addr, opcode });
                };
                if split == 0 {
                    log::debug!("{addr:#010x}: `{opcode}` routed to the interpreter");
                    return Ok(CompileOutcome::Interpret { addr, opcode });
                }
                log::debug!(
                    "block {start:#010x} truncated before `{opcode}` at {addr:#010x} ({split} instructions)"
                );
                self.translator.translate(&mut self.ctx, &insns[..split])?
            }
            Err(err) => return Err(err),
        };

        let module = self.ctx.add_module(unit)?;
        let name = self.ctx.mangler().block_name(start);
        let entry = module.entry(&name).ok_or_else(|| {
            JitError::linkage(&name, "translated block does not export its entry")
        })?;
        self.blocks.insert(start, module.clone());
        Ok(CompileOutcome::Installed { entry, module })
    }

    /// 丢弃缓存的块及其安装的符号
    ///
    /// # Safety
    /// 调用方保证之前返回的入口不会再被执行。代码区在此之后可以由调用方重置。
    pub unsafe fn invalidate_all(&mut self) {
        log::debug!("invalidating {} cached blocks", self.blocks.len());
        self.blocks.clear();
        self.ctx.clear_installed();
    }
}
