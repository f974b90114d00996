//! 指令翻译器
//!
//! 按操作码族分派：每个 [`OpcodeFamily`] 在 [`HandlerTable`] 中占一个槽位，
//! 翻译时每条指令查一次表。缺少处理器的指令不会生成任何代码，
//! 整个批次以 [`JitError::UnimplementedOpcode`] 失败，由调用方转交解释器。
//!
//! 条件执行的指令被包在单独的块中，只有 CPSR 满足条件时才进入。

mod branch;
mod builder;
mod data_processing;
mod load_store;
mod multiply;
mod system;

pub use builder::{MemOperand, UnitBuilder};

use cranelift_codegen::ir::{AbiParam, types};
use vm_core::{BlockExit, Condition, JitError, JitResult, REG_PC};

use crate::context::{Linkage, TranslationContext, TranslationUnit};
use crate::insn::{ArmInsn, OpcodeFamily};
use crate::runtime::TRACE_HELPER;
use builder::BuildOptions;

/// 处理器执行后的控制流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// 继续下一条指令
    Continue,
    /// 处理器已经发射了块出口
    Exit,
}

/// 单条指令的翻译函数
pub type Handler = fn(&mut UnitBuilder<'_>, &ArmInsn) -> JitResult<Flow>;

/// 操作码族 -> 处理器
#[derive(Clone)]
pub struct HandlerTable {
    slots: [Option<Handler>; OpcodeFamily::COUNT],
}

impl HandlerTable {
    /// 空表
    pub fn empty() -> Self {
        Self {
            slots: [None; OpcodeFamily::COUNT],
        }
    }

    /// 内置处理器；协处理器、VFP 与未定义指令没有处理器
    pub fn with_default_handlers() -> Self {
        let mut table = Self::empty();
        table.register(OpcodeFamily::DataProcessing, data_processing::translate);
        table.register(OpcodeFamily::Multiply, multiply::translate_multiply);
        table.register(OpcodeFamily::MultiplyLong, multiply::translate_multiply_long);
        table.register(OpcodeFamily::LoadStore, load_store::translate_single);
        table.register(OpcodeFamily::LoadStoreMultiple, load_store::translate_multiple);
        table.register(OpcodeFamily::Branch, branch::translate_branch);
        table.register(OpcodeFamily::BranchExchange, branch::translate_exchange);
        table.register(OpcodeFamily::Supervisor, system::translate_svc);
        table.register(OpcodeFamily::CountLeadingZeros, system::translate_clz);
        table.register(OpcodeFamily::StatusRead, system::translate_mrs);
        table.register(OpcodeFamily::StatusWrite, system::translate_msr);
        table
    }

    /// 注册处理器，返回被替换的旧处理器
    pub fn register(&mut self, family: OpcodeFamily, handler: Handler) -> Option<Handler> {
        self.slots[family.index()].replace(handler)
    }

    pub fn unregister(&mut self, family: OpcodeFamily) -> Option<Handler> {
        self.slots[family.index()].take()
    }

    pub fn get(&self, family: OpcodeFamily) -> Option<Handler> {
        self.slots[family.index()]
    }

    pub fn is_registered(&self, family: OpcodeFamily) -> bool {
        self.get(family).is_some()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<OpcodeFamily> = OpcodeFamily::ALL
            .into_iter()
            .filter(|family| self.is_registered(*family))
            .collect();
        f.debug_struct("HandlerTable")
            .field("registered", &registered)
            .finish()
    }
}

/// 指令翻译器
#[derive(Debug, Clone, Default)]
pub struct Translator {
    handlers: HandlerTable,
}

impl Translator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: HandlerTable) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    /// 把一批顺序指令翻译成一个单元，导出名为起始地址对应的块名
    ///
    /// 无条件的块出口（分支、SVC、写 PC）之后的指令不再翻译。
    pub fn translate(
        &self,
        ctx: &mut TranslationContext,
        insns: &[ArmInsn],
    ) -> JitResult<TranslationUnit> {
        let Some(first) = insns.first() else {
            log::error!("cannot translate an empty instruction batch");
            return Err(JitError::InvalidAddress(
                "empty instruction batch has no start address".to_string(),
            ));
        };

        let mut plan = Vec::with_capacity(insns.len());
        for insn in insns {
            let handler = self
                .handlers
                .get(insn.family())
                .ok_or_else(|| unimplemented(insn, "no handler for this opcode family"))?;
            if let Some(reg) = insn
                .op
                .register_operands()
                .into_iter()
                .find(|&reg| usize::from(reg) > REG_PC)
            {
                return Err(unimplemented(insn, &format!("register r{reg} out of range")));
            }
            plan.push((insn, handler));
        }

        let name = ctx.mangler().block_name(first.addr);
        let mut func = ctx.declare_function(&name, ctx.block_signature());
        let trace = ctx.config().trace_instructions.then(|| {
            let mut sig = ctx.make_signature();
            sig.params.push(AbiParam::new(ctx.data_layout().pointer_type()));
            sig.params.push(AbiParam::new(types::I32));
            ctx.import_function(&mut func, TRACE_HELPER, sig)
        });
        let options = BuildOptions {
            pointer_type: ctx.data_layout().pointer_type(),
            guard_unmapped_pages: ctx.config().guard_unmapped_pages,
            trace,
        };

        let result = {
            let (_, fb_ctx) = ctx.codegen().split_mut();
            let mut unit = UnitBuilder::new(&mut func, fb_ctx, options);
            emit_block(&mut unit, &plan).map(|()| unit.finalize())
        };
        if let Err(err) = result {
            ctx.codegen().reset_builder();
            return Err(err);
        }

        log::trace!("translated {name}: {} instructions", plan.len());

        let mut unit = TranslationUnit::new(name.clone());
        unit.define_function(name, Linkage::Export, func);
        Ok(unit)
    }
}

fn emit_block(unit: &mut UnitBuilder<'_>, plan: &[(&ArmInsn, Handler)]) -> JitResult<()> {
    let mut last = None;
    for (i, &(insn, handler)) in plan.iter().enumerate() {
        unit.begin_instruction(insn);

        if insn.cond == Condition::Al {
            if handler(&mut *unit, insn)? == Flow::Exit {
                if i + 1 < plan.len() {
                    log::debug!(
                        "block exit at {:#010x}, {} trailing instructions not translated",
                        insn.addr,
                        plan.len() - i - 1
                    );
                }
                return Ok(());
            }
        } else {
            let taken = unit.condition(insn.cond);
            let next = unit.enter_conditional(taken);
            let flow = handler(&mut *unit, insn)?;
            unit.leave_conditional(next, flow == Flow::Continue);
        }
        last = Some(insn.addr);
    }

    if let Some(last) = last {
        unit.set_pc_const(last.wrapping_add(4));
    }
    unit.exit(BlockExit::EndOfBlock);
    Ok(())
}

/// 构造并记录未实现错误
pub(crate) fn unimplemented(insn: &ArmInsn, detail: &str) -> JitError {
    log::warn!("unimplemented opcode `{insn}` at {:#010x}: {detail}", insn.addr);
    JitError::UnimplementedOpcode {
        addr: insn.addr,
        opcode: format!("{insn}: {detail}"),
    }
}
