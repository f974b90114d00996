//! 单元构建器
//!
//! 包装 `FunctionBuilder`，向处理器提供 CPU 上下文字段访问、条件求值、
//! 客户机地址翻译和块出口。寄存器与标志每次都直接读写上下文，不跨指令缓存。

use cranelift_codegen::cursor::{Cursor, FuncCursor};
use cranelift_codegen::ir::{
    Block, Endianness, FuncRef, Function, InstBuilder, MemFlags, Type, Value, condcodes::IntCC,
    types,
};
use cranelift_frontend::{FuncInstBuilder, FunctionBuilder, FunctionBuilderContext};
use vm_core::exit::{pack, tags};
use vm_core::{
    BlockExit, CPSR_C, CPSR_N, CPSR_T, CPSR_V, CPSR_Z, Condition, CpuContextLayout,
    GUEST_PAGE_MASK, GUEST_PAGE_SHIFT, GuestAddr, JitError, JitResult, REG_PC,
};

use crate::insn::ArmInsn;

/// 指向客户机数据的宿主内存操作数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    /// 宿主地址（指针类型）
    pub host: Value,
    /// 访问的值类型
    pub ty: Type,
}

/// 单元构建选项
#[derive(Debug, Clone, Copy)]
pub(crate) struct BuildOptions {
    pub pointer_type: Type,
    pub guard_unmapped_pages: bool,
    pub trace: Option<FuncRef>,
}

/// 单元构建器
pub struct UnitBuilder<'a> {
    builder: FunctionBuilder<'a>,
    cpu: Value,
    pointer_type: Type,
    entry: Block,
    /// 页表基址，首次访存时在入口块加载，之后整个单元复用
    page_table: Option<Value>,
    guard: bool,
    trace: Option<FuncRef>,
    /// 当前指令地址
    pc: GuestAddr,
    /// 到当前指令为止（含）的指令数
    retired: u32,
}

impl<'a> UnitBuilder<'a> {
    pub(crate) fn new(
        func: &'a mut Function,
        fb_ctx: &'a mut FunctionBuilderContext,
        options: BuildOptions,
    ) -> Self {
        let mut builder = FunctionBuilder::new(func, fb_ctx);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let cpu = builder.block_params(entry)[0];

        let body = builder.create_block();
        builder.ins().jump(body, &[]);
        builder.switch_to_block(body);
        builder.seal_block(body);

        Self {
            builder,
            cpu,
            pointer_type: options.pointer_type,
            entry,
            page_table: None,
            guard: options.guard_unmapped_pages,
            trace: options.trace,
            pc: 0,
            retired: 0,
        }
    }

    pub(crate) fn finalize(self) {
        self.builder.finalize();
    }

    /// 直接发射 IR
    pub fn ins(&mut self) -> FuncInstBuilder<'_, 'a> {
        self.builder.ins()
    }

    /// 当前指令地址
    pub fn pc(&self) -> GuestAddr {
        self.pc
    }

    pub fn pointer_type(&self) -> Type {
        self.pointer_type
    }

    /// 开始翻译一条指令
    pub(crate) fn begin_instruction(&mut self, insn: &ArmInsn) {
        self.pc = insn.addr;
        self.retired += 1;
        if let Some(trace) = self.trace {
            let addr = self.const32(insn.addr);
            let cpu = self.cpu;
            self.builder.ins().call(trace, &[cpu, addr]);
        }
    }

    // ========================================================================
    // 常量与控制流
    // ========================================================================

    pub fn const32(&mut self, value: u32) -> Value {
        self.builder.ins().iconst(types::I32, i64::from(value))
    }

    /// 条件为真时进入新块；返回跳过时的后继块，当前位置在执行块中
    pub(crate) fn enter_conditional(&mut self, taken: Value) -> Block {
        let exec = self.builder.create_block();
        let next = self.builder.create_block();
        self.builder.ins().brif(taken, exec, &[], next, &[]);
        self.builder.seal_block(exec);
        self.builder.switch_to_block(exec);
        next
    }

    /// 结束条件执行块（若处理器没有退出）并切到后继块
    pub(crate) fn leave_conditional(&mut self, next: Block, fell_through: bool) {
        if fell_through {
            self.builder.ins().jump(next, &[]);
        }
        self.builder.switch_to_block(next);
        self.builder.seal_block(next);
    }

    // ========================================================================
    // 寄存器与标志
    // ========================================================================

    /// 读通用寄存器；R15 读到当前指令地址 + 8
    pub fn reg(&mut self, r: u8) -> Value {
        if usize::from(r) == REG_PC {
            return self.const32(self.pc.wrapping_add(8));
        }
        let offset = CpuContextLayout::reg(usize::from(r)) as i32;
        let cpu = self.cpu;
        self.builder.ins().load(types::I32, MemFlags::trusted(), cpu, offset)
    }

    /// 写通用寄存器（写 PC 请用 [`UnitBuilder::set_pc`]）
    pub fn set_reg(&mut self, r: u8, value: Value) {
        let offset = CpuContextLayout::reg(usize::from(r)) as i32;
        let cpu = self.cpu;
        self.builder.ins().store(MemFlags::trusted(), value, cpu, offset);
    }

    pub fn set_pc(&mut self, value: Value) {
        self.set_reg(REG_PC as u8, value);
    }

    pub fn set_pc_const(&mut self, pc: GuestAddr) {
        let value = self.const32(pc);
        self.set_pc(value);
    }

    pub fn cpsr(&mut self) -> Value {
        let cpu = self.cpu;
        self.builder
            .ins()
            .load(types::I32, MemFlags::trusted(), cpu, CpuContextLayout::CPSR as i32)
    }

    pub fn set_cpsr(&mut self, value: Value) {
        let cpu = self.cpu;
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, cpu, CpuContextLayout::CPSR as i32);
    }

    /// 取 `value` 的第 `bit` 位（0 或 1）
    pub fn bit(&mut self, value: Value, bit: u32) -> Value {
        let shifted = if bit == 0 {
            value
        } else {
            self.builder.ins().ushr_imm(value, i64::from(bit))
        };
        self.builder.ins().band_imm(shifted, 1)
    }

    /// 当前 C 标志（0 或 1）
    pub fn carry_flag(&mut self) -> Value {
        let cpsr = self.cpsr();
        self.bit(cpsr, CPSR_C.trailing_zeros())
    }

    /// 结果的 N、Z（0 或 1）
    pub fn nz(&mut self, result: Value) -> (Value, Value) {
        let n = self.bit(result, 31);
        let is_zero = self.builder.ins().icmp_imm(IntCC::Equal, result, 0);
        let z = self.builder.ins().uextend(types::I32, is_zero);
        (n, z)
    }

    /// 更新给出的标志，其余保持不变；每个值为 0 或 1
    pub fn set_flags(
        &mut self,
        n: Option<Value>,
        z: Option<Value>,
        c: Option<Value>,
        v: Option<Value>,
    ) {
        let mut mask = 0u32;
        let mut bits: Option<Value> = None;
        for (flag, bit) in [(n, CPSR_N), (z, CPSR_Z), (c, CPSR_C), (v, CPSR_V)] {
            let Some(flag) = flag else { continue };
            mask |= bit;
            let shifted = self
                .builder
                .ins()
                .ishl_imm(flag, i64::from(bit.trailing_zeros()));
            bits = Some(match bits {
                Some(acc) => self.builder.ins().bor(acc, shifted),
                None => shifted,
            });
        }
        let Some(bits) = bits else { return };

        let cpsr = self.cpsr();
        let keep = self.const32(!mask);
        let kept = self.builder.ins().band(cpsr, keep);
        let updated = self.builder.ins().bor(kept, bits);
        self.set_cpsr(updated);
    }

    /// 按 CPSR 当前值求条件，返回 i8 布尔
    pub fn condition(&mut self, cond: Condition) -> Value {
        if cond == Condition::Al {
            return self.builder.ins().iconst(types::I8, 1);
        }

        let cpsr = self.cpsr();
        let n = self.bit(cpsr, CPSR_N.trailing_zeros());
        let z = self.bit(cpsr, CPSR_Z.trailing_zeros());
        let c = self.bit(cpsr, CPSR_C.trailing_zeros());
        let v = self.bit(cpsr, CPSR_V.trailing_zeros());

        let fb = &mut self.builder;
        match cond {
            Condition::Eq => fb.ins().icmp_imm(IntCC::NotEqual, z, 0),
            Condition::Ne => fb.ins().icmp_imm(IntCC::Equal, z, 0),
            Condition::Cs => fb.ins().icmp_imm(IntCC::NotEqual, c, 0),
            Condition::Cc => fb.ins().icmp_imm(IntCC::Equal, c, 0),
            Condition::Mi => fb.ins().icmp_imm(IntCC::NotEqual, n, 0),
            Condition::Pl => fb.ins().icmp_imm(IntCC::Equal, n, 0),
            Condition::Vs => fb.ins().icmp_imm(IntCC::NotEqual, v, 0),
            Condition::Vc => fb.ins().icmp_imm(IntCC::Equal, v, 0),
            Condition::Hi | Condition::Ls => {
                let not_z = fb.ins().bxor_imm(z, 1);
                let hi = fb.ins().band(c, not_z);
                let cc = if cond == Condition::Hi {
                    IntCC::NotEqual
                } else {
                    IntCC::Equal
                };
                fb.ins().icmp_imm(cc, hi, 0)
            }
            Condition::Ge => fb.ins().icmp(IntCC::Equal, n, v),
            Condition::Lt => fb.ins().icmp(IntCC::NotEqual, n, v),
            Condition::Gt => {
                let z_clear = fb.ins().icmp_imm(IntCC::Equal, z, 0);
                let ge = fb.ins().icmp(IntCC::Equal, n, v);
                fb.ins().band(z_clear, ge)
            }
            Condition::Le => {
                let z_set = fb.ins().icmp_imm(IntCC::NotEqual, z, 0);
                let lt = fb.ins().icmp(IntCC::NotEqual, n, v);
                fb.ins().bor(z_set, lt)
            }
            Condition::Al => fb.ins().iconst(types::I8, 1),
        }
    }

    /// ARM AddWithCarry：返回 (结果, C, V)，C/V 为 0 或 1
    pub fn add_with_carry(&mut self, a: Value, b: Value, carry_in: Value) -> (Value, Value, Value) {
        let fb = &mut self.builder;
        let a64 = fb.ins().uextend(types::I64, a);
        let b64 = fb.ins().uextend(types::I64, b);
        let c64 = fb.ins().uextend(types::I64, carry_in);
        let partial = fb.ins().iadd(a64, b64);
        let sum = fb.ins().iadd(partial, c64);

        let result = fb.ins().ireduce(types::I32, sum);
        let high = fb.ins().ushr_imm(sum, 32);
        let carry = fb.ins().ireduce(types::I32, high);

        let a_diff = fb.ins().bxor(a, result);
        let b_diff = fb.ins().bxor(b, result);
        let both = fb.ins().band(a_diff, b_diff);
        let overflow = fb.ins().ushr_imm(both, 31);
        (result, carry, overflow)
    }

    /// BX 语义：bit0 决定 Thumb 状态，其余作为新 PC
    pub fn interwork_branch(&mut self, target: Value) {
        let thumb = self.builder.ins().band_imm(target, 1);
        let t_bit = self
            .builder
            .ins()
            .ishl_imm(thumb, i64::from(CPSR_T.trailing_zeros()));
        let cpsr = self.cpsr();
        let keep = self.const32(!CPSR_T);
        let cleared = self.builder.ins().band(cpsr, keep);
        let updated = self.builder.ins().bor(cleared, t_bit);
        self.set_cpsr(updated);

        let align = self.const32(!1);
        let pc = self.builder.ins().band(target, align);
        self.set_pc(pc);
    }

    // ========================================================================
    // 客户机内存
    // ========================================================================

    fn page_table(&mut self) -> Value {
        if let Some(table) = self.page_table {
            return table;
        }
        // 插在入口块的跳转之前，支配所有后续块
        let mut pos = FuncCursor::new(&mut *self.builder.func).at_last_inst(self.entry);
        let table = pos.ins().load(
            self.pointer_type,
            MemFlags::trusted(),
            self.cpu,
            CpuContextLayout::PAGE_TABLE as i32,
        );
        self.page_table = Some(table);
        table
    }

    /// 把 32 位客户机地址翻译成宿主内存操作数
    ///
    /// 地址拆成页索引（高 20 位）和页内偏移（低 12 位），用页索引查
    /// CPU 上下文中的页表，再加上偏移。所有访存都必须经过这里。
    /// 启用页保护时，空表项会使块以 [`BlockExit::PageFault`] 退出。
    pub fn memory_operand(&mut self, addr: Value, ty: Type) -> JitResult<MemOperand> {
        let addr_ty = self.builder.func.dfg.value_type(addr);
        if addr_ty != types::I32 {
            log::error!("guest address at {:#010x} has type {addr_ty}, expected i32", self.pc);
            return Err(JitError::InvalidAddress(format!(
                "guest address at {:#010x} has type {addr_ty}, expected i32",
                self.pc
            )));
        }
        if !matches!(ty, types::I8 | types::I16 | types::I32 | types::I64) {
            log::error!("unsupported guest access type {ty} at {:#010x}", self.pc);
            return Err(JitError::InvalidAddress(format!(
                "unsupported guest access type {ty} at {:#010x}",
                self.pc
            )));
        }

        let ptr = self.pointer_type;
        let table = self.page_table();

        let index = self.builder.ins().ushr_imm(addr, i64::from(GUEST_PAGE_SHIFT));
        let index = self.to_pointer(index);
        let scaled = self
            .builder
            .ins()
            .ishl_imm(index, i64::from(ptr.bytes().trailing_zeros()));
        let slot = self.builder.ins().iadd(table, scaled);
        let base = self.builder.ins().load(ptr, MemFlags::trusted(), slot, 0);

        if self.guard {
            self.guard_page(base, addr);
        }

        let offset = self.builder.ins().band_imm(addr, i64::from(GUEST_PAGE_MASK));
        let offset = self.to_pointer(offset);
        let host = self.builder.ins().iadd(base, offset);
        Ok(MemOperand { host, ty })
    }

    fn to_pointer(&mut self, value: Value) -> Value {
        if self.pointer_type == types::I32 {
            value
        } else {
            self.builder.ins().uextend(self.pointer_type, value)
        }
    }

    fn guard_page(&mut self, base: Value, addr: Value) {
        let mapped = self.builder.create_block();
        let fault = self.builder.create_block();
        self.builder.ins().brif(base, mapped, &[], fault, &[]);

        self.builder.switch_to_block(fault);
        self.builder.seal_block(fault);
        log::trace!("page guard for access at {:#010x}", self.pc);
        let pc = self.pc;
        self.set_pc_const(pc);
        let tag = self
            .builder
            .ins()
            .iconst(types::I64, pack(tags::PAGE_FAULT, 0) as i64);
        let addr64 = self.builder.ins().uextend(types::I64, addr);
        let raw = self.builder.ins().bor(tag, addr64);
        // 出错指令本身不计入
        self.retire(self.retired.saturating_sub(1));
        self.builder.ins().return_(&[raw]);

        self.builder.switch_to_block(mapped);
        self.builder.seal_block(mapped);
    }

    fn guest_flags() -> MemFlags {
        let mut flags = MemFlags::new();
        flags.set_endianness(Endianness::Little);
        flags
    }

    /// 读客户机内存，窄类型扩展为 i32
    pub fn load(&mut self, mem: MemOperand, signed: bool) -> Value {
        let flags = Self::guest_flags();
        let ins = self.builder.ins();
        match (mem.ty, signed) {
            (types::I8, false) => ins.uload8(types::I32, flags, mem.host, 0),
            (types::I8, true) => ins.sload8(types::I32, flags, mem.host, 0),
            (types::I16, false) => ins.uload16(types::I32, flags, mem.host, 0),
            (types::I16, true) => ins.sload16(types::I32, flags, mem.host, 0),
            (ty, _) => ins.load(ty, flags, mem.host, 0),
        }
    }

    /// 写客户机内存，i32 值按操作数类型截断
    pub fn store(&mut self, mem: MemOperand, value: Value) {
        let flags = Self::guest_flags();
        let ins = self.builder.ins();
        match mem.ty {
            types::I8 => ins.istore8(flags, value, mem.host, 0),
            types::I16 => ins.istore16(flags, value, mem.host, 0),
            _ => ins.store(flags, value, mem.host, 0),
        };
    }

    // ========================================================================
    // 出口
    // ========================================================================

    fn retire(&mut self, count: u32) {
        if count == 0 {
            return;
        }
        let cpu = self.cpu;
        let offset = CpuContextLayout::CYCLES_REMAINING as i32;
        let cycles = self
            .builder
            .ins()
            .load(types::I32, MemFlags::trusted(), cpu, offset);
        let spent = self.const32(count);
        let left = self.builder.ins().isub(cycles, spent);
        self.builder.ins().store(MemFlags::trusted(), left, cpu, offset);
    }

    /// 结算周期并以 `exit` 返回；之后当前块已终结
    pub fn exit(&mut self, exit: BlockExit) {
        self.retire(self.retired);
        let raw = self.builder.ins().iconst(types::I64, exit.encode() as i64);
        self.builder.ins().return_(&[raw]);
    }
}
