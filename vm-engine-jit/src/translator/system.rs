//! SVC、CLZ 与状态寄存器访问

use cranelift_codegen::ir::InstBuilder;
use vm_core::{BlockExit, CPSR_C, CPSR_N, CPSR_V, CPSR_Z, JitResult, REG_PC};

use super::{Flow, UnitBuilder, unimplemented};
use crate::insn::{ArmInsn, ArmOp, MsrOperand, Operand2};

/// MSR 唯一支持的字段：标志位（f）
const MSR_FLAGS_FIELD: u8 = 0b1000;
const FLAG_BITS: u32 = CPSR_N | CPSR_Z | CPSR_C | CPSR_V;

/// SVC：PC 指向下一条指令，带立即数退出
pub(super) fn translate_svc(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::Svc { imm } = insn.op else {
        return Err(unimplemented(insn, "not a supervisor call"));
    };
    unit.set_pc_const(insn.addr.wrapping_add(4));
    unit.exit(BlockExit::Supervisor(imm & 0x00ff_ffff));
    Ok(Flow::Exit)
}

pub(super) fn translate_clz(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::Clz { rd, rm } = insn.op else {
        return Err(unimplemented(insn, "not a clz instruction"));
    };
    if usize::from(rd) == REG_PC || usize::from(rm) == REG_PC {
        return Err(unimplemented(insn, "pc operand"));
    }
    let value = unit.reg(rm);
    let zeros = unit.ins().clz(value);
    unit.set_reg(rd, zeros);
    Ok(Flow::Continue)
}

pub(super) fn translate_mrs(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::Mrs { rd } = insn.op else {
        return Err(unimplemented(insn, "not an mrs instruction"));
    };
    if usize::from(rd) == REG_PC {
        return Err(unimplemented(insn, "mrs into pc"));
    }
    let cpsr = unit.cpsr();
    unit.set_reg(rd, cpsr);
    Ok(Flow::Continue)
}

/// MSR CPSR_f：只改 NZCV；控制、扩展、状态字段需要特权模式支持
pub(super) fn translate_msr(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::Msr { mask, operand } = insn.op else {
        return Err(unimplemented(insn, "not an msr instruction"));
    };
    if mask != MSR_FLAGS_FIELD {
        return Err(unimplemented(insn, "msr to fields other than flags"));
    }

    let value = match operand {
        MsrOperand::Imm { imm8, rotate } => unit.const32(Operand2::expand_imm(imm8, rotate)),
        MsrOperand::Reg(rm) => unit.reg(rm),
    };
    let flags_mask = unit.const32(FLAG_BITS);
    let flags = unit.ins().band(value, flags_mask);
    let cpsr = unit.cpsr();
    let rest_mask = unit.const32(!FLAG_BITS);
    let rest = unit.ins().band(cpsr, rest_mask);
    let updated = unit.ins().bor(rest, flags);
    unit.set_cpsr(updated);
    Ok(Flow::Continue)
}
