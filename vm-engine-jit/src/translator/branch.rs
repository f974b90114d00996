//! 分支

use vm_core::{BlockExit, JitResult, REG_LR};

use super::{Flow, UnitBuilder, unimplemented};
use crate::insn::{ArmInsn, ArmOp};

/// B / BL：目标为指令地址 + 8 + 偏移
pub(super) fn translate_branch(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::Branch { link, offset } = insn.op else {
        return Err(unimplemented(insn, "not a branch instruction"));
    };

    if link {
        let ret = unit.const32(insn.addr.wrapping_add(4));
        unit.set_reg(REG_LR as u8, ret);
    }
    let target = insn.addr.wrapping_add(8).wrapping_add_signed(offset);
    unit.set_pc_const(target);
    unit.exit(BlockExit::Branch);
    Ok(Flow::Exit)
}

/// BX / BLX（寄存器）：目标 bit0 选择 Thumb 状态
pub(super) fn translate_exchange(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::BranchExchange { rm, link } = insn.op else {
        return Err(unimplemented(insn, "not a branch-exchange instruction"));
    };

    // 先读 rm，BLX lr 跳到旧的 lr
    let target = unit.reg(rm);
    if link {
        let ret = unit.const32(insn.addr.wrapping_add(4));
        unit.set_reg(REG_LR as u8, ret);
    }
    unit.interwork_branch(target);
    unit.exit(BlockExit::Branch);
    Ok(Flow::Exit)
}
