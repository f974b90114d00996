//! 单数据与块数据传送
//!
//! 所有访存都通过 [`UnitBuilder::memory_operand`] 翻译地址。
//! 加载类指令先完成全部读取，再回写基址，最后写目标寄存器，
//! 因此开启页保护时出错的指令不会留下部分更新的寄存器。

use cranelift_codegen::ir::{InstBuilder, Value, types};
use vm_core::{BlockExit, JitResult, REG_PC};

use super::data_processing::shift_by_immediate;
use super::{Flow, UnitBuilder, unimplemented};
use crate::insn::{AccessSize, Addressing, ArmInsn, ArmOp, BlockMode, Offset};

/// LDR / STR 及其字节、半字、有符号变体
pub(super) fn translate_single(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::LoadStore {
        load,
        size,
        rd,
        rn,
        offset,
        addressing,
    } = insn.op
    else {
        return Err(unimplemented(insn, "not a load/store instruction"));
    };

    let writeback = addressing != Addressing::Offset;
    if writeback && usize::from(rn) == REG_PC {
        return Err(unimplemented(insn, "write-back to pc"));
    }
    if load && usize::from(rd) == REG_PC && size != AccessSize::Word {
        return Err(unimplemented(insn, "sub-word load into pc"));
    }
    if !load && matches!(size, AccessSize::SignedByte | AccessSize::SignedHalf) {
        return Err(unimplemented(insn, "signed store"));
    }

    let base = unit.reg(rn);
    let (delta, subtract) = match offset {
        Offset::Imm(imm) => (unit.const32(imm.unsigned_abs()), imm < 0),
        Offset::Reg {
            rm,
            shift,
            amount,
            subtract,
        } => {
            if amount > 31 {
                return Err(unimplemented(insn, "shift amount out of range"));
            }
            let value = unit.reg(rm);
            (shift_by_immediate(unit, value, shift, amount, false).0, subtract)
        }
    };
    let updated = if subtract {
        unit.ins().isub(base, delta)
    } else {
        unit.ins().iadd(base, delta)
    };
    let addr = match addressing {
        Addressing::PostIndexed => base,
        Addressing::Offset | Addressing::PreIndexed => updated,
    };

    let (ty, signed) = match size {
        AccessSize::Word => (types::I32, false),
        AccessSize::Byte => (types::I8, false),
        AccessSize::Half => (types::I16, false),
        AccessSize::SignedByte => (types::I8, true),
        AccessSize::SignedHalf => (types::I16, true),
    };
    let mem = unit.memory_operand(addr, ty)?;

    if load {
        let value = unit.load(mem, signed);
        if writeback {
            unit.set_reg(rn, updated);
        }
        if usize::from(rd) == REG_PC {
            unit.interwork_branch(value);
            unit.exit(BlockExit::Branch);
            return Ok(Flow::Exit);
        }
        unit.set_reg(rd, value);
    } else {
        let value = unit.reg(rd);
        unit.store(mem, value);
        if writeback {
            unit.set_reg(rn, updated);
        }
    }
    Ok(Flow::Continue)
}

/// LDM / STM（IA、IB、DA、DB）
pub(super) fn translate_multiple(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::LoadStoreMultiple {
        load,
        mode,
        rn,
        writeback,
        list,
    } = insn.op
    else {
        return Err(unimplemented(insn, "not a load/store-multiple instruction"));
    };
    if list == 0 {
        return Err(unimplemented(insn, "empty register list"));
    }
    if usize::from(rn) == REG_PC {
        return Err(unimplemented(insn, "pc as base register"));
    }

    let regs: Vec<u8> = (0..16u8).filter(|r| list & (1 << r) != 0).collect();
    let bytes = 4 * regs.len() as u32;

    let base = unit.reg(rn);
    let start = match mode {
        BlockMode::IncrementAfter => base,
        BlockMode::IncrementBefore => offset(unit, base, 4, false),
        BlockMode::DecrementAfter => offset(unit, base, bytes - 4, true),
        BlockMode::DecrementBefore => offset(unit, base, bytes, true),
    };
    let final_base = match mode {
        BlockMode::IncrementAfter | BlockMode::IncrementBefore => offset(unit, base, bytes, false),
        BlockMode::DecrementAfter | BlockMode::DecrementBefore => offset(unit, base, bytes, true),
    };

    if load {
        let mut values = Vec::with_capacity(regs.len());
        for (i, &r) in regs.iter().enumerate() {
            let addr = offset(unit, start, 4 * i as u32, false);
            let mem = unit.memory_operand(addr, types::I32)?;
            values.push((r, unit.load(mem, false)));
        }
        // 基址也在列表中时以加载值为准
        if writeback && list & (1 << rn) == 0 {
            unit.set_reg(rn, final_base);
        }
        let mut new_pc = None;
        for (r, value) in values {
            if usize::from(r) == REG_PC {
                new_pc = Some(value);
            } else {
                unit.set_reg(r, value);
            }
        }
        if let Some(target) = new_pc {
            unit.interwork_branch(target);
            unit.exit(BlockExit::Branch);
            return Ok(Flow::Exit);
        }
    } else {
        for (i, &r) in regs.iter().enumerate() {
            let addr = offset(unit, start, 4 * i as u32, false);
            let mem = unit.memory_operand(addr, types::I32)?;
            let value = unit.reg(r);
            unit.store(mem, value);
        }
        if writeback {
            unit.set_reg(rn, final_base);
        }
    }
    Ok(Flow::Continue)
}

fn offset(unit: &mut UnitBuilder<'_>, base: Value, by: u32, subtract: bool) -> Value {
    if by == 0 {
        return base;
    }
    let by = unit.const32(by);
    if subtract {
        unit.ins().isub(base, by)
    } else {
        unit.ins().iadd(base, by)
    }
}
