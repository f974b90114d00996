//! 数据处理指令与移位器

use cranelift_codegen::ir::{InstBuilder, Value};
use vm_core::{BlockExit, JitResult, REG_PC};

use super::{Flow, UnitBuilder, unimplemented};
use crate::insn::{ArmInsn, ArmOp, DpOpcode, Operand2, ShiftKind};

pub(super) fn translate(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::DataProcessing {
        op,
        s,
        rd,
        rn,
        operand,
    } = insn.op
    else {
        return Err(unimplemented(insn, "not a data-processing instruction"));
    };

    let writes_pc = usize::from(rd) == REG_PC && !op.is_test();
    if writes_pc && s {
        // 需要从 SPSR 恢复 CPSR
        return Err(unimplemented(insn, "flag-setting write to pc"));
    }

    let need_carry = s && op.is_logical();
    let (b, shifter_carry) = operand2(unit, insn, operand, need_carry)?;
    let a = if op.is_move() { b } else { unit.reg(rn) };

    let mut arith = None;
    let result = match op {
        DpOpcode::And | DpOpcode::Tst => unit.ins().band(a, b),
        DpOpcode::Eor | DpOpcode::Teq => unit.ins().bxor(a, b),
        DpOpcode::Orr => unit.ins().bor(a, b),
        DpOpcode::Bic => unit.ins().band_not(a, b),
        DpOpcode::Mov => b,
        DpOpcode::Mvn => unit.ins().bnot(b),
        DpOpcode::Add | DpOpcode::Cmn => {
            let zero = unit.const32(0);
            let (r, c, v) = unit.add_with_carry(a, b, zero);
            arith = Some((c, v));
            r
        }
        DpOpcode::Adc => {
            let carry = unit.carry_flag();
            let (r, c, v) = unit.add_with_carry(a, b, carry);
            arith = Some((c, v));
            r
        }
        DpOpcode::Sub | DpOpcode::Cmp | DpOpcode::Sbc => {
            let not_b = unit.ins().bnot(b);
            let carry = if op == DpOpcode::Sbc {
                unit.carry_flag()
            } else {
                unit.const32(1)
            };
            let (r, c, v) = unit.add_with_carry(a, not_b, carry);
            arith = Some((c, v));
            r
        }
        DpOpcode::Rsb | DpOpcode::Rsc => {
            let not_a = unit.ins().bnot(a);
            let carry = if op == DpOpcode::Rsc {
                unit.carry_flag()
            } else {
                unit.const32(1)
            };
            let (r, c, v) = unit.add_with_carry(b, not_a, carry);
            arith = Some((c, v));
            r
        }
    };

    if s {
        let (n, z) = unit.nz(result);
        match arith {
            Some((c, v)) => unit.set_flags(Some(n), Some(z), Some(c), Some(v)),
            None => unit.set_flags(Some(n), Some(z), shifter_carry, None),
        }
    }

    if op.is_test() {
        return Ok(Flow::Continue);
    }
    if writes_pc {
        let align = unit.const32(!3);
        let target = unit.ins().band(result, align);
        unit.set_pc(target);
        unit.exit(BlockExit::Branch);
        return Ok(Flow::Exit);
    }
    unit.set_reg(rd, result);
    Ok(Flow::Continue)
}

/// 求第二操作数；`need_carry` 时一并给出移位器进位（`None` 表示 C 不变）
fn operand2(
    unit: &mut UnitBuilder<'_>,
    insn: &ArmInsn,
    operand: Operand2,
    need_carry: bool,
) -> JitResult<(Value, Option<Value>)> {
    match operand {
        Operand2::Imm { imm8, rotate } => {
            let value = Operand2::expand_imm(imm8, rotate);
            let carry = (need_carry && rotate != 0).then(|| unit.const32(value >> 31));
            Ok((unit.const32(value), carry))
        }
        Operand2::Reg { rm, shift, amount } => {
            if amount > 31 {
                return Err(unimplemented(insn, "shift amount out of range"));
            }
            let value = unit.reg(rm);
            Ok(shift_by_immediate(unit, value, shift, amount, need_carry))
        }
        Operand2::RegShiftReg { .. } => Err(unimplemented(insn, "register-shifted register operand")),
    }
}

/// 按立即数移位；LSR/ASR #0 表示移 32 位，ROR #0 表示 RRX
pub(super) fn shift_by_immediate(
    unit: &mut UnitBuilder<'_>,
    value: Value,
    shift: ShiftKind,
    amount: u8,
    need_carry: bool,
) -> (Value, Option<Value>) {
    let n = i64::from(amount);

    match (shift, amount) {
        (ShiftKind::Lsl, 0) => (value, None),
        (ShiftKind::Lsl, _) => {
            let carry = carry_bit(unit, value, 32 - u32::from(amount), need_carry);
            (unit.ins().ishl_imm(value, n), carry)
        }
        (ShiftKind::Lsr, 0) => {
            let carry = carry_bit(unit, value, 31, need_carry);
            (unit.const32(0), carry)
        }
        (ShiftKind::Lsr, _) => {
            let carry = carry_bit(unit, value, u32::from(amount) - 1, need_carry);
            (unit.ins().ushr_imm(value, n), carry)
        }
        (ShiftKind::Asr, 0) => {
            let carry = carry_bit(unit, value, 31, need_carry);
            (unit.ins().sshr_imm(value, 31), carry)
        }
        (ShiftKind::Asr, _) => {
            let carry = carry_bit(unit, value, u32::from(amount) - 1, need_carry);
            (unit.ins().sshr_imm(value, n), carry)
        }
        (ShiftKind::Ror, 0) => {
            let carry = carry_bit(unit, value, 0, need_carry);
            let c = unit.carry_flag();
            let top = unit.ins().ishl_imm(c, 31);
            let rest = unit.ins().ushr_imm(value, 1);
            (unit.ins().bor(top, rest), carry)
        }
        (ShiftKind::Ror, _) => {
            let carry = carry_bit(unit, value, u32::from(amount) - 1, need_carry);
            (unit.ins().rotr_imm(value, n), carry)
        }
    }
}

fn carry_bit(unit: &mut UnitBuilder<'_>, value: Value, bit: u32, need_carry: bool) -> Option<Value> {
    need_carry.then(|| unit.bit(value, bit))
}
