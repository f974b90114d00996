//! 乘法与长乘法

use cranelift_codegen::ir::{InstBuilder, condcodes::IntCC, types};
use vm_core::{JitResult, REG_PC};

use super::{Flow, UnitBuilder, unimplemented};
use crate::insn::{ArmInsn, ArmOp};

/// MUL / MLA：只更新 N、Z
pub(super) fn translate_multiply(unit: &mut UnitBuilder<'_>, insn: &ArmInsn) -> JitResult<Flow> {
    let ArmOp::Multiply {
        accumulate,
        s,
        rd,
        rn,
        rs,
        rm,
    } = insn.op
    else {
        return Err(unimplemented(insn, "not a multiply instruction"));
    };
    if usize::from(rd) == REG_PC {
        return Err(unimplemented(insn, "multiply into pc"));
    }

    let a = unit.reg(rm);
    let b = unit.reg(rs);
    let mut result = unit.ins().imul(a, b);
    if accumulate {
        let acc = unit.reg(rn);
        result = unit.ins().iadd(result, acc);
    }

    if s {
        let (n, z) = unit.nz(result);
        unit.set_flags(Some(n), Some(z), None, None);
    }
    unit.set_reg(rd, result);
    Ok(Flow::Continue)
}

/// UMULL / UMLAL / SMULL / SMLAL
pub(super) fn translate_multiply_long(
    unit: &mut UnitBuilder<'_>,
    insn: &ArmInsn,
) -> JitResult<Flow> {
    let ArmOp::MultiplyLong {
        signed,
        accumulate,
        s,
        rd_hi,
        rd_lo,
        rs,
        rm,
    } = insn.op
    else {
        return Err(unimplemented(insn, "not a long multiply instruction"));
    };
    if usize::from(rd_hi) == REG_PC || usize::from(rd_lo) == REG_PC || rd_hi == rd_lo {
        return Err(unimplemented(insn, "unpredictable destination registers"));
    }

    let a = unit.reg(rm);
    let b = unit.reg(rs);
    let (a, b) = if signed {
        (
            unit.ins().sextend(types::I64, a),
            unit.ins().sextend(types::I64, b),
        )
    } else {
        (
            unit.ins().uextend(types::I64, a),
            unit.ins().uextend(types::I64, b),
        )
    };
    let mut product = unit.ins().imul(a, b);

    if accumulate {
        let lo = unit.reg(rd_lo);
        let hi = unit.reg(rd_hi);
        let lo = unit.ins().uextend(types::I64, lo);
        let hi = unit.ins().uextend(types::I64, hi);
        let hi = unit.ins().ishl_imm(hi, 32);
        let acc = unit.ins().bor(hi, lo);
        product = unit.ins().iadd(product, acc);
    }

    let lo = unit.ins().ireduce(types::I32, product);
    let high = unit.ins().ushr_imm(product, 32);
    let hi = unit.ins().ireduce(types::I32, high);

    if s {
        let n = unit.bit(hi, 31);
        let is_zero = unit.ins().icmp_imm(IntCC::Equal, product, 0);
        let z = unit.ins().uextend(types::I32, is_zero);
        unit.set_flags(Some(n), Some(z), None, None);
    }
    unit.set_reg(rd_lo, lo);
    unit.set_reg(rd_hi, hi);
    Ok(Flow::Continue)
}
