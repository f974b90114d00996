//! 解码后的 ARM 指令
//!
//! 解码器在本 crate 之外；这里只定义翻译器消费的指令形式。
//! 寄存器号为 0-15，立即数已按编码规则展开（分支偏移已符号扩展并乘 4）。

use std::fmt;

use vm_core::{Condition, GuestAddr};

/// 一条解码后的指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmInsn {
    pub addr: GuestAddr,
    pub cond: Condition,
    pub op: ArmOp,
}

impl ArmInsn {
    pub fn new(addr: GuestAddr, cond: Condition, op: ArmOp) -> Self {
        Self { addr, cond, op }
    }

    /// 无条件执行的指令
    pub fn always(addr: GuestAddr, op: ArmOp) -> Self {
        Self::new(addr, Condition::Al, op)
    }

    pub fn family(&self) -> OpcodeFamily {
        self.op.family()
    }
}

impl fmt::Display for ArmInsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op, self.cond.suffix())
    }
}

/// 移位类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

/// 数据处理指令的第二操作数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand2 {
    /// 8 位立即数循环右移 `2 * rotate` 位
    Imm { imm8: u8, rotate: u8 },
    /// 寄存器按立即数移位；`amount == 0` 的 LSR/ASR 表示移 32 位，ROR 表示 RRX
    Reg { rm: u8, shift: ShiftKind, amount: u8 },
    /// 寄存器按寄存器移位
    RegShiftReg { rm: u8, shift: ShiftKind, rs: u8 },
}

impl Operand2 {
    /// 立即数操作数
    pub fn imm(imm8: u8, rotate: u8) -> Self {
        Operand2::Imm { imm8, rotate }
    }

    /// 不移位的寄存器
    pub fn reg(rm: u8) -> Self {
        Operand2::Reg {
            rm,
            shift: ShiftKind::Lsl,
            amount: 0,
        }
    }

    /// 展开后的立即数值
    pub fn expand_imm(imm8: u8, rotate: u8) -> u32 {
        u32::from(imm8).rotate_right(u32::from(rotate & 0xf) * 2)
    }
}

/// 数据处理操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpOpcode {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
}

impl DpOpcode {
    /// 只更新标志、不写目标寄存器
    pub fn is_test(self) -> bool {
        matches!(self, DpOpcode::Tst | DpOpcode::Teq | DpOpcode::Cmp | DpOpcode::Cmn)
    }

    /// C 取自移位器、V 不变
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            DpOpcode::And
                | DpOpcode::Eor
                | DpOpcode::Tst
                | DpOpcode::Teq
                | DpOpcode::Orr
                | DpOpcode::Mov
                | DpOpcode::Bic
                | DpOpcode::Mvn
        )
    }

    /// 不读取 Rn
    pub fn is_move(self) -> bool {
        matches!(self, DpOpcode::Mov | DpOpcode::Mvn)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            DpOpcode::And => "and",
            DpOpcode::Eor => "eor",
            DpOpcode::Sub => "sub",
            DpOpcode::Rsb => "rsb",
            DpOpcode::Add => "add",
            DpOpcode::Adc => "adc",
            DpOpcode::Sbc => "sbc",
            DpOpcode::Rsc => "rsc",
            DpOpcode::Tst => "tst",
            DpOpcode::Teq => "teq",
            DpOpcode::Cmp => "cmp",
            DpOpcode::Cmn => "cmn",
            DpOpcode::Orr => "orr",
            DpOpcode::Mov => "mov",
            DpOpcode::Bic => "bic",
            DpOpcode::Mvn => "mvn",
        }
    }
}

/// 单数据访存宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Word,
    Byte,
    Half,
    SignedByte,
    SignedHalf,
}

/// 访存偏移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// 带符号立即数
    Imm(i32),
    /// 移位寄存器（移位规则同 [`Operand2::Reg`]），`subtract` 为真时从基址减去
    Reg {
        rm: u8,
        shift: ShiftKind,
        amount: u8,
        subtract: bool,
    },
}

/// 寻址方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// `[rn, off]`，不回写
    Offset,
    /// `[rn, off]!`
    PreIndexed,
    /// `[rn], off`
    PostIndexed,
}

/// 块传送方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    IncrementAfter,
    IncrementBefore,
    DecrementAfter,
    DecrementBefore,
}

/// MSR 源操作数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrOperand {
    Imm { imm8: u8, rotate: u8 },
    Reg(u8),
}

/// 指令操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOp {
    DataProcessing {
        op: DpOpcode,
        s: bool,
        rd: u8,
        rn: u8,
        operand: Operand2,
    },
    /// MUL / MLA
    Multiply {
        accumulate: bool,
        s: bool,
        rd: u8,
        rn: u8,
        rs: u8,
        rm: u8,
    },
    /// UMULL / UMLAL / SMULL / SMLAL
    MultiplyLong {
        signed: bool,
        accumulate: bool,
        s: bool,
        rd_hi: u8,
        rd_lo: u8,
        rs: u8,
        rm: u8,
    },
    LoadStore {
        load: bool,
        size: AccessSize,
        rd: u8,
        rn: u8,
        offset: Offset,
        addressing: Addressing,
    },
    LoadStoreMultiple {
        load: bool,
        mode: BlockMode,
        rn: u8,
        writeback: bool,
        list: u16,
    },
    /// B / BL，`offset` 相对于指令地址 + 8
    Branch { link: bool, offset: i32 },
    /// BX / BLX（寄存器）
    BranchExchange { rm: u8, link: bool },
    Svc { imm: u32 },
    Clz { rd: u8, rm: u8 },
    /// 读 CPSR
    Mrs { rd: u8 },
    /// 写 CPSR，`mask` 为 fsxc 字段掩码（bit3 = f）
    Msr { mask: u8, operand: MsrOperand },
    Coprocessor { raw: u32 },
    Vfp { raw: u32 },
    Undefined { raw: u32 },
}

impl ArmOp {
    pub fn family(&self) -> OpcodeFamily {
        match self {
            ArmOp::DataProcessing { .. } => OpcodeFamily::DataProcessing,
            ArmOp::Multiply { .. } => OpcodeFamily::Multiply,
            ArmOp::MultiplyLong { .. } => OpcodeFamily::MultiplyLong,
            ArmOp::LoadStore { .. } => OpcodeFamily::LoadStore,
            ArmOp::LoadStoreMultiple { .. } => OpcodeFamily::LoadStoreMultiple,
            ArmOp::Branch { .. } => OpcodeFamily::Branch,
            ArmOp::BranchExchange { .. } => OpcodeFamily::BranchExchange,
            ArmOp::Svc { .. } => OpcodeFamily::Supervisor,
            ArmOp::Clz { .. } => OpcodeFamily::CountLeadingZeros,
            ArmOp::Mrs { .. } => OpcodeFamily::StatusRead,
            ArmOp::Msr { .. } => OpcodeFamily::StatusWrite,
            ArmOp::Coprocessor { .. } => OpcodeFamily::Coprocessor,
            ArmOp::Vfp { .. } => OpcodeFamily::Vfp,
            ArmOp::Undefined { .. } => OpcodeFamily::Undefined,
        }
    }

    /// 编码中出现的寄存器号，不含 LDM/STM 的寄存器列表
    pub fn register_operands(&self) -> Vec<u8> {
        match *self {
            ArmOp::DataProcessing {
                rd, rn, operand, ..
            } => match operand {
                Operand2::Imm { .. } => vec![rd, rn],
                Operand2::Reg { rm, .. } => vec![rd, rn, rm],
                Operand2::RegShiftReg { rm, rs, .. } => vec![rd, rn, rm, rs],
            },
            ArmOp::Multiply { rd, rn, rs, rm, .. } => vec![rd, rn, rs, rm],
            ArmOp::MultiplyLong {
                rd_hi, rd_lo, rs, rm, ..
            } => vec![rd_hi, rd_lo, rs, rm],
            ArmOp::LoadStore { rd, rn, offset, .. } => match offset {
                Offset::Imm(_) => vec![rd, rn],
                Offset::Reg { rm, .. } => vec![rd, rn, rm],
            },
            ArmOp::LoadStoreMultiple { rn, .. } => vec![rn],
            ArmOp::BranchExchange { rm, .. } => vec![rm],
            ArmOp::Clz { rd, rm } => vec![rd, rm],
            ArmOp::Mrs { rd } => vec![rd],
            ArmOp::Msr {
                operand: MsrOperand::Reg(rm),
                ..
            } => vec![rm],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ArmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ArmOp::DataProcessing { op, s, .. } => {
                write!(f, "{}{}", op.mnemonic(), if s && !op.is_test() { "s" } else { "" })
            }
            ArmOp::Multiply { accumulate, .. } => f.write_str(if accumulate { "mla" } else { "mul" }),
            ArmOp::MultiplyLong {
                signed, accumulate, ..
            } => write!(
                f,
                "{}{}",
                if signed { "smul" } else { "umul" },
                if accumulate { "al" } else { "l" }
            ),
            ArmOp::LoadStore { load, size, .. } => {
                let suffix = match size {
                    AccessSize::Word => "",
                    AccessSize::Byte => "b",
                    AccessSize::Half => "h",
                    AccessSize::SignedByte => "sb",
                    AccessSize::SignedHalf => "sh",
                };
                write!(f, "{}{suffix}", if load { "ldr" } else { "str" })
            }
            ArmOp::LoadStoreMultiple { load, mode, .. } => {
                let mode = match mode {
                    BlockMode::IncrementAfter => "ia",
                    BlockMode::IncrementBefore => "ib",
                    BlockMode::DecrementAfter => "da",
                    BlockMode::DecrementBefore => "db",
                };
                write!(f, "{}{mode}", if load { "ldm" } else { "stm" })
            }
            ArmOp::Branch { link, .. } => f.write_str(if link { "bl" } else { "b" }),
            ArmOp::BranchExchange { link, .. } => f.write_str(if link { "blx" } else { "bx" }),
            ArmOp::Svc { .. } => f.write_str("svc"),
            ArmOp::Clz { .. } => f.write_str("clz"),
            ArmOp::Mrs { .. } => f.write_str("mrs"),
            ArmOp::Msr { .. } => f.write_str("msr"),
            ArmOp::Coprocessor { raw } => write!(f, "cdp/mcr ({raw:#010x})"),
            ArmOp::Vfp { raw } => write!(f, "vfp ({raw:#010x})"),
            ArmOp::Undefined { raw } => write!(f, "udf ({raw:#010x})"),
        }
    }
}

/// 操作码族：翻译器按族分派处理器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeFamily {
    DataProcessing,
    Multiply,
    MultiplyLong,
    LoadStore,
    LoadStoreMultiple,
    Branch,
    BranchExchange,
    Supervisor,
    CountLeadingZeros,
    StatusRead,
    StatusWrite,
    Coprocessor,
    Vfp,
    Undefined,
}

impl OpcodeFamily {
    pub const COUNT: usize = 14;

    pub const ALL: [OpcodeFamily; Self::COUNT] = [
        OpcodeFamily::DataProcessing,
        OpcodeFamily::Multiply,
        OpcodeFamily::MultiplyLong,
        OpcodeFamily::LoadStore,
        OpcodeFamily::LoadStoreMultiple,
        OpcodeFamily::Branch,
        OpcodeFamily::BranchExchange,
        OpcodeFamily::Supervisor,
        OpcodeFamily::CountLeadingZeros,
        OpcodeFamily::StatusRead,
        OpcodeFamily::StatusWrite,
        OpcodeFamily::Coprocessor,
        OpcodeFamily::Vfp,
        OpcodeFamily::Undefined,
    ];

    /// 分派表下标
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for OpcodeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpcodeFamily::DataProcessing => "data-processing",
            OpcodeFamily::Multiply => "multiply",
            OpcodeFamily::MultiplyLong => "multiply-long",
            OpcodeFamily::LoadStore => "load/store",
            OpcodeFamily::LoadStoreMultiple => "load/store-multiple",
            OpcodeFamily::Branch => "branch",
            OpcodeFamily::BranchExchange => "branch-exchange",
            OpcodeFamily::Supervisor => "supervisor-call",
            OpcodeFamily::CountLeadingZeros => "clz",
            OpcodeFamily::StatusRead => "mrs",
            OpcodeFamily::StatusWrite => "msr",
            OpcodeFamily::Coprocessor => "coprocessor",
            OpcodeFamily::Vfp => "vfp",
            OpcodeFamily::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_indices_are_dense() {
        for (i, family) in OpcodeFamily::ALL.iter().enumerate() {
            assert_eq!(family.index(), i);
        }
    }

    #[test]
    fn test_immediate_expansion() {
        assert_eq!(Operand2::expand_imm(0xff, 0), 0xff);
        assert_eq!(Operand2::expand_imm(0xff, 4), 0xff00_0000);
        assert_eq!(Operand2::expand_imm(0x01, 1), 0x4000_0000);
    }

    #[test]
    fn test_display() {
        let insn = ArmInsn::new(
            0x8000,
            Condition::Ne,
            ArmOp::DataProcessing {
                op: DpOpcode::Add,
                s: true,
                rd: 0,
                rn: 1,
                operand: Operand2::imm(1, 0),
            },
        );
        assert_eq!(insn.to_string(), "addsne");
        assert_eq!(ArmOp::Vfp { raw: 0xee30_0a00 }.to_string(), "vfp (0xee300a00)");
        assert_eq!(insn.family(), OpcodeFamily::DataProcessing);
    }

    #[test]
    fn test_register_operands() {
        let ldr = ArmOp::LoadStore {
            load: true,
            size: AccessSize::Word,
            rd: 2,
            rn: 13,
            offset: Offset::Reg {
                rm: 7,
                shift: ShiftKind::Lsl,
                amount: 2,
                subtract: false,
            },
            addressing: Addressing::PreIndexed,
        };
        assert_eq!(ldr.register_operands(), vec![2, 13, 7]);

        let push = ArmOp::LoadStoreMultiple {
            load: false,
            mode: BlockMode::DecrementBefore,
            rn: 13,
            writeback: true,
            list: 0xffff,
        };
        assert_eq!(push.register_operands(), vec![13]);
        assert!(ArmOp::Svc { imm: 0 }.register_operands().is_empty());
        assert!(
            ArmOp::Msr {
                mask: 0x8,
                operand: MsrOperand::Imm { imm8: 0, rotate: 0 },
            }
            .register_operands()
            .is_empty()
        );
    }
}
