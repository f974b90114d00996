//! 编译块执行测试
//!
//! 翻译 ARM 指令批次，安装后直接以块签名调用，检查寄存器、标志、
//! 客户机内存、退出原因与周期计数。

use std::ptr::NonNull;

use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};
use vm_core::{CPSR_C, CPSR_N, CPSR_T, CPSR_V, CPSR_Z, Condition, GUEST_PAGE_SIZE, REG_LR, REG_SP};
use vm_engine_jit::{
    AccessSize, Addressing, ArmInsn, ArmOp, BlockExit, BlockMode, CpuContext, DpOpcode, EntryPoint,
    Flow, JitConfig, JitError, JitResult, MsrOperand, Offset, OpcodeFamily, Operand2, ShiftKind,
    TranslationContext, Translator, UnitBuilder, runtime,
};
use vm_mem::GuestPageTable;

const CODE: u32 = 0x8000;
const DATA: u32 = 0x10000;
const CYCLES: i32 = 100;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// 测试环境
// ============================================================================

/// 页表加上一段宿主内存作为客户机页的后备
struct GuestMemory {
    table: GuestPageTable,
    backing: Vec<u8>,
}

impl GuestMemory {
    fn new(pages: usize) -> Self {
        Self {
            table: GuestPageTable::new(),
            backing: vec![0; pages * GUEST_PAGE_SIZE],
        }
    }

    /// 客户机页 `guest_page` -> 后备内存第 `slot` 页
    fn map(&mut self, guest_page: usize, slot: usize) {
        let base = self.backing.as_mut_ptr().wrapping_add(slot * GUEST_PAGE_SIZE);
        self.table.map(guest_page, NonNull::new(base).unwrap()).unwrap();
    }

    fn read_u32(&self, addr: u32) -> u32 {
        let ptr = self.table.translate(addr).unwrap();
        u32::from_le_bytes(unsafe { *(ptr as *const [u8; 4]) })
    }

    fn write_bytes(&mut self, addr: u32, bytes: &[u8]) {
        let ptr = self.table.translate(addr).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    }

    fn cpu(&self) -> CpuContext {
        let mut cpu = CpuContext::new(self.table.as_ptr());
        cpu.cycles_remaining = CYCLES;
        cpu
    }
}

fn context(config: JitConfig) -> TranslationContext {
    TranslationContext::with_config(JitConfig {
        arena_capacity: 4 << 20,
        verify_ir: true,
        ..config
    })
    .unwrap()
}

fn compile_with(ctx: &mut TranslationContext, translator: &Translator, insns: &[ArmInsn]) -> EntryPoint {
    let unit = translator.translate(ctx, insns).unwrap();
    let module = ctx.add_module(unit).unwrap();
    module.entry(&ctx.mangler().block_name(insns[0].addr)).unwrap()
}

fn compile(ctx: &mut TranslationContext, insns: &[ArmInsn]) -> EntryPoint {
    compile_with(ctx, &Translator::new(), insns)
}

/// 按顺序给指令分配地址
fn at(base: u32, ops: &[(Condition, ArmOp)]) -> Vec<ArmInsn> {
    ops.iter()
        .enumerate()
        .map(|(i, &(cond, op))| ArmInsn::new(base + 4 * i as u32, cond, op))
        .collect()
}

fn always(ops: &[ArmOp]) -> Vec<ArmInsn> {
    let ops: Vec<_> = ops.iter().map(|&op| (Condition::Al, op)).collect();
    at(CODE, &ops)
}

fn dp(op: DpOpcode, s: bool, rd: u8, rn: u8, operand: Operand2) -> ArmOp {
    ArmOp::DataProcessing {
        op,
        s,
        rd,
        rn,
        operand,
    }
}

fn mov_imm(rd: u8, imm8: u8) -> ArmOp {
    dp(DpOpcode::Mov, false, rd, 0, Operand2::imm(imm8, 0))
}

fn ldr(rd: u8, rn: u8, offset: i32, addressing: Addressing) -> ArmOp {
    ArmOp::LoadStore {
        load: true,
        size: AccessSize::Word,
        rd,
        rn,
        offset: Offset::Imm(offset),
        addressing,
    }
}

fn str_(rd: u8, rn: u8, offset: i32) -> ArmOp {
    ArmOp::LoadStore {
        load: false,
        size: AccessSize::Word,
        rd,
        rn,
        offset: Offset::Imm(offset),
        addressing: Addressing::Offset,
    }
}

fn nzcv(cpu: &CpuContext) -> (bool, bool, bool, bool) {
    (cpu.flag_n(), cpu.flag_z(), cpu.flag_c(), cpu.flag_v())
}

// ============================================================================
// 数据处理
// ============================================================================

#[test]
fn test_mov_add_end_of_block() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[
            mov_imm(0, 5),
            mov_imm(1, 7),
            dp(DpOpcode::Add, true, 2, 0, Operand2::reg(1)),
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.cpsr = CPSR_N | CPSR_Z | CPSR_C | CPSR_V;
    let exit = unsafe { entry.invoke(&mut cpu) };

    assert_eq!(exit, BlockExit::EndOfBlock);
    assert_eq!(cpu.reg(2), 12);
    assert_eq!(nzcv(&cpu), (false, false, false, false));
    assert_eq!(cpu.pc(), CODE + 12);
    assert_eq!(cpu.cycles_remaining, CYCLES - 3);
}

#[test]
fn test_subs_and_cmp_flags() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());

    let subs = compile(
        &mut ctx,
        &always(&[dp(DpOpcode::Sub, true, 2, 0, Operand2::reg(1))]),
    );
    let mut cpu = mem.cpu();
    cpu.set_reg(0, 5);
    cpu.set_reg(1, 7);
    unsafe { subs.invoke(&mut cpu) };
    assert_eq!(cpu.reg(2), (-2i32) as u32);
    assert_eq!(nzcv(&cpu), (true, false, false, false));

    let insns = at(
        0x9000,
        &[(Condition::Al, dp(DpOpcode::Cmp, true, 0, 0, Operand2::reg(0)))],
    );
    let cmp = compile(&mut ctx, &insns);
    let mut cpu = mem.cpu();
    cpu.set_reg(0, 0x1234);
    unsafe { cmp.invoke(&mut cpu) };
    assert_eq!(nzcv(&cpu), (false, true, true, false));
    // CMP 不写 rd
    assert_eq!(cpu.reg(0), 0x1234);
}

#[test]
fn test_adds_signed_overflow() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[dp(DpOpcode::Add, true, 0, 0, Operand2::imm(1, 0))]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 0x7fff_ffff);
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(0), 0x8000_0000);
    assert_eq!(nzcv(&cpu), (true, false, false, true));
}

#[test]
fn test_logical_ops_and_shifter_carry() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[
            // r2 = r1 LSR #32 -> 0，C = r1[31]
            dp(
                DpOpcode::Mov,
                true,
                2,
                0,
                Operand2::Reg {
                    rm: 1,
                    shift: ShiftKind::Lsr,
                    amount: 0,
                },
            ),
            // r3 = r1 & 0xff
            dp(DpOpcode::And, false, 3, 1, Operand2::imm(0xff, 0)),
            // r4 = r1 | 0xf0000000（0x0f ror 4）
            dp(DpOpcode::Orr, false, 4, 1, Operand2::imm(0x0f, 2)),
            // r5 = ~0
            dp(DpOpcode::Mvn, false, 5, 0, Operand2::imm(0, 0)),
            // r6 = r1 bic 0xff
            dp(DpOpcode::Bic, false, 6, 1, Operand2::imm(0xff, 0)),
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(1, 0x8000_00a5);
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(2), 0);
    assert!(cpu.flag_z());
    assert!(cpu.flag_c());
    assert_eq!(cpu.reg(3), 0xa5);
    assert_eq!(cpu.reg(4), 0xf000_00a5);
    assert_eq!(cpu.reg(5), u32::MAX);
    assert_eq!(cpu.reg(6), 0x8000_0000);
}

#[test]
fn test_rrx_uses_incoming_carry() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[dp(
            DpOpcode::Mov,
            true,
            0,
            0,
            Operand2::Reg {
                rm: 1,
                shift: ShiftKind::Ror,
                amount: 0,
            },
        )]),
    );

    let mut cpu = mem.cpu();
    cpu.cpsr = CPSR_C;
    cpu.set_reg(1, 2);
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(0), 0x8000_0001);
    assert!(!cpu.flag_c());
    assert!(cpu.flag_n());
}

#[test]
fn test_adc_and_sbc_use_carry() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[
            dp(DpOpcode::Adc, false, 2, 0, Operand2::reg(1)),
            dp(DpOpcode::Sbc, false, 3, 0, Operand2::reg(1)),
            dp(DpOpcode::Rsb, false, 4, 0, Operand2::imm(0, 0)),
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.cpsr = CPSR_C;
    cpu.set_reg(0, 10);
    cpu.set_reg(1, 3);
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(2), 14);
    assert_eq!(cpu.reg(3), 7);
    assert_eq!(cpu.reg(4), (-10i32) as u32);
}

#[test]
fn test_add_sub_flags_match_reference() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let adds = compile(
        &mut ctx,
        &always(&[dp(DpOpcode::Add, true, 2, 0, Operand2::reg(1))]),
    );
    let subs = compile(
        &mut ctx,
        &at(0x9000, &[(Condition::Al, dp(DpOpcode::Sub, true, 2, 0, Operand2::reg(1)))]),
    );

    let mut runner = TestRunner::new(Config::with_cases(256));
    runner
        .run(&(any::<u32>(), any::<u32>()), |(a, b)| {
            let mut cpu = mem.cpu();
            cpu.set_reg(0, a);
            cpu.set_reg(1, b);
            unsafe { adds.invoke(&mut cpu) };
            let sum = a.wrapping_add(b);
            prop_assert_eq!(cpu.reg(2), sum);
            prop_assert_eq!(
                nzcv(&cpu),
                (
                    (sum as i32) < 0,
                    sum == 0,
                    a.checked_add(b).is_none(),
                    (a as i32).checked_add(b as i32).is_none()
                )
            );

            let mut cpu = mem.cpu();
            cpu.set_reg(0, a);
            cpu.set_reg(1, b);
            unsafe { subs.invoke(&mut cpu) };
            let diff = a.wrapping_sub(b);
            prop_assert_eq!(cpu.reg(2), diff);
            prop_assert_eq!(
                nzcv(&cpu),
                (
                    (diff as i32) < 0,
                    diff == 0,
                    a >= b,
                    (a as i32).checked_sub(b as i32).is_none()
                )
            );
            Ok(())
        })
        .unwrap();
}

// ============================================================================
// 条件执行与分支
// ============================================================================

#[test]
fn test_conditional_instructions_are_skipped() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &at(
            CODE,
            &[
                (Condition::Al, dp(DpOpcode::Cmp, true, 0, 0, Operand2::imm(0, 0))),
                (Condition::Eq, mov_imm(1, 1)),
                (Condition::Ne, mov_imm(2, 2)),
                (Condition::Gt, mov_imm(3, 3)),
            ],
        ),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 1);
    let exit = unsafe { entry.invoke(&mut cpu) };
    assert_eq!(exit, BlockExit::EndOfBlock);
    assert_eq!((cpu.reg(1), cpu.reg(2), cpu.reg(3)), (0, 2, 3));
    // 跳过的指令同样计入
    assert_eq!(cpu.cycles_remaining, CYCLES - 4);
    assert_eq!(cpu.pc(), CODE + 16);

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 0);
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!((cpu.reg(1), cpu.reg(2), cpu.reg(3)), (1, 0, 0));
}

#[test]
fn test_branch_and_link() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[
            mov_imm(0, 1),
            ArmOp::Branch {
                link: true,
                offset: 0x100,
            },
            // 不可达
            mov_imm(1, 1),
        ]),
    );

    let mut cpu = mem.cpu();
    let exit = unsafe { entry.invoke(&mut cpu) };
    assert_eq!(exit, BlockExit::Branch);
    assert_eq!(cpu.pc(), CODE + 4 + 8 + 0x100);
    assert_eq!(cpu.reg(REG_LR), CODE + 8);
    assert_eq!(cpu.reg(1), 0);
    assert_eq!(cpu.cycles_remaining, CYCLES - 2);
}

#[test]
fn test_conditional_branch_falls_through() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &at(
            CODE,
            &[
                (Condition::Al, dp(DpOpcode::Cmp, true, 0, 0, Operand2::imm(0, 0))),
                (
                    Condition::Eq,
                    ArmOp::Branch {
                        link: false,
                        offset: -16,
                    },
                ),
                (Condition::Al, mov_imm(1, 9)),
            ],
        ),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 3);
    assert_eq!(unsafe { entry.invoke(&mut cpu) }, BlockExit::EndOfBlock);
    assert_eq!(cpu.reg(1), 9);
    assert_eq!(cpu.pc(), CODE + 12);

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 0);
    assert_eq!(unsafe { entry.invoke(&mut cpu) }, BlockExit::Branch);
    assert_eq!(cpu.pc(), CODE + 4 + 8 - 16);
    assert_eq!(cpu.reg(1), 0);
    assert_eq!(cpu.cycles_remaining, CYCLES - 2);
}

#[test]
fn test_branch_exchange_selects_thumb() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[ArmOp::BranchExchange { rm: 0, link: true }]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 0x9001);
    assert_eq!(unsafe { entry.invoke(&mut cpu) }, BlockExit::Branch);
    assert_eq!(cpu.pc(), 0x9000);
    assert!(cpu.is_thumb());
    assert_eq!(cpu.reg(REG_LR), CODE + 4);

    let mut cpu = mem.cpu();
    cpu.cpsr = CPSR_T;
    cpu.set_reg(0, 0xa000);
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.pc(), 0xa000);
    assert!(!cpu.is_thumb());
}

#[test]
fn test_svc_exit_carries_immediate() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[mov_imm(7, 1), ArmOp::Svc { imm: 0x12_3456 }]),
    );

    let mut cpu = mem.cpu();
    let exit = unsafe { entry.invoke(&mut cpu) };
    assert_eq!(exit, BlockExit::Supervisor(0x12_3456));
    assert_eq!(cpu.pc(), CODE + 8);
    assert_eq!(cpu.reg(7), 1);
    assert_eq!(cpu.cycles_remaining, CYCLES - 2);
}

#[test]
fn test_pc_reads_as_address_plus_eight() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[mov_imm(0, 0), dp(DpOpcode::Add, false, 1, 15, Operand2::imm(0, 0))]),
    );

    let mut cpu = mem.cpu();
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(1), CODE + 4 + 8);
}

// ============================================================================
// 访存
// ============================================================================

#[test]
fn test_load_store_word_and_writeback() {
    init_logger();
    let mut mem = GuestMemory::new(1);
    mem.map((DATA >> 12) as usize, 0);
    mem.write_bytes(DATA + 8, &0xdead_beefu32.to_le_bytes());

    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[
            ldr(1, 0, 8, Addressing::Offset),
            str_(1, 0, 12),
            ldr(2, 0, 4, Addressing::PostIndexed),
            ldr(3, 0, 4, Addressing::PreIndexed),
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, DATA);
    unsafe { entry.invoke(&mut cpu) };

    assert_eq!(cpu.reg(1), 0xdead_beef);
    assert_eq!(mem.read_u32(DATA + 12), 0xdead_beef);
    assert_eq!(cpu.reg(2), 0);
    assert_eq!(cpu.reg(3), 0xdead_beef);
    assert_eq!(cpu.reg(0), DATA + 8);
}

#[test]
fn test_byte_and_halfword_access() {
    init_logger();
    let mut mem = GuestMemory::new(1);
    mem.map((DATA >> 12) as usize, 0);
    mem.write_bytes(DATA, &[0x80, 0xff, 0x34, 0x12]);

    let access = |load: bool, size: AccessSize, rd: u8, offset: i32| ArmOp::LoadStore {
        load,
        size,
        rd,
        rn: 0,
        offset: Offset::Imm(offset),
        addressing: Addressing::Offset,
    };

    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[
            access(true, AccessSize::Byte, 1, 0),
            access(true, AccessSize::SignedByte, 2, 0),
            access(true, AccessSize::Half, 3, 2),
            access(true, AccessSize::SignedHalf, 4, 0),
            access(false, AccessSize::Byte, 5, 4),
            access(false, AccessSize::Half, 5, 6),
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, DATA);
    cpu.set_reg(5, 0xaabb_ccdd);
    unsafe { entry.invoke(&mut cpu) };

    assert_eq!(cpu.reg(1), 0x80);
    assert_eq!(cpu.reg(2), 0xffff_ff80);
    assert_eq!(cpu.reg(3), 0x1234);
    assert_eq!(cpu.reg(4), 0xffff_ff80);
    assert_eq!(mem.read_u32(DATA + 4), 0xccdd_00dd);
}

#[test]
fn test_register_offset_with_shift() {
    init_logger();
    let mut mem = GuestMemory::new(1);
    mem.map((DATA >> 12) as usize, 0);
    mem.write_bytes(DATA + 0x30, &7u32.to_le_bytes());

    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[ArmOp::LoadStore {
            load: true,
            size: AccessSize::Word,
            rd: 2,
            rn: 0,
            offset: Offset::Reg {
                rm: 1,
                shift: ShiftKind::Lsl,
                amount: 2,
                subtract: false,
            },
            addressing: Addressing::Offset,
        }]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, DATA);
    cpu.set_reg(1, 0xc);
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(2), 7);
}

#[test]
fn test_accesses_follow_page_table() {
    init_logger();
    let mut mem = GuestMemory::new(2);
    // 相邻客户机页映射到顺序相反的宿主页
    mem.map(0x20, 1);
    mem.map(0x21, 0);

    let mut ctx = context(JitConfig::default());
    let entry = compile(&mut ctx, &always(&[str_(1, 0, -4), str_(2, 0, 0)]));

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 0x21000);
    cpu.set_reg(1, 0x1111_1111);
    cpu.set_reg(2, 0x2222_2222);
    unsafe { entry.invoke(&mut cpu) };

    let slot = |page: usize, off: usize| {
        let at = page * GUEST_PAGE_SIZE + off;
        u32::from_le_bytes(mem.backing[at..at + 4].try_into().unwrap())
    };
    assert_eq!(slot(1, GUEST_PAGE_SIZE - 4), 0x1111_1111);
    assert_eq!(slot(0, 0), 0x2222_2222);
    assert_eq!(mem.read_u32(0x20ffc), 0x1111_1111);
}

#[test]
fn test_push_and_pop_multiple() {
    init_logger();
    let mut mem = GuestMemory::new(1);
    mem.map((DATA >> 12) as usize, 0);

    let mut ctx = context(JitConfig::default());
    let sp = REG_SP as u8;
    let entry = compile(
        &mut ctx,
        &always(&[
            ArmOp::LoadStoreMultiple {
                load: false,
                mode: BlockMode::DecrementBefore,
                rn: sp,
                writeback: true,
                list: 0b0100_0000_0000_0011,
            },
            ArmOp::LoadStoreMultiple {
                load: true,
                mode: BlockMode::IncrementAfter,
                rn: sp,
                writeback: true,
                list: 0b0000_0000_0111_0000,
            },
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(REG_SP, DATA + 0x100);
    cpu.set_reg(0, 10);
    cpu.set_reg(1, 11);
    cpu.set_reg(REG_LR, 0x8888);
    unsafe { entry.invoke(&mut cpu) };

    assert_eq!(mem.read_u32(DATA + 0xf4), 10);
    assert_eq!(mem.read_u32(DATA + 0xf8), 11);
    assert_eq!(mem.read_u32(DATA + 0xfc), 0x8888);
    assert_eq!((cpu.reg(4), cpu.reg(5), cpu.reg(6)), (10, 11, 0x8888));
    assert_eq!(cpu.reg(REG_SP), DATA + 0x100);
}

#[test]
fn test_load_into_pc_branches() {
    init_logger();
    let mut mem = GuestMemory::new(1);
    mem.map((DATA >> 12) as usize, 0);
    mem.write_bytes(DATA, &0x0000_c001u32.to_le_bytes());

    let mut ctx = context(JitConfig::default());
    let entry = compile(&mut ctx, &always(&[ldr(15, 0, 0, Addressing::Offset), mov_imm(1, 1)]));

    let mut cpu = mem.cpu();
    cpu.set_reg(0, DATA);
    assert_eq!(unsafe { entry.invoke(&mut cpu) }, BlockExit::Branch);
    assert_eq!(cpu.pc(), 0xc000);
    assert!(cpu.is_thumb());
    assert_eq!(cpu.reg(1), 0);
}

#[test]
fn test_guarded_access_to_unmapped_page_faults() {
    init_logger();
    let mut mem = GuestMemory::new(1);
    mem.map((DATA >> 12) as usize, 0);
    mem.write_bytes(DATA, &5u32.to_le_bytes());

    let mut ctx = context(JitConfig {
        guard_unmapped_pages: true,
        ..JitConfig::default()
    });
    let entry = compile(
        &mut ctx,
        &always(&[
            mov_imm(1, 1),
            ldr(2, 0, 4, Addressing::PostIndexed),
            mov_imm(3, 3),
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 0x40000);
    let exit = unsafe { entry.invoke(&mut cpu) };
    assert_eq!(exit, BlockExit::PageFault(0x40000));
    assert_eq!(cpu.pc(), CODE + 4);
    assert_eq!(cpu.reg(1), 1);
    // 出错指令没有回写基址
    assert_eq!(cpu.reg(0), 0x40000);
    assert_eq!((cpu.reg(2), cpu.reg(3)), (0, 0));
    assert_eq!(cpu.cycles_remaining, CYCLES - 1);

    // 已映射的页照常访问
    let mut cpu = mem.cpu();
    cpu.set_reg(0, DATA);
    assert_eq!(unsafe { entry.invoke(&mut cpu) }, BlockExit::EndOfBlock);
    assert_eq!((cpu.reg(2), cpu.reg(3)), (5, 3));
    assert_eq!(cpu.reg(0), DATA + 4);
}

#[test]
fn test_unguarded_blocks_omit_page_checks() {
    init_logger();
    let insns = always(&[ldr(1, 0, 0, Addressing::Offset), str_(1, 0, 4)]);

    let mut plain = context(JitConfig::default());
    let unit = Translator::new().translate(&mut plain, &insns).unwrap();
    let plain_size = plain.add_module(unit).unwrap().code_size();

    let mut guarded = context(JitConfig {
        guard_unmapped_pages: true,
        ..JitConfig::default()
    });
    let unit = Translator::new().translate(&mut guarded, &insns).unwrap();
    let guarded_size = guarded.add_module(unit).unwrap().code_size();

    assert!(guarded_size > plain_size, "{guarded_size} <= {plain_size}");
}

// ============================================================================
// 乘法与系统指令
// ============================================================================

#[test]
fn test_multiply_variants() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[
            ArmOp::Multiply {
                accumulate: false,
                s: false,
                rd: 2,
                rn: 0,
                rs: 1,
                rm: 0,
            },
            ArmOp::Multiply {
                accumulate: true,
                s: false,
                rd: 3,
                rn: 2,
                rs: 1,
                rm: 0,
            },
            ArmOp::MultiplyLong {
                signed: false,
                accumulate: false,
                s: false,
                rd_hi: 5,
                rd_lo: 4,
                rs: 6,
                rm: 7,
            },
            ArmOp::MultiplyLong {
                signed: true,
                accumulate: false,
                s: true,
                rd_hi: 9,
                rd_lo: 8,
                rs: 10,
                rm: 11,
            },
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.set_reg(0, 6);
    cpu.set_reg(1, 7);
    cpu.set_reg(6, 0xffff_ffff);
    cpu.set_reg(7, 2);
    cpu.set_reg(10, (-2i32) as u32);
    cpu.set_reg(11, 3);
    unsafe { entry.invoke(&mut cpu) };

    assert_eq!(cpu.reg(2), 42);
    assert_eq!(cpu.reg(3), 84);
    assert_eq!((cpu.reg(5), cpu.reg(4)), (1, 0xffff_fffe));
    assert_eq!((cpu.reg(9), cpu.reg(8)), (0xffff_ffff, 0xffff_fffa));
    assert!(cpu.flag_n());
    assert!(!cpu.flag_z());
}

#[test]
fn test_clz_mrs_msr() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig::default());
    let entry = compile(
        &mut ctx,
        &always(&[
            ArmOp::Clz { rd: 1, rm: 0 },
            ArmOp::Mrs { rd: 2 },
            // Z|C = 0x06 ror 4
            ArmOp::Msr {
                mask: 0b1000,
                operand: MsrOperand::Imm { imm8: 0x06, rotate: 2 },
            },
            ArmOp::Mrs { rd: 3 },
        ]),
    );

    let mut cpu = mem.cpu();
    cpu.cpsr = CPSR_N | CPSR_V | 0x13;
    cpu.set_reg(0, 0x0001_0000);
    unsafe { entry.invoke(&mut cpu) };

    assert_eq!(cpu.reg(1), 15);
    assert_eq!(cpu.reg(2), CPSR_N | CPSR_V | 0x13);
    assert_eq!(cpu.reg(3), CPSR_Z | CPSR_C | 0x13);
    assert_eq!(nzcv(&cpu), (false, true, true, false));
}

#[test]
fn test_trace_helper_runs_per_instruction() {
    init_logger();
    let mem = GuestMemory::new(1);
    let mut ctx = context(JitConfig {
        trace_instructions: true,
        ..JitConfig::default()
    });
    let entry = compile(&mut ctx, &always(&[mov_imm(0, 1), mov_imm(1, 2), mov_imm(2, 3)]));

    let before = runtime::traced_instructions();
    let mut cpu = mem.cpu();
    unsafe { entry.invoke(&mut cpu) };
    assert!(runtime::traced_instructions() - before >= 3);
    assert_eq!(cpu.reg(2), 3);
}

// ============================================================================
// 处理器表
// ============================================================================

#[test]
fn test_missing_handler_installs_nothing() {
    init_logger();
    let mut ctx = context(JitConfig::default());
    let insns = always(&[mov_imm(0, 1), ArmOp::Vfp { raw: 0xee30_0a00 }, mov_imm(1, 2)]);

    let err = Translator::new().translate(&mut ctx, &insns).unwrap_err();
    match err {
        JitError::UnimplementedOpcode { addr, ref opcode } => {
            assert_eq!(addr, CODE + 4);
            assert!(opcode.contains("vfp"), "{opcode}");
        }
        other => panic!("expected unimplemented opcode, got {other:?}"),
    }
    assert!(err.needs_interpreter());
    assert!(ctx.lookup(&ctx.mangler().block_name(CODE)).is_none());
    assert_eq!(ctx.stats().modules_installed, 0);

    // 上下文仍可继续翻译
    let entry = compile(&mut ctx, &always(&[mov_imm(0, 1)]));
    let mem = GuestMemory::new(1);
    let mut cpu = mem.cpu();
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(0), 1);
}

#[test]
fn test_out_of_range_register_is_rejected() {
    init_logger();
    let mut ctx = context(JitConfig::default());
    let translator = Translator::new();

    // r16 会落在 CPSR 字段上
    let err = translator
        .translate(&mut ctx, &always(&[mov_imm(0, 1), mov_imm(16, 0xff)]))
        .unwrap_err();
    match err {
        JitError::UnimplementedOpcode { addr, ref opcode } => {
            assert_eq!(addr, CODE + 4);
            assert!(opcode.contains("r16"), "{opcode}");
        }
        other => panic!("expected unimplemented opcode, got {other:?}"),
    }

    let ldm = ArmOp::LoadStoreMultiple {
        load: true,
        mode: BlockMode::IncrementAfter,
        rn: 16,
        writeback: true,
        list: 0b1,
    };
    let err = translator.translate(&mut ctx, &always(&[ldm])).unwrap_err();
    assert!(matches!(err, JitError::UnimplementedOpcode { addr: CODE, .. }), "{err:?}");

    let mul = ArmOp::MultiplyLong {
        signed: false,
        accumulate: false,
        s: false,
        rd_hi: 1,
        rd_lo: 0,
        rs: 2,
        rm: 200,
    };
    assert!(translator.translate(&mut ctx, &always(&[mul])).is_err());
    assert_eq!(ctx.stats().modules_installed, 0);

    // 合法的前缀仍按原样编译，CPSR 不受影响
    let entry = compile(&mut ctx, &always(&[mov_imm(0, 1)]));
    let mem = GuestMemory::new(1);
    let mut cpu = mem.cpu();
    let cpsr = cpu.cpsr;
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(0), 1);
    assert_eq!(cpu.cpsr, cpsr);
}

fn vfp_as_nop(_unit: &mut UnitBuilder<'_>, _insn: &ArmInsn) -> JitResult<Flow> {
    Ok(Flow::Continue)
}

#[test]
fn test_registered_handler_extends_translator() {
    init_logger();
    let mut ctx = context(JitConfig::default());
    let insns = always(&[ArmOp::Vfp { raw: 0 }, mov_imm(1, 2)]);

    let mut translator = Translator::new();
    assert!(translator.handlers_mut().register(OpcodeFamily::Vfp, vfp_as_nop).is_none());
    let entry = compile_with(&mut ctx, &translator, &insns);

    let mem = GuestMemory::new(1);
    let mut cpu = mem.cpu();
    unsafe { entry.invoke(&mut cpu) };
    assert_eq!(cpu.reg(1), 2);
    assert_eq!(cpu.cycles_remaining, CYCLES - 2);

    translator.handlers_mut().unregister(OpcodeFamily::DataProcessing);
    let insns = at(0x9000, &[(Condition::Al, mov_imm(0, 0))]);
    assert!(matches!(
        translator.translate(&mut ctx, &insns),
        Err(JitError::UnimplementedOpcode { addr: 0x9000, .. })
    ));
}
