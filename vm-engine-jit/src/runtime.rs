//! 生成代码可调用的运行时辅助函数

use std::sync::atomic::{AtomicU64, Ordering};

use vm_core::CpuContext;

use crate::link_table::LinkTable;

/// 指令跟踪辅助函数的链接名
pub const TRACE_HELPER: &str = "__arm_jit_trace";

static TRACED_INSNS: AtomicU64 = AtomicU64::new(0);

/// 每条客户机指令执行前调用（启用 `trace_instructions` 时）
pub extern "C" fn arm_jit_trace(cpu: *mut CpuContext, addr: u32) {
    TRACED_INSNS.fetch_add(1, Ordering::Relaxed);
    if log::log_enabled!(log::Level::Trace) {
        // 生成代码传入的是调用方正在使用的上下文
        if let Some(cpu) = unsafe { cpu.as_ref() } {
            log::trace!(
                "{addr:#010x}: r0={:#x} r1={:#x} r2={:#x} r3={:#x} cpsr={:#010x}",
                cpu.regs[0],
                cpu.regs[1],
                cpu.regs[2],
                cpu.regs[3],
                cpu.cpsr
            );
        }
    }
}

/// 进程内被跟踪的指令总数
pub fn traced_instructions() -> u64 {
    TRACED_INSNS.load(Ordering::Relaxed)
}

/// 向链接表登记内置辅助函数
pub fn install_runtime_helpers(table: &LinkTable) {
    table.define(TRACE_HELPER, arm_jit_trace as usize);
}
