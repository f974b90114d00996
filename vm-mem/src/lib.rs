//! vm-mem: JIT 内存管理
//!
//! - [`CodeArena`]: 在一段固定保留的宿主地址范围内按页递增分配代码/数据区段
//! - [`GuestPageTable`]: 客户机页索引到宿主页基址的映射表，编译后的代码直接读取

pub mod code_arena;
pub mod guest_page_table;
mod sys;

pub use code_arena::{CodeArena, Section};
pub use guest_page_table::GuestPageTable;
pub use sys::{Protection, host_page_size};
