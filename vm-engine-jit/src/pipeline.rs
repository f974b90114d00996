//! 编译与链接流水线
//!
//! IR -> 本地代码（可在单元内并行）-> 在代码区放置 -> 解析符号并修补重定位
//! -> 完成区段（刷新指令缓存、只读保护）-> 安装导出符号。
//!
//! 安装是最后一步：之前任何阶段失败，单元的导出名都不会出现在上下文中。
//! 失败单元已经占用的代码区空间不会回收，直到整个代码区被重置。

use std::collections::{HashMap, HashSet};

use cranelift_codegen::binemit::Reloc;
use cranelift_codegen::ir::{ExternalName, Function};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::{Context, FinalizedRelocTarget};
use cranelift_control::ControlPlane;
use rayon::prelude::*;
use vm_core::{JitError, JitResult};
use vm_mem::Section;

use crate::context::{
    EntryPoint, InstalledSymbol, LibCallNames, Linkage, ModuleHandle, SYMBOL_NAMESPACE,
    SymbolTable, TranslationContext, TranslationUnit, UnitData, UnitFunction,
};

/// 单元内函数的对齐
const FUNCTION_ALIGN: usize = 16;

/// 重定位目标
#[derive(Debug, Clone, PartialEq, Eq)]
enum RelocTarget {
    /// 命名符号（单元内、已安装模块或链接表）
    Symbol(String),
    /// 相对本函数起始处的偏移
    Local(u32),
}

#[derive(Debug, Clone)]
struct PendingReloc {
    offset: u32,
    kind: Reloc,
    target: RelocTarget,
    addend: i64,
}

/// 编译完成、尚未放置的函数
#[derive(Debug)]
struct CompiledFunction {
    name: String,
    linkage: Linkage,
    code: Vec<u8>,
    relocs: Vec<PendingReloc>,
}

pub(crate) fn install(ctx: &mut TranslationContext, unit: TranslationUnit) -> JitResult<ModuleHandle> {
    check_names(ctx, &unit)?;

    let unit_name = unit.name().to_string();
    let TranslationUnit { functions, data, .. } = unit;
    let compiled = compile_functions(ctx, &unit_name, functions)?;

    // ------------------------------------------------------------------
    // 放置
    // ------------------------------------------------------------------
    let mut offsets = Vec::with_capacity(compiled.len());
    let mut code_size = 0usize;
    for func in &compiled {
        let offset = code_size.next_multiple_of(FUNCTION_ALIGN);
        offsets.push(offset);
        code_size = offset + func.code.len();
    }

    let mut code_section = if compiled.is_empty() {
        None
    } else {
        let id = ctx.next_section_id();
        Some(ctx.arena.allocate_code_section(code_size, FUNCTION_ALIGN as u32, id, &unit_name)?)
    };

    let mut local: HashMap<&str, usize> = HashMap::new();
    let mut data_sections = Vec::new();
    let mut data_exports = Vec::new();
    let mut data_bytes = 0usize;

    for read_only in [false, true] {
        let objects: Vec<&UnitData> = data.iter().filter(|d| d.read_only == read_only).collect();
        if objects.is_empty() {
            continue;
        }
        let (placements, size, align) = layout_data(&objects);
        let id = ctx.next_section_id();
        let section_name = format!("{unit_name}.{}", if read_only { "rodata" } else { "data" });
        let mut section =
            ctx.arena
                .allocate_data_section(size, align as u32, id, &section_name, read_only)?;

        let base = section.address();
        // 区段刚分配，尚未完成，没有代码引用它
        let bytes = unsafe { section.as_mut_slice() };
        for (object, offset) in objects.iter().zip(&placements) {
            bytes[*offset..*offset + object.bytes.len()].copy_from_slice(&object.bytes);
            let address = base + offset;
            local.insert(object.name.as_str(), address);
            if object.linkage == Linkage::Export {
                data_exports.push((object.name.clone(), address));
            }
        }
        data_bytes += size;
        data_sections.push(section);
    }

    let code_base = code_section.as_ref().map_or(0, Section::address);
    for (func, offset) in compiled.iter().zip(&offsets) {
        local.insert(func.name.as_str(), code_base + offset);
    }

    // ------------------------------------------------------------------
    // 复制代码并修补重定位
    // ------------------------------------------------------------------
    if let Some(section) = code_section.as_mut() {
        let base = section.address();
        // 同上：区段尚未完成
        let bytes = unsafe { section.as_mut_slice() };
        for (func, &offset) in compiled.iter().zip(&offsets) {
            let body = &mut bytes[offset..offset + func.code.len()];
            body.copy_from_slice(&func.code);
            for reloc in &func.relocs {
                let target = match &reloc.target {
                    RelocTarget::Local(off) => base + offset + *off as usize,
                    RelocTarget::Symbol(symbol) => resolve_symbol(ctx, &local, symbol)?,
                };
                apply_relocation(body, base + offset, reloc, target).map_err(|reason| {
                    log::error!(
                        "relocation {:?} at {}+{:#x} -> {target:#x} failed: {reason}",
                        reloc.kind,
                        func.name,
                        reloc.offset
                    );
                    JitError::linkage(&func.name, reason)
                })?;
            }
        }
    }

    // ------------------------------------------------------------------
    // 完成区段
    // ------------------------------------------------------------------
    for section in code_section.iter().chain(&data_sections) {
        ctx.arena.finalize_section(section)?;
    }

    // ------------------------------------------------------------------
    // 安装
    // ------------------------------------------------------------------
    let mut exports = Vec::new();
    for (func, &offset) in compiled.iter().zip(&offsets) {
        if func.linkage == Linkage::Export {
            let address = code_base + offset;
            ctx.installed.insert(
                ctx.mangler.mangle(&func.name),
                InstalledSymbol {
                    address,
                    is_function: true,
                },
            );
            exports.push((func.name.clone(), EntryPoint::new(address)));
        }
    }
    for (name, address) in data_exports {
        ctx.installed.insert(
            ctx.mangler.mangle(&name),
            InstalledSymbol {
                address,
                is_function: false,
            },
        );
    }

    ctx.stats.functions_installed += compiled.len() as u64;
    ctx.stats.code_bytes += code_size;
    ctx.stats.data_bytes += data_bytes;

    log::debug!(
        "module `{unit_name}` installed: {} functions ({code_size} bytes at {code_base:#x}), {} data sections",
        compiled.len(),
        data_sections.len()
    );

    Ok(ModuleHandle {
        name: unit_name,
        code_address: code_base,
        code_size,
        exports,
    })
}

/// 单元内名称唯一，导出名不能与已安装符号冲突
fn check_names(ctx: &TranslationContext, unit: &TranslationUnit) -> JitResult<()> {
    let mut seen = HashSet::new();
    let names = unit
        .functions()
        .map(|f| f.name.as_str())
        .chain(unit.data().map(|d| d.name.as_str()));
    for name in names {
        if !seen.insert(name) {
            log::error!("module `{}` defines `{name}` twice", unit.name());
            return Err(JitError::linkage(name, "duplicate definition in module"));
        }
    }
    for name in unit.exports() {
        if ctx.installed.contains_key(&ctx.mangler.mangle(name)) {
            log::error!("module `{}` exports `{name}`, which is already installed", unit.name());
            return Err(JitError::linkage(name, "symbol already installed"));
        }
    }
    Ok(())
}

fn compile_functions(
    ctx: &TranslationContext,
    unit_name: &str,
    functions: Vec<UnitFunction>,
) -> JitResult<Vec<CompiledFunction>> {
    let isa = &*ctx.isa;
    let symbols = ctx.codegen.symbols();
    let libcall_names = &*ctx.libcall_names;
    let parallel = ctx.config.parallel_compile && functions.len() > 1;

    log::trace!(
        "compiling module `{unit_name}`: {} functions{}",
        functions.len(),
        if parallel { " (parallel)" } else { "" }
    );

    if parallel {
        functions
            .into_par_iter()
            .map(|f| compile_one(isa, symbols, libcall_names, f))
            .collect()
    } else {
        functions
            .into_iter()
            .map(|f| compile_one(isa, symbols, libcall_names, f))
            .collect()
    }
}

fn compile_one(
    isa: &dyn TargetIsa,
    symbols: &SymbolTable,
    libcall_names: &LibCallNames,
    function: UnitFunction,
) -> JitResult<CompiledFunction> {
    let UnitFunction {
        name,
        linkage,
        func,
    } = function;

    let mut context = Context::for_function(func);
    let (code, relocs) = {
        let compiled = context
            .compile(isa, &mut ControlPlane::default())
            .map_err(|e| {
                log::error!("code generation for `{name}` failed: {:?}", e.inner);
                JitError::linkage(&name, format!("code generation failed: {}", e.inner))
            })?;
        (
            compiled.code_buffer().to_vec(),
            compiled.buffer.relocs().to_vec(),
        )
    };

    let relocs = relocs
        .into_iter()
        .map(|reloc| {
            let target = match reloc.target {
                FinalizedRelocTarget::Func(offset) => RelocTarget::Local(offset),
                FinalizedRelocTarget::ExternalName(ext) => {
                    let symbol = external_symbol(&context.func, symbols, libcall_names, &ext)
                        .map_err(|reason| {
                            log::error!("`{name}` references an unsupported symbol: {reason}");
                            JitError::linkage(&name, reason)
                        })?;
                    RelocTarget::Symbol(symbol)
                }
            };
            Ok(PendingReloc {
                offset: reloc.offset,
                kind: reloc.kind,
                target,
                addend: reloc.addend,
            })
        })
        .collect::<JitResult<Vec<_>>>()?;

    log::trace!("compiled `{name}`: {} bytes, {} relocations", code.len(), relocs.len());

    Ok(CompiledFunction {
        name,
        linkage,
        code,
        relocs,
    })
}

/// 外部名称 -> 链接名
fn external_symbol(
    func: &Function,
    symbols: &SymbolTable,
    libcall_names: &LibCallNames,
    ext: &ExternalName,
) -> Result<String, String> {
    match ext {
        ExternalName::User(name_ref) => {
            let user = &func.params.user_named_funcs()[*name_ref];
            if user.namespace != SYMBOL_NAMESPACE {
                return Err(format!("unknown namespace {}", user.namespace));
            }
            symbols
                .name(user.index)
                .map(str::to_string)
                .ok_or_else(|| format!("unknown symbol index {}", user.index))
        }
        ExternalName::LibCall(libcall) => Ok(libcall_names(*libcall)),
        other => Err(format!("unsupported external name {other:?}")),
    }
}

/// 单元内 -> 已安装模块 -> 链接表
fn resolve_symbol(ctx: &TranslationContext, local: &HashMap<&str, usize>, symbol: &str) -> JitResult<usize> {
    if let Some(&address) = local.get(symbol) {
        return Ok(address);
    }
    if let Some(installed) = ctx.installed.get(&ctx.mangler.mangle(symbol)) {
        return Ok(installed.address);
    }
    ctx.links.resolve(symbol)
}

/// 数据对象在区段内的偏移、区段大小与对齐
fn layout_data(objects: &[&UnitData]) -> (Vec<usize>, usize, usize) {
    let mut offsets = Vec::with_capacity(objects.len());
    let mut size = 0usize;
    let mut max_align = 1usize;
    for object in objects {
        let align = (object.align as usize).max(1).next_power_of_two();
        max_align = max_align.max(align);
        let offset = size.next_multiple_of(align);
        offsets.push(offset);
        size = offset + object.bytes.len();
    }
    (offsets, size, max_align)
}

/// 修补一条重定位；`body` 是函数体，`base` 是其运行地址
fn apply_relocation(body: &mut [u8], base: usize, reloc: &PendingReloc, target: usize) -> Result<(), String> {
    let at = reloc.offset as usize;
    let place = base.wrapping_add(at) as i64;
    let value = (target as i64).wrapping_add(reloc.addend);

    let patch = |body: &mut [u8], bytes: &[u8]| -> Result<(), String> {
        let slot = body
            .get_mut(at..at + bytes.len())
            .ok_or_else(|| format!("offset {at:#x} outside function body"))?;
        slot.copy_from_slice(bytes);
        Ok(())
    };

    match reloc.kind {
        Reloc::Abs8 => patch(body, &value.to_ne_bytes()),
        Reloc::Abs4 => {
            let value = u32::try_from(value).map_err(|_| format!("{value:#x} does not fit Abs4"))?;
            patch(body, &value.to_ne_bytes())
        }
        Reloc::X86PCRel4 | Reloc::X86CallPCRel4 => {
            let delta = value.wrapping_sub(place);
            let delta =
                i32::try_from(delta).map_err(|_| format!("pc-relative delta {delta:#x} out of range"))?;
            patch(body, &delta.to_le_bytes())
        }
        Reloc::Arm64Call => {
            let delta = value.wrapping_sub(place);
            if delta % 4 != 0 || !(-(1i64 << 27)..(1i64 << 27)).contains(&delta) {
                return Err(format!("branch delta {delta:#x} out of range"));
            }
            let slot = body
                .get(at..at + 4)
                .ok_or_else(|| format!("offset {at:#x} outside function body"))?;
            let insn = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
            let insn = (insn & 0xfc00_0000) | (((delta >> 2) as u32) & 0x03ff_ffff);
            patch(body, &insn.to_le_bytes())
        }
        other => Err(format!("unsupported relocation kind {other:?}")),
    }
}
