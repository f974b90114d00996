//! 翻译上下文
//!
//! 一个 [`TranslationContext`] 拥有一个 Cranelift 代码生成后端：宿主 ISA、
//! 所有模块共享的符号表与 `FunctionBuilderContext`、数据布局与名称修饰规则，
//! 以及用于放置代码的 [`CodeArena`] 和用于解析外部符号的 [`LinkTable`]。
//!
//! 通过同一个上下文添加的模块串行编译（`add_module` 需要 `&mut self`），
//! 不同上下文可以在不同线程上并发工作，共享或各自持有代码区。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cranelift_codegen::ir::{
    self, AbiParam, ExtFuncData, ExternalName, FuncRef, Function, GlobalValue, GlobalValueData,
    Signature, UserExternalName, UserFuncName, immediates::Imm64, types,
};
use cranelift_codegen::isa::{CallConv, OwnedTargetIsa, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::FunctionBuilderContext;
use vm_core::{BlockExit, CpuContext, GuestAddr, JitError, JitResult};
use vm_mem::CodeArena;

use crate::config::JitConfig;
use crate::link_table::LinkTable;
use crate::runtime;

/// 用户外部名称使用的命名空间
pub(crate) const SYMBOL_NAMESPACE: u32 = 0;

/// Cranelift 库调用 -> 链接名
pub(crate) type LibCallNames = dyn Fn(ir::LibCall) -> String + Send + Sync;

// ============================================================================
// 共享代码生成上下文
// ============================================================================

/// 符号表：名称 <-> 索引，所有模块共用，保证跨模块的名称身份一致
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl SymbolTable {
    /// 返回名称的索引，首次出现时分配
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn name(&self, idx: u32) -> Option<&str> {
        self.names.get(idx as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// 上下文内所有构建调用共享的代码生成状态
pub struct CodegenContext {
    symbols: SymbolTable,
    builder: FunctionBuilderContext,
}

impl CodegenContext {
    fn new() -> Self {
        Self {
            symbols: SymbolTable::default(),
            builder: FunctionBuilderContext::new(),
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// 同时借出符号表与构建器上下文
    pub fn split_mut(&mut self) -> (&mut SymbolTable, &mut FunctionBuilderContext) {
        (&mut self.symbols, &mut self.builder)
    }

    /// 构建中途失败后丢弃残留状态
    pub(crate) fn reset_builder(&mut self) {
        self.builder = FunctionBuilderContext::new();
    }
}

impl fmt::Debug for CodegenContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodegenContext")
            .field("symbols", &self.symbols.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// 数据布局与名称修饰
// ============================================================================

/// 宿主目标的数据布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    pointer_type: ir::Type,
    endianness: ir::Endianness,
    call_conv: CallConv,
}

impl DataLayout {
    pub fn for_isa(isa: &dyn TargetIsa) -> Self {
        Self {
            pointer_type: isa.pointer_type(),
            endianness: isa.endianness(),
            call_conv: isa.default_call_conv(),
        }
    }

    pub fn pointer_type(&self) -> ir::Type {
        self.pointer_type
    }

    pub fn pointer_bytes(&self) -> u32 {
        self.pointer_type.bytes()
    }

    pub fn endianness(&self) -> ir::Endianness {
        self.endianness
    }

    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }
}

/// 目标文件格式的符号名修饰
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mangler {
    global_prefix: &'static str,
}

impl Mangler {
    /// 当前宿主使用的规则（Mach-O 全局符号带下划线前缀）
    pub fn host() -> Self {
        Self {
            global_prefix: if cfg!(target_vendor = "apple") { "_" } else { "" },
        }
    }

    pub fn mangle(&self, name: &str) -> String {
        format!("{}{name}", self.global_prefix)
    }

    pub fn demangle<'a>(&self, symbol: &'a str) -> &'a str {
        symbol.strip_prefix(self.global_prefix).unwrap_or(symbol)
    }

    /// 翻译块的导出名
    pub fn block_name(&self, addr: GuestAddr) -> String {
        format!("arm_block_{addr:08x}")
    }
}

// ============================================================================
// 翻译单元
// ============================================================================

/// 符号可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// 安装后可通过上下文查找，并可被后续模块引用
    Export,
    /// 仅单元内可见
    Local,
}

/// 单元中的函数
#[derive(Debug)]
pub struct UnitFunction {
    pub name: String,
    pub linkage: Linkage,
    pub func: Function,
}

/// 单元中的数据对象
#[derive(Debug, Clone)]
pub struct UnitData {
    pub name: String,
    pub linkage: Linkage,
    pub bytes: Vec<u8>,
    pub align: u32,
    pub read_only: bool,
}

/// 自包含的翻译单元，交给 [`TranslationContext::add_module`] 编译安装
#[derive(Debug)]
pub struct TranslationUnit {
    name: String,
    pub(crate) functions: Vec<UnitFunction>,
    pub(crate) data: Vec<UnitData>,
}

impl TranslationUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn define_function(&mut self, name: impl Into<String>, linkage: Linkage, func: Function) {
        self.functions.push(UnitFunction {
            name: name.into(),
            linkage,
            func,
        });
    }

    /// 定义数据对象，链接时放入数据区段
    pub fn define_data(
        &mut self,
        name: impl Into<String>,
        linkage: Linkage,
        bytes: Vec<u8>,
        align: u32,
        read_only: bool,
    ) {
        self.data.push(UnitData {
            name: name.into(),
            linkage,
            bytes,
            align,
            read_only,
        });
    }

    pub fn functions(&self) -> impl Iterator<Item = &UnitFunction> {
        self.functions.iter()
    }

    pub fn data(&self) -> impl Iterator<Item = &UnitData> {
        self.data.iter()
    }

    /// 单元导出的所有名称
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.functions
            .iter()
            .filter(|f| f.linkage == Linkage::Export)
            .map(|f| f.name.as_str())
            .chain(
                self.data
                    .iter()
                    .filter(|d| d.linkage == Linkage::Export)
                    .map(|d| d.name.as_str()),
            )
    }
}

// ============================================================================
// 入口点与模块句柄
// ============================================================================

/// 已安装函数的本地入口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    addr: usize,
}

/// 编译块的本地签名
pub type BlockFn = unsafe extern "C" fn(*mut CpuContext) -> u64;

impl EntryPoint {
    pub(crate) fn new(addr: usize) -> Self {
        Self { addr }
    }

    pub fn address(&self) -> usize {
        self.addr
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    /// 以编译块签名调用
    ///
    /// # Safety
    /// 入口必须来自块签名（[`TranslationContext::block_signature`]）的函数，
    /// `cpu.page_table` 指向的页表覆盖块内所有访存，且所属代码区未被重置。
    pub unsafe fn invoke(&self, cpu: &mut CpuContext) -> BlockExit {
        let f = unsafe { std::mem::transmute::<*const u8, BlockFn>(self.as_ptr()) };
        BlockExit::decode(unsafe { f(cpu) })
    }
}

/// 安装成功的模块
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    pub(crate) name: String,
    pub(crate) code_address: usize,
    pub(crate) code_size: usize,
    pub(crate) exports: Vec<(String, EntryPoint)>,
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 代码区段起始地址（纯数据模块为 0）
    pub fn code_address(&self) -> usize {
        self.code_address
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// 导出函数的入口
    pub fn entry(&self, name: &str) -> Option<EntryPoint> {
        self.exports
            .iter()
            .find(|(export, _)| export == name)
            .map(|(_, entry)| *entry)
    }

    pub fn exports(&self) -> impl Iterator<Item = (&str, EntryPoint)> {
        self.exports.iter().map(|(name, entry)| (name.as_str(), *entry))
    }
}

/// 上下文统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub modules_installed: u64,
    pub modules_failed: u64,
    pub functions_installed: u64,
    pub code_bytes: usize,
    pub data_bytes: usize,
}

/// 已安装的符号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InstalledSymbol {
    pub(crate) address: usize,
    pub(crate) is_function: bool,
}

// ============================================================================
// 翻译上下文
// ============================================================================

/// 翻译上下文
pub struct TranslationContext {
    pub(crate) isa: OwnedTargetIsa,
    pub(crate) codegen: CodegenContext,
    pub(crate) layout: DataLayout,
    pub(crate) mangler: Mangler,
    pub(crate) arena: Arc<CodeArena>,
    pub(crate) links: Arc<LinkTable>,
    pub(crate) libcall_names: Box<LibCallNames>,
    pub(crate) config: JitConfig,
    /// 修饰后的名称 -> 地址
    pub(crate) installed: HashMap<String, InstalledSymbol>,
    pub(crate) next_section_id: u32,
    pub(crate) stats: ContextStats,
}

impl fmt::Debug for TranslationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationContext")
            .field("isa", &self.isa.name())
            .field("layout", &self.layout)
            .field("installed", &self.installed.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl TranslationContext {
    /// 绑定到已有的代码区和链接表
    pub fn new(config: JitConfig, arena: Arc<CodeArena>, links: Arc<LinkTable>) -> JitResult<Self> {
        check_config(&config)?;

        let isa = build_host_isa(&config)?;
        let layout = DataLayout::for_isa(&*isa);
        runtime::install_runtime_helpers(&links);

        log::debug!(
            "translation context created: isa={}, pointer={}, opt_level={}, arena at {:p}",
            isa.name(),
            layout.pointer_type(),
            config.opt_level.as_setting(),
            arena.origin()
        );

        Ok(Self {
            isa,
            codegen: CodegenContext::new(),
            layout,
            mangler: Mangler::host(),
            arena,
            links,
            libcall_names: cranelift_module::default_libcall_names(),
            config,
            installed: HashMap::new(),
            next_section_id: 0,
            stats: ContextStats::default(),
        })
    }

    /// 按配置创建独占的代码区，链接表以宿主动态链接器为后备
    pub fn with_config(config: JitConfig) -> JitResult<Self> {
        check_config(&config)?;
        let arena = Arc::new(CodeArena::reserve(config.arena_capacity)?);
        let links = Arc::new(LinkTable::with_host_provider(config.symbol_miss_policy));
        Self::new(config, arena, links)
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn isa(&self) -> &dyn TargetIsa {
        &*self.isa
    }

    pub fn data_layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn mangler(&self) -> &Mangler {
        &self.mangler
    }

    pub fn arena(&self) -> &Arc<CodeArena> {
        &self.arena
    }

    pub fn link_table(&self) -> &Arc<LinkTable> {
        &self.links
    }

    pub fn codegen(&mut self) -> &mut CodegenContext {
        &mut self.codegen
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    /// 使用宿主调用约定的空签名
    pub fn make_signature(&self) -> Signature {
        Signature::new(self.layout.call_conv())
    }

    /// 编译块签名：`(cpu: *mut CpuContext) -> u64`
    pub fn block_signature(&self) -> Signature {
        let mut sig = self.make_signature();
        sig.params.push(AbiParam::new(self.layout.pointer_type()));
        sig.returns.push(AbiParam::new(types::I64));
        sig
    }

    /// 为单元中的函数登记名称并创建空函数体
    pub fn declare_function(&mut self, name: &str, sig: Signature) -> Function {
        let idx = self.codegen.symbols.intern(name);
        Function::with_name_signature(UserFuncName::user(SYMBOL_NAMESPACE, idx), sig)
    }

    /// 在 `func` 中引用外部（或同单元）函数
    pub fn import_function(&mut self, func: &mut Function, name: &str, sig: Signature) -> FuncRef {
        import_function_with(&mut self.codegen.symbols, func, name, sig)
    }

    /// 在 `func` 中引用数据对象的地址
    pub fn import_data(&mut self, func: &mut Function, name: &str) -> GlobalValue {
        let idx = self.codegen.symbols.intern(name);
        let name_ref =
            func.declare_imported_user_function(UserExternalName::new(SYMBOL_NAMESPACE, idx));
        func.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::user(name_ref),
            offset: Imm64::new(0),
            colocated: false,
            tls: false,
        })
    }

    /// 编译、放置、链接并安装一个单元；任何阶段失败都不会留下可解析的符号
    pub fn add_module(&mut self, unit: TranslationUnit) -> JitResult<ModuleHandle> {
        let name = unit.name().to_string();
        match crate::pipeline::install(self, unit) {
            Ok(handle) => {
                self.stats.modules_installed += 1;
                Ok(handle)
            }
            Err(err) => {
                self.stats.modules_failed += 1;
                log::error!("module `{name}` was not installed: {err}");
                Err(err)
            }
        }
    }

    /// 查找已安装的函数
    pub fn lookup(&self, name: &str) -> Option<EntryPoint> {
        self.installed
            .get(&self.mangler.mangle(name))
            .filter(|symbol| symbol.is_function)
            .map(|symbol| EntryPoint::new(symbol.address))
    }

    /// 查找已安装的任意符号（函数或数据）
    pub fn symbol_address(&self, name: &str) -> Option<usize> {
        self.installed
            .get(&self.mangler.mangle(name))
            .map(|symbol| symbol.address)
    }

    /// 已安装的符号名（未修饰）
    pub fn installed_symbols(&self) -> impl Iterator<Item = &str> {
        self.installed.keys().map(|symbol| self.mangler.demangle(symbol))
    }

    /// 忘记所有已安装的符号；代码区需要调用方另行重置
    pub fn clear_installed(&mut self) {
        log::debug!("dropping {} installed symbols", self.installed.len());
        self.installed.clear();
    }

    pub(crate) fn next_section_id(&mut self) -> u32 {
        let id = self.next_section_id;
        self.next_section_id = self.next_section_id.wrapping_add(1);
        id
    }
}

pub(crate) fn import_function_with(
    symbols: &mut SymbolTable,
    func: &mut Function,
    name: &str,
    sig: Signature,
) -> FuncRef {
    let idx = symbols.intern(name);
    let name_ref = func.declare_imported_user_function(UserExternalName::new(SYMBOL_NAMESPACE, idx));
    let signature = func.import_signature(sig);
    func.import_function(ExtFuncData {
        name: ExternalName::user(name_ref),
        signature,
        colocated: false,
    })
}

fn check_config(config: &JitConfig) -> JitResult<()> {
    config.validate().map_err(|e| {
        log::error!("rejecting JIT configuration: {e}");
        JitError::InvalidConfig(e.to_string())
    })
}

fn build_host_isa(config: &JitConfig) -> JitResult<OwnedTargetIsa> {
    let backend = |what: &str, err: &dyn fmt::Display| {
        log::error!("failed to configure the host ISA ({what}): {err}");
        JitError::Backend(format!("{what}: {err}"))
    };

    let mut flags = settings::builder();
    flags
        .set("opt_level", config.opt_level.as_setting())
        .map_err(|e| backend("opt_level", &e))?;
    flags
        .set("is_pic", "false")
        .map_err(|e| backend("is_pic", &e))?;
    flags
        .set("enable_verifier", if config.verify_ir { "true" } else { "false" })
        .map_err(|e| backend("enable_verifier", &e))?;

    let builder = cranelift_native::builder().map_err(|e| backend("host detection", &e))?;
    builder
        .finish(settings::Flags::new(flags))
        .map_err(|e| backend("isa", &e))
}
