//! JIT 配置
//!
//! 支持从 TOML 加载，未出现的字段取默认值：
//!
//! ```toml
//! arena_capacity = 33554432
//! opt_level = "speed"
//! guard_unmapped_pages = true
//! symbol_miss_policy = "retry"
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link_table::MissPolicy;

/// 默认代码区大小：64MB
pub const DEFAULT_ARENA_CAPACITY: usize = 64 * 1024 * 1024;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse JIT config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize JIT config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid JIT config field `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Cranelift 优化级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// Cranelift `opt_level` 设置值
    pub fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// JIT 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// 代码/数据区容量（字节）
    pub arena_capacity: usize,
    /// 优化级别
    pub opt_level: OptLevel,
    /// 编译前运行 IR 校验
    pub verify_ir: bool,
    /// 单个模块内多个函数并行编译
    pub parallel_compile: bool,
    /// 每次访存检查客户机页是否已提交
    pub guard_unmapped_pages: bool,
    /// 每条客户机指令前调用跟踪辅助函数
    pub trace_instructions: bool,
    /// 符号解析失败的缓存策略
    pub symbol_miss_policy: MissPolicy,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            opt_level: OptLevel::Speed,
            verify_ir: cfg!(debug_assertions),
            parallel_compile: true,
            guard_unmapped_pages: false,
            trace_instructions: false,
            symbol_miss_policy: MissPolicy::Retry,
        }
    }
}

impl JitConfig {
    /// 从 TOML 文本加载并校验
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: JitConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 序列化为 TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "arena_capacity",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.arena_capacity > isize::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "arena_capacity",
                message: format!("{} exceeds the host address space", self.arena_capacity),
            });
        }
        Ok(())
    }
}
