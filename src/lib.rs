//! MoteQuery SQL Template Engine
//!
//! 带可选片段标记的 SQL 模板编译器与运行时装配器
//!
//! ## 核心特性
//! - 模板编译一次，之后每次调用只做一次线性扫描
//! - 可选变量 `?@name`、注释条件 `/*A&B|C*/`、SELECT 列开关
//! - 全部条件成立且无处理器时零分配返回原始文本
//! - 后缀处理器：`_Q` 引号、`_R` 原样、`_N` 数字、`_M` 多值展开
//!
//! ## 架构
//! - 扫描层: marker stripping + whitespace normalization + footprint records
//! - 编译层: segment split + tiered name registry + condition jump table
//! - 装配层: single forward pass with trim rewind and pooled scratch buffers
//! - 引擎层: handler registrations + LRU cache of compiled programs

pub mod config;
pub mod template;
pub mod cache;
pub mod engine;

mod error;

pub use config::TemplateConfig;
pub use error::{Result, TemplateError};

// 主要对外 API
pub use engine::Engine;
pub use cache::CacheStats;
pub use template::{
    assemble, assemble_with, compile, Bindings, CompileOptions, CompiledProgram, HandlerSet, NameRegistry,
    SegmentHandler, Tier, UsageState, Value,
};
