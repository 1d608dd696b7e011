//! Template engine configuration
//!
//! Controls the marker grammar, SELECT column toggling, declared flags and
//! the sizing knobs of the compiled-template cache and scratch buffers.

use crate::error::{Result, TemplateError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Maximum scope nesting (parentheses + CASE blocks) accepted by the scanner
pub const MAX_NESTING_DEPTH: usize = 64;

/// Number of assemblies after which the buffer estimator freezes
pub const ESTIMATOR_WINDOW: u32 = 1024;

/// 模板引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Variable marker character (default `@`)
    pub marker_char: char,

    /// Treat every top-level SELECT projection as an implicit optional marker
    pub extract_select_columns: bool,

    /// Non-variable gate names that comment conditions may reference
    pub flags: Vec<String>,

    /// Maximum number of compiled templates kept in the engine cache
    pub cache_capacity: usize,

    /// Estimated output size (bytes) above which a pooled scratch buffer is used
    ///
    /// Smaller outputs are built directly in an exactly sized `String`.
    /// Above the threshold the pooled buffer absorbs the growth while the
    /// output is assembled, and the result is then copied into a fresh
    /// `String`: each call still allocates once for what it returns.
    pub pooled_buffer_threshold: usize,

    /// Number of scratch buffers retained per compiled template
    pub buffer_pool_size: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            marker_char: '@',
            extract_select_columns: false,
            flags: Vec::new(),
            cache_capacity: 1024,
            pooled_buffer_threshold: 4096,
            buffer_pool_size: 4,
        }
    }
}

impl TemplateConfig {
    /// 通用配置（推荐）
    pub fn for_general() -> Self {
        Self::default()
    }

    /// SELECT 列可动态开关
    pub fn for_column_toggling() -> Self {
        Self {
            extract_select_columns: true,
            ..Default::default()
        }
    }

    /// 测试用配置：小缓存，总是走池化缓冲区
    pub fn for_testing() -> Self {
        Self {
            cache_capacity: 8,
            pooled_buffer_threshold: 0,
            buffer_pool_size: 1,
            ..Default::default()
        }
    }

    /// Add a declared flag name (builder style)
    pub fn with_flag(mut self, name: impl Into<String>) -> Self {
        self.flags.push(name.into());
        self
    }

    pub fn with_marker(mut self, marker: char) -> Self {
        self.marker_char = marker;
        self
    }

    /// Reject settings the scanner cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.marker_char.is_ascii_punctuation() {
            return Err(TemplateError::Config(format!(
                "marker '{}' must be an ASCII punctuation character",
                self.marker_char
            )));
        }
        if matches!(self.marker_char, '?' | '(' | ')' | ',' | ';' | '\'' | '"' | '`' | '[' | ']' | '&' | '|' | '/' | '*' | '-') {
            return Err(TemplateError::Config(format!(
                "marker '{}' collides with template syntax",
                self.marker_char
            )));
        }
        if self.cache_capacity == 0 {
            return Err(TemplateError::Config("cache_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Persist as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}
