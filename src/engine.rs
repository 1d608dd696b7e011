//! Engine - owner of configuration, handler registrations and the template cache
//!
//! One `Engine` is built at startup and passed by reference; there is no
//! process-wide state. Compiled programs are immutable and shared through
//! `Arc`, so any number of threads may assemble concurrently.

use crate::cache::{CacheStats, TemplateCache};
use crate::config::TemplateConfig;
use crate::error::{Result, TemplateError};
use crate::template::{
    assemble, compile, Bindings, CompileOptions, CompiledProgram, HandlerFactory, HandlerSet, Tier,
};
use std::sync::Arc;
use tracing::debug;

/// SQL template engine
///
/// # 快速开始
///
/// ```
/// use motequery::{Engine, TemplateConfig};
///
/// let engine = Engine::new(TemplateConfig::default())?;
/// let sql = engine.render(
///     "SELECT Id, Name FROM Users WHERE 1=1 /*NameFilter*/ AND Name = @NameFilter",
///     |b| {
///         b.set("NameFilter", "Ann")?;
///         Ok(())
///     },
/// )?;
/// assert_eq!(sql, "SELECT Id, Name FROM Users WHERE 1=1 AND Name = @NameFilter");
/// # Ok::<(), motequery::TemplateError>(())
/// ```
#[derive(Debug)]
pub struct Engine {
    config: TemplateConfig,
    handlers: HandlerSet,
    cache: TemplateCache,
}

impl Engine {
    /// Create an engine with the built-in Q/R/N/M handlers registered
    pub fn new(config: TemplateConfig) -> Result<Self> {
        config.validate()?;
        let cache = TemplateCache::new(config.cache_capacity);
        debug!(
            marker = %config.marker_char,
            capacity = config.cache_capacity,
            "template engine created"
        );
        Ok(Self {
            config,
            handlers: HandlerSet::with_builtins(),
            cache,
        })
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    /// Add or replace the handler for a suffix letter
    ///
    /// Only handler tiers (`Literal`, `Special`) are accepted. Cached programs
    /// were compiled against the previous letters, so the cache is cleared.
    pub fn register_handler(&self, letter: char, tier: Tier, factory: HandlerFactory) -> Result<()> {
        if !letter.is_ascii_alphanumeric() {
            return Err(TemplateError::Config(format!("handler suffix '{}' must be ASCII alphanumeric", letter)));
        }
        if !matches!(tier, Tier::Literal | Tier::Special) {
            return Err(TemplateError::Config(format!("{:?} is not a handler tier", tier)));
        }
        self.handlers.register(letter, tier, factory);
        self.cache.clear();
        debug!(%letter, ?tier, "handler registered");
        Ok(())
    }

    pub fn unregister_handler(&self, letter: char) -> bool {
        let removed = self.handlers.unregister(letter);
        if removed {
            self.cache.clear();
        }
        removed
    }

    pub fn handler_letters(&self) -> Vec<char> {
        self.handlers.letters()
    }

    fn compile_options(&self) -> CompileOptions {
        CompileOptions::from_config(&self.config, self.handlers.clone())
    }

    /// Compile without touching the cache
    pub fn compile(&self, text: &str) -> Result<CompiledProgram> {
        compile(text, &self.compile_options())
    }

    /// Cached compile
    ///
    /// Two threads missing on the same text both compile; the later insert
    /// wins and both results are equivalent.
    pub fn prepare(&self, text: &str) -> Result<Arc<CompiledProgram>> {
        if let Some(program) = self.cache.get(text) {
            return Ok(program);
        }
        let program = Arc::new(self.compile(text)?);
        self.cache.put(text.to_string(), Arc::clone(&program));
        Ok(program)
    }

    /// Prepare, bind and assemble in one call
    pub fn render<F>(&self, text: &str, bind: F) -> Result<String>
    where
        F: FnOnce(&mut Bindings<'_>) -> Result<()>,
    {
        let program = self.prepare(text)?;
        let mut bindings = Bindings::new(program.registry());
        bind(&mut bindings)?;
        let sql = assemble(&program, &bindings)?.into_owned();
        Ok(sql)
    }

    pub fn invalidate(&self, text: &str) -> bool {
        self.cache.invalidate(text)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
