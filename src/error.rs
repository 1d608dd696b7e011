//! Error types for the MoteQuery template engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TemplateError>;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Template syntax errors (compile time)
    #[error("Syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("Unterminated literal starting at offset {offset}")]
    UnterminatedLiteral { offset: usize },

    #[error("Unterminated comment starting at offset {offset}")]
    UnterminatedComment { offset: usize },

    #[error("Nesting deeper than {limit} scopes at offset {offset}")]
    NestingTooDeep { offset: usize, limit: usize },

    #[error("Dangling connective or condition marker at offset {offset}")]
    DanglingConnective { offset: usize },

    #[error("Condition references undeclared name: {0}")]
    UndeclaredCondition(String),

    #[error("Name used with conflicting meanings: {0}")]
    NameConflict(String),

    #[error("No handler registered for suffix '{0}'")]
    UnknownHandler(char),

    // Assembly errors
    #[error("Missing value for variable #{index} ({name})")]
    MissingValue { index: usize, name: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Usage state has {actual} slots, registry expects {expected}")]
    UsageMismatch { expected: usize, actual: usize },

    #[error("Unknown name: {0}")]
    UnknownName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TemplateError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        TemplateError::Syntax { offset, message: message.into() }
    }

    /// True for errors raised while compiling a template
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            TemplateError::Syntax { .. }
                | TemplateError::UnterminatedLiteral { .. }
                | TemplateError::UnterminatedComment { .. }
                | TemplateError::NestingTooDeep { .. }
                | TemplateError::DanglingConnective { .. }
                | TemplateError::UndeclaredCondition(_)
                | TemplateError::NameConflict(_)
                | TemplateError::UnknownHandler(_)
        )
    }
}

impl From<serde_json::Error> for TemplateError {
    fn from(err: serde_json::Error) -> Self {
        TemplateError::Config(err.to_string())
    }
}
