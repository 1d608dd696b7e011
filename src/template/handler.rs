//! Segment handlers
//!
//! A handler formats one bound value into the assembled SQL text. Handlers
//! are selected at compile time by a one-letter suffix on the variable name
//! (`@Title_Q`, `@Ids_M`) and never mutate after construction.

use crate::error::{Result, TemplateError};
use crate::template::registry::Tier;
use dashmap::DashMap;
use std::fmt::{self, Write};
use std::sync::Arc;

/// A value bound to a template variable
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    /// Empty lists count as "not provided" when deciding whether a gate is active
    pub fn is_empty_list(&self) -> bool {
        matches!(self, Value::List(items) if items.is_empty())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOL",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Text(_) => "TEXT",
            Value::List(_) => "LIST",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Formats one bound value into the output buffer
pub trait SegmentHandler: Send + Sync + fmt::Debug {
    fn handle(&self, out: &mut String, value: &Value) -> Result<()>;
}

fn fmt_err(err: fmt::Error) -> TemplateError {
    TemplateError::Internal(err.to_string())
}

/// `'text'` with embedded quotes doubled
#[derive(Debug, Default)]
pub struct QuoteHandler;

impl SegmentHandler for QuoteHandler {
    fn handle(&self, out: &mut String, value: &Value) -> Result<()> {
        match value {
            Value::Null => out.push_str("NULL"),
            Value::List(_) => {
                return Err(TemplateError::InvalidValue {
                    name: "quote".to_string(),
                    message: "lists cannot be quoted; use a multi-value handler".to_string(),
                })
            }
            Value::Text(s) => {
                out.reserve(s.len() + 2);
                out.push('\'');
                for ch in s.chars() {
                    if ch == '\'' {
                        out.push('\'');
                    }
                    out.push(ch);
                }
                out.push('\'');
            }
            other => {
                out.push('\'');
                write!(out, "{}", other).map_err(fmt_err)?;
                out.push('\'');
            }
        }
        Ok(())
    }
}

/// Caller-trusted text, copied as is
#[derive(Debug, Default)]
pub struct RawHandler;

impl SegmentHandler for RawHandler {
    fn handle(&self, out: &mut String, value: &Value) -> Result<()> {
        write!(out, "{}", value).map_err(fmt_err)
    }
}

/// Numbers (and booleans as 0/1); anything else is rejected
#[derive(Debug, Default)]
pub struct NumericHandler;

impl SegmentHandler for NumericHandler {
    fn handle(&self, out: &mut String, value: &Value) -> Result<()> {
        match value {
            Value::Integer(_) | Value::Bool(_) | Value::Null => write!(out, "{}", value).map_err(fmt_err),
            Value::Float(x) if x.is_finite() => write!(out, "{}", x).map_err(fmt_err),
            Value::Text(s) if s.trim().parse::<f64>().map(|x| x.is_finite()).unwrap_or(false) => {
                out.push_str(s.trim());
                Ok(())
            }
            other => Err(TemplateError::InvalidValue {
                name: "numeric".to_string(),
                message: format!("{} is not a number", other.type_name()),
            }),
        }
    }
}

/// Expands a list into `@name_1, @name_2, ..., @name_N`
///
/// The list elements themselves are bound later under those names.
#[derive(Debug)]
pub struct MultiValueHandler {
    /// marker + base name, e.g. `@Ids_`
    prefix: String,
}

impl MultiValueHandler {
    pub fn new(marker: char, name: &str) -> Self {
        let mut prefix = String::with_capacity(name.len() + 2);
        prefix.push(marker);
        prefix.push_str(name);
        prefix.push('_');
        Self { prefix }
    }
}

impl SegmentHandler for MultiValueHandler {
    fn handle(&self, out: &mut String, value: &Value) -> Result<()> {
        let count = match value {
            Value::List(items) => items.len(),
            other => {
                return Err(TemplateError::InvalidValue {
                    name: self.prefix.trim_end_matches('_').to_string(),
                    message: format!("expected LIST, got {}", other.type_name()),
                })
            }
        };

        // Decimal counter kept as ASCII digits; widens on carry (9 -> 10, 99 -> 100)
        let mut digits: Vec<u8> = vec![b'0'];
        out.reserve(count * (self.prefix.len() + 4));
        for i in 0..count {
            increment(&mut digits);
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.prefix);
            for d in &digits {
                out.push(*d as char);
            }
        }
        Ok(())
    }
}

fn increment(digits: &mut Vec<u8>) {
    for d in digits.iter_mut().rev() {
        if *d == b'9' {
            *d = b'0';
        } else {
            *d += 1;
            return;
        }
    }
    digits.insert(0, b'1');
}

/// Builds a handler for one variable; receives the marker char and base name
pub type HandlerFactory = Arc<dyn Fn(char, &str) -> Arc<dyn SegmentHandler> + Send + Sync>;

#[derive(Clone)]
pub struct HandlerRegistration {
    pub tier: Tier,
    pub factory: HandlerFactory,
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration").field("tier", &self.tier).finish()
    }
}

/// Suffix letter -> handler factory
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    handlers: Arc<DashMap<char, HandlerRegistration>>,
}

impl HandlerSet {
    /// Empty set (no reserved suffixes)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Q (quote), R (raw), N (numeric), M (multi-value)
    pub fn with_builtins() -> Self {
        let set = Self::empty();
        let quote: Arc<dyn SegmentHandler> = Arc::new(QuoteHandler);
        let raw: Arc<dyn SegmentHandler> = Arc::new(RawHandler);
        let numeric: Arc<dyn SegmentHandler> = Arc::new(NumericHandler);

        set.register('Q', Tier::Literal, Arc::new(move |_, _| Arc::clone(&quote)));
        set.register('R', Tier::Literal, Arc::new(move |_, _| Arc::clone(&raw)));
        set.register('N', Tier::Literal, Arc::new(move |_, _| Arc::clone(&numeric)));
        set.register(
            'M',
            Tier::Special,
            Arc::new(|marker, name| Arc::new(MultiValueHandler::new(marker, name)) as Arc<dyn SegmentHandler>),
        );
        set
    }

    /// Add or replace the handler for a suffix letter
    pub fn register(&self, letter: char, tier: Tier, factory: HandlerFactory) {
        self.handlers.insert(letter, HandlerRegistration { tier, factory });
    }

    pub fn unregister(&self, letter: char) -> bool {
        self.handlers.remove(&letter).is_some()
    }

    pub fn is_reserved(&self, letter: char) -> bool {
        self.handlers.contains_key(&letter)
    }

    pub fn get(&self, letter: char) -> Option<HandlerRegistration> {
        self.handlers.get(&letter).map(|entry| entry.value().clone())
    }

    pub fn letters(&self) -> Vec<char> {
        let mut letters: Vec<char> = self.handlers.iter().map(|entry| *entry.key()).collect();
        letters.sort_unstable();
        letters
    }
}
