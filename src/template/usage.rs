//! Per-call usage state
//!
//! One slot per registry index: whether the name is active, plus the bound
//! value for variables. Columns start active; flags and variables start off.

use crate::error::{Result, TemplateError};
use crate::template::handler::Value;
use crate::template::registry::{NameRegistry, Tier};

/// What the assembler asks about each registry index
pub trait UsageState {
    /// Number of slots; must equal the registry size
    fn len(&self) -> usize;

    fn is_active(&self, index: usize) -> bool;

    /// Bound value for a handler-bearing variable
    fn value(&self, index: usize) -> Option<&Value>;
}

/// Usage vector keyed by a compiled program's registry
#[derive(Debug, Clone)]
pub struct Bindings<'r> {
    registry: &'r NameRegistry,
    active: Vec<bool>,
    values: Vec<Option<Value>>,
}

impl<'r> Bindings<'r> {
    pub fn new(registry: &'r NameRegistry) -> Self {
        let mut active = vec![false; registry.len()];
        for index in registry.tiers().range(Tier::Column) {
            active[index] = true;
        }
        Self {
            registry,
            active,
            values: vec![None; registry.len()],
        }
    }

    fn resolve(&self, name: &str) -> Result<usize> {
        self.registry
            .index_of(name)
            .ok_or_else(|| TemplateError::UnknownName(name.to_string()))
    }

    fn is_variable(&self, index: usize) -> bool {
        matches!(
            self.registry.tier_of(index),
            Some(Tier::Variable) | Some(Tier::Special) | Some(Tier::Literal)
        )
    }

    /// Bind a variable; an empty list leaves it inactive
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let index = self.resolve(name)?;
        self.set_index(index, value.into())?;
        Ok(self)
    }

    pub fn set_index(&mut self, index: usize, value: Value) -> Result<()> {
        if !self.is_variable(index) {
            let name = self.registry.name(index).unwrap_or_default().to_string();
            return Err(TemplateError::InvalidValue {
                name,
                message: "only variables take values".to_string(),
            });
        }
        self.active[index] = !value.is_empty_list();
        self.values[index] = Some(value);
        Ok(())
    }

    /// Drop a bound value and deactivate the name
    pub fn unset(&mut self, name: &str) -> Result<&mut Self> {
        let index = self.resolve(name)?;
        self.active[index] = false;
        self.values[index] = None;
        Ok(self)
    }

    /// Turn on a flag, column or plain variable
    pub fn enable(&mut self, name: &str) -> Result<&mut Self> {
        let index = self.resolve(name)?;
        self.active[index] = true;
        Ok(self)
    }

    pub fn disable(&mut self, name: &str) -> Result<&mut Self> {
        let index = self.resolve(name)?;
        self.active[index] = false;
        Ok(self)
    }

    /// Keep only the listed select columns
    pub fn only_columns(&mut self, names: &[&str]) -> Result<&mut Self> {
        let columns = self.registry.tiers().range(Tier::Column);
        for index in columns.clone() {
            self.active[index] = false;
        }
        for name in names {
            let index = self.resolve(name)?;
            if !columns.contains(&index) {
                return Err(TemplateError::UnknownName(name.to_string()));
            }
            self.active[index] = true;
        }
        Ok(self)
    }

    /// Active variables and their values, for parameter binding
    pub fn bound(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.values.iter().enumerate().filter_map(move |(index, value)| {
            let value = value.as_ref()?;
            if !self.active[index] {
                return None;
            }
            Some((self.registry.name(index)?, value))
        })
    }

    pub fn registry(&self) -> &NameRegistry {
        self.registry
    }
}

impl UsageState for Bindings<'_> {
    fn len(&self) -> usize {
        self.active.len()
    }

    fn is_active(&self, index: usize) -> bool {
        self.active.get(index).copied().unwrap_or(false)
    }

    fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(Option::as_ref)
    }
}
