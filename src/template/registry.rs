/// Name -> index registry for compiled templates
///
/// Every distinct marker name gets a stable index. Indices are partitioned
/// into contiguous tiers so callers can size and fill usage vectors by
/// category.
use crate::error::{Result, TemplateError};
use ahash::AHashMap;

/// Registry tier, in index order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Toggleable SELECT projections
    Column,
    /// Declared non-variable gates
    Flag,
    /// Plain `@name` / `?@name` variables
    Variable,
    /// Variables expanded by a name-capturing handler (multi-value)
    Special,
    /// Variables whose value is injected as text
    Literal,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::Column, Tier::Flag, Tier::Variable, Tier::Special, Tier::Literal];

    fn ordinal(self) -> usize {
        self as usize
    }
}

/// Half-open index range per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TierBounds {
    starts: [usize; 6],
}

impl TierBounds {
    pub fn range(&self, tier: Tier) -> std::ops::Range<usize> {
        self.starts[tier.ordinal()]..self.starts[tier.ordinal() + 1]
    }

    pub fn tier_of(&self, index: usize) -> Option<Tier> {
        Tier::ALL.into_iter().find(|tier| self.range(*tier).contains(&index))
    }
}

/// Frozen, case-insensitive name registry
#[derive(Debug, Clone, Default)]
pub struct NameRegistry {
    /// lowercase name (or alias) -> index
    lookup: AHashMap<String, usize>,
    /// index -> display name (first spelling seen)
    names: Vec<String>,
    bounds: TierBounds,
}

impl NameRegistry {
    /// Look up a name, ignoring ASCII case
    pub fn index_of(&self, name: &str) -> Option<usize> {
        if let Some(index) = self.lookup.get(name) {
            return Some(*index);
        }
        self.lookup.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn tiers(&self) -> TierBounds {
        self.bounds
    }

    pub fn tier_of(&self, index: usize) -> Option<Tier> {
        self.bounds.tier_of(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, name)| (i, name.as_str()))
    }
}

#[derive(Debug)]
struct PendingName {
    display: String,
    tier: Tier,
    first_seen: usize,
    aliases: Vec<String>,
}

/// Collects names during compilation, then freezes them into a `NameRegistry`
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    pending: AHashMap<String, PendingName>,
    /// alias key -> canonical key
    aliases: AHashMap<String, String>,
    seen: usize,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn canonical_key(&self, name: &str) -> String {
        let key = name.to_ascii_lowercase();
        match self.aliases.get(&key) {
            Some(canonical) => canonical.clone(),
            None => key,
        }
    }

    /// Declare a name in a tier
    ///
    /// Variables may be promoted to a handler tier (the same name used once
    /// plain and once with a handler suffix). Columns and flags never share a
    /// name with anything else.
    pub fn declare(&mut self, name: &str, tier: Tier) -> Result<()> {
        let key = self.canonical_key(name);
        match self.pending.get_mut(&key) {
            Some(existing) if existing.tier == tier => Ok(()),
            Some(existing) => {
                let promotable = |a: Tier, b: Tier| a == Tier::Variable && matches!(b, Tier::Special | Tier::Literal);
                if promotable(existing.tier, tier) {
                    existing.tier = tier;
                    Ok(())
                } else if promotable(tier, existing.tier) {
                    Ok(())
                } else {
                    Err(TemplateError::NameConflict(name.to_string()))
                }
            }
            None => {
                self.pending.insert(
                    key,
                    PendingName {
                        display: name.to_string(),
                        tier,
                        first_seen: self.seen,
                        aliases: Vec::new(),
                    },
                );
                self.seen += 1;
                Ok(())
            }
        }
    }

    /// Make `alias` resolve to the same index as `name` (joined columns)
    pub fn alias(&mut self, name: &str, alias: &str) -> Result<()> {
        let canonical = self.canonical_key(name);
        let alias_key = alias.to_ascii_lowercase();
        if alias_key == canonical {
            return Ok(());
        }
        if self.pending.contains_key(&alias_key) || self.aliases.contains_key(&alias_key) {
            return Err(TemplateError::NameConflict(alias.to_string()));
        }
        let entry = self
            .pending
            .get_mut(&canonical)
            .ok_or_else(|| TemplateError::UnknownName(name.to_string()))?;
        entry.aliases.push(alias_key.clone());
        self.aliases.insert(alias_key, canonical);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pending.contains_key(&self.canonical_key(name))
    }

    pub fn tier(&self, name: &str) -> Option<Tier> {
        self.pending.get(&self.canonical_key(name)).map(|p| p.tier)
    }

    /// Assign indices: by tier, then by first appearance
    pub fn freeze(self) -> NameRegistry {
        let mut entries: Vec<(String, PendingName)> = self.pending.into_iter().collect();
        entries.sort_by_key(|(_, p)| (p.tier, p.first_seen));

        let mut lookup = AHashMap::with_capacity(entries.len());
        let mut names = Vec::with_capacity(entries.len());
        let mut starts = [0usize; 6];
        for tier in Tier::ALL {
            starts[tier.ordinal() + 1] = entries.iter().filter(|(_, p)| p.tier <= tier).count();
        }

        for (index, (key, pending)) in entries.into_iter().enumerate() {
            for alias in pending.aliases {
                lookup.insert(alias, index);
            }
            lookup.insert(key, index);
            names.push(pending.display);
        }

        NameRegistry {
            lookup,
            names,
            bounds: TierBounds { starts },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tiers_are_contiguous() {
        let mut builder = RegistryBuilder::new();
        builder.declare("Filter", Tier::Variable).unwrap();
        builder.declare("Ids", Tier::Special).unwrap();
        builder.declare("Name", Tier::Column).unwrap();
        builder.declare("Archived", Tier::Flag).unwrap();
        builder.declare("Title", Tier::Literal).unwrap();
        builder.declare("Id", Tier::Column).unwrap();

        let registry = builder.freeze();
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.tiers().range(Tier::Column), 0..2);
        assert_eq!(registry.tiers().range(Tier::Flag), 2..3);
        assert_eq!(registry.tiers().range(Tier::Variable), 3..4);
        assert_eq!(registry.tiers().range(Tier::Special), 4..5);
        assert_eq!(registry.tiers().range(Tier::Literal), 5..6);
        assert_eq!(registry.index_of("name"), Some(0));
        assert_eq!(registry.index_of("ID"), Some(1));
        assert_eq!(registry.name(3), Some("Filter"));
        assert_eq!(registry.tier_of(4), Some(Tier::Special));
    }

    #[test]
    fn test_registry_empty_trailing_tiers() {
        let mut builder = RegistryBuilder::new();
        builder.declare("A", Tier::Variable).unwrap();
        let registry = builder.freeze();

        assert_eq!(registry.tiers().range(Tier::Column), 0..0);
        assert_eq!(registry.tiers().range(Tier::Variable), 0..1);
        assert_eq!(registry.tiers().range(Tier::Literal), 1..1);
    }

    #[test]
    fn test_registry_promotion_and_conflicts() {
        let mut builder = RegistryBuilder::new();
        builder.declare("Ids", Tier::Variable).unwrap();
        builder.declare("ids", Tier::Special).unwrap();
        assert_eq!(builder.tier("IDS"), Some(Tier::Special));
        builder.declare("Ids", Tier::Variable).unwrap();
        assert_eq!(builder.tier("Ids"), Some(Tier::Special));

        builder.declare("Name", Tier::Column).unwrap();
        assert!(matches!(
            builder.declare("name", Tier::Variable),
            Err(TemplateError::NameConflict(_))
        ));
    }

    #[test]
    fn test_registry_aliases_share_index() {
        let mut builder = RegistryBuilder::new();
        builder.declare("FirstName", Tier::Column).unwrap();
        builder.alias("FirstName", "LastName").unwrap();
        builder.declare("Age", Tier::Column).unwrap();

        let registry = builder.freeze();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.index_of("lastname"), registry.index_of("FirstName"));
        assert_eq!(registry.index_of("Age"), Some(1));
    }
}
