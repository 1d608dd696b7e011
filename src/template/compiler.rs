/// Template compiler - condition records to a flat segment/jump-table program
///
/// Splits the normalized text at every footprint and handler boundary,
/// finalizes the tiered name registry and builds the sentinel-terminated
/// condition array with precomputed AND skips and OR-group sizes.
use crate::cache::BufferPool;
use crate::config::TemplateConfig;
use crate::error::{Result, TemplateError};
use crate::template::handler::{HandlerSet, SegmentHandler};
use crate::template::keyword;
use crate::template::program::{CompiledProgram, Condition, Segment, SizeEstimator};
use crate::template::registry::{NameRegistry, RegistryBuilder, Tier};
use crate::template::scanner::{self, ConditionRecord, RecordKind, ScanOutput};
use ahash::AHashMap;
use std::sync::Arc;
use tracing::debug;

/// Everything `compile` needs besides the template text
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub marker_char: char,
    pub extract_select_columns: bool,
    /// Declared non-variable gates
    pub flags: Vec<String>,
    /// Reserved suffix letters and their handler factories
    pub handlers: HandlerSet,
    pub pooled_buffer_threshold: usize,
    pub buffer_pool_size: usize,
}

impl CompileOptions {
    pub fn from_config(config: &TemplateConfig, handlers: HandlerSet) -> Self {
        Self {
            marker_char: config.marker_char,
            extract_select_columns: config.extract_select_columns,
            flags: config.flags.clone(),
            handlers,
            pooled_buffer_threshold: config.pooled_buffer_threshold,
            buffer_pool_size: config.buffer_pool_size,
        }
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::from_config(&TemplateConfig::default(), HandlerSet::with_builtins())
    }
}

/// Compile template text into a reusable program
pub fn compile(text: &str, options: &CompileOptions) -> Result<CompiledProgram> {
    let scanned = scanner::scan(text, options.marker_char, &options.handlers, options.extract_select_columns)?;
    Compiler::new(options).build(scanned)
}

/// One gate before flattening: several members form an OR group
struct ConditionStub {
    members: Vec<usize>,
    segment_index: usize,
    length: usize,
}

struct Compiler<'a> {
    options: &'a CompileOptions,
    interned: AHashMap<(char, String), Arc<dyn SegmentHandler>>,
}

impl<'a> Compiler<'a> {
    fn new(options: &'a CompileOptions) -> Self {
        Self {
            options,
            interned: AHashMap::new(),
        }
    }

    fn build(mut self, scanned: ScanOutput) -> Result<CompiledProgram> {
        let registry = self.build_registry(&scanned)?;
        check_laminar(&scanned)?;

        let ScanOutput { text, records, variables, .. } = scanned;

        // Split points: every footprint and handler-site boundary
        let handler_sites: Vec<_> = variables.iter().filter(|v| v.handler.is_some()).collect();
        let mut points: Vec<usize> = Vec::with_capacity(records.len() * 2 + handler_sites.len() * 2 + 2);
        points.push(0);
        points.push(text.len());
        for record in &records {
            points.push(record.start);
            points.push(record.end);
        }
        for site in &handler_sites {
            points.push(site.start);
            points.push(site.end);
        }
        points.sort_unstable();
        points.dedup();

        let mut segments: Vec<Segment> = points
            .windows(2)
            .filter(|w| w[1] > w[0])
            .map(|w| Segment {
                start: w[0],
                length: w[1] - w[0],
                excess_or_index: 0,
                is_section: keyword::starts_section(&text[w[0]..w[1]]),
                handler: None,
            })
            .collect();

        let segment_at = |offset: usize| -> Result<usize> {
            segments_index(&points, offset)
                .ok_or_else(|| TemplateError::Internal(format!("no segment boundary at offset {}", offset)))
        };

        for site in &handler_sites {
            let index = segment_at(site.start)?;
            let letter = site
                .handler
                .ok_or_else(|| TemplateError::Internal("handler site without letter".to_string()))?;
            let handler = self.handler_for(letter, &site.name)?;
            let registry_index = registry
                .index_of(&site.name)
                .ok_or_else(|| TemplateError::UnknownName(site.name.clone()))?;
            let segment = &mut segments[index];
            segment.handler = Some(handler);
            segment.excess_or_index = registry_index;
            segment.is_section = false;
        }

        for record in &records {
            let index = segment_at(record.start)?;
            if index == 0 {
                continue;
            }
            let previous = &mut segments[index - 1];
            if previous.handler.is_none() {
                previous.excess_or_index = previous.excess_or_index.max(record.excess.min(previous.length));
            }
        }

        let mut stubs = Vec::with_capacity(records.len());
        for record in &records {
            let segment_index = segment_at(record.start)?;
            let segment_end = segment_at(record.end)?;
            stubs.push(ConditionStub {
                members: gate_members(record, &registry)?,
                segment_index,
                length: segment_end - segment_index,
            });
        }
        let conditions = flatten_conditions(stubs, segments.len());

        debug!(
            segments = segments.len(),
            conditions = conditions.len() - 1,
            names = registry.len(),
            "compiled template"
        );

        let estimate = text.len();
        Ok(CompiledProgram {
            text,
            segments,
            conditions,
            registry,
            estimator: SizeEstimator::new(estimate),
            pool: BufferPool::new(self.options.buffer_pool_size),
            pooled_threshold: self.options.pooled_buffer_threshold,
        })
    }

    fn build_registry(&self, scanned: &ScanOutput) -> Result<NameRegistry> {
        let mut builder = RegistryBuilder::new();

        for column in &scanned.columns {
            let (canonical, aliases) = column
                .split_first()
                .ok_or_else(|| TemplateError::Internal("empty column group".to_string()))?;
            builder.declare(canonical, Tier::Column)?;
            for alias in aliases {
                builder.alias(canonical, alias)?;
            }
        }

        let mut letters: AHashMap<String, char> = AHashMap::new();
        for site in &scanned.variables {
            let tier = match site.handler {
                Some(letter) => {
                    let previous = letters.entry(site.name.to_ascii_lowercase()).or_insert(letter);
                    if *previous != letter {
                        return Err(TemplateError::NameConflict(site.name.clone()));
                    }
                    self.options
                        .handlers
                        .get(letter)
                        .ok_or(TemplateError::UnknownHandler(letter))?
                        .tier
                }
                None => Tier::Variable,
            };
            builder.declare(&site.name, tier)?;
        }

        // Comment conditions must name something declared
        for record in &scanned.records {
            if !matches!(
                record.kind,
                RecordKind::AndComment | RecordKind::OrComment | RecordKind::CollapsedScope
            ) {
                continue;
            }
            for name in &record.names {
                if builder.contains(name) {
                    continue;
                }
                if self.options.flags.iter().any(|flag| flag.eq_ignore_ascii_case(name)) {
                    builder.declare(name, Tier::Flag)?;
                } else {
                    return Err(TemplateError::UndeclaredCondition(name.clone()));
                }
            }
        }

        Ok(builder.freeze())
    }

    fn handler_for(&mut self, letter: char, name: &str) -> Result<Arc<dyn SegmentHandler>> {
        let key = (letter, name.to_ascii_lowercase());
        if let Some(handler) = self.interned.get(&key) {
            return Ok(Arc::clone(handler));
        }
        let registration = self
            .options
            .handlers
            .get(letter)
            .ok_or(TemplateError::UnknownHandler(letter))?;
        let handler = (registration.factory)(self.options.marker_char, name);
        self.interned.insert(key, Arc::clone(&handler));
        Ok(handler)
    }
}

fn segments_index(points: &[usize], offset: usize) -> Option<usize> {
    points.binary_search(&offset).ok()
}

/// Registry indices gated by one record (several = OR group)
fn gate_members(record: &ConditionRecord, registry: &NameRegistry) -> Result<Vec<usize>> {
    let names = match record.kind {
        // aliases resolve to the canonical index
        RecordKind::JoinedSelectColumn => &record.names[..record.names.len().min(1)],
        _ => &record.names[..],
    };
    let mut members = Vec::with_capacity(names.len());
    for name in names {
        let index = registry
            .index_of(name)
            .ok_or_else(|| TemplateError::UndeclaredCondition(name.clone()))?;
        if !members.contains(&index) {
            members.push(index);
        }
    }
    if members.is_empty() {
        return Err(TemplateError::Internal("condition without names".to_string()));
    }
    Ok(members)
}

/// Footprints must nest or be disjoint
fn check_laminar(scanned: &ScanOutput) -> Result<()> {
    let mut spans: Vec<(usize, usize)> = scanned
        .records
        .iter()
        .map(|r| (r.start, r.end))
        .chain(
            scanned
                .variables
                .iter()
                .filter(|v| v.handler.is_some())
                .map(|v| (v.start, v.end)),
        )
        .collect();
    spans.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut open: Vec<usize> = Vec::new();
    for (start, end) in spans {
        if start >= end || end > scanned.text.len() {
            return Err(TemplateError::Internal(format!("empty or out-of-range footprint {}..{}", start, end)));
        }
        while open.last().map_or(false, |top| start >= *top) {
            open.pop();
        }
        if let Some(top) = open.last() {
            if end > *top {
                return Err(TemplateError::Internal(format!("overlapping footprints at {}..{}", start, end)));
            }
        }
        open.push(end);
    }
    Ok(())
}

/// Sort stubs, expand OR groups and compute forward skips
fn flatten_conditions(mut stubs: Vec<ConditionStub>, segment_count: usize) -> Vec<Condition> {
    // Outer (longer) gates before the ones nested inside them
    stubs.sort_by(|a, b| a.segment_index.cmp(&b.segment_index).then(b.length.cmp(&a.length)));

    let slots: usize = stubs.iter().map(|s| s.members.len()).sum();
    let mut conditions = Vec::with_capacity(slots + 1);
    for stub in &stubs {
        let group = stub.members.len();
        for (k, member) in stub.members.iter().enumerate() {
            conditions.push(Condition {
                cond_index: *member,
                segment_index: stub.segment_index,
                length: if k == 0 { stub.length as i32 } else { 0 },
                nb_condition_skip: if k == 1 { -(group as i32) } else { 0 },
            });
        }
    }
    conditions.push(Condition::sentinel(segment_count));

    // Backward walk: nested heads already know their skip
    for i in (0..conditions.len() - 1).rev() {
        if conditions[i].length == 0 {
            continue;
        }
        let group = group_size(&conditions, i);
        let end = conditions[i].segment_index + conditions[i].length as usize;
        let mut j = i + group;
        while conditions[j].segment_index < end {
            j += conditions[j].nb_condition_skip.max(1) as usize;
        }
        conditions[i].nb_condition_skip = (j - i) as i32;
    }
    conditions
}

/// Members in the OR group headed at `i` (1 for a plain gate)
pub(crate) fn group_size(conditions: &[Condition], i: usize) -> usize {
    match conditions.get(i + 1) {
        Some(next) if next.nb_condition_skip < 0 => (-next.nb_condition_skip) as usize,
        _ => 1,
    }
}
