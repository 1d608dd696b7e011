/// Template scanner - one left-to-right pass over raw template text
///
/// Strips marker syntax, collapses whitespace, tracks nesting and quoting,
/// and emits condition records: which byte range of the normalized text
/// disappears when a gate is false.
use crate::config::MAX_NESTING_DEPTH;
use crate::error::{Result, TemplateError};
use crate::template::handler::HandlerSet;
use crate::template::keyword::{self, classify, Keyword, Section};
use crate::template::registry::Tier;

/// Category of a condition record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `?@name`, or a multi-value handler variable
    OptionalVariable,
    /// `/*A*/`, one factor of `/*A&B*/`
    AndComment,
    /// `/*A|B*/`
    OrComment,
    /// Implicit SELECT projection toggle
    SelectColumn,
    /// Projections joined with `&`; first name is canonical, the rest alias it
    JoinedSelectColumn,
    /// A parenthesized group whose every item is gated collapses when all are off
    CollapsedScope,
}

/// One AND-factor of an item's gate. Several names mean OR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gate {
    pub kind: RecordKind,
    pub names: Vec<String>,
}

impl Gate {
    fn single(kind: RecordKind, name: &str) -> Self {
        Self { kind, names: vec![name.to_string()] }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionRecord {
    pub kind: RecordKind,
    pub names: Vec<String>,
    /// Footprint in normalized text, half open
    pub start: usize,
    pub end: usize,
    /// Scope bitmask active when the record was produced
    pub scope: u64,
    /// Bytes of dangling separator/keyword right before `start`
    pub excess: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSite {
    pub name: String,
    pub handler: Option<char>,
    pub optional: bool,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Default)]
pub struct ScanOutput {
    pub text: String,
    pub records: Vec<ConditionRecord>,
    pub variables: Vec<VariableSite>,
    /// Toggleable projections: canonical name followed by joined aliases
    pub columns: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Root,
    Paren,
    Case,
}

#[derive(Debug, Default)]
struct Item {
    start: Option<usize>,
    end: usize,
    gates: Vec<Gate>,
    join_next: bool,
}

#[derive(Debug, Default)]
struct Clause {
    section: Option<Section>,
    /// Offset before the space preceding the section keyword
    lead: usize,
    /// Gates placed in front of the section keyword
    gates: Vec<Gate>,
    header_open: bool,
    items: Vec<Item>,
    current: Item,
    /// Input offset of a connector still waiting for its right-hand item
    connector_pending: Option<usize>,
    between: bool,
}

/// Constructs whose gate spans more than one clause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanKind {
    /// JOIN plus its ON clause
    Join,
    /// UNION plus the statement after it
    Union,
    /// One WHEN ... THEN ... branch, or the ELSE branch, of a CASE
    Branch,
}

/// Clause gates waiting for the end of their construct
#[derive(Debug)]
struct Span {
    kind: SpanKind,
    lead: usize,
    gates: Vec<Gate>,
    seen_on: bool,
}

impl Span {
    /// Does a clause started by `section` fall outside this span?
    fn ends_at(&mut self, section: Section) -> bool {
        match self.kind {
            SpanKind::Join if section == Section::On && !self.seen_on => {
                self.seen_on = true;
                false
            }
            SpanKind::Join => true,
            SpanKind::Union => section == Section::Union,
            SpanKind::Branch => matches!(section, Section::When | Section::Else),
        }
    }
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    open_offset: usize,
    at_boundary: bool,
    sectioned: bool,
    clause: Clause,
    spans: Vec<Span>,
    /// Lead of the current WHEN branch (CASE scopes)
    branch_lead: Option<usize>,
}

impl Scope {
    fn new(kind: ScopeKind, open_offset: usize, at_boundary: bool) -> Self {
        Self {
            kind,
            open_offset,
            at_boundary,
            sectioned: false,
            clause: Clause::default(),
            spans: Vec::new(),
            branch_lead: None,
        }
    }
}

/// Gates that drop a whole CASE branch: a sole gated item, or an OR of
/// single gates when every item is gated
fn branch_gates(items: &mut [Item]) -> Vec<Gate> {
    let gated = items.iter().filter(|item| !item.gates.is_empty()).count();
    if items.is_empty() || gated != items.len() {
        return Vec::new();
    }
    if items.len() == 1 {
        return std::mem::take(&mut items[0].gates);
    }
    if !items.iter().all(|item| item.gates.len() == 1) {
        return Vec::new();
    }
    vec![collapsed_gate(items)]
}

/// One OR gate over the single gate of every item
fn collapsed_gate(items: &[Item]) -> Gate {
    let mut names: Vec<String> = Vec::new();
    for item in items {
        for name in &item.gates[0].names {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.clone());
            }
        }
    }
    Gate {
        kind: RecordKind::CollapsedScope,
        names,
    }
}

struct ResolvedItem {
    start: usize,
    end: usize,
    gates: Vec<Gate>,
}

pub struct Scanner<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
    marker: u8,
    handlers: &'a HandlerSet,
    extract_columns: bool,
    out: Vec<u8>,
    pending_space: bool,
    scopes: Vec<Scope>,
    /// Bit per open scope: set when the scope opened at an item boundary
    mask: u64,
    /// Comment gates waiting for the next token, with their input offset
    pending_gates: Vec<(Gate, usize)>,
    records: Vec<ConditionRecord>,
    variables: Vec<VariableSite>,
    columns: Vec<Vec<String>>,
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty() && is_name_start(bytes[0]) && bytes.iter().all(|b| is_word_byte(*b))
}

/// Parse `A`, `A&B`, `A|B`, `A|B&C` (`|` binds tighter). None if not a condition.
fn parse_condition(content: &str, marker: u8) -> Option<Vec<Gate>> {
    let content = content.trim();
    if content.is_empty() {
        return None;
    }
    let mut gates = Vec::new();
    for factor in content.split('&') {
        let mut names = Vec::new();
        for name in factor.split('|') {
            let name = name.trim();
            let name = name.strip_prefix(marker as char).unwrap_or(name);
            if !is_name(name) {
                return None;
            }
            names.push(name.to_string());
        }
        let kind = if names.len() > 1 { RecordKind::OrComment } else { RecordKind::AndComment };
        gates.push(Gate { kind, names });
    }
    Some(gates)
}

/// Name a SELECT projection by its alias or trailing column identifier
fn column_name(text: &str) -> Option<String> {
    let text = text.trim_end();
    let bytes = text.as_bytes();
    let last = *bytes.last()?;
    let (close, open) = match last {
        b'"' => (b'"', b'"'),
        b']' => (b']', b'['),
        b'`' => (b'`', b'`'),
        _ => (0, 0),
    };
    if close != 0 {
        let inner = &text[..text.len() - 1];
        let start = inner.rfind(open as char)?;
        let name = &inner[start + 1..];
        return is_name(name).then(|| name.to_string());
    }
    let start = bytes.iter().rposition(|b| !is_word_byte(*b)).map(|p| p + 1).unwrap_or(0);
    let name = &text[start..];
    if !is_name(name) || classify(name).is_some() {
        return None;
    }
    Some(name.to_string())
}

impl<'a> Scanner<'a> {
    pub fn new(input: &'a str, marker: char, handlers: &'a HandlerSet, extract_columns: bool) -> Result<Self> {
        if !marker.is_ascii() {
            return Err(TemplateError::Config(format!("marker '{}' must be ASCII", marker)));
        }
        Ok(Self {
            input,
            bytes: input.as_bytes(),
            pos: 0,
            marker: marker as u8,
            handlers,
            extract_columns,
            out: Vec::with_capacity(input.len()),
            pending_space: false,
            scopes: vec![Scope::new(ScopeKind::Root, 0, true)],
            mask: 0,
            pending_gates: Vec::new(),
            records: Vec::new(),
            variables: Vec::new(),
            columns: Vec::new(),
        })
    }

    /// Run the scan to completion
    pub fn scan(mut self) -> Result<ScanOutput> {
        while self.pos < self.bytes.len() {
            self.step()?;
        }
        self.finish()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn top_index(&self) -> usize {
        self.scopes.len() - 1
    }

    fn text(&self, start: usize, end: usize) -> &str {
        std::str::from_utf8(&self.out[start..end]).unwrap_or_default()
    }

    /// Word starting at `from` after skipping whitespace
    fn word_after(&self, from: usize) -> &str {
        let mut i = from;
        while i < self.bytes.len() && self.bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let start = i;
        while i < self.bytes.len() && is_word_byte(self.bytes[i]) {
            i += 1;
        }
        &self.input[start..i]
    }

    fn next_non_space(&self, from: usize) -> Option<u8> {
        self.bytes[from.min(self.bytes.len())..]
            .iter()
            .copied()
            .find(|b| !b.is_ascii_whitespace())
    }

    fn step(&mut self) -> Result<()> {
        let bytes = self.bytes;
        let b = bytes[self.pos];
        match b {
            _ if b.is_ascii_whitespace() => {
                self.pending_space = true;
                self.pos += 1;
            }
            b'-' if self.peek(1) == Some(b'-') => {
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                self.pending_space = true;
            }
            b'/' if self.peek(1) == Some(b'*') => self.read_comment()?,
            b'\'' | b'"' | b'`' | b'[' => self.read_literal(b)?,
            b'?' if self.peek(1) == Some(self.marker) && self.peek(2).map_or(false, is_name_start) => {
                self.pos += 1;
                self.read_variable(true)?;
            }
            _ if b == self.marker => self.read_variable(false)?,
            b'(' => {
                let offset = self.pos;
                self.pos += 1;
                self.open_scope(ScopeKind::Paren, b"(", offset)?;
            }
            b')' => {
                let offset = self.pos;
                self.pos += 1;
                self.close_scope(ScopeKind::Paren, offset)?;
                self.emit_content(b")");
            }
            b',' => {
                let offset = self.pos;
                self.pos += 1;
                self.emit_connector(b",", offset)?;
            }
            b';' => {
                let offset = self.pos;
                self.pos += 1;
                self.terminate_statement(offset)?;
            }
            b'&' if self.joins_projection() => {
                let i = self.top_index();
                self.scopes[i].clause.current.join_next = true;
                self.pos += 1;
            }
            _ if is_name_start(b) => self.read_word()?,
            _ if is_word_byte(b) => {
                let start = self.pos;
                while self.pos < self.bytes.len() && is_word_byte(self.bytes[self.pos]) {
                    self.pos += 1;
                }
                self.emit_content(&bytes[start..self.pos]);
            }
            _ if b.is_ascii() => {
                self.pos += 1;
                self.emit_content(&[b]);
            }
            _ => {
                let len = self.input[self.pos..].chars().next().map_or(1, char::len_utf8);
                let start = self.pos;
                self.pos += len;
                self.emit_content(&bytes[start..self.pos]);
            }
        }
        Ok(())
    }

    fn joins_projection(&self) -> bool {
        let scope = &self.scopes[self.top_index()];
        self.extract_columns
            && scope.kind == ScopeKind::Root
            && scope.clause.section == Some(Section::Select)
            && scope.clause.current.start.is_some()
            && self.next_non_space(self.pos + 1) == Some(b',')
    }

    fn flush_space(&mut self) {
        if self.pending_space && !self.out.is_empty() && self.out.last() != Some(&b' ') {
            self.out.push(b' ');
        }
        self.pending_space = false;
    }

    /// Append text belonging to the current item; returns its offset
    fn emit_content(&mut self, text: &[u8]) -> usize {
        self.flush_space();
        let offset = self.out.len();
        let i = self.top_index();
        let clause = &mut self.scopes[i].clause;
        clause.header_open = false;
        clause.connector_pending = None;
        let item = &mut clause.current;
        if item.start.is_none() {
            item.start = Some(offset);
        }
        item.gates.extend(self.pending_gates.drain(..).map(|(gate, _)| gate));
        self.out.extend_from_slice(text);
        item.end = self.out.len();
        offset
    }

    /// Text that belongs to the clause header, not to any item
    fn emit_header(&mut self, text: &[u8]) {
        self.flush_space();
        self.out.extend_from_slice(text);
    }

    fn emit_connector(&mut self, text: &[u8], offset: usize) -> Result<()> {
        let i = self.top_index();
        let clause = &mut self.scopes[i].clause;
        if clause.current.start.is_none() {
            return Err(TemplateError::DanglingConnective { offset });
        }
        let item = std::mem::take(&mut clause.current);
        clause.items.push(item);
        clause.connector_pending = Some(offset);
        clause.between = false;
        self.flush_space();
        self.out.extend_from_slice(text);
        Ok(())
    }

    fn read_comment(&mut self) -> Result<()> {
        let bytes = self.bytes;
        let start = self.pos;
        let close = self.input[start + 2..]
            .find("*/")
            .ok_or(TemplateError::UnterminatedComment { offset: start })?;
        let content_end = start + 2 + close;
        self.pos = content_end + 2;

        match parse_condition(&self.input[start + 2..content_end], self.marker) {
            Some(gates) => {
                // Whitespace after a removed marker only survives between two words
                while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
                    self.pos += 1;
                }
                let word_before = self.out.last().map_or(false, |b| is_word_byte(*b));
                let word_after = bytes.get(self.pos).map_or(false, |b| is_word_byte(*b) || *b == self.marker);
                self.pending_space = self.pending_space || (word_before && word_after);
                self.pending_gates.extend(gates.into_iter().map(|gate| (gate, start)));
            }
            None => {
                self.emit_content(&bytes[start..self.pos]);
            }
        }
        Ok(())
    }

    fn read_literal(&mut self, open: u8) -> Result<()> {
        let bytes = self.bytes;
        let start = self.pos;
        let close = if open == b'[' { b']' } else { open };
        let mut i = start + 1;
        loop {
            match self.bytes.get(i) {
                None => return Err(TemplateError::UnterminatedLiteral { offset: start }),
                Some(b) if *b == close => {
                    // '' inside a string literal is an escaped quote
                    if open == b'\'' && self.bytes.get(i + 1) == Some(&b'\'') {
                        i += 2;
                        continue;
                    }
                    break;
                }
                Some(_) => i += 1,
            }
        }
        self.pos = i + 1;
        self.emit_content(&bytes[start..self.pos]);
        Ok(())
    }

    fn read_variable(&mut self, optional: bool) -> Result<()> {
        let bytes = self.bytes;
        let input = self.input;
        let start = self.pos;
        let name_start = start + 1;
        match self.bytes.get(name_start).copied() {
            // @@name: server variable, copied verbatim
            Some(b) if b == self.marker => {
                let mut i = name_start + 1;
                while i < self.bytes.len() && is_word_byte(self.bytes[i]) {
                    i += 1;
                }
                self.pos = i;
                self.emit_content(&bytes[start..i]);
                return Ok(());
            }
            Some(b) if is_name_start(b) => {}
            _ => {
                self.pos += 1;
                self.emit_content(&[self.marker]);
                return Ok(());
            }
        }

        let mut end = name_start;
        while end < self.bytes.len() && is_word_byte(self.bytes[end]) {
            end += 1;
        }
        self.pos = end;
        let full = &input[name_start..end];

        let (name, handler) = match full.as_bytes() {
            [.., b'_', letter] if full.len() >= 3 && self.handlers.is_reserved(*letter as char) => {
                (&full[..full.len() - 2], Some(*letter as char))
            }
            _ => (full, None),
        };

        let gated = optional
            || handler
                .and_then(|letter| self.handlers.get(letter))
                .map_or(false, |registration| registration.tier == Tier::Special);
        if gated {
            self.pending_gates.push((Gate::single(RecordKind::OptionalVariable, name), start));
        }

        let mut text = Vec::with_capacity(name.len() + 1);
        text.push(self.marker);
        text.extend_from_slice(name.as_bytes());
        let offset = self.emit_content(&text);
        self.variables.push(VariableSite {
            name: name.to_string(),
            handler,
            optional,
            start: offset,
            end: offset + text.len(),
        });
        Ok(())
    }

    fn read_word(&mut self) -> Result<()> {
        let bytes = self.bytes;
        let input = self.input;
        let start = self.pos;
        while self.pos < self.bytes.len() && is_word_byte(self.bytes[self.pos]) {
            self.pos += 1;
        }
        let word_end = self.pos;
        let word = &input[start..word_end];

        let i = self.top_index();
        if self.scopes[i].clause.header_open && self.is_header_continuation(word) {
            self.emit_header(&bytes[start..word_end]);
            return Ok(());
        }

        match classify(word) {
            Some(Keyword::Section(Section::GroupBy)) | Some(Keyword::Section(Section::OrderBy)) => {
                if self.word_after(word_end).eq_ignore_ascii_case("by") {
                    let section = if word.eq_ignore_ascii_case("group") { Section::GroupBy } else { Section::OrderBy };
                    self.start_section(section, start, word_end)?;
                } else {
                    self.emit_content(&bytes[start..word_end]);
                }
            }
            Some(Keyword::Section(section)) => self.start_section(section, start, word_end)?,
            Some(Keyword::JoinPrefix) => {
                // LEFT(...) / RIGHT(...) are string functions
                if self.next_non_space(word_end) == Some(b'(') {
                    self.emit_content(&bytes[start..word_end]);
                } else {
                    self.start_section(Section::Join, start, word_end)?;
                }
            }
            Some(Keyword::And) if self.scopes[i].clause.between => {
                self.scopes[i].clause.between = false;
                self.emit_content(&bytes[start..word_end]);
            }
            Some(Keyword::And) | Some(Keyword::Or) => {
                self.emit_connector(&bytes[start..word_end], start)?;
            }
            Some(Keyword::Between) => {
                self.emit_content(&bytes[start..word_end]);
                self.scopes[i].clause.between = true;
            }
            Some(Keyword::Case) => {
                self.open_scope(ScopeKind::Case, &bytes[start..word_end], start)?;
            }
            Some(Keyword::End) if self.scopes[i].kind == ScopeKind::Case => {
                self.close_scope(ScopeKind::Case, start)?;
                self.emit_content(&bytes[start..word_end]);
            }
            _ => {
                self.emit_content(&bytes[start..word_end]);
            }
        }
        Ok(())
    }

    fn is_header_continuation(&self, word: &str) -> bool {
        let section = self.scopes[self.top_index()].clause.section;
        let matches_any = |words: &[&str]| words.iter().any(|w| w.eq_ignore_ascii_case(word));
        match section {
            Some(Section::Select) => matches_any(&["distinct", "all"]),
            Some(Section::GroupBy) | Some(Section::OrderBy) => matches_any(&["by"]),
            Some(Section::Union) => matches_any(&["all", "distinct"]),
            Some(Section::Insert) => matches_any(&["into"]),
            Some(Section::With) => matches_any(&["recursive"]),
            Some(Section::Join) => {
                matches_any(&["join"]) || classify(word) == Some(Keyword::JoinPrefix)
            }
            _ => false,
        }
    }

    fn start_section(&mut self, section: Section, start: usize, word_end: usize) -> Result<()> {
        let bytes = self.bytes;
        let lead = self.out.len();
        let root = self.scopes.len() == 1;
        self.settle_clause(lead, root, Some(section))?;

        let gates: Vec<Gate> = self.pending_gates.drain(..).map(|(gate, _)| gate).collect();
        let i = self.top_index();
        self.scopes[i].sectioned = true;
        if section == Section::When && self.scopes[i].kind == ScopeKind::Case {
            self.scopes[i].branch_lead = Some(lead);
        }
        self.scopes[i].clause = Clause {
            section: Some(section),
            lead,
            gates,
            header_open: true,
            ..Default::default()
        };
        self.emit_header(&bytes[start..word_end]);
        Ok(())
    }

    fn terminate_statement(&mut self, offset: usize) -> Result<()> {
        if self.scopes.len() > 1 {
            return Err(TemplateError::syntax(offset, "';' inside an open scope"));
        }
        if let Some((_, gate_offset)) = self.pending_gates.first() {
            return Err(TemplateError::DanglingConnective { offset: *gate_offset });
        }
        let end = self.out.len();
        self.settle_clause(end, true, None)?;
        self.emit_header(b";");
        self.scopes[0].clause = Clause {
            lead: self.out.len(),
            ..Default::default()
        };
        Ok(())
    }

    fn open_scope(&mut self, kind: ScopeKind, text: &[u8], offset: usize) -> Result<()> {
        if self.scopes.len() > MAX_NESTING_DEPTH {
            return Err(TemplateError::NestingTooDeep {
                offset,
                limit: MAX_NESTING_DEPTH,
            });
        }
        let i = self.top_index();
        let at_boundary = self.scopes[i].clause.current.start.is_none();
        self.emit_content(text);
        self.mask = (self.mask << 1) | at_boundary as u64;
        self.scopes.push(Scope::new(kind, offset, at_boundary));
        Ok(())
    }

    fn close_scope(&mut self, kind: ScopeKind, offset: usize) -> Result<()> {
        let i = self.top_index();
        if self.scopes[i].kind != kind {
            let message = match kind {
                ScopeKind::Paren => "unbalanced ')'",
                _ => "END without CASE",
            };
            return Err(TemplateError::syntax(offset, message));
        }
        if let Some((_, gate_offset)) = self.pending_gates.first() {
            return Err(TemplateError::DanglingConnective { offset: *gate_offset });
        }

        let end = self.out.len();
        let mut clause = self.close_clause()?;
        let span = self.take_span(&mut clause);

        let scope = &self.scopes[i];
        let mut promoted = Vec::new();
        if scope.kind == ScopeKind::Paren && !scope.sectioned && clause.gates.is_empty() {
            let gated = clause.items.iter().filter(|item| !item.gates.is_empty()).count();
            if clause.items.len() == 1 && gated == 1 {
                // Sole gated item: the whole group goes with it
                promoted = std::mem::take(&mut clause.items[0].gates);
            } else if scope.at_boundary
                && clause.items.len() > 1
                && gated == clause.items.len()
                && clause.items.iter().all(|item| item.gates.len() == 1)
            {
                promoted.push(collapsed_gate(&clause.items));
            }
        }

        self.record_clause(clause, end, false)?;
        if let Some(span) = span {
            self.scopes[i].spans.push(span);
        }
        self.end_spans(None, end);
        self.scopes.pop();
        self.mask >>= 1;
        let parent = self.top_index();
        self.scopes[parent].clause.current.gates.extend(promoted);
        Ok(())
    }

    /// Close the top clause at `end`, keeping gates of multi-clause constructs open
    fn settle_clause(&mut self, end: usize, root: bool, next: Option<Section>) -> Result<()> {
        let mut clause = self.close_clause()?;
        let span = self.take_span(&mut clause);
        self.record_clause(clause, end, root)?;
        let i = self.top_index();
        if let Some(span) = span {
            self.scopes[i].spans.push(span);
        }
        self.end_spans(next, end);
        Ok(())
    }

    /// Move gates that must outlive this clause into a span
    fn take_span(&self, clause: &mut Clause) -> Option<Span> {
        let scope = &self.scopes[self.top_index()];
        let (kind, lead, gates) = match clause.section {
            Some(Section::Join) if !clause.gates.is_empty() => {
                (SpanKind::Join, clause.lead, std::mem::take(&mut clause.gates))
            }
            Some(Section::Union) if !clause.gates.is_empty() => {
                (SpanKind::Union, clause.lead, std::mem::take(&mut clause.gates))
            }
            Some(section @ (Section::When | Section::Then | Section::Else)) if scope.kind == ScopeKind::Case => {
                let lead = match section {
                    Section::Else => clause.lead,
                    _ => scope.branch_lead.unwrap_or(clause.lead),
                };
                let mut gates = std::mem::take(&mut clause.gates);
                gates.extend(branch_gates(&mut clause.items));
                (SpanKind::Branch, lead, gates)
            }
            _ => return None,
        };
        if gates.is_empty() {
            return None;
        }
        Some(Span {
            kind,
            lead,
            gates,
            seen_on: false,
        })
    }

    /// Record spans of the top scope that end before `next` (all of them for None)
    fn end_spans(&mut self, next: Option<Section>, end: usize) {
        let i = self.top_index();
        loop {
            let ends = match (self.scopes[i].spans.last_mut(), next) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(span), Some(section)) => span.ends_at(section),
            };
            if !ends {
                break;
            }
            let Some(span) = self.scopes[i].spans.pop() else { break };
            if end <= span.lead {
                continue;
            }
            let excess = keyword::dangling_tail(self.text(0, span.lead));
            for gate in span.gates {
                self.records.push(ConditionRecord {
                    kind: gate.kind,
                    names: gate.names,
                    start: span.lead,
                    end,
                    scope: self.mask,
                    excess,
                });
            }
        }
    }

    /// Detach the top scope's clause, closing its last item
    fn close_clause(&mut self) -> Result<Clause> {
        let i = self.top_index();
        let mut clause = std::mem::take(&mut self.scopes[i].clause);
        if let Some(offset) = clause.connector_pending {
            return Err(TemplateError::DanglingConnective { offset });
        }
        if clause.current.start.is_some() {
            let item = std::mem::take(&mut clause.current);
            clause.items.push(item);
        }
        Ok(clause)
    }

    /// Turn a finished clause into condition records
    fn record_clause(&mut self, clause: Clause, end: usize, root: bool) -> Result<()> {
        let extract = root && self.extract_columns && clause.section == Some(Section::Select);

        let mut items: Vec<ResolvedItem> = Vec::with_capacity(clause.items.len());
        let mut iter = clause.items.into_iter();
        while let Some(item) = iter.next() {
            let Some(start) = item.start else { continue };
            let mut resolved = ResolvedItem { start, end: item.end, gates: item.gates };
            let mut columns = Vec::new();
            if extract {
                columns.extend(column_name(self.text(start, item.end)));
            }
            let mut join = item.join_next;
            while join {
                let Some(next) = iter.next() else { break };
                let Some(next_start) = next.start else { break };
                resolved.end = next.end;
                resolved.gates.extend(next.gates);
                if extract {
                    columns.extend(column_name(self.text(next_start, next.end)));
                }
                join = next.join_next;
            }
            if !columns.is_empty() {
                let kind = if columns.len() > 1 { RecordKind::JoinedSelectColumn } else { RecordKind::SelectColumn };
                self.columns.push(columns.clone());
                resolved.gates.push(Gate { kind, names: columns });
            }
            items.push(resolved);
        }

        for i in 0..items.len() {
            if items[i].gates.is_empty() {
                continue;
            }
            let (start, stop) = if i + 1 < items.len() {
                // fold the following connector into the footprint
                (items[i].start, items[i + 1].start)
            } else if i > 0 && items[i - 1].gates.is_empty() {
                // last item: take the preceding connector instead
                (items[i - 1].end, items[i].end)
            } else {
                (items[i].start, items[i].end)
            };
            let excess = keyword::dangling_tail(self.text(0, start));
            for gate in std::mem::take(&mut items[i].gates) {
                self.records.push(ConditionRecord {
                    kind: gate.kind,
                    names: gate.names,
                    start,
                    end: stop,
                    scope: self.mask,
                    excess,
                });
            }
        }

        if !clause.gates.is_empty() && end > clause.lead {
            let excess = keyword::dangling_tail(self.text(0, clause.lead));
            for gate in clause.gates {
                self.records.push(ConditionRecord {
                    kind: gate.kind,
                    names: gate.names,
                    start: clause.lead,
                    end,
                    scope: self.mask,
                    excess,
                });
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<ScanOutput> {
        if let Some((_, offset)) = self.pending_gates.first() {
            return Err(TemplateError::DanglingConnective { offset: *offset });
        }
        if self.scopes.len() > 1 {
            let scope = &self.scopes[self.top_index()];
            let message = match scope.kind {
                ScopeKind::Case => "CASE without END",
                _ => "unclosed '('",
            };
            return Err(TemplateError::syntax(scope.open_offset, message));
        }
        let end = self.out.len();
        self.settle_clause(end, true, None)?;

        let text = String::from_utf8(self.out).map_err(|e| TemplateError::Internal(e.to_string()))?;
        Ok(ScanOutput {
            text,
            records: self.records,
            variables: self.variables,
            columns: self.columns,
        })
    }
}

/// Scan a template with the given marker and reserved handler letters
pub fn scan(input: &str, marker: char, handlers: &HandlerSet, extract_columns: bool) -> Result<ScanOutput> {
    Scanner::new(input, marker, handlers, extract_columns)?.scan()
}
