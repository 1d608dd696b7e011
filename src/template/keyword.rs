/// SQL keyword classification for the template scanner
///
/// Only the words that change the scanner's structure are recognized:
/// clause-introducing sections, item connectors and scope delimiters.
/// Everything else is ordinary text.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Select,
    From,
    Where,
    Join,
    On,
    GroupBy,
    OrderBy,
    Having,
    Union,
    Insert,
    Values,
    Update,
    Set,
    With,
    When,
    Then,
    Else,
}

impl Section {
    /// Sections whose keyword dangles when every item of the clause is dropped
    pub fn is_trimmable(self) -> bool {
        matches!(
            self,
            Section::Where | Section::Having | Section::On | Section::GroupBy | Section::OrderBy
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Section(Section),
    /// LEFT / RIGHT / INNER / FULL / CROSS / OUTER / NATURAL
    JoinPrefix,
    And,
    Or,
    Between,
    Case,
    End,
}

static KEYWORDS: &[(&str, Keyword)] = &[
    ("select", Keyword::Section(Section::Select)),
    ("from", Keyword::Section(Section::From)),
    ("where", Keyword::Section(Section::Where)),
    ("join", Keyword::Section(Section::Join)),
    ("on", Keyword::Section(Section::On)),
    ("group", Keyword::Section(Section::GroupBy)),
    ("order", Keyword::Section(Section::OrderBy)),
    ("having", Keyword::Section(Section::Having)),
    ("union", Keyword::Section(Section::Union)),
    ("insert", Keyword::Section(Section::Insert)),
    ("values", Keyword::Section(Section::Values)),
    ("update", Keyword::Section(Section::Update)),
    ("set", Keyword::Section(Section::Set)),
    ("with", Keyword::Section(Section::With)),
    ("when", Keyword::Section(Section::When)),
    ("then", Keyword::Section(Section::Then)),
    ("else", Keyword::Section(Section::Else)),
    ("left", Keyword::JoinPrefix),
    ("right", Keyword::JoinPrefix),
    ("inner", Keyword::JoinPrefix),
    ("full", Keyword::JoinPrefix),
    ("cross", Keyword::JoinPrefix),
    ("outer", Keyword::JoinPrefix),
    ("natural", Keyword::JoinPrefix),
    ("and", Keyword::And),
    ("or", Keyword::Or),
    ("between", Keyword::Between),
    ("case", Keyword::Case),
    ("end", Keyword::End),
];

/// Case-insensitive keyword lookup
pub fn classify(word: &str) -> Option<Keyword> {
    if word.len() > 7 {
        return None;
    }
    KEYWORDS
        .iter()
        .find(|(kw, _)| kw.eq_ignore_ascii_case(word))
        .map(|(_, keyword)| *keyword)
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// First identifier-like word of `text`
fn leading_word(text: &str) -> &str {
    let end = text.bytes().position(|b| !is_word_byte(b)).unwrap_or(text.len());
    &text[..end]
}

/// Does this normalized text start a new clause or close the current scope?
///
/// Used to flag segments that trigger a trim rewind after a skipped clause.
pub fn starts_section(text: &str) -> bool {
    let text = text.strip_prefix(' ').unwrap_or(text);
    match text.as_bytes().first() {
        Some(b')') | Some(b';') => true,
        Some(b) if is_word_byte(*b) => matches!(
            classify(leading_word(text)),
            Some(Keyword::Section(_)) | Some(Keyword::JoinPrefix) | Some(Keyword::End)
        ),
        _ => false,
    }
}

/// Length of a trailing separator or keyword that dangles once everything
/// after it (up to the next section) is dropped.
///
/// Recognized tails: `,`, `AND`, `OR`, `WHERE`, `HAVING`, `ON`, `GROUP BY`,
/// `ORDER BY`, each with the single spaces around them in normalized text.
/// Any other text only gives up its trailing space.
pub fn dangling_tail(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut end = bytes.len();
    if end > 0 && bytes[end - 1] == b' ' {
        end -= 1;
    }
    let space = bytes.len() - end;
    if end == 0 {
        return space;
    }
    if bytes[end - 1] == b',' {
        return bytes.len() - (end - 1);
    }

    let mut start = end;
    while start > 0 && is_word_byte(bytes[start - 1]) {
        start -= 1;
    }
    if start == end {
        return space;
    }
    let word = &text[start..end];
    let mut dangling = match classify(word) {
        Some(Keyword::And) | Some(Keyword::Or) => true,
        Some(Keyword::Section(section)) => section.is_trimmable(),
        _ => false,
    };
    if !dangling && word.eq_ignore_ascii_case("by") && start > 1 && bytes[start - 1] == b' ' {
        let mut lead = start - 1;
        while lead > 0 && is_word_byte(bytes[lead - 1]) {
            lead -= 1;
        }
        if matches!(
            classify(&text[lead..start - 1]),
            Some(Keyword::Section(Section::GroupBy | Section::OrderBy))
        ) {
            start = lead;
            dangling = true;
        }
    }
    if !dangling {
        return space;
    }
    if start > 0 && bytes[start - 1] == b' ' {
        start -= 1;
    }
    bytes.len() - start
}
