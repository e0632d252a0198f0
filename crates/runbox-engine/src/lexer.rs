//! Lightweight JavaScript lexer that separates code from strings and comments.
//!
//! The analyzer and the security validator both match patterns against
//! source text. Matching on raw text produces false positives for
//! occurrences inside string literals and comments (`"eval("` is harmless),
//! so both run on [`strip`]ped source where every string and comment byte is
//! blanked. Offsets are preserved, so a match in stripped text can be mapped
//! back to the raw source at the same index.
//!
//! This is not a parser. It only tracks enough state to classify bytes:
//! quoted strings, template literals (with `${...}` substitutions lexed as
//! code, including nested templates), regular expression literals (using the
//! usual previous-token heuristic) and both comment forms.

/// Classification of a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Executable source.
    Code,
    /// String, template or regex literal text, including delimiters.
    String,
    /// Line or block comment, including delimiters.
    Comment,
}

/// A classified byte range `[start, end)` of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// What the range contains.
    pub kind: SpanKind,
    /// Start offset in bytes.
    pub start: usize,
    /// End offset in bytes (exclusive).
    pub end: usize,
}

impl Span {
    /// Slice the span out of the source it was lexed from.
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }
}

/// Keywords after which a `/` starts a regex literal rather than a division.
const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

/// What the last significant code token was, for the regex heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Last {
    Start,
    Punct,
    Keyword,
    Value,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    code_start: usize,
    last: Last,
    /// Brace depth inside each open template substitution.
    substitutions: Vec<usize>,
    spans: Vec<Span>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            code_start: 0,
            last: Last::Start,
            substitutions: Vec::new(),
            spans: Vec::new(),
        }
    }

    fn push(&mut self, kind: SpanKind, start: usize, end: usize) {
        if start >= end {
            return;
        }
        if let Some(prev) = self.spans.last_mut() {
            if prev.kind == kind && prev.end == start {
                prev.end = end;
                return;
            }
        }
        self.spans.push(Span { kind, start, end });
    }

    /// Close the current code run at `self.pos` and record a literal span.
    fn emit(&mut self, kind: SpanKind, end: usize) {
        self.push(SpanKind::Code, self.code_start, self.pos);
        self.push(kind, self.pos, end);
        self.pos = end;
        self.code_start = end;
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn run(mut self) -> Vec<Span> {
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            match b {
                b'/' if self.peek(1) == Some(b'/') => {
                    let end = line_end(self.bytes, self.pos);
                    self.emit(SpanKind::Comment, end);
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    let end = match self.src[self.pos + 2..].find("*/") {
                        Some(i) => self.pos + 2 + i + 2,
                        None => self.bytes.len(),
                    };
                    self.emit(SpanKind::Comment, end);
                }
                b'/' if self.regex_allowed() => {
                    let end = scan_regex(self.bytes, self.pos);
                    self.emit(SpanKind::String, end);
                    self.last = Last::Value;
                }
                b'\'' | b'"' => {
                    let end = scan_quoted(self.bytes, self.pos, b);
                    self.emit(SpanKind::String, end);
                    self.last = Last::Value;
                }
                b'`' => self.template_chunk(),
                b'{' => {
                    if let Some(depth) = self.substitutions.last_mut() {
                        *depth += 1;
                    }
                    self.last = Last::Punct;
                    self.pos += 1;
                }
                b'}' => match self.substitutions.last_mut() {
                    Some(0) => {
                        self.substitutions.pop();
                        self.template_chunk();
                    }
                    Some(depth) => {
                        *depth -= 1;
                        self.last = Last::Value;
                        self.pos += 1;
                    }
                    None => {
                        self.last = Last::Value;
                        self.pos += 1;
                    }
                },
                b')' | b']' => {
                    self.last = Last::Value;
                    self.pos += 1;
                }
                b if b.is_ascii_whitespace() => self.pos += 1,
                b if is_ident_byte(b) => {
                    let start = self.pos;
                    while self.pos < self.bytes.len() && is_ident_byte(self.bytes[self.pos]) {
                        self.pos += 1;
                    }
                    let word = &self.src[start..self.pos];
                    self.last = if REGEX_PRECEDING_KEYWORDS.contains(&word) {
                        Last::Keyword
                    } else {
                        Last::Value
                    };
                }
                _ => {
                    self.last = Last::Punct;
                    self.pos += 1;
                }
            }
        }
        self.push(SpanKind::Code, self.code_start, self.bytes.len());
        self.spans
    }

    fn regex_allowed(&self) -> bool {
        matches!(self.last, Last::Start | Last::Punct | Last::Keyword)
    }

    /// Lex a template chunk starting at a backtick or at the `}` closing a
    /// substitution. Ends at the closing backtick or at the next `${`.
    fn template_chunk(&mut self) {
        let mut i = self.pos + 1;
        let mut opened = false;
        let mut end = self.bytes.len();
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'`' if !is_escaped(self.bytes, self.pos + 1, i) => {
                    end = i + 1;
                    break;
                }
                b'$' if self.bytes.get(i + 1) == Some(&b'{')
                    && !is_escaped(self.bytes, self.pos + 1, i) =>
                {
                    end = i + 2;
                    opened = true;
                    break;
                }
                _ => i += 1,
            }
        }
        self.emit(SpanKind::String, end);
        if opened {
            self.substitutions.push(0);
            self.last = Last::Punct;
        } else {
            self.last = Last::Value;
        }
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| from + i)
        .unwrap_or(bytes.len())
}

/// Whether the byte at `i` is escaped: an odd number of consecutive
/// backslashes (not reaching back before `floor`) precedes it.
fn is_escaped(bytes: &[u8], floor: usize, i: usize) -> bool {
    let mut count = 0;
    let mut j = i;
    while j > floor && bytes[j - 1] == b'\\' {
        count += 1;
        j -= 1;
    }
    count % 2 == 1
}

/// Scan a `'` or `"` string starting at `start`. Unterminated strings end
/// at the line break.
fn scan_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if b == quote && !is_escaped(bytes, start + 1, i) {
            return i + 1;
        }
        if b == b'\n' && !is_escaped(bytes, start + 1, i) {
            return i;
        }
        i += 1;
    }
    bytes.len()
}

/// Scan a regex literal starting at the opening `/`, including flags.
fn scan_regex(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    let mut in_class = false;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\n' {
            return i;
        }
        if !is_escaped(bytes, start + 1, i) {
            match b {
                b'[' => in_class = true,
                b']' => in_class = false,
                b'/' if !in_class => {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                        i += 1;
                    }
                    return i;
                }
                _ => {}
            }
        }
        i += 1;
    }
    bytes.len()
}

/// Split `src` into contiguous code, string and comment spans.
///
/// The returned spans cover the whole input in order, and adjacent spans
/// never share a kind.
pub fn lex(src: &str) -> Vec<Span> {
    Lexer::new(src).run()
}

/// Replace every string and comment byte with a space, keeping newlines.
///
/// The output has the same byte length as the input, and every offset in
/// it refers to the same position in the original.
pub fn strip(src: &str) -> String {
    let mut out = src.as_bytes().to_vec();
    for span in lex(src) {
        if span.kind == SpanKind::Code {
            continue;
        }
        for b in &mut out[span.start..span.end] {
            if *b != b'\n' && *b != b'\r' {
                *b = b' ';
            }
        }
    }
    // Span boundaries sit on ASCII delimiters, so blanking whole spans keeps
    // the buffer valid UTF-8.
    match String::from_utf8(out) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Concatenated text of all comment spans, separated by newlines.
pub fn comments(src: &str) -> String {
    lex(src)
        .into_iter()
        .filter(|s| s.kind == SpanKind::Comment)
        .map(|s| s.text(src))
        .collect::<Vec<_>>()
        .join("\n")
}
