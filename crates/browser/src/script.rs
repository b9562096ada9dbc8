//! Script wrapping - turn caller text into one awaitable expression
//!
//! Callers send anything from `document.title` to a multi-line snippet
//! ending in a bare expression. Everything is wrapped in an async IIFE so
//! `Runtime.evaluate` with `awaitPromise` yields the script's value:
//!
//! | shape      | body                                  |
//! |------------|---------------------------------------|
//! | empty      | `return undefined;`                   |
//! | function   | `return await (TEXT)();`              |
//! | object     | `return (TEXT);`                      |
//! | statements | TEXT, last bare expression returned   |
//! | expression | `return (TEXT);`                      |
//!
//! The scanner understands quotes, comments and bracket depth, nothing more.
//! Regex literals containing quotes will confuse it.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptShape {
    Empty,
    Function,
    Object,
    Statements,
    Expression,
}

/// Statement keywords that must never be prefixed with `return`
const STATEMENT_KEYWORDS: &[&str] = &[
    "return", "const", "let", "var", "if", "for", "while", "do", "switch", "try", "throw",
    "class", "function", "async", "import", "export", "break", "continue", "debugger",
];

/// A newline does not end a statement when the next line starts with one of these
const CONTINUATION_STARTS: &[char] = &[
    '.', '?', ':', ',', ')', ']', '}', '+', '-', '*', '/', '%', '=', '&', '|', '<', '>',
];

/// ... nor when the line ends with one of these
const CONTINUATION_ENDS: &[char] = &[
    '+', '-', '*', '/', '%', '=', '&', '|', '^', '!', '?', ':', ',', '.', '<', '>', '(', '[',
    '{',
];

pub fn classify(script: &str) -> ScriptShape {
    let text = script.trim();
    if text.is_empty() {
        return ScriptShape::Empty;
    }
    let scan = Scan::new(text);
    let single = scan.segments.len() == 1;

    if single && is_function(text) {
        ScriptShape::Function
    } else if single && is_object(strip_semicolons(text)) {
        ScriptShape::Object
    } else if scan.has_return
        || !single
        || scan
            .segments
            .first()
            .is_some_and(|range| starts_with_keyword(&text[range.clone()]))
    {
        ScriptShape::Statements
    } else {
        ScriptShape::Expression
    }
}

/// Wrap `script` as an async IIFE expression
pub fn wrap_script(script: &str) -> String {
    let text = script.trim();
    let body = match classify(text) {
        ScriptShape::Empty => "return undefined;".to_string(),
        ScriptShape::Function => {
            format!("return await ({}{})();", strip_semicolons(text), close_line(text))
        }
        ScriptShape::Object | ScriptShape::Expression => {
            format!("return ({}{});", strip_semicolons(text), close_line(text))
        }
        ScriptShape::Statements => return_last_expression(text),
    };
    format!("(async () => {{\n{}\n}})()", body)
}

/// Insert `return` before the final statement when it is a bare expression
fn return_last_expression(text: &str) -> String {
    let scan = Scan::new(text);
    match scan.segments.last() {
        Some(last) if !starts_with_keyword(&text[last.clone()]) && !text[last.clone()].starts_with('{') => {
            format!("{}return {}", &text[..last.start], &text[last.start..])
        }
        _ => text.to_string(),
    }
}

/// A trailing line comment would swallow the closing paren
fn close_line(text: &str) -> &'static str {
    if Scan::new(text).ends_in_line_comment {
        "\n"
    } else {
        ""
    }
}

fn strip_semicolons(text: &str) -> &str {
    text.trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn starts_with_word(text: &str, word: &str) -> bool {
    text.strip_prefix(word)
        .is_some_and(|rest| !rest.starts_with(is_ident_char))
}

fn starts_with_keyword(text: &str) -> bool {
    STATEMENT_KEYWORDS
        .iter()
        .any(|keyword| starts_with_word(text, keyword))
}

fn leading_ident(text: &str) -> &str {
    let end = text
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

fn is_function(text: &str) -> bool {
    if starts_with_word(text, "function") || starts_with_word(text, "async") {
        return true;
    }
    // (a, b) => ...
    if text.starts_with('(') {
        return matching_close(text, 0)
            .is_some_and(|close| text[close + 1..].trim_start().starts_with("=>"));
    }
    // a => ...
    let ident = leading_ident(text);
    !ident.is_empty()
        && !ident.starts_with(|c: char| c.is_ascii_digit())
        && text[ident.len()..].trim_start().starts_with("=>")
}

fn is_object(text: &str) -> bool {
    if !text.starts_with('{') || matching_close(text, 0) != Some(text.len() - 1) {
        return false;
    }
    let inner = text[1..].trim_start();
    if inner.starts_with('}') || inner.starts_with("...") || inner.starts_with('[') {
        return true;
    }
    if let Some(quote) = inner.chars().next().filter(|c| *c == '"' || *c == '\'') {
        return inner[1..]
            .find(quote)
            .is_some_and(|end| inner[end + 2..].trim_start().starts_with(':'));
    }
    let key = leading_ident(inner);
    if key.is_empty() || starts_with_keyword(inner) {
        return false;
    }
    let after = inner[key.len()..].trim_start();
    after.starts_with(':') || after.starts_with(',') || after.starts_with('}')
}

/// Byte index of the bracket closing the one at `open`
fn matching_close(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut lexer = Lexer::default();
    let bytes = text.as_bytes();
    for (i, c) in text.char_indices().skip_while(|(i, _)| *i < open) {
        let next = bytes.get(i + 1).copied().map(char::from);
        if !lexer.step(c, next) {
            continue;
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LexState {
    #[default]
    Code,
    Str {
        quote: char,
        escaped: bool,
    },
    LineComment,
    BlockComment,
    /// Second char of a two-char comment delimiter
    Skip(SkipThen),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipThen {
    LineComment,
    BlockComment,
    Code,
}

/// Tracks whether the current char is code, string or comment
#[derive(Debug, Default)]
struct Lexer {
    state: LexState,
}

impl Lexer {
    /// Advance over `c`; true if `c` is a code character
    fn step(&mut self, c: char, next: Option<char>) -> bool {
        match self.state {
            LexState::Code => match (c, next) {
                ('/', Some('/')) => {
                    self.state = LexState::Skip(SkipThen::LineComment);
                    false
                }
                ('/', Some('*')) => {
                    self.state = LexState::Skip(SkipThen::BlockComment);
                    false
                }
                ('\'' | '"' | '`', _) => {
                    self.state = LexState::Str {
                        quote: c,
                        escaped: false,
                    };
                    false
                }
                _ => true,
            },
            LexState::Str { quote, escaped } => {
                self.state = if escaped {
                    LexState::Str {
                        quote,
                        escaped: false,
                    }
                } else if c == '\\' {
                    LexState::Str {
                        quote,
                        escaped: true,
                    }
                } else if c == quote {
                    LexState::Code
                } else {
                    self.state
                };
                false
            }
            LexState::LineComment => {
                if c == '\n' {
                    self.state = LexState::Code;
                    return true;
                }
                false
            }
            LexState::BlockComment => {
                if c == '*' && next == Some('/') {
                    self.state = LexState::Skip(SkipThen::Code);
                }
                false
            }
            LexState::Skip(then) => {
                self.state = match then {
                    SkipThen::LineComment => LexState::LineComment,
                    SkipThen::BlockComment => LexState::BlockComment,
                    SkipThen::Code => LexState::Code,
                };
                false
            }
        }
    }

    fn in_line_comment(&self) -> bool {
        matches!(
            self.state,
            LexState::LineComment | LexState::Skip(SkipThen::LineComment)
        )
    }
}

/// Top-level statement boundaries of a script
struct Scan {
    /// Trimmed, non-empty statement ranges
    segments: Vec<Range<usize>>,
    /// `return` appears in code (any depth)
    has_return: bool,
    ends_in_line_comment: bool,
}

impl Scan {
    fn new(text: &str) -> Self {
        let bytes = text.as_bytes();
        let mut lexer = Lexer::default();
        let mut depth = 0i32;
        let mut segments = Vec::new();
        let mut start = 0;
        let mut last_code: Option<char> = None;
        let mut has_return = false;

        for (i, c) in text.char_indices() {
            let next = bytes.get(i + 1).copied().map(char::from);
            let was_string = matches!(lexer.state, LexState::Str { .. });
            if !lexer.step(c, next) {
                if was_string || matches!(lexer.state, LexState::Str { .. }) {
                    // A string is an operand
                    last_code = Some('"');
                }
                continue;
            }
            match c {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                'r' if !has_return
                    && (i == 0 || !is_ident_char(char::from(bytes[i - 1])))
                    && starts_with_word(&text[i..], "return") =>
                {
                    has_return = true;
                }
                _ => {}
            }

            let separator = depth == 0
                && match c {
                    ';' => true,
                    '\n' => ends_statement(last_code, &text[i + 1..]),
                    _ => false,
                };
            if separator {
                push_trimmed(&mut segments, text, start..i);
                start = i + 1;
                last_code = None;
            } else if !c.is_whitespace() {
                last_code = Some(c);
            }
        }
        push_trimmed(&mut segments, text, start..text.len());

        Self {
            segments,
            has_return,
            ends_in_line_comment: lexer.in_line_comment(),
        }
    }
}

fn ends_statement(last_code: Option<char>, rest: &str) -> bool {
    let Some(last) = last_code else {
        return false;
    };
    if CONTINUATION_ENDS.contains(&last) {
        return false;
    }
    let rest = rest.trim_start();
    if rest.starts_with("//") || rest.starts_with("/*") {
        return true;
    }
    !rest.starts_with(CONTINUATION_STARTS)
}

fn push_trimmed(segments: &mut Vec<Range<usize>>, text: &str, range: Range<usize>) {
    let slice = &text[range.clone()];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }
    let begin = range.start + (slice.len() - slice.trim_start().len());
    segments.push(begin..begin + trimmed.len());
}
