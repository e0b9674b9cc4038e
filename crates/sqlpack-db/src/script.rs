//! Statement-level scanning of deploy scripts
//!
//! Deploy scripts run inside a transaction owned by the target, so a
//! top-level `BEGIN` or `COMMIT` in a script would end that transaction
//! early and commit part of a change. The scanner finds such statements
//! while skipping comments, quoted strings and dollar-quoted bodies.

/// Statement keywords that open or close a transaction
const TRANSACTION_KEYWORDS: &[&str] = &["BEGIN", "START", "COMMIT", "END", "ROLLBACK", "ABORT"];

/// Leading keyword of the first top-level transaction-control statement
///
/// `BEGIN` inside `DO` bodies, function bodies and `BEGIN ATOMIC` blocks
/// is not transaction control and is ignored.
pub fn transaction_control(script: &str) -> Option<String> {
    Scanner::new(script).find_transaction_control()
}

struct Scanner<'a> {
    bytes: &'a [u8],
    idx: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            bytes: src.as_bytes(),
            idx: 0,
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.idx + offset).copied()
    }

    fn find_transaction_control(&mut self) -> Option<String> {
        let mut at_start = true;
        let mut prev_word = String::new();
        let mut atomic_depth = 0usize;
        let mut case_depth = 0usize;

        while let Some(b) = self.peek(0) {
            match b {
                b if b.is_ascii_whitespace() => self.idx += 1,
                b'-' if self.peek(1) == Some(b'-') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment(),
                b'\'' => {
                    let escapes = self.idx > 0 && matches!(self.bytes[self.idx - 1], b'E' | b'e');
                    self.skip_quoted(b'\'', escapes);
                    at_start = false;
                }
                b'"' => {
                    self.skip_quoted(b'"', false);
                    at_start = false;
                }
                b'$' => {
                    if !self.skip_dollar_quoted() {
                        self.idx += 1;
                    }
                    at_start = false;
                }
                b';' => {
                    self.idx += 1;
                    if atomic_depth == 0 {
                        at_start = true;
                        prev_word.clear();
                    }
                }
                b if b.is_ascii_alphabetic() || b == b'_' => {
                    let word = self.read_word().to_ascii_uppercase();
                    if at_start && atomic_depth == 0 && TRANSACTION_KEYWORDS.contains(&word.as_str()) {
                        return Some(word);
                    }
                    match word.as_str() {
                        "ATOMIC" if prev_word == "BEGIN" => atomic_depth += 1,
                        "CASE" if atomic_depth > 0 => case_depth += 1,
                        "END" if case_depth > 0 => case_depth -= 1,
                        "END" if atomic_depth > 0 => atomic_depth -= 1,
                        _ => {}
                    }
                    at_start = false;
                    prev_word = word;
                }
                _ => {
                    self.idx += 1;
                    at_start = false;
                }
            }
        }
        None
    }

    fn read_word(&mut self) -> &'a str {
        let start = self.idx;
        while let Some(b) = self.peek(0) {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'$' {
                self.idx += 1;
            } else {
                break;
            }
        }
        std::str::from_utf8(&self.bytes[start..self.idx]).unwrap_or_default()
    }

    fn skip_line_comment(&mut self) {
        while let Some(b) = self.peek(0) {
            self.idx += 1;
            if b == b'\n' {
                break;
            }
        }
    }

    fn skip_block_comment(&mut self) {
        // Block comments nest
        let mut depth = 0usize;
        while self.idx < self.bytes.len() {
            if self.peek(0) == Some(b'/') && self.peek(1) == Some(b'*') {
                depth += 1;
                self.idx += 2;
            } else if self.peek(0) == Some(b'*') && self.peek(1) == Some(b'/') {
                depth -= 1;
                self.idx += 2;
                if depth == 0 {
                    return;
                }
            } else {
                self.idx += 1;
            }
        }
    }

    fn skip_quoted(&mut self, quote: u8, escapes: bool) {
        self.idx += 1;
        while let Some(b) = self.peek(0) {
            self.idx += 1;
            if escapes && b == b'\\' {
                self.idx += 1;
            } else if b == quote {
                if self.peek(0) == Some(quote) {
                    self.idx += 1;
                } else {
                    return;
                }
            }
        }
    }

    /// Skip `$tag$ ... $tag$`; false when `$` does not open a dollar quote
    fn skip_dollar_quoted(&mut self) -> bool {
        let rest = &self.bytes[self.idx + 1..];
        let tag_len = rest
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
            .count();
        if rest.get(tag_len) != Some(&b'$') || rest.first().is_some_and(|b| b.is_ascii_digit()) {
            return false;
        }

        let tag = &self.bytes[self.idx..self.idx + tag_len + 2];
        let body_start = self.idx + tag.len();
        match self.bytes[body_start..].windows(tag.len()).position(|w| w == tag) {
            Some(pos) => self.idx = body_start + pos + tag.len(),
            None => self.idx = self.bytes.len(),
        }
        true
    }
}
