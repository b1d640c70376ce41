// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! Stateless scanner from text to position-tagged lexemes.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Eol,
    Word,
    /// A word immediately followed by `:`; the colon is not part of the
    /// lexeme.
    Label,
    /// `@` and an integer.
    Position,
    Number,
    /// `.` and a word.
    Directive,
    /// `:` and a word, as in `add:u64`.
    Type,
    Str,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Tilde,
    Arrow,
    Ellipsis,
    Comment,
    /// Anything malformed. Reported by whoever consumes it.
    Invalid,
}

/// A token kind and its byte range in the scanned text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lexeme {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

pub struct Lexer<'a> {
    text: &'a str,
    position: usize,
}

fn is_word_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_word_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'.'
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, position: 0 }
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.text.as_bytes().get(self.position + ahead).copied()
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.text[self.position..].starts_with(prefix)
    }

    fn take_while(&mut self, predicate: impl Fn(u8) -> bool) -> usize {
        let start = self.position;
        while self.peek_at(0).is_some_and(&predicate) {
            self.position += 1;
        }
        self.position - start
    }

    /// Skips blanks and backslash-newline continuations.
    fn skip_whitespace(&mut self) {
        loop {
            match self.peek_at(0) {
                Some(b' ' | b'\t' | b'\r') => self.position += 1,
                Some(b'\\') if self.peek_at(1) == Some(b'\n') => {
                    self.position += 2
                }
                Some(b'\\')
                    if self.peek_at(1) == Some(b'\r')
                        && self.peek_at(2) == Some(b'\n') =>
                {
                    self.position += 3
                }
                _ => break,
            }
        }
    }

    fn number(&mut self) -> TokenKind {
        let valid = if self.starts_with("0x") || self.starts_with("0X") {
            self.position += 2;
            self.take_while(|byte| byte.is_ascii_hexdigit()) > 0
        } else if self.starts_with("0b") || self.starts_with("0B") {
            self.position += 2;
            self.take_while(|byte| byte == b'0' || byte == b'1') > 0
        } else {
            self.take_while(|byte| byte.is_ascii_digit());
            if self.peek_at(0) == Some(b'.')
                && self.peek_at(1).is_some_and(|byte| byte.is_ascii_digit())
            {
                self.position += 1;
                self.take_while(|byte| byte.is_ascii_digit());
            }
            if matches!(self.peek_at(0), Some(b'e' | b'E')) {
                let sign =
                    matches!(self.peek_at(1), Some(b'+' | b'-')) as usize;
                if self
                    .peek_at(1 + sign)
                    .is_some_and(|byte| byte.is_ascii_digit())
                {
                    self.position += 1 + sign;
                    self.take_while(|byte| byte.is_ascii_digit());
                }
            }
            true
        };
        // `12ab` is one bad token, not a number and a word
        let glued = self.take_while(is_word_char) > 0;
        if valid && !glued {
            TokenKind::Number
        } else {
            TokenKind::Invalid
        }
    }

    fn string(&mut self) -> TokenKind {
        self.position += 1;
        let mut valid = true;
        loop {
            match self.peek_at(0) {
                None | Some(b'\n') => return TokenKind::Invalid,
                Some(b'"') => {
                    self.position += 1;
                    break;
                }
                Some(b'\\') => {
                    valid &= matches!(
                        self.peek_at(1),
                        Some(b'n' | b'r' | b't' | b'0' | b'\\' | b'"')
                    );
                    self.position += 1;
                    if self.peek_at(0).is_some_and(|byte| byte != b'\n') {
                        self.position += 1;
                    }
                }
                Some(_) => self.position += 1,
            }
        }
        if valid {
            TokenKind::Str
        } else {
            TokenKind::Invalid
        }
    }

    fn invalid_char(&mut self) -> TokenKind {
        let length = self.text[self.position..]
            .chars()
            .next()
            .map_or(1, char::len_utf8);
        self.position += length;
        TokenKind::Invalid
    }
}

impl Iterator for Lexer<'_> {
    type Item = Lexeme;

    fn next(&mut self) -> Option<Lexeme> {
        self.skip_whitespace();
        let start = self.position;
        let first = self.peek_at(0)?;
        let mut end = None;

        let kind = match first {
            b'\n' => {
                self.position += 1;
                TokenKind::Eol
            }
            b'#' => {
                self.take_while(|byte| byte != b'\n');
                TokenKind::Comment
            }
            b'@' => {
                self.position += 1;
                if self.peek_at(0).is_some_and(|byte| byte.is_ascii_digit())
                    && self.number() == TokenKind::Number
                {
                    TokenKind::Position
                } else {
                    TokenKind::Invalid
                }
            }
            b'0'..=b'9' => self.number(),
            b'.' if self.starts_with("...") => {
                self.position += 3;
                TokenKind::Ellipsis
            }
            b'.' if self.peek_at(1).is_some_and(is_word_start) => {
                self.position += 1;
                self.take_while(is_word_char);
                TokenKind::Directive
            }
            b':' if self.peek_at(1).is_some_and(is_word_start) => {
                self.position += 1;
                self.take_while(is_word_char);
                TokenKind::Type
            }
            byte if is_word_start(byte) => {
                self.take_while(is_word_char);
                let label = self.peek_at(0) == Some(b':')
                    && matches!(
                        self.peek_at(1),
                        None | Some(b' ' | b'\t' | b'\r' | b'\n' | b'#')
                    );
                if label {
                    end = Some(self.position);
                    self.position += 1;
                    TokenKind::Label
                } else {
                    TokenKind::Word
                }
            }
            b'"' => self.string(),
            b'-' if self.peek_at(1) == Some(b'>') => {
                self.position += 2;
                TokenKind::Arrow
            }
            b'(' | b')' | b'{' | b'}' | b',' | b'+' | b'-' | b'*' | b'/'
            | b'~' => {
                self.position += 1;
                match first {
                    b'(' => TokenKind::LParen,
                    b')' => TokenKind::RParen,
                    b'{' => TokenKind::LBrace,
                    b'}' => TokenKind::RBrace,
                    b',' => TokenKind::Comma,
                    b'+' => TokenKind::Plus,
                    b'-' => TokenKind::Minus,
                    b'*' => TokenKind::Star,
                    b'/' => TokenKind::Slash,
                    _ => TokenKind::Tilde,
                }
            }
            _ => self.invalid_char(),
        };

        Some(Lexeme {
            kind,
            start,
            end: end.unwrap_or(self.position),
        })
    }
}

/// A numeric literal's value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Number::Int(value) => value as f64,
            Number::Float(value) => value,
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            Number::Int(value) => value == 0,
            Number::Float(value) => value == 0.0,
        }
    }
}

/// Parses the text of a [`TokenKind::Number`]. Integers above `i64::MAX`
/// keep their bit pattern. A leading `-` only appears in folded literals.
pub fn parse_number(text: &str) -> Option<Number> {
    if let Some(magnitude) = text.strip_prefix('-') {
        return match parse_number(magnitude)? {
            Number::Int(value) => Some(Number::Int(value.wrapping_neg())),
            Number::Float(value) => Some(Number::Float(-value)),
        };
    }
    let radix = |prefix: [&str; 2]| {
        prefix
            .iter()
            .find_map(|prefix| text.strip_prefix(prefix))
    };
    if let Some(digits) = radix(["0x", "0X"]) {
        return u64::from_str_radix(digits, 16)
            .ok()
            .map(|value| Number::Int(value as i64));
    }
    if let Some(digits) = radix(["0b", "0B"]) {
        return u64::from_str_radix(digits, 2)
            .ok()
            .map(|value| Number::Int(value as i64));
    }
    if text.contains(['.', 'e', 'E']) {
        return text.parse().ok().map(Number::Float);
    }
    text.parse::<u64>().ok().map(|value| Number::Int(value as i64))
}

/// Decodes a quoted [`TokenKind::Str`] lexeme.
pub fn unescape(text: &str) -> Option<String> {
    let inner = text.strip_prefix('"')?.strip_suffix('"')?;
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        result.push(match chars.next()? {
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            '0' => '\0',
            '\\' => '\\',
            '"' => '"',
            _ => return None,
        });
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        Lexer::new(text).map(|lexeme| lexeme.kind).collect()
    }

    fn texts(text: &str) -> Vec<&str> {
        Lexer::new(text)
            .map(|lexeme| &text[lexeme.start..lexeme.end])
            .collect()
    }

    #[test]
    fn classifies_an_instruction_line() {
        use TokenKind::*;
        let line = "main:\n add:u64*4 5, x -> y # sum";
        assert_eq!(
            vec![
                Label, Eol, Word, Type, Star, Number, Number, Comma, Word,
                Arrow, Word, Comment
            ],
            kinds(line)
        );
        assert_eq!(
            vec![
                "main", "\n", "add", ":u64", "*", "4", "5", ",", "x", "->",
                "y", "# sum"
            ],
            texts(line)
        );
    }

    #[test]
    fn labels_need_a_boundary_after_the_colon() {
        use TokenKind::*;
        assert_eq!(vec![Label], kinds("end:"));
        assert_eq!(vec![Label, Comment], kinds("end:# here"));
        assert_eq!(vec![Word, Type], kinds("end:u8"));
    }

    #[test]
    fn numbers_and_positions() {
        use TokenKind::*;
        assert_eq!(
            vec![Number, Number, Number, Number, Number, Position],
            kinds("12 0x1F 0b101 1.5 2e-3 @256")
        );
        assert_eq!(
            vec![Invalid, Invalid, Invalid, Invalid],
            kinds("0x 0b2 12ab @")
        );
    }

    #[test]
    fn directives_strings_and_punctuation() {
        use TokenKind::*;
        assert_eq!(
            vec![
                Directive, Word, LParen, Ellipsis, Word, RParen, LBrace,
                RBrace
            ],
            kinds(".macro f(...rest) {}")
        );
        assert_eq!(vec![Str, Invalid], kinds(r#""a\"b" "open"#));
        assert_eq!(vec![Minus, Plus, Slash, Tilde], kinds("- + / ~"));
    }

    #[test]
    fn line_continuations_are_whitespace() {
        use TokenKind::*;
        assert_eq!(vec![Word, Word, Eol, Word], kinds("a \\\n b\nc"));
    }

    #[test]
    fn parses_literal_values() {
        assert_eq!(Some(Number::Int(255)), parse_number("0xff"));
        assert_eq!(Some(Number::Int(5)), parse_number("0b101"));
        assert_eq!(Some(Number::Int(-1)), parse_number("0xffffffffffffffff"));
        assert_eq!(Some(Number::Float(0.25)), parse_number("0.25"));
        assert_eq!(None, parse_number("99999999999999999999"));
        assert_eq!(Some(Number::Int(-2)), parse_number("-2"));
        assert_eq!(Some(Number::Float(-1.5)), parse_number("-1.5"));
    }

    #[test]
    fn unescapes_strings() {
        assert_eq!(Some("a\n\"b\"".into()), unescape(r#""a\n\"b\"""#));
        assert_eq!(None, unescape(r#""\q""#));
    }
}
