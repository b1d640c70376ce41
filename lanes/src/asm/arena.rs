// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! Append-only storage for source text and tokens. Everything refers to
//! tokens and sources by index, so references stay valid as more text is
//! added during expansion.

use super::{
    error::{Location, Trace},
    token::{Lexer, TokenKind},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(usize);

/// A run of text in the arena: a loaded file or text synthesized during
/// expansion.
#[derive(Clone, Debug)]
pub struct Source {
    pub name: String,
    start: usize,
    end: usize,
    /// The token whose expansion created this source. `None` for files.
    pub producer: Option<TokenId>,
}

#[derive(Clone, Copy, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub source: SourceId,
    start: usize,
    end: usize,
    /// The token that caused this one to be emitted, if it came from an
    /// expansion.
    pub prev: Option<TokenId>,
}

/// Name given to synthesized sources.
pub const SYNTHETIC_SOURCE: &str = "<expansion>";

#[derive(Debug, Default)]
pub struct TokenArena {
    chars: String,
    sources: Vec<Source>,
    tokens: Vec<Token>,
}

impl TokenArena {
    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        text: &str,
        producer: Option<TokenId>,
    ) -> SourceId {
        let start = self.chars.len();
        self.chars.push_str(text);
        self.sources.push(Source {
            name: name.into(),
            start,
            end: self.chars.len(),
            producer,
        });
        SourceId(self.sources.len() - 1)
    }

    /// Lexes all of `source`, giving each token `prev` as its parent.
    pub fn lex(
        &mut self,
        source: SourceId,
        prev: Option<TokenId>,
    ) -> Vec<TokenId> {
        let (start, end) = {
            let source = &self.sources[source.0];
            (source.start, source.end)
        };
        let lexemes =
            Lexer::new(&self.chars[start..end]).collect::<Vec<_>>();
        lexemes
            .into_iter()
            .map(|lexeme| {
                self.push(Token {
                    kind: lexeme.kind,
                    source,
                    start: start + lexeme.start,
                    end: start + lexeme.end,
                    prev,
                })
            })
            .collect()
    }

    /// Adds a file's text and lexes it.
    pub fn load(
        &mut self,
        name: impl Into<String>,
        text: &str,
    ) -> Vec<TokenId> {
        let source = self.add_source(name, text, None);
        self.lex(source, None)
    }

    /// Starts building text on behalf of `producer`.
    pub fn synthesize(&mut self, producer: TokenId) -> Synthesizer<'_> {
        Synthesizer {
            arena: self,
            producer,
            text: String::new(),
        }
    }

    /// One token of `kind` spelled `text`, however the lexer would split
    /// it.
    pub fn synthesize_token(
        &mut self,
        producer: TokenId,
        kind: TokenKind,
        text: &str,
    ) -> TokenId {
        let source = self.add_source(SYNTHETIC_SOURCE, text, Some(producer));
        let (start, end) = {
            let source = &self.sources[source.0];
            (source.start, source.end)
        };
        self.push(Token {
            kind,
            source,
            start,
            end,
            prev: Some(producer),
        })
    }

    /// A new token with `template`'s text and kind whose parent is `prev`.
    pub fn copy(&mut self, template: TokenId, prev: TokenId) -> TokenId {
        let token = Token {
            prev: Some(prev),
            ..self.tokens[template.0]
        };
        self.push(token)
    }

    fn push(&mut self, token: Token) -> TokenId {
        debug_assert!(token
            .prev
            .map_or(true, |prev| prev.0 < self.tokens.len()));
        self.tokens.push(token);
        TokenId(self.tokens.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, id: TokenId) -> &Token {
        &self.tokens[id.0]
    }

    pub fn kind(&self, id: TokenId) -> TokenKind {
        self.tokens[id.0].kind
    }

    pub fn text(&self, id: TokenId) -> &str {
        let token = &self.tokens[id.0];
        &self.chars[token.start..token.end]
    }

    pub fn source(&self, id: SourceId) -> &Source {
        &self.sources[id.0]
    }

    pub fn source_text(&self, id: SourceId) -> &str {
        let source = &self.sources[id.0];
        &self.chars[source.start..source.end]
    }

    pub fn location(&self, id: TokenId) -> Location {
        let token = &self.tokens[id.0];
        let source = &self.sources[token.source.0];
        let before = &self.chars[source.start..token.start];
        let line_start = before.rfind('\n').map_or(0, |newline| newline + 1);
        Location {
            source: source.name.clone(),
            line: before.matches('\n').count() + 1,
            column: before[line_start..].chars().count() + 1,
        }
    }

    /// The full line of source text containing `id`.
    pub fn line_text(&self, id: TokenId) -> &str {
        let token = &self.tokens[id.0];
        let source = &self.sources[token.source.0];
        let text = &self.chars[source.start..source.end];
        let offset = token.start - source.start;
        let start = text[..offset].rfind('\n').map_or(0, |newline| newline + 1);
        let end = text[offset..]
            .find('\n')
            .map_or(text.len(), |newline| offset + newline);
        text[start..end].trim_end_matches('\r')
    }

    /// Walks the parent links from `id` back to the original text.
    pub fn trace(&self, id: TokenId) -> Trace {
        let mut frames = vec![];
        let mut current = Some(id);
        while let Some(token) = current {
            frames.push(self.location(token));
            current = self.tokens[token.0].prev;
        }
        Trace { frames }
    }
}

/// Accumulates new text, then lexes it into tokens whose parent is the
/// producer.
pub struct Synthesizer<'a> {
    arena: &'a mut TokenArena,
    producer: TokenId,
    text: String,
}

impl Synthesizer<'_> {
    pub fn push_str(&mut self, text: &str) -> &mut Self {
        self.text.push_str(text);
        self
    }

    pub fn finish(self) -> Vec<TokenId> {
        let source =
            self.arena
                .add_source(SYNTHETIC_SOURCE, &self.text, Some(self.producer));
        self.arena.lex(source, Some(self.producer))
    }
}
