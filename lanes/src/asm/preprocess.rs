// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! The macro language. Filters the raw token stream into the stream the
//! parser sees, expanding macros and directives through a stack of frames.

use std::collections::HashMap;

use super::{
    arena::{TokenArena, TokenId},
    error::AsmError,
    expr::{evaluate, parse_parenthesized, Cursor},
    loader::SourceLoader,
    token::{parse_number, unescape, Number, TokenKind},
    AssemblerConfig,
};

/// Frames deeper than this are taken to be runaway recursion.
const MAX_FRAMES: usize = 256;

/// A reader over a materialized token list.
struct Frame {
    tokens: Vec<TokenId>,
    next: usize,
}

#[derive(Clone, Debug)]
struct Macro {
    params: Vec<String>,
    /// The `...name` parameter, which takes every remaining argument.
    rest: Option<String>,
    body: Vec<TokenId>,
}

/// An open `{` of a conditional whose contents are being expanded.
struct Block {
    open: TokenId,
    is_else: bool,
}

pub struct Preprocessor<'a> {
    arena: &'a mut TokenArena,
    loader: &'a mut dyn SourceLoader,
    config: &'a AssemblerConfig,
    frames: Vec<Frame>,
    macros: HashMap<String, Macro>,
    namespaces: Vec<String>,
    blocks: Vec<Block>,
    /// Whether the most recently closed conditional block was taken, for a
    /// following `.else`.
    last_if: Option<bool>,
    region_cursor: u64,
    output: Vec<TokenId>,
    /// Kinds of the last two tokens read, most recent last.
    recent: [Option<TokenKind>; 2],
}

impl<'a> Preprocessor<'a> {
    pub fn new(
        arena: &'a mut TokenArena,
        loader: &'a mut dyn SourceLoader,
        config: &'a AssemblerConfig,
    ) -> Self {
        Self {
            arena,
            loader,
            config,
            frames: vec![],
            macros: HashMap::new(),
            namespaces: vec![],
            blocks: vec![],
            last_if: None,
            region_cursor: config.region_base,
            output: vec![],
            recent: [None; 2],
        }
    }

    /// Expands `tokens` completely.
    pub fn run(
        mut self,
        tokens: Vec<TokenId>,
    ) -> Result<Vec<TokenId>, AsmError> {
        self.frames.push(Frame { tokens, next: 0 });
        while let Some(token) = self.next_token() {
            self.process(token)?;
        }
        if let Some(block) = self.blocks.last() {
            return Err(
                self.error(block.open, "unbalanced `{`: block is never closed")
            );
        }
        Ok(self.output)
    }

    fn error(&self, token: TokenId, message: impl Into<String>) -> AsmError {
        AsmError::macro_error(self.arena, token, message)
    }

    fn next_token(&mut self) -> Option<TokenId> {
        while let Some(frame) = self.frames.last_mut() {
            if let Some(&token) = frame.tokens.get(frame.next) {
                frame.next += 1;
                self.recent = [self.recent[1], Some(self.arena.kind(token))];
                return Some(token);
            }
            self.frames.pop();
        }
        None
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.tokens.get(frame.next))
            .map(|token| self.arena.kind(*token))
    }

    /// The next token, which must exist because `cause` needs it.
    fn require_token(
        &mut self,
        cause: TokenId,
        what: &str,
    ) -> Result<TokenId, AsmError> {
        self.next_token().ok_or_else(|| {
            self.error(cause, format!("expected {what}, found end of input"))
        })
    }

    fn expect(
        &mut self,
        cause: TokenId,
        kind: TokenKind,
        what: &str,
    ) -> Result<TokenId, AsmError> {
        let token = self.require_token(cause, what)?;
        if self.arena.kind(token) != kind {
            let found = self.arena.text(token).escape_debug();
            return Err(
                self.error(token, format!("expected {what}, found `{found}`"))
            );
        }
        Ok(token)
    }

    fn push_frame(
        &mut self,
        tokens: Vec<TokenId>,
        cause: TokenId,
    ) -> Result<(), AsmError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.error(cause, "macro expansion nested too deeply"));
        }
        self.frames.push(Frame { tokens, next: 0 });
        Ok(())
    }

    fn synthesize(&mut self, producer: TokenId, text: &str) -> Vec<TokenId> {
        let mut synthesizer = self.arena.synthesize(producer);
        synthesizer.push_str(text);
        synthesizer.finish()
    }

    fn qualify(&self, name: &str) -> String {
        if self.namespaces.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.namespaces.join("."), name)
        }
    }

    /// Finds a macro named `name` in the innermost namespace that has one.
    fn lookup(&self, name: &str) -> Option<String> {
        (0..=self.namespaces.len()).rev().find_map(|depth| {
            let key = if depth == 0 {
                name.to_string()
            } else {
                format!("{}.{}", self.namespaces[..depth].join("."), name)
            };
            self.macros.contains_key(&key).then_some(key)
        })
    }

    fn process(&mut self, token: TokenId) -> Result<(), AsmError> {
        let last_if = self.last_if.take();
        match self.arena.kind(token) {
            TokenKind::Comment => self.last_if = last_if,
            TokenKind::Eol => {
                self.last_if = last_if;
                self.output.push(token);
            }
            TokenKind::Invalid => {
                return Err(AsmError::invalid(self.arena, token))
            }
            TokenKind::LBrace => {
                return Err(self.error(token, "unexpected `{`"))
            }
            TokenKind::RBrace => {
                let Some(block) = self.blocks.pop() else {
                    return Err(self.error(token, "unbalanced `}`"));
                };
                self.last_if = (!block.is_else).then_some(true);
            }
            TokenKind::Directive => self.directive(token, last_if)?,
            TokenKind::Label => self.emit_label(token),
            TokenKind::Word => match self.lookup(self.arena.text(token)) {
                Some(key) => self.invoke(&key, token)?,
                None => self.output.push(token),
            },
            _ => self.output.push(token),
        }
        Ok(())
    }

    fn emit_label(&mut self, token: TokenId) {
        if self.namespaces.is_empty() {
            self.output.push(token);
            return;
        }
        let name = format!("{}:", self.qualify(self.arena.text(token)));
        let tokens = self.synthesize(token, &name);
        self.output.extend(tokens);
    }

    fn directive(
        &mut self,
        token: TokenId,
        last_if: Option<bool>,
    ) -> Result<(), AsmError> {
        let name = self.arena.text(token)[1..].to_string();
        match name.as_str() {
            "macro" => self.define(token),
            "unmacro" => {
                let name_token =
                    self.expect(token, TokenKind::Word, "a macro name")?;
                let name = self.arena.text(name_token);
                match self.lookup(name) {
                    Some(key) => {
                        self.macros.remove(&key);
                        Ok(())
                    }
                    None => Err(self.error(
                        name_token,
                        format!("macro `{name}` is not defined"),
                    )),
                }
            }
            "import" => self.import(token),
            "region" => self.region(token),
            "add" => self.fold_sum(token),
            "if" => {
                let group = self.capture_group(token)?;
                let mut cursor = Cursor::new(self.arena, &group);
                let expr = parse_parenthesized(&mut cursor)?;
                let value = evaluate(&expr, self.arena, &|_| None)?;
                self.enter_block(token, !value.is_zero(), false)
            }
            "ifdef" | "ifndef" => {
                let name_token =
                    self.expect(token, TokenKind::Word, "a macro name")?;
                let defined =
                    self.lookup(self.arena.text(name_token)).is_some();
                self.enter_block(token, defined == (name == "ifdef"), false)
            }
            "else" => match last_if {
                Some(taken) => self.enter_block(token, !taken, true),
                None => Err(self.error(
                    token,
                    "`.else` without a conditional block before it",
                )),
            },
            "ns" => {
                let name_token =
                    self.expect(token, TokenKind::Word, "a namespace name")?;
                self.namespaces
                    .push(self.arena.text(name_token).to_string());
                Ok(())
            }
            "endns" => match self.namespaces.pop() {
                Some(_) => Ok(()),
                None => Err(self.error(token, "`.endns` without `.ns`")),
            },
            "addns" => {
                let word = self.single_word_argument(token)?;
                let qualified = self.qualify(self.arena.text(word));
                let tokens = self.synthesize(token, &qualified);
                self.push_frame(tokens, token)
            }
            "tomacro" => {
                let word = self.single_word_argument(token)?;
                let name = self.arena.text(word);
                match self.lookup(name) {
                    Some(key) => self.invoke(&key, token),
                    None => {
                        Err(self.error(word, format!("unknown macro `{name}`")))
                    }
                }
            }
            "concat" => {
                let arguments = self.capture_args(token, None, true)?;
                let text = arguments
                    .iter()
                    .flatten()
                    .map(|part| self.arena.text(*part))
                    .collect::<String>();
                let tokens = self.synthesize(token, &text);
                if tokens.len() != 1 {
                    let made = tokens.len();
                    return Err(self.error(
                        token,
                        format!("`.concat` made {made} tokens of `{text}`"),
                    ));
                }
                self.push_frame(tokens, token)
            }
            "label" => {
                let word = self.single_word_argument(token)?;
                let text = format!("{}:", self.arena.text(word));
                let tokens = self.synthesize(token, &text);
                self.push_frame(tokens, token)
            }
            _ => match self.lookup(&name) {
                Some(key) => self.invoke(&key, token),
                None => {
                    Err(self.error(token, format!("unknown macro `{name}`")))
                }
            },
        }
    }

    fn define(&mut self, directive: TokenId) -> Result<(), AsmError> {
        let name_token =
            self.expect(directive, TokenKind::Word, "a macro name")?;
        let name = self.qualify(self.arena.text(name_token));
        if self.macros.contains_key(&name) {
            return Err(self.error(
                name_token,
                format!("macro `{name}` is already defined"),
            ));
        }

        let mut params = vec![];
        let mut rest = None;
        if self.peek_kind() == Some(TokenKind::LParen) {
            self.next_token();
            if self.peek_kind() == Some(TokenKind::RParen) {
                self.next_token();
            } else {
                loop {
                    let param =
                        self.require_token(directive, "a parameter name")?;
                    match self.arena.kind(param) {
                        TokenKind::Word => {
                            params.push(self.arena.text(param).to_string())
                        }
                        TokenKind::Ellipsis => {
                            let word = self.expect(
                                param,
                                TokenKind::Word,
                                "a name after `...`",
                            )?;
                            rest = Some(self.arena.text(word).to_string());
                        }
                        _ => {
                            return Err(
                                self.error(param, "expected a parameter name")
                            )
                        }
                    }
                    let separator =
                        self.require_token(directive, "`,` or `)`")?;
                    match self.arena.kind(separator) {
                        TokenKind::RParen => break,
                        TokenKind::Comma if rest.is_none() => {}
                        _ => {
                            return Err(self.error(
                                separator,
                                "expected `)` after the parameters",
                            ))
                        }
                    }
                }
            }
        }

        let mut body = vec![];
        if self.peek_kind() == Some(TokenKind::LBrace) {
            let open = self.require_token(directive, "`{`")?;
            let mut depth = 1;
            loop {
                let Some(token) = self.next_token() else {
                    return Err(self.error(
                        open,
                        "unbalanced `{`: macro body is never closed",
                    ));
                };
                match self.arena.kind(token) {
                    TokenKind::LBrace => depth += 1,
                    TokenKind::RBrace => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    TokenKind::Comment => continue,
                    _ => {}
                }
                body.push(token);
            }
        } else {
            while !matches!(self.peek_kind(), None | Some(TokenKind::Eol)) {
                let token = self.require_token(directive, "a macro body")?;
                if self.arena.kind(token) != TokenKind::Comment {
                    body.push(token);
                }
            }
        }

        if self.config.trace_expansion {
            tracing::trace!(
                name = %name,
                params = params.len(),
                "defined macro"
            );
        }
        self.macros.insert(name, Macro { params, rest, body });
        Ok(())
    }

    fn invoke(&mut self, key: &str, invoker: TokenId) -> Result<(), AsmError> {
        let Some(definition) = self.macros.get(key).cloned() else {
            return Err(self.error(invoker, format!("unknown macro `{key}`")));
        };
        let named = definition.params.len();
        let arguments = if self.peek_kind() == Some(TokenKind::LParen) {
            let rest_from = definition.rest.is_some().then_some(named);
            self.capture_args(invoker, rest_from, false)?
        } else {
            vec![]
        };
        let given = arguments.len();
        if given < named || (given > named && definition.rest.is_none()) {
            return Err(self.error(
                invoker,
                format!("macro `{key}` takes {named} arguments, not {given}"),
            ));
        }

        let mut tokens = vec![];
        for &token in &definition.body {
            let substitution = match self.arena.kind(token) {
                TokenKind::Word => {
                    let text = self.arena.text(token);
                    let index = definition
                        .params
                        .iter()
                        .position(|param| param == text);
                    if let Some(index) = index {
                        Some(arguments[index].as_slice())
                    } else if definition.rest.as_deref() == Some(text) {
                        Some(
                            arguments
                                .get(named)
                                .map_or(&[][..], Vec::as_slice),
                        )
                    } else {
                        None
                    }
                }
                _ => None,
            };
            match substitution {
                Some(argument) => {
                    for &part in argument {
                        tokens.push(self.arena.copy(part, invoker));
                    }
                }
                None => tokens.push(self.arena.copy(token, invoker)),
            }
        }

        if self.config.trace_expansion {
            tracing::trace!(
                name = key,
                at = %self.arena.location(invoker),
                tokens = tokens.len(),
                "expanding macro"
            );
        }
        self.push_frame(tokens, invoker)
    }

    /// Reads `(a, b, ...)` after `cause`. Arguments are split on top-level
    /// commas, except that argument `rest_from` runs to the closing paren.
    /// With `expand`, directives inside are expanded first.
    fn capture_args(
        &mut self,
        cause: TokenId,
        rest_from: Option<usize>,
        expand: bool,
    ) -> Result<Vec<Vec<TokenId>>, AsmError> {
        let open = self.expect(cause, TokenKind::LParen, "`(`")?;
        let mut arguments: Vec<Vec<TokenId>> = vec![vec![]];
        let mut depth = 0usize;
        loop {
            let token = match self.next_token() {
                Some(token) if self.arena.kind(token) != TokenKind::Eol => {
                    token
                }
                _ => {
                    return Err(self.error(
                        open,
                        "unbalanced `(`: argument list is never closed",
                    ))
                }
            };
            match self.arena.kind(token) {
                TokenKind::Directive if expand => {
                    self.directive(token, None)?;
                    continue;
                }
                TokenKind::Comment => continue,
                TokenKind::LParen => depth += 1,
                TokenKind::RParen if depth == 0 => break,
                TokenKind::RParen => depth -= 1,
                TokenKind::Comma
                    if depth == 0
                        && rest_from
                            .map_or(true, |rest| arguments.len() <= rest) =>
                {
                    arguments.push(vec![]);
                    continue;
                }
                _ => {}
            }
            if let Some(argument) = arguments.last_mut() {
                argument.push(token);
            }
        }
        if arguments.len() == 1 && arguments[0].is_empty() {
            arguments.clear();
        }
        Ok(arguments)
    }

    /// Reads a parenthesized group after `cause`, parentheses included.
    fn capture_group(
        &mut self,
        cause: TokenId,
    ) -> Result<Vec<TokenId>, AsmError> {
        let open = self.expect(cause, TokenKind::LParen, "`(`")?;
        let mut group = vec![open];
        let mut depth = 1;
        while depth > 0 {
            let token = match self.next_token() {
                Some(token) if self.arena.kind(token) != TokenKind::Eol => {
                    token
                }
                _ => return Err(self.error(open, "unbalanced `(`")),
            };
            match self.arena.kind(token) {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth -= 1,
                TokenKind::Comment => continue,
                _ => {}
            }
            group.push(token);
        }
        Ok(group)
    }

    fn single_word_argument(
        &mut self,
        cause: TokenId,
    ) -> Result<TokenId, AsmError> {
        let arguments = self.capture_args(cause, None, true)?;
        match arguments.as_slice() {
            [argument] => match argument.as_slice() {
                [word] if self.arena.kind(*word) == TokenKind::Word => {
                    Ok(*word)
                }
                _ => Err(self.error(cause, "expected a single word argument")),
            },
            _ => Err(self.error(cause, "expected a single word argument")),
        }
    }

    /// Expects `{` after a conditional, then either expands the block or
    /// skips it, counting braces only.
    fn enter_block(
        &mut self,
        cause: TokenId,
        taken: bool,
        is_else: bool,
    ) -> Result<(), AsmError> {
        let open = loop {
            let token = self.require_token(cause, "`{`")?;
            match self.arena.kind(token) {
                TokenKind::Eol | TokenKind::Comment => {}
                TokenKind::LBrace => break token,
                _ => {
                    return Err(self.error(
                        token,
                        "expected `{` to open the conditional block",
                    ))
                }
            }
        };
        if taken {
            self.blocks.push(Block { open, is_else });
            return Ok(());
        }

        let mut depth = 1;
        while depth > 0 {
            let Some(token) = self.next_token() else {
                return Err(
                    self.error(open, "unbalanced `{`: block is never closed")
                );
            };
            match self.arena.kind(token) {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth -= 1,
                _ => {}
            }
        }
        self.last_if = (!is_else).then_some(false);
        Ok(())
    }

    fn import(&mut self, directive: TokenId) -> Result<(), AsmError> {
        let target = self.require_token(directive, "a file name")?;
        let file = match self.arena.kind(target) {
            TokenKind::Str => unescape(self.arena.text(target))
                .ok_or_else(|| AsmError::invalid(self.arena, target))?,
            TokenKind::Word => self.arena.text(target).to_string(),
            _ => {
                return Err(self.error(target, "expected a file name to import"))
            }
        };
        let from = self
            .arena
            .source(self.arena.token(directive).source)
            .name
            .clone();
        let (name, text) =
            self.loader
                .load(&file, &from)
                .map_err(|source| AsmError::Import {
                    name: file.clone(),
                    trace: self.arena.trace(directive),
                    source,
                })?;
        tracing::debug!(file = %name, from = %from, "importing");
        let source = self.arena.add_source(name, &text, Some(directive));
        let tokens = self.arena.lex(source, Some(directive));
        self.push_frame(tokens, directive)
    }

    /// `.region name [-] size` takes `size` bytes below the previous region
    /// and labels its start, or its end with `-`.
    fn region(&mut self, directive: TokenId) -> Result<(), AsmError> {
        let name_token =
            self.expect(directive, TokenKind::Word, "a region name")?;
        let at_end = self.peek_kind() == Some(TokenKind::Minus);
        if at_end {
            self.next_token();
        }
        let size_token =
            self.expect(directive, TokenKind::Number, "a region size")?;
        let size = match parse_number(self.arena.text(size_token)) {
            Some(Number::Int(size)) if size >= 0 => size as u64,
            _ => {
                return Err(self.error(
                    size_token,
                    "region size must be a non-negative integer",
                ))
            }
        };
        let Some(start) = self.region_cursor.checked_sub(size) else {
            return Err(self.error(
                size_token,
                "regions do not fit below the region base",
            ));
        };
        self.region_cursor = start;

        let label = if at_end { start + size } else { start };
        let text = format!("@{label} {}:", self.arena.text(name_token));
        let tokens = self.synthesize(directive, &text);
        self.push_frame(tokens, directive)
    }

    /// `.add(a, b, ...)` becomes one literal holding the sum, and
    /// `.add(*a, *b, ...)` one width holding the total lane count. A folded
    /// width reuses a `*` written right before the directive.
    fn fold_sum(&mut self, directive: TokenId) -> Result<(), AsmError> {
        let after_star = self.recent[0] == Some(TokenKind::Star);
        let arguments = self.capture_args(directive, None, true)?;
        let mut sum = Number::Int(0);
        let mut widths = None;
        for argument in &arguments {
            let (value, is_width) = match argument.as_slice() {
                [number] => (self.literal(*number, false)?, false),
                [sign, number] => match self.arena.kind(*sign) {
                    TokenKind::Minus => (self.literal(*number, true)?, false),
                    TokenKind::Star => (self.literal(*number, false)?, true),
                    _ => return Err(self.error(*sign, "expected `-` or `*`")),
                },
                _ => {
                    return Err(self.error(
                        directive,
                        "`.add` takes numeric literals or widths",
                    ))
                }
            };
            if *widths.get_or_insert(is_width) != is_width {
                return Err(self.error(
                    directive,
                    "`.add` cannot mix widths and literals",
                ));
            }
            if is_width && !matches!(value, Number::Int(count) if count >= 0) {
                return Err(self.error(
                    argument[1],
                    "a width must be a non-negative integer",
                ));
            }
            sum = match (sum, value) {
                (Number::Int(a), Number::Int(b)) => {
                    Number::Int(a.wrapping_add(b))
                }
                (a, b) => Number::Float(a.as_f64() + b.as_f64()),
            };
        }

        let text = match sum {
            Number::Int(value) => value.to_string(),
            Number::Float(value) => format!("{value:?}"),
        };
        let mut tokens = vec![];
        if widths == Some(true) && !after_star {
            tokens.push(self.arena.synthesize_token(
                directive,
                TokenKind::Star,
                "*",
            ));
        }
        tokens.push(
            self.arena
                .synthesize_token(directive, TokenKind::Number, &text),
        );
        self.push_frame(tokens, directive)
    }

    fn literal(
        &self,
        token: TokenId,
        negate: bool,
    ) -> Result<Number, AsmError> {
        if self.arena.kind(token) != TokenKind::Number {
            return Err(self.error(token, "expected a numeric literal"));
        }
        let value = parse_number(self.arena.text(token))
            .ok_or_else(|| AsmError::invalid(self.arena, token))?;
        Ok(match (value, negate) {
            (Number::Int(value), true) => Number::Int(value.wrapping_neg()),
            (Number::Float(value), true) => Number::Float(-value),
            (value, false) => value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::loader::MemoryLoader;

    fn run_with(
        text: &str,
        loader: &mut MemoryLoader,
    ) -> (TokenArena, Result<Vec<TokenId>, AsmError>) {
        let config = AssemblerConfig::default();
        let mut arena = TokenArena::default();
        let tokens = arena.load("main.lanes", text);
        let result = Preprocessor::new(&mut arena, loader, &config).run(tokens);
        (arena, result)
    }

    /// Expanded token texts, line breaks dropped.
    fn expand(text: &str) -> Vec<String> {
        let (arena, result) = run_with(text, &mut MemoryLoader::default());
        result
            .unwrap()
            .into_iter()
            .filter(|token| arena.kind(*token) != TokenKind::Eol)
            .map(|token| arena.text(token).to_string())
            .collect()
    }

    fn fails(text: &str) -> AsmError {
        run_with(text, &mut MemoryLoader::default()).1.unwrap_err()
    }

    #[test]
    fn substitutes_macro_arguments() {
        assert_eq!(
            vec!["add", "42", ",", "1"],
            expand(".macro inc(x) { add x, 1 }\ninc(42)\n")
        );
        assert_eq!(
            vec!["nop", "halt"],
            expand(".macro stop nop halt\n.stop\n")
        );
    }

    #[test]
    fn rest_parameter_takes_remaining_arguments() {
        assert_eq!(
            vec![":u8", "1", "2", ",", "3"],
            expand(".macro bytes(a, ...r) { :u8 a r }\nbytes(1, 2, 3)\n")
        );
        assert_eq!(
            vec![":u8", "1"],
            expand(".macro bytes(a, ...r) { :u8 a r }\nbytes(1)\n")
        );
    }

    #[test]
    fn expanded_tokens_trace_to_the_invocation() {
        let (arena, result) = run_with(
            ".macro inc(x) { add x, 1 }\n\ninc(42)\n",
            &mut MemoryLoader::default(),
        );
        let tokens = result.unwrap();
        let add = tokens
            .iter()
            .find(|t| arena.text(**t) == "add")
            .copied()
            .unwrap();
        assert_eq!(
            "main.lanes:1:17, expanded from main.lanes:3:1",
            arena.trace(add).to_string()
        );
    }

    #[test]
    fn conditionals_and_else() {
        assert_eq!(
            vec!["a", "d"],
            expand(
                ".macro x {}\n.ifdef x { a }\n.else { b }\n\
                 .ifndef x { c } .else { d }\n"
            )
        );
        assert_eq!(
            vec!["yes"],
            expand(".if(1 + 1) { yes }\n.if(2 - 2) { no }\n")
        );
        assert_eq!(
            vec!["inner"],
            expand(".if(1) { .if(0) { { skipped } } .else { inner } }\n")
        );
    }

    #[test]
    fn namespaces_qualify_labels() {
        let (arena, result) = run_with(
            ".ns math\nsq:\njump .addns(sq)\n.endns\n",
            &mut MemoryLoader::default(),
        );
        let tokens = result
            .unwrap()
            .into_iter()
            .filter(|token| arena.kind(*token) != TokenKind::Eol)
            .collect::<Vec<_>>();
        assert_eq!(TokenKind::Label, arena.kind(tokens[0]));
        assert_eq!(
            vec!["math.sq", "jump", "math.sq"],
            tokens.iter().map(|t| arena.text(*t)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn namespaced_macros_shadow_global_ones() {
        assert_eq!(
            vec!["inner", "outer"],
            expand(".macro m outer\n.ns a\n.macro m inner\nm\n.endns\nm\n")
        );
    }

    #[test]
    fn regions_grow_down() {
        assert_eq!(
            vec!["@16776960", "stack", "@16776960", "heap"],
            expand(".region stack 256\n.region heap - 16\n")
        );
    }

    #[test]
    fn folds_and_builds_tokens() {
        assert_eq!(vec!["-1"], expand(".add(1, 2, -4)\n"));
        assert_eq!(vec!["1.5"], expand(".add(1, 0.5)\n"));
        assert_eq!(vec!["3"], expand(".add(.add(1, 1), 1)\n"));
        assert_eq!(vec!["main"], expand(".concat(ma, in)\n"));
        assert_eq!(vec!["loop"], expand(".label(.concat(lo, op))\n"));
        assert_eq!(vec!["2"], expand(".macro two() { 2 }\n.tomacro(two)()\n"));
    }

    #[test]
    fn folded_sums_are_single_tokens() {
        let (arena, result) =
            run_with(".add(1, -3)\n", &mut MemoryLoader::default());
        let tokens = result.unwrap();
        assert_eq!(2, tokens.len());
        assert_eq!(TokenKind::Number, arena.kind(tokens[0]));
        assert_eq!("-2", arena.text(tokens[0]));
    }

    #[test]
    fn folds_widths() {
        assert_eq!(
            vec!["push", ":u8", "*", "5", "1"],
            expand("push:u8*.add(*2, *3) 1\n")
        );
        assert_eq!(vec!["*", "4"], expand(".add(*1, *3)\n"));
        assert_eq!(
            vec!["*", "6"],
            expand(".add(*.add(*1, *2), *3)\n")
        );
        for text in [".add(*2, 3)\n", ".add(*-2)\n", ".add(+2)\n"] {
            assert!(matches!(fails(text), AsmError::Macro { .. }), "{text}");
        }
    }

    #[test]
    fn arguments_trace_to_the_invocation() {
        let (arena, result) = run_with(
            ".macro inc(x) { add x, 1 }\ninc(42)\n",
            &mut MemoryLoader::default(),
        );
        let tokens = result.unwrap();
        let argument = tokens
            .iter()
            .find(|t| arena.text(**t) == "42")
            .copied()
            .unwrap();
        assert_eq!(
            "main.lanes:2:5, expanded from main.lanes:2:1",
            arena.trace(argument).to_string()
        );
    }

    #[test]
    fn imports_read_through_the_loader() {
        let mut loader = MemoryLoader::default();
        loader.insert("lib.lanes", "inside\n");
        let (arena, result) =
            run_with(".import \"lib.lanes\"\nafter\n", &mut loader);
        let tokens = result.unwrap();
        let inside = tokens[0];
        assert_eq!("inside", arena.text(inside));
        assert_eq!(
            "lib.lanes:1:1, expanded from main.lanes:1:1",
            arena.trace(inside).to_string()
        );
        assert!(matches!(
            run_with(".import \"gone\"\n", &mut loader).1,
            Err(AsmError::Import { .. })
        ));
    }

    #[test]
    fn malformed_macros_are_errors() {
        for text in [
            ".nope\n",
            "}\n",
            ".endns\n",
            ".unmacro x\n",
            ".ifdef x {\n",
            ".ifdef x { } .else { } .else { }\n",
            ".macro f() { f() }\nf()\n",
            ".macro f nop\n.macro f nop\n",
            ".macro f(a) { a }\nf(1, 2)\n",
            ".macro f(a) { a }\nf(1\n",
            ".concat(1, +, 2)\n",
        ] {
            assert!(matches!(fails(text), AsmError::Macro { .. }), "{text}");
        }
        assert!(matches!(fails("0x\n"), AsmError::InvalidToken { .. }));
    }
}
