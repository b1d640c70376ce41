// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! Constant expressions: `+ - * /` with the usual precedence, unary `-`
//! and `~`, parentheses, numeric literals and label names. Parsed into
//! postfix node lists by a shunting-yard pass over any [`TokenSource`].

use super::{
    arena::{TokenArena, TokenId},
    error::AsmError,
    token::{parse_number, Number, TokenKind},
};
use crate::arch::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node {
    /// A number or a label name.
    Leaf(TokenId),
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
}

impl Node {
    fn precedence(&self) -> u8 {
        match self {
            Node::Leaf(_) => 0,
            Node::Add | Node::Sub => 1,
            Node::Mul | Node::Div => 2,
            Node::Neg | Node::Not => 3,
        }
    }
}

/// A parsed expression in postfix order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstExpr {
    pub nodes: Vec<Node>,
    /// The opening parenthesis, for error reporting.
    pub token: TokenId,
}

impl ConstExpr {
    pub fn references_label(&self, arena: &TokenArena) -> bool {
        self.nodes.iter().any(|node| match node {
            Node::Leaf(token) => arena.kind(*token) == TokenKind::Word,
            _ => false,
        })
    }
}

/// Anything that hands out tokens one at a time.
pub trait TokenSource {
    fn arena(&self) -> &TokenArena;

    fn peek(&self) -> Option<TokenId>;

    fn bump(&mut self) -> Option<TokenId>;

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|token| self.arena().kind(token))
    }
}

/// A [`TokenSource`] over a slice of already collected tokens.
pub struct Cursor<'a> {
    arena: &'a TokenArena,
    tokens: &'a [TokenId],
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(arena: &'a TokenArena, tokens: &'a [TokenId]) -> Self {
        Self {
            arena,
            tokens,
            position: 0,
        }
    }

    /// The most recently consumed token, if any.
    pub fn last(&self) -> Option<TokenId> {
        self.position
            .checked_sub(1)
            .and_then(|index| self.tokens.get(index).copied())
    }
}

impl TokenSource for Cursor<'_> {
    fn arena(&self) -> &TokenArena {
        self.arena
    }

    fn peek(&self) -> Option<TokenId> {
        self.tokens.get(self.position).copied()
    }

    fn bump(&mut self) -> Option<TokenId> {
        let token = self.peek()?;
        self.position += 1;
        Some(token)
    }
}

/// Parses `( expr )`, consuming both parentheses.
pub fn parse_parenthesized<S: TokenSource + ?Sized>(
    source: &mut S,
) -> Result<ConstExpr, AsmError> {
    let Some(open) = source.bump() else {
        return Err(AsmError::Syntax {
            message: "expected `(`, found end of input".into(),
            trace: Default::default(),
        });
    };
    let arena = source.arena();
    if arena.kind(open) != TokenKind::LParen {
        return Err(AsmError::syntax(arena, open, "expected `(`"));
    }

    let mut nodes = vec![];
    // `None` marks an open parenthesis
    let mut operators: Vec<Option<Node>> = vec![None];
    let mut seen_value = false;

    loop {
        let Some(token) = source.bump() else {
            return Err(AsmError::syntax(
                source.arena(),
                open,
                "unterminated expression",
            ));
        };
        let arena = source.arena();
        let kind = arena.kind(token);
        let unexpected = |what: &str| {
            let found = arena.text(token).escape_debug();
            AsmError::syntax(
                arena,
                token,
                format!("expected {what}, found `{found}`"),
            )
        };

        match kind {
            TokenKind::Number | TokenKind::Word => {
                if seen_value {
                    return Err(unexpected("an operator"));
                }
                nodes.push(Node::Leaf(token));
                seen_value = true;
            }
            TokenKind::LParen => {
                if seen_value {
                    return Err(unexpected("an operator"));
                }
                operators.push(None);
            }
            TokenKind::Plus if !seen_value => {}
            TokenKind::Minus if !seen_value => operators.push(Some(Node::Neg)),
            TokenKind::Tilde if !seen_value => operators.push(Some(Node::Not)),
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash => {
                let op = match kind {
                    TokenKind::Plus => Node::Add,
                    TokenKind::Minus => Node::Sub,
                    TokenKind::Star => Node::Mul,
                    _ => Node::Div,
                };
                while let Some(Some(top)) = operators.last().copied() {
                    if top.precedence() < op.precedence() {
                        break;
                    }
                    nodes.push(top);
                    operators.pop();
                }
                operators.push(Some(op));
                seen_value = false;
            }
            TokenKind::RParen => {
                if !seen_value {
                    return Err(unexpected("a value"));
                }
                while let Some(Some(op)) = operators.pop() {
                    nodes.push(op);
                }
                if operators.is_empty() {
                    return Ok(ConstExpr { nodes, token: open });
                }
            }
            _ if seen_value => return Err(unexpected("an operator or `)`")),
            _ => return Err(unexpected("a value")),
        }
    }
}

/// Evaluates `expr`, resolving label names through `labels`.
pub fn evaluate(
    expr: &ConstExpr,
    arena: &TokenArena,
    labels: &dyn Fn(&str) -> Option<Address>,
) -> Result<Number, AsmError> {
    let mut stack: Vec<Number> = Vec::with_capacity(expr.nodes.len());
    for node in &expr.nodes {
        let value = match *node {
            Node::Leaf(token) => leaf(arena, token, labels)?,
            Node::Neg | Node::Not => {
                let Some(value) = stack.pop() else {
                    return Err(malformed(arena, expr));
                };
                match (node, value) {
                    (Node::Neg, Number::Int(value)) => {
                        Number::Int(value.wrapping_neg())
                    }
                    (Node::Neg, Number::Float(value)) => Number::Float(-value),
                    (_, Number::Int(value)) => Number::Int(!value),
                    (_, Number::Float(_)) => {
                        return Err(AsmError::eval(
                            arena,
                            expr.token,
                            "`~` needs an integer",
                        ))
                    }
                }
            }
            op => {
                let (Some(b), Some(a)) = (stack.pop(), stack.pop()) else {
                    return Err(malformed(arena, expr));
                };
                binary(op, a, b).ok_or_else(|| {
                    AsmError::eval(arena, expr.token, "division by zero")
                })?
            }
        };
        stack.push(value);
    }
    match stack.as_slice() {
        [value] => Ok(*value),
        _ => Err(malformed(arena, expr)),
    }
}

fn malformed(arena: &TokenArena, expr: &ConstExpr) -> AsmError {
    AsmError::eval(arena, expr.token, "malformed expression")
}

fn leaf(
    arena: &TokenArena,
    token: TokenId,
    labels: &dyn Fn(&str) -> Option<Address>,
) -> Result<Number, AsmError> {
    match arena.kind(token) {
        TokenKind::Word => labels(arena.text(token))
            .map(|address| Number::Int(address as i64))
            .ok_or_else(|| AsmError::unknown_label(arena, token)),
        _ => parse_number(arena.text(token))
            .ok_or_else(|| AsmError::invalid(arena, token)),
    }
}

/// `None` on integer division by zero.
fn binary(op: Node, a: Number, b: Number) -> Option<Number> {
    if let (Number::Int(a), Number::Int(b)) = (a, b) {
        return Some(Number::Int(match op {
            Node::Add => a.wrapping_add(b),
            Node::Sub => a.wrapping_sub(b),
            Node::Mul => a.wrapping_mul(b),
            _ => a
                .checked_div(b)
                .or_else(|| (b == -1).then(|| a.wrapping_neg()))?,
        }));
    }
    let (a, b) = (a.as_f64(), b.as_f64());
    Some(Number::Float(match op {
        Node::Add => a + b,
        Node::Sub => a - b,
        Node::Mul => a * b,
        _ => a / b,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> (TokenArena, Result<ConstExpr, AsmError>) {
        let mut arena = TokenArena::default();
        let tokens = arena.load("expr", text);
        let result = parse_parenthesized(&mut Cursor::new(&arena, &tokens));
        (arena, result)
    }

    fn value(text: &str) -> Number {
        let (arena, expr) = parse(text);
        let labels = |name: &str| (name == "base").then_some(0x100u32);
        evaluate(&expr.unwrap(), &arena, &labels).unwrap()
    }

    #[test]
    fn respects_precedence_and_grouping() {
        assert_eq!(Number::Int(7), value("(1 + 2 * 3)"));
        assert_eq!(Number::Int(9), value("((1 + 2) * 3)"));
        assert_eq!(Number::Int(-6), value("(-2 * 3)"));
        assert_eq!(Number::Int(1), value("(7 - 4 - 2)"));
        assert_eq!(Number::Int(2), value("(8 / 2 / 2)"));
        assert_eq!(Number::Int(!5), value("(~5)"));
        assert_eq!(Number::Int(5), value("(- -5)"));
    }

    #[test]
    fn labels_and_floats_mix() {
        assert_eq!(Number::Int(0x108), value("(base + 8)"));
        assert_eq!(Number::Float(1.5), value("(3 / 2.0)"));
    }

    #[test]
    fn stops_at_the_matching_paren() {
        let mut arena = TokenArena::default();
        let tokens = arena.load("expr", "((1 + 2)) * 4");
        let mut cursor = Cursor::new(&arena, &tokens);
        let expr = parse_parenthesized(&mut cursor).unwrap();
        assert_eq!(3, expr.nodes.len());
        assert_eq!(Some(TokenKind::Star), cursor.peek_kind());
    }

    #[test]
    fn reports_malformed_expressions() {
        assert!(matches!(parse("(1 +)").1, Err(AsmError::Syntax { .. })));
        assert!(matches!(parse("(1 2)").1, Err(AsmError::Syntax { .. })));
        assert!(matches!(parse("(1, 2)").1, Err(AsmError::Syntax { .. })));
        assert!(matches!(parse("(1 + 2").1, Err(AsmError::Syntax { .. })));
    }

    #[test]
    fn evaluation_errors() {
        let (arena, expr) = parse("(1 / 0)");
        assert!(matches!(
            evaluate(&expr.unwrap(), &arena, &|_| None),
            Err(AsmError::Eval { .. })
        ));
        let (arena, expr) = parse("(missing + 1)");
        let expr = expr.unwrap();
        assert!(expr.references_label(&arena));
        assert!(matches!(
            evaluate(&expr, &arena, &|_| None),
            Err(AsmError::UnknownLabel { name, .. }) if name == "missing"
        ));
    }
}
