// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! Turns the expanded token stream into statements, one line at a time.

use super::{
    arena::{TokenArena, TokenId},
    error::AsmError,
    expr::{parse_parenthesized, ConstExpr, Cursor, TokenSource},
    token::{parse_number, Number, TokenKind},
};
use crate::{arch::MAX_WIDTH, op::Opcode, value::DataType};

#[derive(Clone, Debug, PartialEq)]
pub enum OperandKind {
    /// `_` or an omitted operand: the value lives on the stack.
    Placeholder,
    Literal { token: TokenId, negative: bool },
    /// A label name.
    Word(TokenId),
    Str(TokenId),
    Expr(ConstExpr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operand {
    pub kind: OperandKind,
    /// The first token of the operand.
    pub token: TokenId,
    /// The `*n` suffix, 1 when absent.
    pub repeat: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstructionStatement {
    pub opcode: Opcode,
    pub token: TokenId,
    pub ty: Option<DataType>,
    pub width: u8,
    /// Operands before `->`.
    pub inputs: Vec<Operand>,
    /// Operands after `->`.
    pub outputs: Vec<Operand>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Label(TokenId),
    Position(TokenId),
    /// One item of a `:type item, item, ...` declaration.
    Data { ty: DataType, item: Operand },
    Instruction(InstructionStatement),
}

impl Statement {
    /// The token this statement is reported against.
    pub fn token(&self) -> TokenId {
        match self {
            Statement::Label(token) | Statement::Position(token) => *token,
            Statement::Data { item, .. } => item.token,
            Statement::Instruction(instruction) => instruction.token,
        }
    }
}

pub fn parse(
    arena: &TokenArena,
    tokens: &[TokenId],
) -> Result<Vec<Statement>, AsmError> {
    let mut parser = Parser {
        cursor: Cursor::new(arena, tokens),
        arena,
        statements: vec![],
    };
    while parser.cursor.peek().is_some() {
        parser.line()?;
    }
    Ok(parser.statements)
}

struct Parser<'a> {
    cursor: Cursor<'a>,
    arena: &'a TokenArena,
    statements: Vec<Statement>,
}

impl Parser<'_> {
    fn error(&self, token: TokenId, message: impl Into<String>) -> AsmError {
        AsmError::syntax(self.arena, token, message)
    }

    fn unexpected(&self, token: TokenId, what: &str) -> AsmError {
        let found = self.arena.text(token).escape_debug();
        self.error(token, format!("expected {what}, found `{found}`"))
    }

    fn at_line_end(&self) -> bool {
        matches!(self.cursor.peek_kind(), None | Some(TokenKind::Eol))
    }

    fn line(&mut self) -> Result<(), AsmError> {
        loop {
            let Some(token) = self.cursor.bump() else {
                return Ok(());
            };
            match self.arena.kind(token) {
                TokenKind::Eol => return Ok(()),
                TokenKind::Label => {
                    self.statements.push(Statement::Label(token))
                }
                TokenKind::Position => {
                    self.statements.push(Statement::Position(token))
                }
                TokenKind::Type => return self.data(token),
                TokenKind::Word => return self.instruction(token),
                _ => {
                    return Err(self.unexpected(
                        token,
                        "a label, declaration or instruction",
                    ))
                }
            }
        }
    }

    fn data_type(&self, token: TokenId) -> Result<DataType, AsmError> {
        let name = &self.arena.text(token)[1..];
        DataType::parse(name).ok_or_else(|| {
            self.error(token, format!("unknown type `{name}`"))
        })
    }

    /// Finishes the line, which must have nothing left on it.
    fn end_line(&mut self) -> Result<(), AsmError> {
        match self.cursor.bump() {
            Some(token) if self.arena.kind(token) != TokenKind::Eol => {
                Err(self.unexpected(token, "the end of the line"))
            }
            _ => Ok(()),
        }
    }

    fn data(&mut self, type_token: TokenId) -> Result<(), AsmError> {
        let ty = self.data_type(type_token)?;
        if self.at_line_end() {
            return Err(self.error(type_token, "declaration has no values"));
        }
        while !self.at_line_end() {
            let item = self.operand(type_token)?;
            if item.kind == OperandKind::Placeholder {
                return Err(self.error(item.token, "`_` is not a value"));
            }
            self.statements.push(Statement::Data { ty, item });
            if self.cursor.peek_kind() == Some(TokenKind::Comma) {
                self.cursor.bump();
            }
        }
        self.end_line()
    }

    fn instruction(&mut self, mnemonic: TokenId) -> Result<(), AsmError> {
        let name = self.arena.text(mnemonic);
        let opcode = Opcode::parse(name).ok_or_else(|| {
            self.error(mnemonic, format!("unknown instruction `{name}`"))
        })?;

        let mut ty = None;
        if self.cursor.peek_kind() == Some(TokenKind::Type) {
            if let Some(token) = self.cursor.bump() {
                ty = Some(self.data_type(token)?);
            }
        }
        let mut width = 1;
        if self.cursor.peek_kind() == Some(TokenKind::Star) {
            self.cursor.bump();
            let count = self.count(mnemonic)?;
            if count == 0 || count as usize > MAX_WIDTH {
                return Err(self.error(
                    mnemonic,
                    format!("width must be 1 to {MAX_WIDTH}"),
                ));
            }
            width = count as u8;
        }

        let mut inputs = vec![];
        let mut outputs = vec![];
        let mut after_arrow = false;
        while !self.at_line_end() {
            if self.cursor.peek_kind() == Some(TokenKind::Arrow) {
                let arrow = self.cursor.bump();
                if after_arrow {
                    let arrow = arrow.unwrap_or(mnemonic);
                    return Err(self.error(arrow, "second `->`"));
                }
                after_arrow = true;
                continue;
            }
            let operand = self.operand(mnemonic)?;
            if after_arrow {
                outputs.push(operand);
            } else {
                inputs.push(operand);
            }
            match self.cursor.peek_kind() {
                Some(TokenKind::Comma) => {
                    self.cursor.bump();
                }
                None | Some(TokenKind::Eol | TokenKind::Arrow) => {}
                Some(_) => {
                    let token = self.cursor.peek().unwrap_or(mnemonic);
                    return Err(self.unexpected(
                        token,
                        "`,`, `->` or the end of the line",
                    ));
                }
            }
        }
        self.end_line()?;

        let template = opcode.template();
        if inputs.len() > template.inputs as usize
            || outputs.len() > template.outputs as usize
        {
            return Err(self.error(
                mnemonic,
                format!(
                    "`{name}` takes {} inputs and {} outputs",
                    template.inputs, template.outputs
                ),
            ));
        }
        self.statements.push(Statement::Instruction(InstructionStatement {
            opcode,
            token: mnemonic,
            ty,
            width,
            inputs,
            outputs,
        }));
        Ok(())
    }

    /// A non-negative integer literal following `cause`.
    fn count(&mut self, cause: TokenId) -> Result<u32, AsmError> {
        let Some(token) = self.cursor.bump() else {
            return Err(self.error(cause, "expected a count"));
        };
        if self.arena.kind(token) != TokenKind::Number {
            return Err(self.unexpected(token, "a count"));
        }
        match parse_number(self.arena.text(token)) {
            Some(Number::Int(count))
                if (0..=u32::MAX as i64).contains(&count) =>
            {
                Ok(count as u32)
            }
            _ => Err(self.error(
                token,
                "count must be a small non-negative integer",
            )),
        }
    }

    fn operand(&mut self, cause: TokenId) -> Result<Operand, AsmError> {
        let Some(token) = self.cursor.peek() else {
            return Err(self.error(cause, "expected an operand"));
        };
        let kind = match self.arena.kind(token) {
            TokenKind::Word if self.arena.text(token) == "_" => {
                self.cursor.bump();
                OperandKind::Placeholder
            }
            TokenKind::Word => {
                self.cursor.bump();
                OperandKind::Word(token)
            }
            TokenKind::Number => {
                self.cursor.bump();
                OperandKind::Literal {
                    token,
                    negative: false,
                }
            }
            TokenKind::Minus => {
                self.cursor.bump();
                match self.cursor.bump() {
                    Some(number)
                        if self.arena.kind(number) == TokenKind::Number =>
                    {
                        OperandKind::Literal {
                            token: number,
                            negative: true,
                        }
                    }
                    _ => {
                        return Err(self.error(
                            token,
                            "`-` must be followed by a number",
                        ))
                    }
                }
            }
            TokenKind::Str => {
                self.cursor.bump();
                OperandKind::Str(token)
            }
            TokenKind::LParen => {
                OperandKind::Expr(parse_parenthesized(&mut self.cursor)?)
            }
            _ => return Err(self.unexpected(token, "an operand")),
        };

        let mut repeat = 1;
        if self.cursor.peek_kind() == Some(TokenKind::Star) {
            self.cursor.bump();
            repeat = self.count(token)?;
        }
        Ok(Operand {
            kind,
            token,
            repeat,
        })
    }
}
