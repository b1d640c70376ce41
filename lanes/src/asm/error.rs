// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::{fmt, io};

use thiserror::Error;

use super::arena::{TokenArena, TokenId};
use crate::arch::Address;

/// A line and column inside a named source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub source: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.line, self.column)
    }
}

/// Where a token came from, innermost frame first, following macro
/// expansions back to the text that caused them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trace {
    pub frames: Vec<Location>,
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((first, rest)) = self.frames.split_first() else {
            return write!(f, "<unknown>");
        };
        write!(f, "{first}")?;
        for frame in rest {
            write!(f, ", expanded from {frame}")?;
        }
        Ok(())
    }
}

/// Every way assembly can fail. Nothing is written to memory when any of
/// these is returned.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("{trace}: invalid token `{text}`")]
    InvalidToken { text: String, trace: Trace },

    #[error("{trace}: {message}")]
    Macro { message: String, trace: Trace },

    #[error("{trace}: syntax error: {message}")]
    Syntax { message: String, trace: Trace },

    #[error("{trace}: cannot evaluate expression: {message}")]
    Eval { message: String, trace: Trace },

    #[error("{trace}: unknown label `{name}`")]
    UnknownLabel { name: String, trace: Trace },

    #[error("{trace}: label `{name}` is already defined")]
    DuplicateLabel { name: String, trace: Trace },

    #[error(
        "{trace}: label `{name}` moved from {first:#x} to {second:#x} between passes"
    )]
    LabelMismatch {
        name: String,
        first: Address,
        second: Address,
        trace: Trace,
    },

    #[error("{trace}: constant pool label `{label}` is not defined")]
    MissingPoolAnchor { label: String, trace: Trace },

    #[error("{trace}: operand {slot} of `{opcode}` has no type")]
    MissingType {
        opcode: String,
        slot: usize,
        trace: Trace,
    },

    #[error("{trace}: constant pool at {address:#x} overlaps emitted data")]
    PoolOverlap { address: Address, trace: Trace },

    #[error("{trace}: cannot import `{name}`")]
    Import {
        name: String,
        trace: Trace,
        #[source]
        source: io::Error,
    },
}

impl AsmError {
    pub(crate) fn syntax(
        arena: &TokenArena,
        token: TokenId,
        message: impl Into<String>,
    ) -> Self {
        AsmError::Syntax {
            message: message.into(),
            trace: arena.trace(token),
        }
    }

    pub(crate) fn macro_error(
        arena: &TokenArena,
        token: TokenId,
        message: impl Into<String>,
    ) -> Self {
        AsmError::Macro {
            message: message.into(),
            trace: arena.trace(token),
        }
    }

    pub(crate) fn eval(
        arena: &TokenArena,
        token: TokenId,
        message: impl Into<String>,
    ) -> Self {
        AsmError::Eval {
            message: message.into(),
            trace: arena.trace(token),
        }
    }

    pub(crate) fn invalid(arena: &TokenArena, token: TokenId) -> Self {
        AsmError::InvalidToken {
            text: arena.text(token).to_string(),
            trace: arena.trace(token),
        }
    }

    pub(crate) fn unknown_label(arena: &TokenArena, token: TokenId) -> Self {
        AsmError::UnknownLabel {
            name: arena.text(token).to_string(),
            trace: arena.trace(token),
        }
    }

    pub fn trace(&self) -> &Trace {
        match self {
            AsmError::InvalidToken { trace, .. }
            | AsmError::Macro { trace, .. }
            | AsmError::Syntax { trace, .. }
            | AsmError::Eval { trace, .. }
            | AsmError::UnknownLabel { trace, .. }
            | AsmError::DuplicateLabel { trace, .. }
            | AsmError::LabelMismatch { trace, .. }
            | AsmError::MissingPoolAnchor { trace, .. }
            | AsmError::MissingType { trace, .. }
            | AsmError::PoolOverlap { trace, .. }
            | AsmError::Import { trace, .. } => trace,
        }
    }
}
