// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::fmt::Write;

use super::{
    arena::{TokenArena, TokenId},
    error::Trace,
};
use crate::{arch::Address, value::DataType};

/// Bytes shown per listing line before eliding the rest.
const LISTING_BYTES: usize = 8;

/// One emitted instruction or data item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub address: Address,
    pub bytes: Vec<u8>,
    pub token: TokenId,
    /// The declared type of a data run, `None` for instructions.
    pub ty: Option<DataType>,
}

impl Entry {
    fn contains(&self, address: Address) -> bool {
        let distance = (address as u64).wrapping_sub(self.address as u64);
        distance < self.bytes.len() as u64
    }
}

/// A label and where it was defined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: Address,
    pub token: TokenId,
}

/// What the assembler knows about a program after building it: labels,
/// where each emitted item came from, and the tokens to trace it back.
#[derive(Debug)]
pub struct DebugSymbols {
    arena: TokenArena,
    labels: Vec<Symbol>,
    entries: Vec<Entry>,
}

impl DebugSymbols {
    pub fn new(
        arena: TokenArena,
        mut labels: Vec<Symbol>,
        mut entries: Vec<Entry>,
    ) -> Self {
        labels.sort_by_key(|symbol| symbol.address);
        entries.sort_by_key(|entry| entry.address);
        Self {
            arena,
            labels,
            entries,
        }
    }

    pub fn arena(&self) -> &TokenArena {
        &self.arena
    }

    /// Labels in address order.
    pub fn labels(&self) -> &[Symbol] {
        &self.labels
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.labels
            .iter()
            .find(|symbol| symbol.name == name)
            .map(|symbol| symbol.address)
    }

    /// The nearest label at or before `address`.
    pub fn label_before(&self, address: Address) -> Option<&Symbol> {
        let after = self
            .labels
            .partition_point(|symbol| symbol.address <= address);
        after.checked_sub(1).map(|index| &self.labels[index])
    }

    /// The instruction or data item covering `address`.
    pub fn entry_at(&self, address: Address) -> Option<&Entry> {
        let after = self
            .entries
            .partition_point(|entry| entry.address <= address);
        let entry = &self.entries[after.checked_sub(1)?];
        entry.contains(address).then_some(entry)
    }

    /// The token of the instruction or data item covering `address`.
    pub fn instruction_at(&self, address: Address) -> Option<TokenId> {
        self.entry_at(address).map(|entry| entry.token)
    }

    /// The line of text `token` was lexed from, which for expanded tokens is
    /// a line of the macro body.
    pub fn source_line(&self, token: TokenId) -> &str {
        self.arena.line_text(token)
    }

    /// The line the outermost expansion of `token` started from.
    pub fn origin_line(&self, token: TokenId) -> &str {
        let mut current = token;
        while let Some(prev) = self.arena.token(current).prev {
            current = prev;
        }
        self.arena.line_text(current)
    }

    pub fn trace(&self, token: TokenId) -> Trace {
        self.arena.trace(token)
    }

    /// One line per emitted item: address, leading bytes and source.
    pub fn listing(&self) -> String {
        let mut listing = String::new();
        for entry in &self.entries {
            if let Some(symbol) = self
                .labels
                .iter()
                .find(|symbol| symbol.address == entry.address)
            {
                let _ = writeln!(listing, "{}:", symbol.name);
            }
            let mut bytes = entry
                .bytes
                .iter()
                .take(LISTING_BYTES)
                .map(|byte| format!("{byte:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            if entry.bytes.len() > LISTING_BYTES {
                bytes.push_str(" ..");
            }
            let _ = writeln!(
                listing,
                "{:06x}  {:<26}  {}",
                entry.address,
                bytes,
                self.source_line(entry.token).trim()
            );
        }
        listing
    }
}
