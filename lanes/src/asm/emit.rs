// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! Lays out statements in two passes. The first assigns every label an
//! address and decides how each operand is reached; the constant pool is
//! then placed; the second pass writes the bytes, now that every address is
//! known, and checks that no label moved.

use std::collections::HashMap;

use tracing::debug;

use super::{
    arena::{TokenArena, TokenId},
    error::AsmError,
    expr::{evaluate, ConstExpr},
    parse::{InstructionStatement, Operand, OperandKind, Statement},
    symbols::{Entry, Symbol},
    token::{parse_number, unescape, Number},
    AssemblerConfig,
};
use crate::{
    arch::{mask, offset, Address, ADDRESS_BYTES, ADDRESS_SPACE, MAX_OPERANDS},
    instruction::Instruction,
    program::Program,
    value::{DataType, Mode, Value},
};

/// Everything the emitter produces.
#[derive(Debug, Default)]
pub struct Emitted {
    pub program: Program,
    pub labels: Vec<Symbol>,
    pub entries: Vec<Entry>,
}

/// How one operand slot reaches its value.
#[derive(Clone, Copy, Debug)]
enum Addressing<'s> {
    Stack,
    /// The immediate bytes are the value.
    Inline(&'s Operand),
    /// A label; the immediate is its address.
    Direct(TokenId),
    /// The immediate is the value of an expression over labels.
    Offset(&'s ConstExpr),
    /// The immediate is the address of a pool request's cell.
    Pooled(usize),
}

/// A statement after the first pass.
enum Lowered<'s> {
    Label(TokenId),
    Position(Address),
    Data {
        ty: DataType,
        item: &'s Operand,
    },
    Instruction {
        statement: &'s InstructionStatement,
        instruction: Instruction,
        slots: [Addressing<'s>; MAX_OPERANDS],
    },
}

struct PoolRequest<'s> {
    ty: DataType,
    lanes: usize,
    operand: &'s Operand,
}

/// One distinct constant: a run of bytes repeated `lanes` times.
struct PoolCell {
    run: Vec<u8>,
    lanes: usize,
    address: Address,
}

struct Pool {
    cells: Vec<PoolCell>,
    /// Cell index of each request.
    assignment: Vec<usize>,
}

impl Pool {
    fn address_of(&self, request: usize) -> Address {
        self.assignment
            .get(request)
            .and_then(|cell| self.cells.get(*cell))
            .map_or(0, |cell| cell.address)
    }
}

/// A range of emitted bytes. Ranges that wrap are split in two.
#[derive(Clone, Copy)]
struct Extent {
    start: u64,
    end: u64,
}

pub fn emit(
    arena: &TokenArena,
    config: &AssemblerConfig,
    statements: &[Statement],
) -> Result<Emitted, AsmError> {
    Emitter {
        arena,
        config,
        labels: HashMap::new(),
        label_tokens: vec![],
        requests: vec![],
        extents: vec![],
    }
    .run(statements)
}

struct Emitter<'a, 's> {
    arena: &'a TokenArena,
    config: &'a AssemblerConfig,
    labels: HashMap<String, Address>,
    label_tokens: Vec<TokenId>,
    requests: Vec<PoolRequest<'s>>,
    extents: Vec<Extent>,
}

impl<'a, 's> Emitter<'a, 's> {
    fn run(mut self, statements: &'s [Statement]) -> Result<Emitted, AsmError> {
        let lowered = self.first_pass(statements)?;
        let pool = self.layout_pool()?;
        let mut emitted = self.second_pass(&lowered, &pool)?;

        for cell in &pool.cells {
            emitted.program.push(cell.address, &cell.run.repeat(cell.lanes));
        }
        emitted
            .program
            .segments
            .sort_by_key(|segment| segment.address);
        emitted.labels = self
            .label_tokens
            .iter()
            .map(|token| {
                let name = self.arena.text(*token).to_string();
                let address =
                    self.labels.get(&name).copied().unwrap_or_default();
                Symbol {
                    name,
                    address,
                    token: *token,
                }
            })
            .collect();
        Ok(emitted)
    }

    fn lookup(&self) -> impl Fn(&str) -> Option<Address> + '_ {
        move |name: &str| self.labels.get(name).copied()
    }

    fn first_pass(
        &mut self,
        statements: &'s [Statement],
    ) -> Result<Vec<Lowered<'s>>, AsmError> {
        let mut cursor: Address = 0;
        let mut lowered = Vec::with_capacity(statements.len());
        for statement in statements {
            match statement {
                Statement::Label(token) => {
                    let name = self.arena.text(*token);
                    if self.labels.insert(name.to_string(), cursor).is_some() {
                        return Err(AsmError::DuplicateLabel {
                            name: name.to_string(),
                            trace: self.arena.trace(*token),
                        });
                    }
                    self.label_tokens.push(*token);
                    lowered.push(Lowered::Label(*token));
                }
                Statement::Position(token) => {
                    cursor = self.position(*token)?;
                    lowered.push(Lowered::Position(cursor));
                }
                Statement::Data { ty, item } => {
                    let size = self.data_size(*ty, item)?;
                    self.occupy(cursor, size);
                    cursor = offset(cursor, size as i64);
                    lowered.push(Lowered::Data { ty: *ty, item });
                }
                Statement::Instruction(instruction) => {
                    let (encoded, slots) = self.plan(instruction)?;
                    self.occupy(cursor, encoded.size());
                    cursor = offset(cursor, encoded.size() as i64);
                    lowered.push(Lowered::Instruction {
                        statement: instruction,
                        instruction: encoded,
                        slots,
                    });
                }
            }
        }
        Ok(lowered)
    }

    fn occupy(&mut self, start: Address, size: usize) {
        let space = ADDRESS_SPACE as u64;
        let (start, end) = (start as u64, start as u64 + size as u64);
        if end > space {
            self.extents.push(Extent { start, end: space });
            self.extents.push(Extent {
                start: 0,
                end: end - space,
            });
        } else if size > 0 {
            self.extents.push(Extent { start, end });
        }
    }

    /// Whether `size` bytes at `start`, wrapping, touch emitted data.
    fn overlaps(&self, start: u64, size: u64) -> bool {
        let space = ADDRESS_SPACE as u64;
        let hits = |start: u64, end: u64| {
            self.extents
                .iter()
                .any(|extent| extent.start < end && start < extent.end)
        };
        let end = start + size;
        hits(start, end.min(space)) || (end > space && hits(0, end - space))
    }

    /// Where `size` free bytes start: right after the highest emitted byte
    /// when they fit below the top of memory, else the lowest free gap.
    fn free_range(&self, size: u64) -> Option<Address> {
        let space = ADDRESS_SPACE as u64;
        let highest = self.extents.iter().map(|extent| extent.end).max();
        let mut ends = self
            .extents
            .iter()
            .map(|extent| extent.end)
            .collect::<Vec<_>>();
        ends.sort_unstable();
        highest
            .into_iter()
            .chain([0])
            .chain(ends)
            .find(|start| start + size <= space && !self.overlaps(*start, size))
            .map(|start| start as Address)
    }

    fn position(&self, token: TokenId) -> Result<Address, AsmError> {
        match parse_number(&self.arena.text(token)[1..]) {
            Some(Number::Int(address)) if address >= 0 => {
                Ok(mask(address as u64))
            }
            _ => Err(AsmError::syntax(
                self.arena,
                token,
                "position must be a non-negative integer",
            )),
        }
    }

    fn string(&self, token: TokenId) -> Result<Vec<u8>, AsmError> {
        unescape(self.arena.text(token))
            .map(String::into_bytes)
            .ok_or_else(|| AsmError::invalid(self.arena, token))
    }

    fn data_size(
        &self,
        ty: DataType,
        item: &Operand,
    ) -> Result<usize, AsmError> {
        let lanes = match item.kind {
            OperandKind::Str(token) => self.string(token)?.len(),
            _ => 1,
        };
        Ok(lanes * ty.size() * item.repeat as usize)
    }

    /// Decides the encoding of `statement` and how each operand is reached.
    fn plan(
        &mut self,
        statement: &'s InstructionStatement,
    ) -> Result<(Instruction, [Addressing<'s>; MAX_OPERANDS]), AsmError> {
        let template = statement.opcode.template();
        let mut instruction =
            Instruction::new(statement.opcode, statement.width);
        let mut slots = [Addressing::Stack; MAX_OPERANDS];

        for slot in 0..template.operands() {
            let fixed = template.slots[slot];
            let ty = fixed
                .ty
                .or(statement.ty)
                .or(self.config.default_type)
                .ok_or_else(|| AsmError::MissingType {
                    opcode: statement.opcode.mnemonic().to_string(),
                    slot,
                    trace: self.arena.trace(statement.token),
                })?;
            let width = fixed.width.unwrap_or(statement.width);
            instruction.types[slot] = ty;

            let output = template.is_output(slot);
            let operand = if output {
                statement.outputs.get(slot - template.inputs as usize)
            } else {
                statement.inputs.get(slot)
            };
            let Some(operand) = operand else {
                continue;
            };
            let addressing = self.addressing(operand, ty, width, output)?;
            match addressing {
                Addressing::Stack => continue,
                Addressing::Inline(_) => instruction.inline |= 1 << slot,
                _ => {}
            }
            instruction.immediate |= 1 << slot;
            instruction.imm_count += 1;
            slots[slot] = addressing;
        }
        Ok((instruction, slots))
    }

    fn addressing(
        &mut self,
        operand: &'s Operand,
        ty: DataType,
        width: u8,
        output: bool,
    ) -> Result<Addressing<'s>, AsmError> {
        let inline = !output
            && ty == DataType::P24
            && width == 1
            && operand.repeat == 1;
        Ok(match &operand.kind {
            OperandKind::Placeholder => Addressing::Stack,
            OperandKind::Literal { .. }
            | OperandKind::Word(_)
            | OperandKind::Expr(_)
                if inline =>
            {
                Addressing::Inline(operand)
            }
            OperandKind::Word(token) => Addressing::Direct(*token),
            OperandKind::Expr(expr)
                if output || expr.references_label(self.arena) =>
            {
                Addressing::Offset(expr)
            }
            _ if output => {
                return Err(AsmError::syntax(
                    self.arena,
                    operand.token,
                    "an output must be `_`, a label or an address",
                ))
            }
            kind => {
                let lanes = match kind {
                    OperandKind::Str(_) => 1,
                    _ => (width as usize).max(operand.repeat as usize),
                };
                self.requests.push(PoolRequest { ty, lanes, operand });
                Addressing::Pooled(self.requests.len() - 1)
            }
        })
    }

    fn literal(
        &self,
        token: TokenId,
        negative: bool,
    ) -> Result<Number, AsmError> {
        let number = parse_number(self.arena.text(token))
            .ok_or_else(|| AsmError::invalid(self.arena, token))?;
        Ok(match (number, negative) {
            (Number::Int(value), true) => Number::Int(value.wrapping_neg()),
            (Number::Float(value), true) => Number::Float(-value),
            (number, false) => number,
        })
    }

    /// The numeric value of an operand once every label is known.
    fn number(&self, operand: &Operand) -> Result<Number, AsmError> {
        match &operand.kind {
            OperandKind::Literal { token, negative } => {
                self.literal(*token, *negative)
            }
            OperandKind::Word(token) => self
                .labels
                .get(self.arena.text(*token))
                .map(|address| Number::Int(*address as i64))
                .ok_or_else(|| AsmError::unknown_label(self.arena, *token)),
            OperandKind::Expr(expr) => {
                evaluate(expr, self.arena, &self.lookup())
            }
            OperandKind::Placeholder | OperandKind::Str(_) => {
                let message = "expected a number";
                Err(AsmError::syntax(self.arena, operand.token, message))
            }
        }
    }

    fn address(
        &self,
        operand: &Operand,
        number: Number,
    ) -> Result<Address, AsmError> {
        match number {
            Number::Int(value) => Ok(mask(value as u64)),
            Number::Float(_) => Err(AsmError::eval(
                self.arena,
                operand.token,
                "an address must be an integer",
            )),
        }
    }

    /// One copy of `operand` encoded as `ty`: a single lane, or for strings a
    /// lane per byte.
    fn encode_once(
        &self,
        ty: DataType,
        operand: &Operand,
        length_prefix: bool,
    ) -> Result<Vec<u8>, AsmError> {
        let values = match operand.kind {
            OperandKind::Str(token) => {
                let text = self.string(token)?;
                let mut values = Vec::with_capacity(text.len() + 1);
                if length_prefix {
                    values.push(Number::Int(text.len() as i64));
                }
                values.extend(
                    text.into_iter().map(|byte| Number::Int(byte as i64)),
                );
                values
            }
            _ => vec![self.number(operand)?],
        };
        let size = ty.size();
        let mut bytes = vec![0; values.len() * size];
        for (value, lane) in values.into_iter().zip(bytes.chunks_mut(size)) {
            ty.encode(convert(value, ty.mode()), lane);
        }
        Ok(bytes)
    }

    fn layout_pool(&self) -> Result<Pool, AsmError> {
        let mut cells: Vec<PoolCell> = vec![];
        let mut index: HashMap<(DataType, Vec<u8>), usize> = HashMap::new();
        let mut assignment = Vec::with_capacity(self.requests.len());
        for request in &self.requests {
            let run = self.encode_once(request.ty, request.operand, true)?;
            let cell =
                *index.entry((request.ty, run.clone())).or_insert_with(|| {
                    cells.push(PoolCell {
                        run,
                        lanes: 0,
                        address: 0,
                    });
                    cells.len() - 1
                });
            cells[cell].lanes = cells[cell].lanes.max(request.lanes);
            assignment.push(cell);
        }
        let Some(first) = self.requests.first() else {
            return Ok(Pool { cells, assignment });
        };

        let size = cells
            .iter()
            .map(|cell| (cell.run.len() * cell.lanes) as u64)
            .sum::<u64>();
        let overlap = |address: Address| AsmError::PoolOverlap {
            address,
            trace: self.arena.trace(first.operand.token),
        };
        let base = match self.labels.get(&self.config.pool_label) {
            Some(&address) if self.overlaps(address as u64, size) => {
                return Err(overlap(address))
            }
            Some(&address) => address,
            None if self.config.require_pool_anchor => {
                return Err(AsmError::MissingPoolAnchor {
                    label: self.config.pool_label.clone(),
                    trace: self.arena.trace(first.operand.token),
                })
            }
            None => self.free_range(size).ok_or_else(|| {
                let highest =
                    self.extents.iter().map(|extent| extent.end).max();
                overlap(mask(highest.unwrap_or(0)))
            })?,
        };

        let mut end = base as u64;
        for cell in &mut cells {
            cell.address = mask(end);
            end += (cell.run.len() * cell.lanes) as u64;
        }
        debug!(
            base,
            cells = cells.len(),
            bytes = size,
            "laid out constant pool"
        );
        Ok(Pool { cells, assignment })
    }

    fn second_pass(
        &self,
        lowered: &[Lowered<'s>],
        pool: &Pool,
    ) -> Result<Emitted, AsmError> {
        let mut emitted = Emitted::default();
        let mut cursor: Address = 0;
        for step in lowered {
            let (bytes, token, ty) = match step {
                Lowered::Label(token) => {
                    let name = self.arena.text(*token);
                    let first =
                        self.labels.get(name).copied().unwrap_or_default();
                    if first != cursor {
                        return Err(AsmError::LabelMismatch {
                            name: name.to_string(),
                            first,
                            second: cursor,
                            trace: self.arena.trace(*token),
                        });
                    }
                    continue;
                }
                Lowered::Position(address) => {
                    cursor = *address;
                    continue;
                }
                Lowered::Data { ty, item } => {
                    let once = self.encode_once(*ty, item, false)?;
                    (once.repeat(item.repeat as usize), item.token, Some(*ty))
                }
                Lowered::Instruction {
                    statement,
                    instruction,
                    slots,
                } => (
                    self.encode(instruction, slots, pool)?,
                    statement.token,
                    None,
                ),
            };
            if !bytes.is_empty() {
                emitted.program.push(cursor, &bytes);
                emitted.entries.push(Entry {
                    address: cursor,
                    bytes: bytes.clone(),
                    token,
                    ty,
                });
            }
            cursor = offset(cursor, bytes.len() as i64);
        }
        Ok(emitted)
    }

    fn encode(
        &self,
        instruction: &Instruction,
        slots: &[Addressing<'s>; MAX_OPERANDS],
        pool: &Pool,
    ) -> Result<Vec<u8>, AsmError> {
        let mut bytes = Vec::with_capacity(instruction.size());
        bytes.extend_from_slice(&instruction.encode().to_le_bytes());
        for addressing in slots {
            let immediate = match *addressing {
                Addressing::Stack => continue,
                Addressing::Inline(operand) => {
                    self.address(operand, self.number(operand)?)?
                }
                Addressing::Direct(token) => self
                    .labels
                    .get(self.arena.text(token))
                    .copied()
                    .ok_or_else(|| AsmError::unknown_label(self.arena, token))?,
                Addressing::Offset(expr) => {
                    match evaluate(expr, self.arena, &self.lookup())? {
                        Number::Int(value) => mask(value as u64),
                        Number::Float(_) => {
                            return Err(AsmError::eval(
                                self.arena,
                                expr.token,
                                "an address must be an integer",
                            ))
                        }
                    }
                }
                Addressing::Pooled(request) => pool.address_of(request),
            };
            bytes.extend_from_slice(&immediate.to_le_bytes()[..ADDRESS_BYTES]);
        }
        Ok(bytes)
    }
}

/// Converts an assembler number into a lane of `mode`.
fn convert(number: Number, mode: Mode) -> Value {
    match number {
        Number::Int(value) => mode.from_i64(value),
        Number::Float(value) => mode.from_f64(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        asm::{parse::parse, token::TokenKind},
        op::Opcode,
    };

    fn emit_text(
        text: &str,
        config: &AssemblerConfig,
    ) -> Result<Emitted, AsmError> {
        let mut arena = TokenArena::default();
        let tokens = arena
            .load("test", text)
            .into_iter()
            .filter(|token| arena.kind(*token) != TokenKind::Comment)
            .collect::<Vec<_>>();
        let statements = parse(&arena, &tokens)?;
        emit(&arena, config, &statements)
    }

    fn bytes_at(emitted: &Emitted, address: Address, length: usize) -> Vec<u8> {
        let mut memory = crate::memory::Ram::with_size(1 << 24);
        emitted.program.write_to(&mut memory);
        let mut bytes = vec![0; length];
        crate::memory::Memory::read(&mut memory, address, &mut bytes);
        bytes
    }

    fn label(emitted: &Emitted, name: &str) -> Address {
        emitted
            .labels
            .iter()
            .find(|symbol| symbol.name == name)
            .map(|symbol| symbol.address)
            .unwrap()
    }

    #[test]
    fn forward_references_resolve() {
        let emitted = emit_text(
            "@0x100\nstart: jump end\n:u8 1, 2, 3\nend: halt\n",
            &AssemblerConfig::default(),
        )
        .unwrap();
        assert_eq!(0x100, label(&emitted, "start"));
        // jump with one inline immediate, then three bytes of data
        assert_eq!(0x100 + 11 + 3, label(&emitted, "end"));
        let jump = Instruction::decode(u64::from_le_bytes(
            bytes_at(&emitted, 0x100, 8).try_into().unwrap(),
        ));
        assert_eq!(Opcode::Jump, jump.opcode);
        assert!(jump.is_inline(0));
        assert_eq!(vec![0x0e, 0x01, 0x00], bytes_at(&emitted, 0x108, 3));
        assert_eq!(vec![1, 2, 3], bytes_at(&emitted, 0x10b, 3));
    }

    #[test]
    fn layout_is_deterministic() {
        let text =
            "a: push:u16 1\nb: :u32 (a + 2), b\n@64\nc: add:f32 1.5, 2\n";
        let first = emit_text(text, &AssemblerConfig::default()).unwrap();
        let second = emit_text(text, &AssemblerConfig::default()).unwrap();
        assert_eq!(first.program, second.program);
        assert_eq!(first.labels, second.labels);
    }

    #[test]
    fn equal_constants_share_one_cell_of_the_widest_use() {
        let emitted = emit_text(
            "push:u32 7\npush:u32*4 7\npush:u64 7\n",
            &AssemblerConfig::default(),
        )
        .unwrap();
        let immediate = |at: Address| {
            let bytes = bytes_at(&emitted, at + 8, 3);
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
        };
        let (first, second, third) =
            (immediate(0), immediate(11), immediate(22));
        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(33, first);
        assert_eq!(
            [7u8, 0, 0, 0].repeat(4),
            bytes_at(&emitted, first, 16)
        );
        assert_eq!(49, third);
    }

    #[test]
    fn pool_can_be_anchored() {
        let config = AssemblerConfig::default();
        let text = format!("push:u8 9\nhalt\n@0x400\n{}:\n", config.pool_label);
        let emitted = emit_text(&text, &config).unwrap();
        assert_eq!(vec![0x00, 0x04, 0x00], bytes_at(&emitted, 8, 3));
        assert_eq!(vec![9], bytes_at(&emitted, 0x400, 1));

        let strict = AssemblerConfig {
            require_pool_anchor: true,
            ..AssemblerConfig::default()
        };
        assert!(matches!(
            emit_text("push:u8 9\n", &strict),
            Err(AsmError::MissingPoolAnchor { .. })
        ));
    }

    #[test]
    fn pool_must_not_overlap_code() {
        let config = AssemblerConfig::default();
        let text = format!("{}:\npush:u8 9\n", config.pool_label);
        assert!(matches!(
            emit_text(&text, &config),
            Err(AsmError::PoolOverlap { address: 0, .. })
        ));
    }

    #[test]
    fn pool_fills_a_gap_when_data_reaches_the_top() {
        let emitted = emit_text(
            "@0\nadd 1, 2\nhalt\n@0xFFFFF8\n:u64 7\n",
            &AssemblerConfig::default(),
        )
        .unwrap();
        // add with two pooled immediates, then halt
        assert_eq!(vec![22, 0, 0], bytes_at(&emitted, 8, 3));
        assert_eq!(vec![30, 0, 0], bytes_at(&emitted, 11, 3));
        assert_eq!(1i64.to_le_bytes().to_vec(), bytes_at(&emitted, 22, 8));
        assert_eq!(vec![7, 0], bytes_at(&emitted, 0xFFFFF8, 2));
    }

    #[test]
    fn entries_record_data_types() {
        let emitted = emit_text(
            "nop\n:u16 1, 2\n",
            &AssemblerConfig::default(),
        )
        .unwrap();
        let types = emitted
            .entries
            .iter()
            .map(|entry| entry.ty)
            .collect::<Vec<_>>();
        assert_eq!(vec![None, Some(DataType::U16), Some(DataType::U16)], types);
    }

    #[test]
    fn strings_are_pooled_with_a_length() {
        let emitted =
            emit_text("dbgstr \"hi\"\n", &AssemblerConfig::default())
                .unwrap();
        assert_eq!(vec![2, b'h', b'i'], bytes_at(&emitted, 11, 3));
    }

    #[test]
    fn reports_layout_errors() {
        let config = AssemblerConfig::default();
        assert!(matches!(
            emit_text("a:\na:\n", &config),
            Err(AsmError::DuplicateLabel { name, .. }) if name == "a"
        ));
        assert!(matches!(
            emit_text("jump nowhere\n", &config),
            Err(AsmError::UnknownLabel { .. })
        ));
        assert!(matches!(
            emit_text("push 1 -> 2\n", &config),
            Err(AsmError::Syntax { .. })
        ));
        let untyped = AssemblerConfig {
            default_type: None,
            ..AssemblerConfig::default()
        };
        assert!(matches!(
            emit_text("add 1, 2\n", &untyped),
            Err(AsmError::MissingType { slot: 0, .. })
        ));
        // fixed slot types need no default
        assert!(emit_text("jump 0\n", &untyped).is_ok());
    }
}
