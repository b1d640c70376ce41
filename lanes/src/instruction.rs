// Copyright (C) 2024 Ethan Uppal. All rights reserved.

use static_assertions::const_assert;

use crate::{
    arch::{Word, ADDRESS_BYTES, MAX_OPERANDS, MAX_WIDTH, WORD_BYTES},
    decode, encode,
    op::{Opcode, OPCODE_BITS},
    value::{DataType, DATA_TYPE_BITS},
};

/// Bits for the lane count, stored minus one.
pub const WIDTH_BITS: usize = 3;
const_assert!(MAX_WIDTH == 1 << WIDTH_BITS);

/// Bits for the number of immediate operands.
pub const IMM_COUNT_BITS: usize = 2;
const_assert!(MAX_OPERANDS < 1 << IMM_COUNT_BITS);

/// Bits for a per-slot flag set.
pub const SLOT_MASK_BITS: usize = MAX_OPERANDS;

//  +---------------------------------------------------------------------+
//  | Instruction word, least significant field first:                    |
//  |   opcode | width-1 | imm count | 3 x type | imm slots | inline slots |
//  | followed by `imm count` 3-byte little-endian addresses.              |
//  +---------------------------------------------------------------------+
const_assert!(
    OPCODE_BITS
        + WIDTH_BITS
        + IMM_COUNT_BITS
        + MAX_OPERANDS * DATA_TYPE_BITS
        + 2 * SLOT_MASK_BITS
        <= Word::BITS as usize
);

/// A decoded instruction word. The immediate and inline slot masks extend
/// the opcode, width, count and type fields so the VM knows which operand
/// each trailing address belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Lanes per operand, 1 through 8.
    pub width: u8,
    /// Number of operand addresses following the word.
    pub imm_count: u8,
    /// Data type of each operand slot.
    pub types: [DataType; MAX_OPERANDS],
    /// Bit `i` is set when slot `i` takes the next immediate address.
    pub immediate: u8,
    /// Bit `i` is set when slot `i`'s immediate bytes are the operand
    /// itself (an inline `p24`) rather than the address of it.
    pub inline: u8,
}

impl Instruction {
    pub fn new(opcode: Opcode, width: u8) -> Self {
        Self {
            opcode,
            width,
            imm_count: 0,
            types: [DataType::U8; MAX_OPERANDS],
            immediate: 0,
            inline: 0,
        }
    }

    /// Encodes this instruction as a [`Word`]. Never fails: out of range
    /// fields are truncated to their bit width.
    pub fn encode(&self) -> Word {
        encode!(Word;
            [..OPCODE_BITS..] = self.opcode,
            [..WIDTH_BITS..] = self.width.wrapping_sub(1),
            [..IMM_COUNT_BITS..] = self.imm_count,
            [..DATA_TYPE_BITS..] = self.types[0],
            [..DATA_TYPE_BITS..] = self.types[1],
            [..DATA_TYPE_BITS..] = self.types[2],
            [..SLOT_MASK_BITS..] = self.immediate,
            [..SLOT_MASK_BITS..] = self.inline
        )
    }

    /// Decodes an instruction from a [`Word`]. Never fails: unknown opcodes
    /// and types decode to [`Opcode::Invalid`] and
    /// [`DataType::Unsupported`].
    pub fn decode(word: Word) -> Self {
        decode!(word; Word;
            @(
                opcode: Opcode = [..OPCODE_BITS..],
                width: u8 = [..WIDTH_BITS..],
                imm_count: u8 = [..IMM_COUNT_BITS..],
                t0: DataType = [..DATA_TYPE_BITS..],
                t1: DataType = [..DATA_TYPE_BITS..],
                t2: DataType = [..DATA_TYPE_BITS..],
                immediate: u8 = [..SLOT_MASK_BITS..],
                inline: u8 = [..SLOT_MASK_BITS..]
            ) => Self {
                opcode,
                width: width + 1,
                imm_count,
                types: [t0, t1, t2],
                immediate,
                inline,
            }
        )
    }

    /// Bytes from this instruction's word to the next instruction.
    pub const fn size(&self) -> usize {
        WORD_BYTES + self.imm_count as usize * ADDRESS_BYTES
    }

    pub const fn is_immediate(&self, slot: usize) -> bool {
        self.immediate & (1 << slot) != 0
    }

    pub const fn is_inline(&self, slot: usize) -> bool {
        self.inline & (1 << slot) != 0
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn encodes_correctly() {
        let mut add = Instruction::new(Opcode::Add, 1);
        add.types = [DataType::U8; 3];
        assert_eq!(Opcode::ADD_TAG as Word, add.encode());

        add.width = 4;
        add.imm_count = 2;
        add.types = [DataType::U64, DataType::U64, DataType::U8];
        add.immediate = 0b011;
        assert_eq!(
            (Opcode::ADD_TAG as Word)
                | (3 << OPCODE_BITS)
                | (2 << (OPCODE_BITS + WIDTH_BITS))
                | (3 << 12)
                | (3 << 16)
                | (0b011 << 24),
            add.encode()
        );
        assert_eq!(14, add.size());
    }

    #[test]
    fn garbage_words_still_decode() {
        let decoded = Instruction::decode(Word::MAX);
        assert_eq!(Opcode::Invalid, decoded.opcode);
        assert_eq!(8, decoded.width);
        assert_eq!(3, decoded.imm_count);
        assert_eq!([DataType::Unsupported; 3], decoded.types);
    }

    fn data_type() -> impl Strategy<Value = DataType> {
        (0..=DataType::P24_TAG).prop_map(|tag| {
            DataType::from_tag(tag).expect("tags up to p24 are contiguous")
        })
    }

    fn opcode() -> impl Strategy<Value = Opcode> {
        (0..Opcode::ALL.len()).prop_map(|index| Opcode::ALL[index])
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            opcode in opcode(),
            width in 1u8..=8,
            imm_count in 0u8..=3,
            types in proptest::array::uniform3(data_type()),
            immediate in 0u8..8,
            inline in 0u8..8,
        ) {
            let instruction = Instruction {
                opcode,
                width,
                imm_count,
                types,
                immediate,
                inline,
            };
            let decoded = Instruction::decode(instruction.encode());
            prop_assert_eq!(instruction, decoded);
        }
    }
}
